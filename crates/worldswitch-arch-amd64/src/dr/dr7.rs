/// `DR7` debug control register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Dr7(pub u64);

impl Dr7 {
    /// The L0..L3/G0..G3 breakpoint enable bits (bits 0..8).
    pub const ENABLED: u64 = 0xFF;

    /// DR7.GD (bit 13), general detect.
    ///
    /// While set, any access to a debug register raises `#DB` with DR6.BD.
    pub const GD: u64 = 1 << 13;

    /// The architectural reset value: all breakpoints disabled, reserved-one
    /// bit 10 set.
    pub const DEFAULT: u64 = 1 << 10;

    /// Checks if any breakpoint is enabled.
    pub fn any_breakpoint_enabled(self) -> bool {
        self.0 & Self::ENABLED != 0
    }

    /// Checks if DR7.GD is set.
    pub fn general_detect(self) -> bool {
        self.0 & Self::GD != 0
    }
}

impl Default for Dr7 {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl std::fmt::Debug for Dr7 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Dr7(0x{:016x})", self.0)
    }
}

impl From<u64> for Dr7 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Dr7> for u64 {
    fn from(value: Dr7) -> Self {
        value.0
    }
}
