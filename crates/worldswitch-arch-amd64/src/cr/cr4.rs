/// `CR4` control register.
///
/// Architectural feature enable bits.  The world switch composes its own
/// working CR4 from a monitor template plus the host bits that must be
/// preserved, so this type carries both accessors and the bit constants.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr4(pub u64);

impl Cr4 {
    /// CR4.PAE (bit 5), physical address extension.
    pub const PAE: u64 = 1 << 5;

    /// CR4.MCE (bit 6), machine-check exception enable.
    pub const MCE: u64 = 1 << 6;

    /// CR4.PGE (bit 7), global page enable.
    pub const PGE: u64 = 1 << 7;

    /// CR4.OSFXSR (bit 9), FXSAVE/FXRSTOR and SSE enable.
    pub const OSFXSR: u64 = 1 << 9;

    /// CR4.VMXE (bit 13), VMX enable.
    pub const VMXE: u64 = 1 << 13;

    /// CR4.PCIDE (bit 17), process-context identifier enable.
    pub const PCIDE: u64 = 1 << 17;

    /// CR4.OSXSAVE (bit 18), XSAVE and extended states enable.
    pub const OSXSAVE: u64 = 1 << 18;

    /// Checks if CR4.PAE is set.
    pub fn physical_address_extension(self) -> bool {
        self.0 & Self::PAE != 0
    }

    /// Checks if CR4.MCE is set.
    pub fn machine_check_enable(self) -> bool {
        self.0 & Self::MCE != 0
    }

    /// Checks if CR4.PGE is set.
    pub fn page_global_enable(self) -> bool {
        self.0 & Self::PGE != 0
    }

    /// Checks if CR4.VMXE is set.
    pub fn vmx_enable(self) -> bool {
        self.0 & Self::VMXE != 0
    }

    /// Checks if CR4.PCIDE is set.
    pub fn pcid_enable(self) -> bool {
        self.0 & Self::PCIDE != 0
    }

    /// Checks if CR4.OSXSAVE is set.
    pub fn os_xsave(self) -> bool {
        self.0 & Self::OSXSAVE != 0
    }
}

impl std::fmt::Debug for Cr4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Cr4(0x{:016x})", self.0)
    }
}

impl From<u64> for Cr4 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr4> for u64 {
    fn from(value: Cr4) -> Self {
        value.0
    }
}
