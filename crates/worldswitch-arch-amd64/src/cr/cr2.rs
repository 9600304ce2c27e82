/// `CR2` control register.
///
/// Holds the faulting linear address of the most recent page fault.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr2(pub u64);

impl std::fmt::Debug for Cr2 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Cr2(0x{:016x})", self.0)
    }
}

impl From<u64> for Cr2 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr2> for u64 {
    fn from(value: Cr2) -> Self {
        value.0
    }
}
