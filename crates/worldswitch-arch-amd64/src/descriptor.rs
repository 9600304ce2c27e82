use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The 10-byte memory image of a descriptor-table register (GDTR or IDTR),
/// as stored by `sgdt`/`sidt` and consumed by `lgdt`/`lidt`.
#[repr(C, packed)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DescriptorTableRegister {
    /// Table limit: size in bytes minus one.
    pub limit: u16,

    /// Linear address of the first descriptor.
    pub base: u64,
}

impl DescriptorTableRegister {
    /// Builds a register image for a table of `size` bytes at `base`.
    pub fn new(base: u64, size: u32) -> Self {
        Self {
            limit: (size - 1) as u16,
            base,
        }
    }

    /// Returns the table size in bytes.
    pub fn size(&self) -> u32 {
        u32::from(self.limit) + 1
    }
}

impl std::fmt::Debug for DescriptorTableRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let base = self.base;
        let limit = self.limit;
        write!(f, "DescriptorTableRegister {{ base: 0x{base:016x}, limit: 0x{limit:04x} }}")
    }
}
