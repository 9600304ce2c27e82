use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A segment selector: a 16-bit index into the GDT or the current LDT plus
/// a requested privilege level.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Selector(pub u16);

/// A descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTable {
    /// The Global Descriptor Table.
    Gdt,

    /// The Local Descriptor Table.
    Ldt,
}

impl Selector {
    /// The null selector.
    pub const NULL: Selector = Selector(0);

    /// Returns the requested privilege level (bits 0..2).
    pub fn rpl(self) -> u8 {
        (self.0 & 0b11) as u8
    }

    /// Returns the table this selector indexes (bit 2).
    pub fn table(self) -> DescriptorTable {
        if self.0 & 0b100 == 0 {
            DescriptorTable::Gdt
        } else {
            DescriptorTable::Ldt
        }
    }

    /// Returns the descriptor index (bits 3..16).
    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Returns the byte offset of the referenced descriptor within its
    /// table.
    pub fn descriptor_offset(self) -> u64 {
        u64::from(self.0 & !0b111)
    }

    /// Returns this selector with the RPL cleared.
    pub fn clear_rpl(self) -> Selector {
        Selector(self.0 & !0b11)
    }

    /// Checks if this is the null selector (index 0 in the GDT).
    pub fn is_null(self) -> bool {
        self.0 & !0b11 == 0
    }
}

impl From<u16> for Selector {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Selector> for u16 {
    fn from(value: Selector) -> Self {
        value.0
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("rpl", &self.rpl())
            .field("table", &self.table())
            .field("index", &self.index())
            .finish()
    }
}
