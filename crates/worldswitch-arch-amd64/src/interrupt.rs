use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::Selector;

/// Number of architectural exception vectors covered by the switch IDT.
pub const NUM_EXCEPTIONS: usize = 32;

/// Architectural exception vectors the world switch cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionVector {
    /// `#DB`, debug exception.
    DebugException = 1,

    /// `#NMI`, non-maskable interrupt.
    NonMaskableInterrupt = 2,

    /// `#UD`, invalid opcode.
    InvalidOpcode = 6,

    /// `#MC`, machine check.
    MachineCheck = 18,
}

impl ExceptionVector {
    /// The four vectors handled by the switch IDT, in vector order.
    pub const SWITCH_HANDLED: [ExceptionVector; 4] = [
        Self::DebugException,
        Self::NonMaskableInterrupt,
        Self::InvalidOpcode,
        Self::MachineCheck,
    ];

    /// Returns the vector number.
    pub fn vector(self) -> u8 {
        self as u8
    }
}

/// A 16-byte 64-bit IDT gate.
#[repr(C)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Gate64 {
    offset_low: u16,
    selector: u16,
    ist_and_type: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl Gate64 {
    /// Type/attribute value of a present DPL-0 64-bit interrupt gate.
    const INTERRUPT_GATE: u16 = 0x8E00;

    /// Builds a present interrupt gate targeting `handler` through
    /// `selector`, with no IST stack switch.
    pub fn interrupt_gate(selector: Selector, handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: selector.0,
            ist_and_type: Self::INTERRUPT_GATE,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    /// Checks the present bit.
    pub fn present(&self) -> bool {
        self.ist_and_type & 0x8000 != 0
    }

    /// Returns the handler address.
    pub fn offset(&self) -> u64 {
        u64::from(self.offset_low)
            | (u64::from(self.offset_mid) << 16)
            | (u64::from(self.offset_high) << 32)
    }
}

impl std::fmt::Debug for Gate64 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Gate64")
            .field("present", &self.present())
            .field("selector", &Selector(self.selector))
            .field("offset", &format_args!("0x{:016x}", self.offset()))
            .finish()
    }
}

/// The 64-bit task-state segment.
///
/// The monitor's TSS lives in the crosspage data page; only the stack
/// pointers, the interrupt stack table, and the I/O map base are meaningful.
#[repr(C, packed)]
#[derive(Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Tss64 {
    reserved0: u32,

    /// Stack pointers for privilege levels 0..2.
    pub rsp: [u64; 3],

    reserved1: u64,

    /// Interrupt stack table entries 1..7 (index 0 here is IST1).
    pub ist: [u64; 7],

    reserved2: u64,
    reserved3: u16,

    /// Offset of the I/O permission map from the TSS base.
    pub iomap_base: u16,
}

impl Tss64 {
    /// IST slot (1-based, as encoded in a gate) used for `#DF`.
    pub const IST_DF: usize = 1;

    /// IST slot used for `#NMI`.
    pub const IST_NMI: usize = 2;

    /// IST slot used for `#MC`.
    pub const IST_MC: usize = 3;
}

const _: () = assert!(size_of::<Tss64>() == 104);
const _: () = assert!(size_of::<Gate64>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_offset_round_trip() {
        let handler = 0xFFFF_FFFF_FCA0_1234u64;
        let gate = Gate64::interrupt_gate(Selector(0x08), handler);
        assert!(gate.present());
        assert_eq!(gate.offset(), handler);
    }
}
