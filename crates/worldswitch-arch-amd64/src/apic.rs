//! Local-APIC definitions: the LVT registers the switch driver masks while
//! the monitor owns the CPU.

use bitflags::bitflags;

/// Base of the x2APIC MSR window; register `r` lives at `0x800 + r`.
pub const X2APIC_MSR_BASE: u32 = 0x800;

/// Minimum max-LVT value (from the version register) at which the thermal
/// LVT exists.
pub const APIC_MAX_LVT_THERMAL: u32 = 5;

/// APIC register numbers (xAPIC MMIO offset divided by 16, equal to the
/// x2APIC MSR offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LvtRegister {
    /// The version register (not an LVT, but read to size the LVT array).
    Version = 0x03,

    /// LVT thermal monitor.
    Thermal = 0x33,

    /// LVT performance counter.
    PerfCounter = 0x34,

    /// LVT LINT0.
    Lint0 = 0x35,

    /// LVT LINT1.
    Lint1 = 0x36,
}

impl LvtRegister {
    /// The LVT entries whose NMI delivery must be masked around a world
    /// switch, thermal last (it exists only on newer parts).
    pub const NMI_CAPABLE: [LvtRegister; 4] = [
        Self::Lint0,
        Self::Lint1,
        Self::PerfCounter,
        Self::Thermal,
    ];

    /// Returns the xAPIC MMIO offset of this register.
    pub fn mmio_offset(self) -> usize {
        (self as usize) << 4
    }

    /// Returns the x2APIC MSR index of this register.
    pub fn msr(self) -> u32 {
        X2APIC_MSR_BASE + self as u32
    }
}

bitflags! {
    /// Fields of a local vector table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ApicLvt: u32 {
        /// Vector number.
        const VECTOR = 0xFF;
        /// Delivery mode field.
        const DELIVERY_MODE = 0x700;
        /// Delivery status (read only).
        const DELIVERY_STATUS = 1 << 12;
        /// Masked.
        const MASKED = 1 << 16;
    }
}

/// LVT delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LvtDeliveryMode {
    /// Fixed interrupt.
    Fixed = 0b000,

    /// System management interrupt.
    Smi = 0b010,

    /// Non-maskable interrupt.
    Nmi = 0b100,

    /// INIT.
    Init = 0b101,

    /// External interrupt.
    ExtInt = 0b111,
}

impl ApicLvt {
    /// Returns the delivery mode field.
    pub fn delivery_mode(self) -> u32 {
        (self.bits() & Self::DELIVERY_MODE.bits()) >> 8
    }

    /// Checks if this entry delivers an NMI when it fires.
    pub fn delivers_nmi(self) -> bool {
        self.delivery_mode() == LvtDeliveryMode::Nmi as u32
    }

    /// Checks if this entry is masked.
    pub fn masked(self) -> bool {
        self.contains(Self::MASKED)
    }
}

/// Extracts the max-LVT field from the APIC version register.
pub fn max_lvt(version: u32) -> u32 {
    (version >> 16) & 0xFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_delivery_detection() {
        let nmi = ApicLvt::from_bits_retain(0x400);
        assert!(nmi.delivers_nmi());
        assert!(!nmi.masked());

        let fixed = ApicLvt::from_bits_retain(0x30);
        assert!(!fixed.delivers_nmi());

        let masked_nmi = ApicLvt::from_bits_retain(0x400 | 0x10000);
        assert!(masked_nmi.delivers_nmi());
        assert!(masked_nmi.masked());
    }
}
