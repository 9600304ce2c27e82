//! Host local-APIC access: masking NMI-class LVT entries around a switch.
//!
//! While the monitor owns the CPU, an LVT-delivered NMI would vector
//! through whatever IDT happens to be live, so every LVT entry programmed
//! for NMI delivery is masked before the switch and unmasked after.  The
//! mask state is remembered per entry so only entries this driver masked
//! get restored.

use worldswitch_arch_amd64::{APIC_MAX_LVT_THERMAL, ApicLvt, LvtRegister, max_lvt};

use crate::cpu::Cpu;

/// How the host's local APIC is reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApicDescriptor {
    /// x2APIC mode: registers live in the MSR space.
    pub is_x2: bool,

    /// Kernel virtual address of the xAPIC MMIO window, zero if absent.
    pub mmio_base: u64,
}

impl ApicDescriptor {
    /// Checks whether any APIC is reachable.
    pub fn reachable(&self) -> bool {
        self.is_x2 || self.mmio_base != 0
    }

    fn read<C: Cpu>(&self, cpu: &mut C, reg: LvtRegister) -> u32 {
        if self.is_x2 {
            cpu.rdmsr(reg.msr()) as u32
        } else {
            cpu.mmio_read32(self.mmio_base + reg.mmio_offset() as u64)
        }
    }

    fn write<C: Cpu>(&self, cpu: &mut C, reg: LvtRegister, value: u32) {
        if self.is_x2 {
            cpu.wrmsr(reg.msr(), u64::from(value));
        } else {
            cpu.mmio_write32(self.mmio_base + reg.mmio_offset() as u64, value);
        }
    }

    /// Number of LVT entries, from the version register.
    fn max_lvt<C: Cpu>(&self, cpu: &mut C) -> u32 {
        max_lvt(self.read(cpu, LvtRegister::Version))
    }
}

/// Which LVT entries were masked by [`disable_nmi`] and must be restored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmiMaskState {
    masked: [bool; LvtRegister::NMI_CAPABLE.len()],
}

fn disable_nmi_delivery<C: Cpu>(cpu: &mut C, apic: &ApicDescriptor, reg: LvtRegister) -> bool {
    let lvt = ApicLvt::from_bits_retain(apic.read(cpu, reg));
    if lvt.delivers_nmi() && !lvt.masked() {
        apic.write(cpu, reg, (lvt | ApicLvt::MASKED).bits());
        // Read back to force completion of the masking write before any
        // NMI window opens.
        let _ = apic.read(cpu, reg);
        return true;
    }
    false
}

/// Masks every unmasked NMI-delivering LVT entry.  Returns the state
/// [`restore_nmi`] needs.
pub fn disable_nmi<C: Cpu>(cpu: &mut C, apic: &ApicDescriptor) -> NmiMaskState {
    let mut state = NmiMaskState::default();
    if !apic.reachable() {
        return state;
    }

    let max_lvt = apic.max_lvt(cpu);
    for (i, &reg) in LvtRegister::NMI_CAPABLE.iter().enumerate() {
        // The thermal LVT only exists on parts that advertise it.
        if reg == LvtRegister::Thermal && max_lvt < APIC_MAX_LVT_THERMAL {
            continue;
        }
        state.masked[i] = disable_nmi_delivery(cpu, apic, reg);
    }
    state
}

/// Unmasks exactly the entries [`disable_nmi`] masked.
pub fn restore_nmi<C: Cpu>(cpu: &mut C, apic: &ApicDescriptor, state: NmiMaskState) {
    for (i, &reg) in LvtRegister::NMI_CAPABLE.iter().enumerate() {
        if state.masked[i] {
            let lvt = apic.read(cpu, reg);
            apic.write(cpu, reg, lvt & !ApicLvt::MASKED.bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use worldswitch_arch_amd64::X2APIC_MSR_BASE;

    use super::*;
    use crate::cpu::mock::MockCpu;

    const LVT_NMI: u32 = 0x400;
    const LVT_MASK: u32 = 1 << 16;

    fn x2_apic() -> ApicDescriptor {
        ApicDescriptor {
            is_x2: true,
            mmio_base: 0,
        }
    }

    fn version_with_max_lvt(cpu: &mut MockCpu, max: u32) {
        cpu.set_msr_value(
            X2APIC_MSR_BASE + LvtRegister::Version as u32,
            u64::from(max << 16),
        );
    }

    #[test]
    fn masks_only_unmasked_nmi_entries() {
        let mut cpu = MockCpu::new();
        let apic = x2_apic();
        version_with_max_lvt(&mut cpu, 6);

        // LINT0 delivers NMI unmasked, LINT1 delivers NMI but is already
        // masked, perf counter delivers fixed.
        cpu.set_msr_value(LvtRegister::Lint0.msr(), u64::from(LVT_NMI));
        cpu.set_msr_value(LvtRegister::Lint1.msr(), u64::from(LVT_NMI | LVT_MASK));
        cpu.set_msr_value(LvtRegister::PerfCounter.msr(), 0xFE);
        cpu.set_msr_value(LvtRegister::Thermal.msr(), u64::from(LVT_NMI));

        let state = disable_nmi(&mut cpu, &apic);

        assert_eq!(cpu.rdmsr(LvtRegister::Lint0.msr()) as u32, LVT_NMI | LVT_MASK);
        assert_eq!(cpu.rdmsr(LvtRegister::Lint1.msr()) as u32, LVT_NMI | LVT_MASK);
        assert_eq!(cpu.rdmsr(LvtRegister::PerfCounter.msr()) as u32, 0xFE);
        assert_eq!(cpu.rdmsr(LvtRegister::Thermal.msr()) as u32, LVT_NMI | LVT_MASK);

        restore_nmi(&mut cpu, &apic, state);

        // LINT0 and thermal were masked by us and get unmasked; LINT1 was
        // already masked and must stay that way.
        assert_eq!(cpu.rdmsr(LvtRegister::Lint0.msr()) as u32, LVT_NMI);
        assert_eq!(cpu.rdmsr(LvtRegister::Lint1.msr()) as u32, LVT_NMI | LVT_MASK);
        assert_eq!(cpu.rdmsr(LvtRegister::Thermal.msr()) as u32, LVT_NMI);
    }

    #[test]
    fn thermal_lvt_skipped_on_old_parts() {
        let mut cpu = MockCpu::new();
        let apic = x2_apic();
        version_with_max_lvt(&mut cpu, 4);

        cpu.set_msr_value(LvtRegister::Thermal.msr(), u64::from(LVT_NMI));
        let state = disable_nmi(&mut cpu, &apic);

        assert_eq!(cpu.rdmsr(LvtRegister::Thermal.msr()) as u32, LVT_NMI);
        restore_nmi(&mut cpu, &apic, state);
        assert_eq!(cpu.rdmsr(LvtRegister::Thermal.msr()) as u32, LVT_NMI);
    }

    #[test]
    fn unreachable_apic_is_a_no_op() {
        let mut cpu = MockCpu::new();
        let apic = ApicDescriptor::default();
        let state = disable_nmi(&mut cpu, &apic);
        restore_nmi(&mut cpu, &apic, state);
        assert!(cpu.log.is_empty());
    }
}
