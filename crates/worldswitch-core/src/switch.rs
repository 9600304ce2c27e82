//! The switch driver: `WorldSwitch::switch` and its unwind helpers.
//!
//! Think of a switch as a coroutine transfer that swaps not just the
//! registers but the address space, the descriptor tables, and the
//! interrupt plumbing.  Everything saved on the way out is restored in
//! reverse order on the way back, and any `#NMI`/`#MC` that slipped in
//! while neither side's IDT was fully valid is re-raised for the host once
//! the host is whole again.

use worldswitch_arch_amd64::{
    Cr0, Cr4, DescriptorTableRegister, Dr6, Dr7, ExceptionVector, MsrEfer, Rflags,
    SegmentDescriptor, Selector, msr_index,
};

use crate::{
    Ma, PcpuId, SwitchError, VcpuId, Vm, WorldSwitch, apic,
    cpu::{Cpu, SegmentRegister},
    crosspage::{CrossPageData, TINY_STACK_SENTINEL, module_call},
    host::{HostOps, KernelPages},
    ptsc,
    vm::INVALID_PCPU,
};

const EXC_DB: u8 = ExceptionVector::DebugException as u8;
const EXC_NMI: u8 = ExceptionVector::NonMaskableInterrupt as u8;
const EXC_UD: u8 = ExceptionVector::InvalidOpcode as u8;
const EXC_MC: u8 = ExceptionVector::MachineCheck as u8;

/// A request the monitor posted for the driver's caller to service before
/// re-entering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleCall {
    /// Nothing to do.
    None,

    /// Allocate the HV root page for `pcpu` (from allocation-friendly
    /// context), then switch again.
    AllocVmxPage {
        /// The pCPU missing its root page.
        pcpu: PcpuId,
    },

    /// Allocate the temporary GDT for `pcpu`, then switch again.
    AllocTmpGdt {
        /// The pCPU missing its temporary GDT.
        pcpu: PcpuId,
    },

    /// An interrupt fired while the monitor ran; the driver already raised
    /// it on the host.
    Intr {
        /// The forwarded vector.
        vector: u64,
    },

    /// A userspace call the upper layers dispatch.
    UserCall {
        /// The raw module-call type.
        call: u32,
    },
}

/// What a completed switch reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchSummary {
    /// The monitor's request, if any.
    pub module_call: ModuleCall,

    /// An NMI was observed during the switch and re-raised on the host.
    pub nmi_forwarded: bool,

    /// A machine check was observed during the switch and re-raised.
    pub mce_forwarded: bool,
}

impl SwitchSummary {
    fn new() -> SwitchSummary {
        SwitchSummary {
            module_call: ModuleCall::None,
            nmi_forwarded: false,
            mce_forwarded: false,
        }
    }
}

/// Debug-register save reconciliation.
///
/// Reading DR7 with DR7.GD set raises `#DB`; the CPU clears GD on handler
/// entry, the handler records the witness, and the retried read then
/// observes GD clear with DR6.BD set.  The saved values must look the way
/// they did *before* the trap so restore reproduces the host state, and
/// breakpoints must be off for the duration of the switch.
///
/// Returns `(saved_dr6, saved_dr7, host_dr_in_hw, load_default_dr7)`.
fn reconcile_debug_save(dr6: u64, dr7: u64, got_db: bool) -> (u64, u64, u8, bool) {
    debug_assert!(dr7 & Dr7::GD == 0);

    if got_db && dr6 & Dr6::BD != 0 {
        // DR6.BD is assumed clear before the trap; there is no way to
        // know, so restore will clear it.
        return (dr6 - Dr6::BD, dr7 | Dr7::GD, 0b0000_1111, true);
    }

    if dr7 & Dr7::ENABLED != 0 {
        // Live breakpoints could trip mid-switch; park them.
        return (dr6, dr7, 0b0100_1111, true);
    }

    (dr6, dr7, 0b1100_1111, false)
}

fn save_debug_registers<C: Cpu>(cpu: &mut C, cp: &mut CrossPageData) {
    let saved_witness = cp.got_exception(EXC_DB);
    cp.set_exception(EXC_DB, false);
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);

    // Either of these reads can raise #DB when DR7.GD is set.
    let dr7 = cpu.get_dr(7);
    let dr6 = cpu.get_dr(6);

    let (dr6, dr7, in_hw, load_default) = reconcile_debug_save(dr6, dr7, cp.got_exception(EXC_DB));
    cp.host_dr[6] = dr6;
    cp.host_dr[7] = dr7;
    cp.host_dr_in_hw = in_hw;
    if load_default {
        cpu.set_dr(7, Dr7::DEFAULT);
    }

    cp.set_exception(EXC_DB, saved_witness);
    cp.host_dr_saved = 0xC0;
}

fn restore_debug_registers<C: Cpu>(cpu: &mut C, cp: &CrossPageData) {
    // DR7 restores last in case DR7.GD comes back with it.
    for n in [0usize, 1, 2, 3, 6, 7] {
        if cp.host_dr_in_hw & (1 << n) != 0 {
            continue; // Hardware still holds the host value.
        }
        let value = cp.host_dr[n];
        if cp.shadow_dr_in_hw & (1 << n) == 0 || value != cp.shadow_dr[n] {
            cpu.set_dr(n, value);
        }
    }
}

/// Puts the host GDT, TR and LDT back.
///
/// TR cannot be loaded from a busy TSS descriptor, so the busy bit gets
/// cleared first: directly in the host GDT when it is writable, otherwise
/// in a sparse temporary copy that is active just long enough for the
/// `ltr`.
fn restore_host_gdt_tr_ldt<C: Cpu>(
    cpu: &mut C,
    tmp_gdt: Option<KernelPages>,
    host_gdt: DescriptorTableRegister,
    ldt: Selector,
    cs: Selector,
    tr: Selector,
) {
    debug_assert!(tr.0 != 0);
    debug_assert!(tr.0 & 7 == 0);

    let host_base = host_gdt.base as *const SegmentDescriptor;

    if let Some(tmp) = tmp_gdt {
        let tmp_base = tmp.ptr.as_ptr() as *mut SegmentDescriptor;
        let ss = cpu.get_segment(SegmentRegister::Ss).clear_rpl();

        debug_assert!(cs.rpl() == 0);
        debug_assert!(ss.rpl() == 0);

        // Copy code and stack segments so they stay valid if an NMI lands
        // while the temporary GDT is active.  Worldswitch returned with
        // DS == ES == SS, so those need no separate slots.
        let copy = |sel: Selector| unsafe {
            let index = usize::from(sel.0) / size_of::<SegmentDescriptor>();
            *tmp_base.add(index) = *host_base.add(index);
        };
        copy(cs);
        copy(ss);
        copy(tr);
        copy(Selector(tr.0 + 8)); // TR descriptors are 16 bytes in long mode.

        unsafe {
            (*tmp_base.add(usize::from(tr.0) / size_of::<SegmentDescriptor>())).unbusy_tss();
        }

        let tmp_gdtr = DescriptorTableRegister {
            limit: host_gdt.limit,
            base: tmp.ptr.as_ptr() as u64,
        };
        cpu.set_gdt(&tmp_gdtr);
        cpu.set_tr(tr);
        cpu.set_gdt(&host_gdt);
        cpu.set_ldt(ldt);
    } else {
        // The host GDT is writable; clear the busy bit in place.
        unsafe {
            let descriptor = host_base
                .cast_mut()
                .add(usize::from(tr.0) / size_of::<SegmentDescriptor>());
            (*descriptor).unbusy_tss();
        }
        cpu.set_gdt(&host_gdt);
        cpu.set_tr(tr);
        cpu.set_ldt(ldt);
    }
}

fn decode_module_call(cp: &CrossPageData) -> ModuleCall {
    match cp.module_call_type {
        module_call::MODULECALL_NONE => ModuleCall::None,
        module_call::MODULECALL_INTR => ModuleCall::Intr { vector: cp.args[0] },
        module_call::MODULECALL_ALLOC_VMX_PAGE => ModuleCall::AllocVmxPage {
            pcpu: PcpuId(cp.pcpu_num),
        },
        module_call::MODULECALL_ALLOC_TMP_GDT => ModuleCall::AllocTmpGdt {
            pcpu: PcpuId(cp.pcpu_num),
        },
        other => ModuleCall::UserCall { call: other },
    }
}

fn take_retry(cp: &mut CrossPageData) -> bool {
    let retry = cp.retry_world_switch != 0;
    cp.retry_world_switch = 0;
    retry
}

impl<H: HostOps> WorldSwitch<H> {
    /// Switches into the monitor of `vm`'s VCPU `vcpuid` and back.
    ///
    /// Must run on a pinned thread.  Succeeds unless a `#UD` hit during
    /// the switch, the firmware forbids VT, or the monitor forwarded an
    /// unacceptable interrupt vector; resource shortfalls are not errors
    /// but [`ModuleCall`] requests in the summary.
    pub fn switch<C: Cpu>(
        &self,
        vm: &Vm,
        vcpuid: VcpuId,
        cpu: &mut C,
    ) -> Result<SwitchSummary, SwitchError> {
        assert!((vcpuid.0 as usize) < vm.num_vcpus());

        // Single writer: this pinned thread owns the VCPU.
        let cp = unsafe { &mut *vm.crosspage_ptr(vcpuid) };
        let vcpu = &vm.vcpus[vcpuid.0 as usize];
        let mut summary = SwitchSummary::new();

        let nmi_state = apic::disable_nmi(cpu, &vm.apic);
        let flags = cpu.get_flags();
        cpu.disable_interrupts();

        let pcpu = self.host().current_pcpu();
        let hv_root = self.hv_root().get(pcpu);
        let tmp_gdt = if self.use_tmp_gdt() {
            self.tmp_gdts().get(pcpu)
        } else {
            None
        };

        // Memory cannot be allocated with interrupts disabled, so missing
        // per-pCPU resources turn into module calls serviced from
        // interrupt-enabled context, and the caller switches again.
        if hv_root.is_invalid() && self.caps().hv_supported() {
            cp.user_call_type = module_call::MODULECALL_USERCALL_NONE;
            cp.module_call_type = module_call::MODULECALL_ALLOC_VMX_PAGE;
            cp.pcpu_num = pcpu.0;
            summary.module_call = ModuleCall::AllocVmxPage { pcpu };
        } else if self.use_tmp_gdt() && tmp_gdt.is_none() {
            cp.user_call_type = module_call::MODULECALL_USERCALL_NONE;
            cp.module_call_type = module_call::MODULECALL_ALLOC_TMP_GDT;
            cp.pcpu_num = pcpu.0;
            summary.module_call = ModuleCall::AllocTmpGdt { pcpu };
        } else {
            // VT disabled-and-locked by firmware is fatal; check before
            // touching any state that would need unwinding.
            if self.caps().uses_vmx() {
                let required = worldswitch_arch_amd64::FeatureControl::LOCK
                    | worldswitch_arch_amd64::FeatureControl::VMXON_OUTSIDE_SMX;
                let feature_control = cpu.rdmsr(msr_index::IA32_FEATURE_CONTROL);
                if feature_control & required != required {
                    if feature_control & worldswitch_arch_amd64::FeatureControl::LOCK != 0 {
                        tracing::warn!(pcpu = pcpu.0, "VT-x is disabled and locked");
                        cpu.set_flags(flags);
                        apic::restore_nmi(cpu, &vm.apic, nmi_state);
                        return Err(SwitchError::VtDisabledByFirmware);
                    }
                    cpu.wrmsr(msr_index::IA32_FEATURE_CONTROL, feature_control | required);
                }
            }

            let mut switch_ok = true;
            loop {
                vcpu.current_host_cpu.store(pcpu.0, std::sync::atomic::Ordering::Release);

                ptsc::update_parameters(self.host(), cpu, &vm.ptsc, cp, vcpuid);

                // PEBS and Processor Trace write memory behind the OS's
                // back; neither may be live while the host IDT is not.
                let pebs_msr = if self.pebs_available() {
                    let value = cpu.rdmsr(msr_index::IA32_PEBS_ENABLE);
                    if value != 0 {
                        cpu.wrmsr(msr_index::IA32_PEBS_ENABLE, 0);
                    }
                    value
                } else {
                    0
                };
                let pt_msr = if self.pt_available() {
                    let value = cpu.rdmsr(msr_index::IA32_RTIT_CTL);
                    if value & worldswitch_arch_amd64::RTIT_CTL_TRACE_EN != 0 {
                        cpu.wrmsr(
                            msr_index::IA32_RTIT_CTL,
                            value & !worldswitch_arch_amd64::RTIT_CTL_TRACE_EN,
                        );
                    }
                    value
                } else {
                    0
                };

                // From here until the far side of the return, exceptions
                // vector through the crosspage's miniature IDT.
                let host_idt = cpu.get_idt();
                cpu.set_idt(&cp.switch_host_idtr);
                self.test_switch_idt_handlers(cpu, cp);

                // Save CR state.  The monitor deals with EFER.
                let cr2 = cpu.get_cr2();
                let cr0 = cpu.get_cr0();
                let cr4 = cpu.get_cr4();
                let cr3 = cpu.get_cr3();
                cp.host_cr3 = cr3;

                // Reserved CR0 bits must ride through unchanged; reserved
                // CR4 bits are cleared instead.
                cp.ws_cr0 = (cp.ws_cr0 & !Cr0::RESERVED) | (cr0 & Cr0::RESERVED);

                if self.caps().uses_vmx() {
                    cp.ws_cr4 |= Cr4::VMXE;
                }

                // MCE and PCIDE always reflect the host.  PGE must stay
                // clear so loading the monitor CR4 flushes global
                // translations.
                cp.ws_cr4 =
                    (cp.ws_cr4 & !(Cr4::MCE | Cr4::PCIDE)) | (cr4 & (Cr4::MCE | Cr4::PCIDE));
                debug_assert_eq!(cp.ws_cr4 & Cr4::PGE, 0);

                // The monitor CR3 cannot be loaded yet; this code is not
                // mapped there.
                cpu.set_cr0(cp.ws_cr0);
                cpu.set_cr4(cp.ws_cr4);

                save_debug_registers(cpu, cp);

                let host_gdt = cpu.get_gdt();

                // Enter HV root mode.  A refused VMXON means a foreign
                // hypervisor got there first: remember its VMCS, skip
                // VMXOFF on the way out, and hand its VMCS back.
                let mut need_vmxoff = false;
                let mut foreign_vmcs: Option<Ma> = None;
                let mut svm_saved: Option<(u64, u64)> = None;
                if self.caps().uses_vmx() {
                    if cpu.vmxon(hv_root.address()) {
                        need_vmxoff = true;
                    } else {
                        foreign_vmcs = Some(cpu.vmptrst());
                    }
                }
                if self.caps().uses_svm() {
                    let efer = cpu.rdmsr(msr_index::IA32_EFER);
                    if efer & MsrEfer::SVME == 0 {
                        cpu.wrmsr(msr_index::IA32_EFER, efer | MsrEfer::SVME);
                    }
                    let foreign_hsave = cpu.rdmsr(msr_index::AMD_VM_HSAVE_PA);
                    cpu.wrmsr(msr_index::AMD_VM_HSAVE_PA, hv_root.address().0);
                    svm_saved = Some((efer, foreign_hsave));
                }

                // Segments are saved out here rather than in the switch
                // code, both to keep that code small and because loading a
                // selector that lives in the LDT would fault after the
                // LDT is gone.
                let cs = cpu.get_segment(SegmentRegister::Cs);
                let mut ss = cpu.get_segment(SegmentRegister::Ss);
                let ds = cpu.get_segment(SegmentRegister::Ds);
                let es = cpu.get_segment(SegmentRegister::Es);
                let fs = cpu.get_segment(SegmentRegister::Fs);
                let gs = cpu.get_segment(SegmentRegister::Gs);
                let host_ldt = cpu.get_ldt();
                let host_tr = cpu.get_tr();

                let kernel_gs_base = cpu.rdmsr(msr_index::IA32_KERNEL_GS_BASE);
                let gs_base = cpu.rdmsr(msr_index::IA32_GS_BASE);
                let fs_base = cpu.rdmsr(msr_index::IA32_FS_BASE);

                // Worldswitch restores DS and ES from SS on the way back,
                // so SS must not be null.
                if ss.is_null() {
                    ss = self.kernel_stack_segment();
                    cpu.set_segment(SegmentRegister::Ss, ss);
                }

                if self.spec_ctrl_available() {
                    cp.spec_ctrl = cpu.rdmsr(msr_index::IA32_SPEC_CTRL);
                }

                debug_assert_eq!(cp.mon_tiny_stack[0], TINY_STACK_SENTINEL);
                debug_assert_eq!(cp.host_tiny_stack[0], TINY_STACK_SENTINEL);

                // The point of no return, until the monitor decides to
                // come back.
                unsafe { cpu.host_to_vmm(cp) };

                debug_assert_eq!(cp.mon_tiny_stack[0], TINY_STACK_SENTINEL);
                debug_assert_eq!(cp.host_tiny_stack[0], TINY_STACK_SENTINEL);

                // Unwind, in reverse.
                if need_vmxoff {
                    cpu.vmxoff();
                } else if let Some(foreign) = foreign_vmcs {
                    cpu.vmptrld(foreign);
                }
                if let Some((efer, foreign_hsave)) = svm_saved {
                    cpu.wrmsr(msr_index::AMD_VM_HSAVE_PA, foreign_hsave);
                    if efer & MsrEfer::SVME == 0 {
                        cpu.wrmsr(msr_index::IA32_EFER, efer);
                    }
                }

                // CR3 came back with the worldswitch; CR2 always needs
                // restoring, CR0/CR4 only when the working values differ.
                cpu.set_cr2(cr2);
                if cp.ws_cr0 != cr0 {
                    cpu.set_cr0(cr0);
                }
                if cp.ws_cr4 != cr4 {
                    cpu.set_cr4(cr4);
                } else if cr4 & Cr4::PCIDE != 0 {
                    // Flush everything tied to PCID 0.
                    debug_assert_eq!(cr4 & Cr4::PGE, 0);
                    cpu.set_cr4(cr4 | Cr4::PGE);
                    cpu.set_cr4(cr4);
                }
                if cfg!(debug_assertions) {
                    debug_assert_eq!(cpu.get_cr0(), cr0);
                    debug_assert_eq!(cpu.get_cr4(), cr4);
                    debug_assert_eq!(cpu.get_cr3(), cr3);
                }

                // Worldswitch returned on the crossGDT; bring back the
                // host GDT, TR (busy-bit dance included) and LDT.
                restore_host_gdt_tr_ldt(cpu, tmp_gdt, host_gdt, host_ldt, cs, host_tr);

                cpu.set_segment(SegmentRegister::Ds, ds);
                cpu.set_segment(SegmentRegister::Es, es);

                // Selectors first, then overwrite the descriptor-cached
                // bases with the saved 64-bit values.
                cpu.set_segment(SegmentRegister::Fs, fs);
                cpu.set_segment(SegmentRegister::Gs, gs);
                cpu.wrmsr(msr_index::IA32_FS_BASE, fs_base);
                cpu.wrmsr(msr_index::IA32_GS_BASE, gs_base);
                cpu.wrmsr(msr_index::IA32_KERNEL_GS_BASE, kernel_gs_base);

                restore_debug_registers(cpu, cp);

                debug_assert!(!cpu.get_flags().interrupt_enable());

                cpu.set_idt(&host_idt);

                if pebs_msr != 0 {
                    cpu.wrmsr(msr_index::IA32_PEBS_ENABLE, pebs_msr);
                }
                if pt_msr & worldswitch_arch_amd64::RTIT_CTL_TRACE_EN != 0 {
                    cpu.wrmsr(msr_index::IA32_RTIT_CTL, pt_msr);
                }

                ptsc::update_latest(self.host(), cpu, &vm.ptsc, cp);
                vcpu.current_host_cpu
                    .store(INVALID_PCPU, std::sync::atomic::Ordering::Release);

                // Anything the switch IDT caught gets handed to the host
                // now that the host can take it.  The handlers returned
                // with lretq, so an NMI taken mid-switch still has NMI
                // delivery blocked; the int below is what unblocks it.
                if cp.got_exception(EXC_NMI) {
                    cp.set_exception(EXC_NMI, false);
                    cpu.raise_interrupt(EXC_NMI);
                    summary.nmi_forwarded = true;
                }
                if cp.got_exception(EXC_MC) {
                    cp.set_exception(EXC_MC, false);
                    tracing::debug!("forwarding machine check to host");
                    cpu.raise_interrupt(EXC_MC);
                    summary.mce_forwarded = true;
                }
                if cp.got_exception(EXC_UD) {
                    cp.set_exception(EXC_UD, false);
                    tracing::warn!(
                        rip = format_args!("{:#x}", cp.ws_ud2),
                        "#UD occurred on switch back to host",
                    );
                    switch_ok = false;
                }

                // An NMI that interrupted the guest (rather than the
                // switch) must reach the host too, but the monitor may
                // have been mid-critical-region, so go right back in.
                if cp.module_call_type == module_call::MODULECALL_INTR
                    && cp.args[0] == u64::from(EXC_NMI)
                {
                    cpu.raise_interrupt(EXC_NMI);
                    cp.retry_world_switch = 1;
                }

                if !take_retry(cp) {
                    break;
                }
            }

            summary.module_call = decode_module_call(cp);

            if cp.module_call_type == module_call::MODULECALL_INTR {
                // Some hosts expect RFLAGS.AC live while handling an
                // interrupt; put it back before raising if the caller had
                // it.
                if flags.alignment_check() {
                    let current = cpu.get_flags();
                    cpu.set_flags(Rflags(current.0 | Rflags::AC));
                }

                // Raise before interrupts come back on.  Only #MC and the
                // vectors from 0x14 up are acceptable; the host owns
                // everything below.
                let vector = cp.args[0];
                if vector == u64::from(EXC_MC) || (0x14..=0xFF).contains(&vector) {
                    cpu.raise_interrupt(vector as u8);
                } else {
                    tracing::warn!(vector, "received unexpected interrupt");
                    cpu.set_flags(flags);
                    apic::restore_nmi(cpu, &vm.apic, nmi_state);
                    return Err(SwitchError::UnexpectedInterrupt { vector });
                }
            }

            if !switch_ok {
                cpu.set_flags(flags);
                apic::restore_nmi(cpu, &vm.apic, nmi_state);
                return Err(SwitchError::UndefinedOpcode);
            }
        }

        cpu.set_flags(flags);
        apic::restore_nmi(cpu, &vm.apic, nmi_state);
        Ok(summary)
    }

    /// First-switch self-test: raise each handled vector against the
    /// freshly loaded switch IDT and check the witnesses.  Hardware only;
    /// debug builds only.
    fn test_switch_idt_handlers<C: Cpu>(&self, cpu: &mut C, cp: &mut CrossPageData) {
        if !cfg!(debug_assertions) || !C::HARDWARE {
            return;
        }
        if self
            .switch_idt_tested()
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }

        for vector in [EXC_DB, EXC_NMI, EXC_MC] {
            let saved = cp.got_exception(vector);
            cp.set_exception(vector, false);
            cpu.raise_interrupt(vector);
            debug_assert!(cp.got_exception(vector), "switch IDT vector {vector} dead");
            cp.set_exception(vector, saved);
        }
    }
}

#[cfg(test)]
#[path = "switch_tests.rs"]
mod switch_tests;
