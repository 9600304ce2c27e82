//! The world-switch engine.
//!
//! This crate is the core of a hosted x86-64 hypervisor driver: it moves a
//! physical CPU from host context into monitor context and back, keeping
//! both sides whole.  The pieces, bottom up:
//!
//! - [`caps`] — probe the CPUs and reduce their virtualization feature
//!   MSRs to the common vector every pCPU honors.
//! - [`hvroot`] — per-pCPU VMXON region / SVM host-save-area pages,
//!   lazily raced into existence.
//! - [`crossgdt`] — the one descriptor page valid on both sides of the
//!   switch.
//! - [`crosspage`] — the shared data page layout and the switch code page.
//! - [`ptpatch`] — surgical insertion of the crosspage mappings into the
//!   monitor's page tables.
//! - [`ptsc`] — the per-VM monotonic pseudo-TSC.
//! - [`apic`] — NMI-class LVT masking around the switch.
//! - the switch driver itself, [`WorldSwitch::switch`].
//!
//! The host kernel is reached only through the traits in [`host`]; ring-0
//! instructions only through the trait in [`cpu`].  Everything above the
//! two trait seams is testable in userspace.

pub mod apic;
pub mod caps;
mod core;
pub mod cpu;
pub mod crossgdt;
pub mod crosspage;
mod error;
pub mod host;
pub mod hvroot;
pub mod layout;
pub mod ptpatch;
pub mod ptsc;
mod switch;
mod vm;

use once_cell::sync::OnceCell;
use std::sync::atomic::AtomicBool;

use worldswitch_arch_amd64::{
    Cr4, MISC_ENABLE_EMON, MISC_ENABLE_PEBS_UNAVAILABLE, SegmentDescriptor, Selector,
    msr_index,
};

pub use self::{
    core::{INVALID_MPN, La, Lpn, Ma, Mpn, PcpuId, VcpuId},
    crossgdt::{CrossGdt, CrossGdtInit, CrossGdtInitEntry},
    error::SwitchError,
    switch::{ModuleCall, SwitchSummary},
    vm::{INVALID_PCPU, Vm, VmConfig},
};

use self::{
    caps::HostHvSupport,
    cpu::{Cpu, SegmentRegister},
    crosspage::CROSSPAGE_VERSION,
    host::HostOps,
    hvroot::{HvRootPages, TmpGdts},
};

/// The driver core: global state created at load time, shared by every VM.
pub struct WorldSwitch<H: HostOps> {
    host: H,
    caps: HostHvSupport,
    hv_root: HvRootPages,
    tmp_gdts: TmpGdts,
    use_tmp_gdt: bool,
    cross_gdt: OnceCell<CrossGdt>,
    kernel_stack_segment: Selector,
    pebs_available: bool,
    pt_available: bool,
    spec_ctrl_available: bool,
    switch_idt_tested: AtomicBool,
}

impl<H: HostOps> WorldSwitch<H> {
    /// Driver load: validates the crosspage code, finds a flat kernel data
    /// segment, probes the hardware, and sets up the per-pCPU slots.
    pub fn new<C: Cpu>(host: H, cpu: &mut C) -> Result<WorldSwitch<H>, SwitchError> {
        #[cfg(target_arch = "x86_64")]
        if !crosspage::code::code_fits_one_page() {
            tracing::warn!("crosspage code validation failed");
            return Err(SwitchError::CrosspageCodeTooLarge);
        }

        // The worldswitch code temporarily restores the data segments from
        // the stack segment, so a zero SS cannot be tolerated; find a
        // non-zero flat kernel read/write data segment up front.
        let kernel_stack_segment = find_flat_writeable_data_segment(cpu);
        if kernel_stack_segment.is_null() || kernel_stack_segment.0 & 7 != 0 {
            tracing::warn!(ss = kernel_stack_segment.0, "unsupported kernel stack segment");
            return Err(SwitchError::NoKernelDataSegment);
        }

        let caps = caps::probe(cpu, &host);

        // PEBS is available when performance monitoring exists and PEBS is
        // not fused off.  Mixed CPU models are not expected.
        let pebs_available = host
            .safe_rdmsr(msr_index::IA32_MISC_ENABLE)
            .is_some_and(|misc| {
                misc & MISC_ENABLE_EMON != 0 && misc & MISC_ENABLE_PEBS_UNAVAILABLE == 0
            });

        let leaf7 = cpu.cpuid(7, 0);
        let pt_available = leaf7.ebx & (1 << 25) != 0;
        let spec_ctrl_available = leaf7.edx & (1 << 26) != 0;

        let num_pcpus = host.num_pcpus();
        let use_tmp_gdt = host.needs_temporary_gdt();

        Ok(WorldSwitch {
            caps,
            hv_root: HvRootPages::new(num_pcpus),
            tmp_gdts: TmpGdts::new(num_pcpus),
            use_tmp_gdt,
            cross_gdt: OnceCell::new(),
            kernel_stack_segment,
            pebs_available,
            pt_available,
            spec_ctrl_available,
            switch_idt_tested: AtomicBool::new(false),
            host,
        })
    }

    /// The host-OS interface.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// What the hardware supports.
    pub fn caps(&self) -> &HostHvSupport {
        &self.caps
    }

    /// The crossGDT, once created.
    pub fn cross_gdt(&self) -> Option<&CrossGdt> {
        self.cross_gdt.get()
    }

    pub(crate) fn hv_root(&self) -> &HvRootPages {
        &self.hv_root
    }

    pub(crate) fn tmp_gdts(&self) -> &TmpGdts {
        &self.tmp_gdts
    }

    pub(crate) fn use_tmp_gdt(&self) -> bool {
        self.use_tmp_gdt
    }

    pub(crate) fn kernel_stack_segment(&self) -> Selector {
        self.kernel_stack_segment
    }

    pub(crate) fn pebs_available(&self) -> bool {
        self.pebs_available
    }

    pub(crate) fn pt_available(&self) -> bool {
        self.pt_available
    }

    pub(crate) fn spec_ctrl_available(&self) -> bool {
        self.spec_ctrl_available
    }

    pub(crate) fn switch_idt_tested(&self) -> &AtomicBool {
        &self.switch_idt_tested
    }

    /// Allocates (or verifies) the crossGDT and installs a VM's monitor
    /// descriptors.  Called at each VM power-on; the first call also runs
    /// the host phase.
    pub fn create_cross_gdt<C: Cpu>(
        &self,
        cpu: &mut C,
        init: &CrossGdtInit,
    ) -> Result<(), SwitchError> {
        self.host.global_lock(2);
        let result = (|| {
            if self.cross_gdt.get().is_none() {
                let gdt = CrossGdt::create(&self.host, cpu)?;
                // The global lock serializes creation; set cannot race.
                let _ = self.cross_gdt.set(gdt);
            }
            self.cross_gdt
                .get()
                .expect("just created")
                .set_monitor_entries(&self.host, init)
        })();
        self.host.global_unlock(2);
        result
    }

    /// Module-call service: allocate the HV root page of a pCPU from a
    /// context where allocation is legal.
    pub fn alloc_hv_root(&self, pcpu: PcpuId) -> Result<(), SwitchError> {
        if self.hv_root.get_or_alloc(&self.host, pcpu).is_invalid() {
            return Err(SwitchError::Alloc);
        }
        Ok(())
    }

    /// Module-call service: allocate the temporary GDT of a pCPU.
    pub fn alloc_tmp_gdt(&self, pcpu: PcpuId) -> Result<(), SwitchError> {
        match self.tmp_gdts.get_or_alloc(&self.host, pcpu) {
            Some(_) => Ok(()),
            None => Err(SwitchError::Alloc),
        }
    }

    /// Initializes every VCPU's crosspage for a VM whose monitor occupies
    /// `[mon_start, mon_end]`: self-descriptors, page-table patches, the
    /// switch IDT, and the PTSC conversion.
    pub fn init_crosspage<C: Cpu>(
        &self,
        cpu: &mut C,
        vm: &Vm,
        mon_start: Lpn,
        mon_end: Lpn,
    ) -> Result<(), SwitchError> {
        let cross_gdt = self.cross_gdt.get().ok_or(SwitchError::NoCrossGdt)?;
        let mut num_ptp_pages: u16 = 0;

        for index in 0..vm.num_vcpus() {
            let vcpuid = VcpuId(index as u32);
            // Power-on path: this thread is the crosspage's only writer.
            let cp = unsafe { &mut *vm.crosspage_ptr(vcpuid) };

            // cp.version is the monitor side's claim; CROSSPAGE_VERSION is
            // ours.
            if cp.version != CROSSPAGE_VERSION {
                tracing::warn!(
                    driver = format_args!("{CROSSPAGE_VERSION:#x}"),
                    monitor = format_args!("{:#x}", cp.version),
                    "crosspage version mismatch",
                );
                return Err(SwitchError::VersionMismatch {
                    driver: CROSSPAGE_VERSION,
                    monitor: cp.version,
                });
            }

            let data_la = La(vm.crosspage_ptr(vcpuid) as u64);
            cp.crosspage_data_ma = vm.vcpus[index].crosspage.mpn.address().0;
            cp.crosspage_data_la = data_la.0;
            cp.crosspage_code_la = Self::code_la().0;
            cp.vmm_to_host_la = Self::vmm_to_host_la().0;
            cp.cross_gdt_la = cross_gdt.la().0;
            cp.cross_gdt_hkla_desc = cross_gdt.descriptor();
            if self.caps.xsave {
                cp.ws_cr4 |= Cr4::OSXSAVE;
            }
            cp.mon_cr3 = vm.vcpus[index].pt_root.address().0;
            cp.host_pat = cpu.rdmsr(msr_index::IA32_PAT);

            self.host.vm_lock(39);
            let created = {
                let mut tracker = vm.vcpus[index].tracker.lock().unwrap();
                ptpatch::create_patches(
                    &self.host,
                    &mut tracker,
                    cp,
                    mon_start,
                    mon_end,
                    cross_gdt.mpn(),
                )
            };
            self.host.vm_unlock(39);

            num_ptp_pages += created.inspect_err(|_| {
                tracing::warn!(vcpu = vcpuid.0, "could not create page table patches");
            })?;

            ptpatch::apply_patches(&self.host, cp).inspect_err(|_| {
                tracing::warn!(vcpu = vcpuid.0, "could not apply page table patches");
            })?;

            if cfg!(debug_assertions) {
                ptpatch::verify_patches(&self.host, cp, cross_gdt.mpn()).inspect_err(|_| {
                    tracing::warn!(vcpu = vcpuid.0, "page table patches failed verification");
                })?;
            }

            // The host code selector has to stay loadable while the
            // crossGDT is active, which the host phase guarantees for
            // first-page GDT selectors.
            let cs = cpu.get_segment(SegmentRegister::Cs);
            debug_assert_eq!(cs.rpl(), 0);
            debug_assert_eq!(cs.clear_rpl().0 & 0b100, 0);
            cp.host_initial64_cs = cs;

            cp.module_call_interrupted = 0;
            ptsc::reset_conversion(cp);
            cp.world_switch_ptsc = self.host.pseudo_tsc();

            cp.init_switch_idt(data_la, |vector| Self::handler_la(vector));
        }

        // Report the patch-page overhead so the bootstrap can account for
        // it in a later module call.
        vm.set_num_ptp_pages(num_ptp_pages);

        Ok(())
    }

    /// Driver unload: frees all global allocations.
    pub fn terminate(mut self) {
        self.hv_root.free_all(&self.host);
        if let Some(cross_gdt) = self.cross_gdt.take() {
            cross_gdt.free(&self.host);
        }
        self.tmp_gdts.free_all(&self.host);
    }

    #[cfg(target_arch = "x86_64")]
    fn code_la() -> La {
        crosspage::code::code_begin_la()
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn code_la() -> La {
        La(0)
    }

    #[cfg(target_arch = "x86_64")]
    fn vmm_to_host_la() -> La {
        crosspage::code::vmm_to_host_la()
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn vmm_to_host_la() -> La {
        La(0)
    }

    #[cfg(target_arch = "x86_64")]
    fn handler_la(vector: u8) -> La {
        crosspage::code::handler_la(vector)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn handler_la(_vector: u8) -> La {
        La(0)
    }
}

/// Searches the host GDT for a flat writeable kernel data segment.
///
/// Limit and granularity are deliberately not checked: host and monitor
/// are both 64-bit, where they are ignored, and operating systems disagree
/// about what to put there.
fn find_flat_writeable_data_segment<C: Cpu>(cpu: &mut C) -> Selector {
    let gdtr = cpu.get_gdt();
    let count = (gdtr.size() as usize) / size_of::<SegmentDescriptor>();

    for index in 1..count.saturating_sub(1) {
        // The host GDT is kernel-mapped for limit + 1 bytes.
        let descriptor: SegmentDescriptor = unsafe {
            (gdtr.base as *const SegmentDescriptor).add(index).read()
        };
        if descriptor.writeable_data()
            && descriptor.base() == 0
            && descriptor.dpl() == 0
            && descriptor.db()
        {
            return Selector((index * size_of::<SegmentDescriptor>()) as u16);
        }
    }
    Selector::NULL
}
