//! The crosspage data page.
//!
//! One [`CrossPageData`] per VCPU, occupying a single page that is mapped at
//! the host kernel address of its allocation *and* at
//! [`CROSS_PAGE_DATA_LA`] inside the monitor.  It describes both sides of
//! the world to the switch code: saved host context, target monitor
//! context, the miniature switch IDT, the exception witnesses, the
//! page-table patch array, the module-call mailbox, and the pseudo-TSC
//! conversion.
//!
//! [`CROSS_PAGE_DATA_LA`]: crate::layout::CROSS_PAGE_DATA_LA

use std::mem::offset_of;

use worldswitch_arch_amd64::{
    Cr0, Cr4, DescriptorTableRegister, Dr6, Dr7, Gate64, NUM_EXCEPTIONS, PAGE_SIZE, Selector,
    Tss64,
};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{La, layout};

/// Layout version of [`CrossPageData`].
///
/// The monitor-side VMX writes its own copy of this constant into the page;
/// power-on refuses to proceed unless both sides were built from the same
/// layout.
pub const CROSSPAGE_VERSION: u32 = 0x2025_0003;

/// Version of this driver, reported alongside the layout version.
pub const DRIVER_VERSION: u32 = 0x0003_0000;

/// Number of page-table patch slots per VCPU.
pub const MAX_SWITCH_PT_PATCHES: usize = 8;

/// `level` value of an unused patch slot.
pub const PTP_EMPTY: u32 = 0;

/// Module-call identifiers surfaced in [`CrossPageData::module_call_type`].
#[allow(missing_docs)]
pub mod module_call {
    pub const MODULECALL_NONE: u32 = 0;
    pub const MODULECALL_INTR: u32 = 1;
    pub const MODULECALL_ALLOC_VMX_PAGE: u32 = 2;
    pub const MODULECALL_ALLOC_TMP_GDT: u32 = 3;
    pub const MODULECALL_USERCALL_NONE: u32 = 0;
}

/// One page-table patch: a PTE-rooted subtree that maps a crosspage page
/// into the monitor's address space at its host linear address.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTablePatch {
    /// Patch level, 1..=4, or [`PTP_EMPTY`].
    pub level: u32,

    /// Index of the root PTE within its page table.
    pub pte_idx: u32,

    /// Global index of the root PTE across the whole hierarchy; patches are
    /// deduplicated on `{level, pte_global_idx}`.
    pub pte_global_idx: u64,

    /// The linear page number this patch maps.
    pub lpn: u64,

    /// The root PTE value.  Before fix-up this holds the intermediary
    /// `VA | flags` form; afterwards a real `MPN | flags | P` entry.
    pub pte: u64,
}

/// The pseudo-TSC conversion, guarded by a versioned atomic.
///
/// Writers bump `version` to odd, update, then bump to even; the monitor
/// retries its read until it observes a stable even version.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PtscConv {
    /// Write-in-progress is odd.
    pub version: u32,

    /// Rate multiplier.
    pub mult: u32,

    /// Rate shift: `ptsc = mult * tsc >> shift + add`.
    pub shift: u32,

    _pad: u32,

    /// Additive offset, updated on every switch.
    pub add: u64,
}

/// The per-VCPU crosspage data page.
///
/// Field order in the two context blocks is load-bearing: the switch code
/// saves and restores them with `push`/`pop` runs anchored at the
/// `*_context` offsets below, so the compile-time assertions at the bottom
/// of this file pin the adjacency the assembly relies on.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[allow(missing_docs)]
pub struct CrossPageData {
    /// Layout version; must be the first four bytes of the page.
    pub version: u32,

    /// Driver version, for diagnostics.
    pub driver_version: u32,

    // Host context.  Saved by the switch code on the way out, reloaded on
    // the way back.
    pub host_cr3: u64,
    pub host_rbx: u64,
    pub host_rbp: u64,
    pub host_rsi: u64,
    pub host_rdi: u64,
    pub host_r12: u64,
    pub host_r13: u64,
    pub host_r14: u64,
    pub host_r15: u64,
    pub host_rsp: u64,
    pub host_ss: Selector,
    pub host_ds: Selector,
    pub host_es: Selector,
    _pad0: u16,

    // Monitor context.  The monitor's RSI/RDI are not part of its ABI
    // contract, so the block is two quadwords shorter than the host's.
    pub mon_cr3: u64,
    pub mon_rbx: u64,
    pub mon_rbp: u64,
    pub mon_r12: u64,
    pub mon_r13: u64,
    pub mon_r14: u64,
    pub mon_r15: u64,
    pub mon_rsp: u64,
    pub mon_ss: Selector,
    pub mon_ds: Selector,
    pub mon_es: Selector,
    _pad1: u16,

    /// Working CR0 for the switch: monitor template plus host reserved
    /// bits.
    pub ws_cr0: u64,

    /// Working CR4 for the switch: monitor template plus host MCE/PCIDE,
    /// never PGE.
    pub ws_cr4: u64,

    /// Host `IA32_PAT`, captured at crosspage init.
    pub host_pat: u64,

    /// Host `IA32_SPEC_CTRL` at switch time, for the monitor to honor.
    pub spec_ctrl: u64,

    /// Address of the monitor-to-host entry point; the monitor calls
    /// through this to leave.
    pub vmm_to_host_la: u64,

    /// Machine address of this page.
    pub crosspage_data_ma: u64,

    /// Host linear address of this page.
    pub crosspage_data_la: u64,

    /// Host linear address of the crosspage code page.
    pub crosspage_code_la: u64,

    /// Host linear address of the crossGDT.
    pub cross_gdt_la: u64,

    /// Descriptor for loading the crossGDT by its host linear address.
    pub cross_gdt_hkla_desc: DescriptorTableRegister,

    /// Descriptor locating the switch IDT at its host linear address.
    pub switch_host_idtr: DescriptorTableRegister,

    /// Descriptor locating the switch IDT at its monitor linear address.
    pub switch_mon_idtr: DescriptorTableRegister,

    _pad2: [u8; 2],

    /// The miniature switch IDT; present gates only for `#DB`, `#NMI`,
    /// `#UD` and `#MC`.
    pub switch_idt: [Gate64; NUM_EXCEPTIONS],

    /// Exception witnesses, indexed by vector.  Set only by the switch IDT
    /// handlers; read and cleared only by the switch driver.
    pub ws_exception: [u8; NUM_EXCEPTIONS],

    /// RIP of a `ud2` the `#UD` handler skipped.
    pub ws_ud2: u64,

    /// Saved host debug registers (indexed by register number; 4 and 5
    /// unused).
    pub host_dr: [u64; 8],

    /// Bitmap of `host_dr` entries that hold saved values.
    pub host_dr_saved: u8,

    /// Bitmap of debug registers whose hardware contents still match the
    /// host's.
    pub host_dr_in_hw: u8,

    _pad3: [u8; 6],

    /// Monitor-maintained debug register shadow.
    pub shadow_dr: [u64; 8],

    /// Bitmap of hardware debug registers currently holding shadow values.
    pub shadow_dr_in_hw: u8,

    _pad4: [u8; 7],

    /// The page-table patch array.
    pub vmm_ptp: [PageTablePatch; MAX_SWITCH_PT_PATCHES],

    /// Module-call mailbox: request kind.
    pub module_call_type: u32,

    /// Module-call mailbox: userspace call kind.
    pub user_call_type: u32,

    /// pCPU the request concerns (for per-CPU allocations).
    pub pcpu_num: u32,

    _pad5: u32,

    /// Module-call arguments.
    pub args: [u64; 4],

    /// Set when the driver must re-enter the monitor without returning to
    /// userspace (NMI-during-guest).
    pub retry_world_switch: u8,

    /// Set when a module call was interrupted and will be replayed.
    pub module_call_interrupted: u8,

    _pad6: [u8; 6],

    /// Pseudo-TSC conversion read by the monitor.
    pub pseudo_tsc_conv: PtscConv,

    /// Pseudo-TSC captured on the last switch in.
    pub world_switch_ptsc: u64,

    /// The monitor's task-state segment.
    pub mon_task: Tss64,

    /// The monitor's GDTR.
    pub mon_gdtr: DescriptorTableRegister,

    /// The host kernel's 64-bit code selector, valid in the crossGDT.
    pub host_initial64_cs: Selector,

    _pad7: [u8; 4],

    /// Scratch stack available to host-side switch code; index 0 carries a
    /// sentinel that must survive every switch.
    pub host_tiny_stack: [u64; 24],

    /// Scratch stack the monitor's first entry runs on; index 0 carries a
    /// sentinel that must survive every switch.
    pub mon_tiny_stack: [u64; 24],
}

/// Stack-overflow sentinel stored in `*_tiny_stack[0]`.
pub const TINY_STACK_SENTINEL: u64 = 0xDEAD_BEEF;

impl CrossPageData {
    /// Builds the compile-time template every crosspage starts from.
    ///
    /// Self-describing addresses (`crosspage_data_*`, `cross_gdt_*`,
    /// `switch_host_idtr`, the switch IDT gates) are filled in later by
    /// crosspage init, since they depend on the allocation.
    pub fn template() -> CrossPageData {
        let mut cp = CrossPageData::new_zeroed();

        cp.version = CROSSPAGE_VERSION;
        cp.driver_version = DRIVER_VERSION;

        cp.mon_rsp = layout::CROSS_PAGE_DATA_LA.0
            + (offset_of!(CrossPageData, mon_tiny_stack) + size_of::<[u64; 24]>()) as u64;
        cp.mon_ss = Selector(layout::MONITOR_DATA_SELECTOR);
        cp.mon_ds = Selector(layout::MONITOR_DATA_SELECTOR);
        cp.mon_es = Selector(layout::MONITOR_DATA_SELECTOR);

        cp.ws_cr0 = Cr0::PE | Cr0::MP | Cr0::EM | Cr0::NE | Cr0::WP | Cr0::PG;
        cp.ws_cr4 = Cr4::PAE | Cr4::OSFXSR;

        cp.mon_task.rsp[0] = layout::MONITOR_STACK_TOP.0;
        cp.mon_task.rsp[1] = layout::DF_STACK_TOP.0; // CPL 1 and 2 are not used.
        cp.mon_task.rsp[2] = layout::DF_STACK_TOP.0;
        cp.mon_task.ist[Tss64::IST_DF - 1] = layout::DF_STACK_TOP.0;
        cp.mon_task.ist[Tss64::IST_NMI - 1] = layout::NMI_STACK_TOP.0;
        cp.mon_task.ist[Tss64::IST_MC - 1] = layout::MC_STACK_TOP.0;
        cp.mon_task.iomap_base = size_of::<Tss64>() as u16;

        cp.mon_gdtr =
            DescriptorTableRegister::new(layout::MONITOR_GDT_LA.0, layout::MONITOR_GDT_SIZE);

        cp.shadow_dr[6] = Dr6::DEFAULT;
        cp.shadow_dr[7] = Dr7::DEFAULT;

        // The monitor-side view of the switch IDT is a compile-time
        // constant; the host-side view depends on the allocation address.
        cp.switch_mon_idtr = DescriptorTableRegister::new(
            layout::CROSS_PAGE_DATA_LA.0 + offset_of!(CrossPageData, switch_idt) as u64,
            (size_of::<Gate64>() * NUM_EXCEPTIONS) as u32,
        );

        cp.host_tiny_stack[0] = TINY_STACK_SENTINEL;
        cp.mon_tiny_stack[0] = TINY_STACK_SENTINEL;

        cp
    }

    /// Populates the switch IDT with the four handled gates and points the
    /// host-side IDTR at it.
    ///
    /// `data_host_la` is the host linear address of this page and
    /// `handler_la` maps an exception vector to the host linear address of
    /// its handler inside the crosspage code page (identical in both
    /// address spaces).
    pub fn init_switch_idt(&mut self, data_host_la: La, handler_la: impl Fn(u8) -> La) {
        let cs = self.host_initial64_cs;

        for gate in self.switch_idt.iter_mut() {
            *gate = Gate64::default();
        }
        for vector in worldswitch_arch_amd64::ExceptionVector::SWITCH_HANDLED {
            let la = handler_la(vector.vector());
            self.switch_idt[vector.vector() as usize] = Gate64::interrupt_gate(cs, la.0);
        }

        self.switch_host_idtr = DescriptorTableRegister::new(
            data_host_la.0 + offset_of!(CrossPageData, switch_idt) as u64,
            (size_of::<Gate64>() * NUM_EXCEPTIONS) as u32,
        );
    }

    /// Reads an exception witness.
    pub fn got_exception(&self, vector: u8) -> bool {
        self.ws_exception[vector as usize] != 0
    }

    /// Writes an exception witness.
    pub fn set_exception(&mut self, vector: u8, value: bool) {
        self.ws_exception[vector as usize] = u8::from(value);
    }
}

// The whole page contract: version first, everything within one page.
const _: () = assert!(offset_of!(CrossPageData, version) == 0);
const _: () = assert!(size_of::<CrossPageData>() <= PAGE_SIZE as usize);

// The push/pop adjacency the switch code depends on.  The "full" anchor of
// each context block is its CR3 field; the "empty" anchor is its DS field,
// two bytes past the saved SS.
const _: () = {
    let base = offset_of!(CrossPageData, host_cr3);
    assert!(offset_of!(CrossPageData, host_rbx) == base + 8);
    assert!(offset_of!(CrossPageData, host_rbp) == base + 16);
    assert!(offset_of!(CrossPageData, host_rsi) == base + 24);
    assert!(offset_of!(CrossPageData, host_rdi) == base + 32);
    assert!(offset_of!(CrossPageData, host_r12) == base + 40);
    assert!(offset_of!(CrossPageData, host_r15) == base + 64);
    assert!(offset_of!(CrossPageData, host_rsp) == base + 72);
    assert!(offset_of!(CrossPageData, host_ss) == base + 80);
    assert!(offset_of!(CrossPageData, host_ds) == base + 82);
};

const _: () = {
    let base = offset_of!(CrossPageData, mon_cr3);
    assert!(offset_of!(CrossPageData, mon_rbx) == base + 8);
    assert!(offset_of!(CrossPageData, mon_rbp) == base + 16);
    assert!(offset_of!(CrossPageData, mon_r12) == base + 24);
    assert!(offset_of!(CrossPageData, mon_r15) == base + 48);
    assert!(offset_of!(CrossPageData, mon_rsp) == base + 56);
    assert!(offset_of!(CrossPageData, mon_ss) == base + 64);
    assert!(offset_of!(CrossPageData, mon_ds) == base + 66);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_versioned() {
        let cp = CrossPageData::template();
        assert_eq!(cp.version, CROSSPAGE_VERSION);
        assert_eq!(cp.mon_ss.0, layout::MONITOR_DATA_SELECTOR);
        assert_eq!(cp.host_tiny_stack[0], TINY_STACK_SENTINEL);
        assert_eq!(cp.mon_tiny_stack[0], TINY_STACK_SENTINEL);
    }

    #[test]
    fn template_cr_composition_excludes_pge() {
        let cp = CrossPageData::template();
        assert_eq!(cp.ws_cr4 & Cr4::PGE, 0);
        assert_ne!(cp.ws_cr0 & Cr0::PG, 0);
    }

    #[test]
    fn switch_idt_gates() {
        let mut cp = CrossPageData::template();
        cp.host_initial64_cs = Selector(0x10);
        cp.init_switch_idt(La(0xFFFF_8880_1234_5000), |vec| {
            La(0xFFFF_8880_0000_0000 + u64::from(vec) * 0x10)
        });

        for vector in [1u8, 2, 6, 18] {
            assert!(cp.switch_idt[vector as usize].present(), "vector {vector}");
        }
        assert!(!cp.switch_idt[0].present());
        assert!(!cp.switch_idt[3].present());

        let idtr = cp.switch_host_idtr;
        let idtr_base = idtr.base;
        assert_eq!(
            idtr_base,
            0xFFFF_8880_1234_5000 + offset_of!(CrossPageData, switch_idt) as u64
        );
        assert_eq!(idtr.size() as usize, size_of::<Gate64>() * NUM_EXCEPTIONS);
    }
}
