//! The monitor's fixed address-space layout.
//!
//! The monitor owns the top 64 MiB of the 64-bit virtual address space,
//! carved into 2 MiB-aligned container regions.  Only the items the switch
//! driver needs to know about are named here; everything is expressed in
//! pages from [`MONITOR_LINEAR_START`] so the region arithmetic stays
//! visible.
//!
//! Keeping the monitor in the sign-extendable top 2 GiB matters: the
//! crosspage code addresses its own data page with 32-bit absolute
//! displacements.

use worldswitch_arch_amd64::{PAGE_SHIFT, PAGE_SIZE};

use crate::{La, Lpn};

/// Size of the monitor address space, in pages.
pub const MONITOR_SIZE_PAGES: u64 = 16384;

/// First linear address of the monitor region (top 64 MiB).
pub const MONITOR_LINEAR_START: La = La(0u64.wrapping_sub(MONITOR_SIZE_PAGES * PAGE_SIZE));

/// First linear page number of the monitor region.
pub const MONITOR_START_LPN: Lpn = Lpn(MONITOR_LINEAR_START.0 >> PAGE_SHIFT);

/// Last linear page number of the monitor region.
pub const MONITOR_END_LPN: Lpn = Lpn(u64::MAX >> PAGE_SHIFT);

const fn page(index: u64) -> La {
    La(MONITOR_LINEAR_START.0 + index * PAGE_SIZE)
}

// Container regions, in order.
const MONITOR_READONLY_PAGES: u64 = 1024;
const MONITOR_DATA_PAGES: u64 = 512;
const TC_REGION_PAGES: u64 = 1024;

const MONITOR_DATA_BASE: u64 = MONITOR_READONLY_PAGES;
const MONITOR_MISC_BASE: u64 = MONITOR_DATA_BASE + MONITOR_DATA_PAGES + TC_REGION_PAGES;

// MONITOR_DATA items.
const MON_STACK_PAGES: u64 = 8;

/// Top of the monitor's main stack.
pub const MONITOR_STACK_TOP: La = page(MONITOR_DATA_BASE + MON_STACK_PAGES);

// MONITOR_MISC items, in order.
const CROSS_PAGE_DATA_PAGE: u64 = MONITOR_MISC_BASE;
const CROSS_PAGE_CODE_PAGE: u64 = CROSS_PAGE_DATA_PAGE + 1;
const GDT_AND_TASK_PAGE: u64 = CROSS_PAGE_CODE_PAGE + 1;
const MON_PT_PAGES: u64 = 1 + 1 + 1 + 1 + 32; // L5, L4, L3, L2, 32 x L1
const HOST_APIC_PAGE: u64 = GDT_AND_TASK_PAGE + 1 + MON_PT_PAGES;
const GUEST_APIC_PAGE: u64 = HOST_APIC_PAGE + 1;
const DF_GUARD_PAGE: u64 = GUEST_APIC_PAGE + 1;
const DF_STACK_PAGES: u64 = 1;
const MC_GUARD_PAGE: u64 = DF_GUARD_PAGE + 1 + DF_STACK_PAGES;
const MC_STACK_PAGES: u64 = 1;
const NMI_GUARD_PAGE: u64 = MC_GUARD_PAGE + 1 + MC_STACK_PAGES;
const NMI_STACK_PAGES: u64 = 4;

/// Monitor-side linear address of the crosspage data page.
pub const CROSS_PAGE_DATA_LA: La = page(CROSS_PAGE_DATA_PAGE);

/// Monitor-side linear address of the crosspage code page.
pub const CROSS_PAGE_CODE_LA: La = page(CROSS_PAGE_CODE_PAGE);

/// Monitor-side linear address of the monitor GDT and TSS page.
pub const MONITOR_GDT_LA: La = page(GDT_AND_TASK_PAGE);

/// Top of the `#DF` fault stack.
pub const DF_STACK_TOP: La = page(DF_GUARD_PAGE + 1 + DF_STACK_PAGES);

/// Top of the `#MC` fault stack.
pub const MC_STACK_TOP: La = page(MC_GUARD_PAGE + 1 + MC_STACK_PAGES);

/// Top of the `#NMI` fault stack.
pub const NMI_STACK_TOP: La = page(NMI_GUARD_PAGE + 1 + NMI_STACK_PAGES);

/// Size in bytes of the monitor GDT.
pub const MONITOR_GDT_SIZE: u32 = 0x1000;

/// Monitor code selector in the crossGDT and monitor GDT.
///
/// The monitor's crossGDT slots sit at the top of the descriptor page,
/// past the range any host kernel populates in the first page of its GDT.
pub const MONITOR_CODE_SELECTOR: u16 = 0xF80;

/// Monitor data selector; loaded into SS/DS/ES across the switch.
pub const MONITOR_DATA_SELECTOR: u16 = 0xF88;

/// Monitor TSS selector (occupies two descriptor slots).
pub const MONITOR_TSS_SELECTOR: u16 = 0xF90;

const MONITOR_MISC_PAGES: u64 = 5632;

const _: () = assert!(MONITOR_LINEAR_START.0 == 0xFFFF_FFFF_FC00_0000);
const _: () = assert!(CROSS_PAGE_DATA_LA.0 == 0xFFFF_FFFF_FCA0_0000);
const _: () = assert!(NMI_GUARD_PAGE + 1 + NMI_STACK_PAGES <= MONITOR_MISC_BASE + MONITOR_MISC_PAGES);
