//! The page-table patch engine.
//!
//! While the CPU runs crosspage code it is already using the monitor's CR3,
//! yet it still fetches instructions from the crosspage code page and loads
//! data from the crosspage data page and the crossGDT, all at their host
//! linear addresses.  This module builds the minimal page-table subtrees
//! ("patches") that make those three pages visible inside the monitor's
//! address space without colliding with any existing monitor mapping.
//!
//! A patch is a single root PTE plus the freshly allocated tables below it.
//! The root sits at the highest paging level where the target address's
//! translation path diverges from the monitor's own address range, so the
//! patch shares upper tables with the monitor and owns everything beneath.
//!
//! Patch construction happens in two passes.  While building, entries above
//! the leaf hold an intermediary `kernel VA | flags` form (present bit
//! clear) so the construction walk can follow plain pointers.  Once all
//! patches exist, a fix-up pass rewrites each intermediary entry into a
//! real `MPN | flags | P` PTE using the tracker's VA→MPN record.
//!
//! After the first switch completes, the monitor owns patching and
//! unpatching around its own exits; this driver never touches the patches
//! again.

use indexmap::IndexMap;
use smallvec::SmallVec;

use worldswitch_arch_amd64::{
    PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PageTableEntry, PageTableLevel, PteFlags, pte_global_index,
    pte_index,
};

use crate::{
    La, Lpn, Ma, Mpn, SwitchError,
    crosspage::{CrossPageData, MAX_SWITCH_PT_PATCHES, PTP_EMPTY, PageTablePatch},
    host::{HostAlloc, HostPhysMem, KernelPages},
};

/// Leaf entries are fully formed from the start.
fn leaf_flags() -> PteFlags {
    PteFlags::PRESENT | PteFlags::RW | PteFlags::ACCESSED | PteFlags::DIRTY
}

/// Non-leaf entries stay non-present until fix-up.
fn table_flags() -> PteFlags {
    PteFlags::RW | PteFlags::ACCESSED | PteFlags::DIRTY
}

/// VA→MPN record of the pages allocated for patch subtrees.
///
/// Owned by the VCPU; the pages live until [`cleanup`].
#[derive(Default)]
pub struct PtpTracker {
    pages: IndexMap<u64, KernelPages>,
}

impl PtpTracker {
    /// Creates an empty tracker.
    pub fn new() -> PtpTracker {
        PtpTracker::default()
    }

    /// Number of pages allocated so far.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Checks if no pages have been allocated.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn lookup_vpn(&self, vpn: u64) -> Mpn {
        self.pages
            .get(&vpn)
            .map(|pages| pages.mpn)
            .expect("patch page missing from tracker")
    }

    fn alloc_page<H: HostAlloc>(&mut self, host: &H) -> Result<*mut u64, SwitchError> {
        let pages = host.alloc_kernel_pages(1)?;
        // The construction walk assumes zeroed tables.
        unsafe { std::ptr::write_bytes(pages.ptr.as_ptr(), 0, PAGE_SIZE as usize) };
        self.pages.insert(pages.ptr.as_ptr() as u64 >> PAGE_SHIFT, pages);
        Ok(pages.ptr.as_ptr().cast())
    }
}

/// Frees every patch page of a VCPU.  Teardown only.
pub fn cleanup<H: HostAlloc>(host: &H, tracker: &mut PtpTracker) {
    for (_, pages) in tracker.pages.drain(..) {
        unsafe { host.free_kernel_pages(1, pages) };
    }
}

/// Finds the level at which `lpn`'s translation path first diverges from
/// the monitor's address range: the highest level whose global index falls
/// outside the monitor's global index span.
fn locate_patch_level(lpn: Lpn, mon_start: Lpn, mon_end: Lpn) -> Option<PageTableLevel> {
    for level in PageTableLevel::TOP_DOWN {
        let idx = pte_global_index(lpn.0, level);
        if idx < pte_global_index(mon_start.0, level) || idx > pte_global_index(mon_end.0, level) {
            return Some(level);
        }
    }
    None
}

fn search_patch(cp: &CrossPageData, lpn: Lpn, level: PageTableLevel) -> Option<usize> {
    let global_idx = pte_global_index(lpn.0, level);
    (0..MAX_SWITCH_PT_PATCHES).find(|&i| {
        cp.vmm_ptp[i].level == level as u32 && cp.vmm_ptp[i].pte_global_idx == global_idx
    })
}

fn save_patch(
    cp: &mut CrossPageData,
    lpn: Lpn,
    level: PageTableLevel,
) -> Result<usize, SwitchError> {
    let pte_idx = pte_index(lpn.0, level) as u32;
    let pte_global_idx = pte_global_index(lpn.0, level);

    for i in 0..MAX_SWITCH_PT_PATCHES {
        let patch = &mut cp.vmm_ptp[i];
        debug_assert!(
            patch.level != level as u32
                || patch.pte_global_idx != pte_global_idx
                || patch.pte_idx != pte_idx,
        );
        if patch.level == PTP_EMPTY {
            *patch = PageTablePatch {
                level: level as u32,
                pte_idx,
                pte_global_idx,
                lpn: lpn.0,
                pte: 0,
            };
            return Ok(i);
        }
    }
    Err(SwitchError::PatchTableFull)
}

/// Creates (or extends) the patch mapping `lpn` to `mpn`.
///
/// New subtree entries are written in the intermediary `VA | flags` form;
/// `num_pages` counts the pages allocated on behalf of this VM.
fn create_patch<H: HostAlloc>(
    host: &H,
    tracker: &mut PtpTracker,
    cp: &mut CrossPageData,
    mon_start: Lpn,
    mon_end: Lpn,
    lpn: Lpn,
    mpn: Mpn,
    num_pages: &mut u16,
) -> Result<(), SwitchError> {
    let Some(top) = locate_patch_level(lpn, mon_start, mon_end) else {
        tracing::warn!(
            %lpn,
            "cannot create page table patch: LPN overlaps with the VMM address space",
        );
        return Err(SwitchError::MonitorOverlap { lpn });
    };

    let slot = match search_patch(cp, lpn, top) {
        Some(slot) => slot,
        None => save_patch(cp, lpn, top)?,
    };

    // Walk the patch-rooted subtree down to the leaf level, allocating
    // tables as needed.  The root entry lives in the patch record itself;
    // everything below lives in tracker pages reachable by plain pointers
    // thanks to the intermediary form.
    let mut level = top;
    let mut pte_ptr: *mut u64 = &mut cp.vmm_ptp[slot].pte;
    while let Some(next) = level.down() {
        let entry = unsafe { *pte_ptr };
        debug_assert!(entry & PteFlags::PRESENT.bits() == 0);

        let table: *mut u64 = if entry & PAGE_MASK == 0 {
            let table = tracker.alloc_page(host).map_err(|err| {
                tracing::warn!("failed to allocate page for page table patch");
                err
            })?;
            *num_pages += 1;
            unsafe { *pte_ptr = table as u64 | table_flags().bits() };
            table
        } else {
            (entry & PAGE_MASK) as *mut u64
        };

        level = next;
        pte_ptr = unsafe { table.add(pte_index(lpn.0, level) as usize) };
    }

    debug_assert!(unsafe { *pte_ptr } == 0);
    unsafe { *pte_ptr = PageTableEntry::new(mpn.0, leaf_flags()).0 };

    Ok(())
}

fn fixup_entry(tracker: &PtpTracker, pte_ptr: *mut u64, level: PageTableLevel) {
    let entry = unsafe { *pte_ptr };
    let table_va = entry & PAGE_MASK;
    let flags = entry & (PAGE_SIZE - 1);

    if level == PageTableLevel::L1 {
        debug_assert!(flags & PteFlags::PRESENT.bits() != 0); // already a PTE
        return;
    }
    if table_va == 0 {
        return;
    }

    debug_assert!(flags & PteFlags::PRESENT.bits() == 0); // still intermediary
    let mpn = tracker.lookup_vpn(table_va >> PAGE_SHIFT);
    unsafe {
        *pte_ptr = PageTableEntry::new(
            mpn.0,
            PteFlags::from_bits_truncate(flags) | PteFlags::PRESENT,
        )
        .0;
    }

    let next = level.down().expect("not at leaf");
    let table = table_va as *mut u64;
    for i in 0..(PAGE_SIZE as usize / size_of::<u64>()) {
        let child = unsafe { table.add(i) };
        if unsafe { *child } != 0 {
            fixup_entry(tracker, child, next);
        }
    }
}

/// Converts every intermediary entry of every patch into its final PTE
/// form.
fn fixup_patches(tracker: &PtpTracker, cp: &mut CrossPageData) {
    for i in 0..MAX_SWITCH_PT_PATCHES {
        let level = cp.vmm_ptp[i].level;
        if level == PTP_EMPTY {
            break;
        }
        let level = PageTableLevel::from_raw(level).expect("valid patch level");
        fixup_entry(tracker, &mut cp.vmm_ptp[i].pte, level);
    }
}

/// Creates the three crosspage patches for one VCPU and fixes them up.
///
/// Returns the number of pages allocated for the subtrees.
pub fn create_patches<H: HostAlloc>(
    host: &H,
    tracker: &mut PtpTracker,
    cp: &mut CrossPageData,
    mon_start: Lpn,
    mon_end: Lpn,
    cross_gdt_mpn: Mpn,
) -> Result<u16, SwitchError> {
    let data_lpn = La(cp.crosspage_data_la).lpn();
    let data_mpn = Ma(cp.crosspage_data_ma).mpn();
    let code_lpn = La(cp.crosspage_code_la).lpn();
    let code_mpn = host.crosspage_code_mpn();
    let gdt_lpn = La(cp.cross_gdt_la).lpn();

    debug_assert!(!code_mpn.is_invalid());

    let mut num_pages = 0;
    create_patch(host, tracker, cp, mon_start, mon_end, data_lpn, data_mpn, &mut num_pages)?;
    create_patch(host, tracker, cp, mon_start, mon_end, gdt_lpn, cross_gdt_mpn, &mut num_pages)?;
    create_patch(host, tracker, cp, mon_start, mon_end, code_lpn, code_mpn, &mut num_pages)?;
    fixup_patches(tracker, cp);

    Ok(num_pages)
}

/// Applies the patches to the monitor's live page tables.
///
/// Only needed before the first switch; afterwards the monitor patches and
/// unpatches around its own exits.  For each patch the walk descends from
/// the monitor root to the patch's level: entries above it must already be
/// present (they are the shared ancestors), and the slot at the patch's
/// level must be empty.
pub fn apply_patches<H: HostPhysMem>(host: &H, cp: &CrossPageData) -> Result<(), SwitchError> {
    for patch in &cp.vmm_ptp {
        if patch.level == PTP_EMPTY {
            return Ok(()); // No more entries.
        }

        let top = match PageTableLevel::from_raw(patch.level) {
            Some(PageTableLevel::L1) | None => {
                return Err(SwitchError::InvalidPatchLevel { level: patch.level });
            }
            Some(level) => level,
        };

        let mut level = PageTableLevel::L4;
        let mut table = Ma(cp.mon_cr3 & PageTableEntry::PFN_MASK);
        loop {
            let ma = table + pte_index(patch.lpn, level) * 8;
            let entry = PageTableEntry(host.read_physical_u64(ma)?);

            if level == top {
                debug_assert_eq!(pte_index(patch.lpn, level) as u32, patch.pte_idx);
                if entry.0 != 0 {
                    return Err(SwitchError::PatchCollision { level: level as u32 });
                }
                host.write_physical_u64(ma, patch.pte)?;
                break;
            }

            if !entry.present() {
                return Err(SwitchError::PatchPathNotPresent { level: level as u32 });
            }
            table = Ma(entry.table_address());
            level = level.down().expect("top is above L1");
        }
    }
    Ok(())
}

/// Walks the monitor page tables for `lpn` and returns the mapped MPN.
fn walk<H: HostPhysMem>(host: &H, cr3: Ma, lpn: Lpn) -> Result<Mpn, SwitchError> {
    let mut entries: SmallVec<[PageTableEntry; 4]> = SmallVec::new();
    let mut entry = PageTableEntry(cr3.0);
    for level in PageTableLevel::TOP_DOWN {
        let ma = Ma(entry.0 & PageTableEntry::PFN_MASK) + pte_index(lpn.0, level) * 8;
        entry = PageTableEntry(host.read_physical_u64(ma)?);
        entries.push(entry);
        if !entry.present() {
            tracing::warn!(%lpn, depth = entries.len(), "monitor page walk hit a hole");
            return Err(SwitchError::PatchVerifyFailed { lpn });
        }
    }
    Ok(Mpn(entry.pfn()))
}

/// Verifies that every patched LPN translates to its registered MPN.
/// Debug builds only call this after [`apply_patches`].
pub fn verify_patches<H: HostPhysMem + HostAlloc>(
    host: &H,
    cp: &CrossPageData,
    cross_gdt_mpn: Mpn,
) -> Result<(), SwitchError> {
    let cr3 = Ma(cp.mon_cr3);
    let checks = [
        (La(cp.crosspage_data_la).lpn(), Ma(cp.crosspage_data_ma).mpn()),
        (La(cp.cross_gdt_la).lpn(), cross_gdt_mpn),
        (La(cp.crosspage_code_la).lpn(), host.crosspage_code_mpn()),
    ];

    for (lpn, expected) in checks {
        let found = walk(host, cr3, lpn)?;
        if found != expected {
            tracing::warn!(%lpn, %expected, %found, "page table patch verification failed");
            return Err(SwitchError::PatchVerifyFailed { lpn });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "ptpatch_tests.rs"]
mod ptpatch_tests;
