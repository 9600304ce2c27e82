use worldswitch_arch_amd64::{PAGE_SIZE, PageTableEntry, PageTableLevel, PteFlags};

use super::{PtpTracker, apply_patches, cleanup, create_patches, locate_patch_level, verify_patches};
use crate::{
    La, Lpn, Mpn, SwitchError,
    crosspage::{CrossPageData, MAX_SWITCH_PT_PATCHES, PTP_EMPTY},
    host::{HostPhysMem, mock::MockHost},
    layout,
};

const MON_START: Lpn = layout::MONITOR_START_LPN;
const MON_END: Lpn = layout::MONITOR_END_LPN;

const ROOT_MPN: Mpn = Mpn(0x100);
const L3_MPN: Mpn = Mpn(0x101);
const L2_MPN: Mpn = Mpn(0x102);

const DATA_MPN: Mpn = Mpn(0xD47A);
const GDT_MPN: Mpn = Mpn(0x6D7);

/// Host kernel addresses in the low canonical half: their L4 index differs
/// from the monitor's, so patches root at level 4.
const DATA_LA: u64 = 0xFFFF_8880_0000_1000;
const CODE_LA: u64 = 0xFFFF_8880_0000_2000;
const GDT_LA: u64 = 0xFFFF_8880_0000_3000;

fn page_with_ptes(entries: &[(usize, u64)]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE as usize];
    for &(idx, value) in entries {
        page[idx * 8..idx * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }
    page
}

fn table_pte(mpn: Mpn) -> u64 {
    PageTableEntry::new(mpn.0, PteFlags::PRESENT | PteFlags::RW | PteFlags::ACCESSED).0
}

/// Installs the monitor's own page tables: L4[511] -> L3[511] -> L2, which
/// is the shared ancestry of the whole top-64MiB region.
fn install_monitor_tables(host: &MockHost) {
    host.install_page(ROOT_MPN, page_with_ptes(&[(511, table_pte(L3_MPN))]));
    host.install_page(L3_MPN, page_with_ptes(&[(511, table_pte(L2_MPN))]));
    host.install_page(L2_MPN, page_with_ptes(&[]));
}

fn crosspage(data_la: u64, code_la: u64, gdt_la: u64) -> Box<CrossPageData> {
    let mut cp = Box::new(CrossPageData::template());
    cp.crosspage_data_la = data_la;
    cp.crosspage_data_ma = DATA_MPN.address().0;
    cp.crosspage_code_la = code_la;
    cp.cross_gdt_la = gdt_la;
    cp.mon_cr3 = ROOT_MPN.address().0;
    cp
}

#[test]
fn locate_level_diverges_at_the_top() {
    // Low-half kernel address: already outside the monitor's L4 entry.
    assert_eq!(
        locate_patch_level(La(DATA_LA).lpn(), MON_START, MON_END),
        Some(PageTableLevel::L4)
    );

    // Same 1GiB region as the monitor, different 2MiB region.
    assert_eq!(
        locate_patch_level(La(0xFFFF_FFFF_C000_0000).lpn(), MON_START, MON_END),
        Some(PageTableLevel::L2)
    );

    // Inside the monitor itself: no patchable level.
    assert_eq!(
        locate_patch_level(layout::CROSS_PAGE_DATA_LA.lpn(), MON_START, MON_END),
        None
    );
}

#[test]
fn patches_apply_and_verify() {
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    let mut cp = crosspage(DATA_LA, CODE_LA, GDT_LA);
    let mut tracker = PtpTracker::new();

    let pages = create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN)
        .expect("patch creation");

    // All three LPNs share one L4 entry, so one patch and one subtree
    // (L3 + L2 + L1) suffice.
    assert_eq!(pages, 3);
    assert_eq!(tracker.len(), 3);
    assert_eq!(cp.vmm_ptp[0].level, PageTableLevel::L4 as u32);
    assert_eq!(cp.vmm_ptp[1].level, PTP_EMPTY);

    // Fix-up must have produced a present root PTE.
    assert!(PageTableEntry(cp.vmm_ptp[0].pte).present());

    apply_patches(&host, &cp).expect("patch application");
    verify_patches(&host, &cp, GDT_MPN).expect("patch verification");

    // Invariant: the monitor root now holds the patch root, and a manual
    // walk of the data LPN lands on the data MPN.
    let l4_idx = worldswitch_arch_amd64::pte_index(La(DATA_LA).lpn().0, PageTableLevel::L4);
    let root_entry = host
        .read_physical_u64(ROOT_MPN.address() + l4_idx * 8)
        .unwrap();
    assert_eq!(root_entry, cp.vmm_ptp[0].pte);

    cleanup(&host, &mut tracker);
    assert!(tracker.is_empty());
}

#[test]
fn no_two_patches_share_level_and_global_index() {
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    let mut cp = crosspage(DATA_LA, CODE_LA, GDT_LA);
    let mut tracker = PtpTracker::new();
    create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN).unwrap();

    let filled: Vec<_> = cp
        .vmm_ptp
        .iter()
        .take_while(|p| p.level != PTP_EMPTY)
        .collect();
    for (i, a) in filled.iter().enumerate() {
        for b in &filled[i + 1..] {
            assert!(
                a.level != b.level || a.pte_global_idx != b.pte_global_idx,
                "duplicate patch {a:?} vs {b:?}",
            );
        }
    }

    cleanup(&host, &mut tracker);
}

#[test]
fn monitor_overlap_fails_power_on() {
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    // The data page's linear address collides with the monitor layout.
    let mut cp = crosspage(layout::CROSS_PAGE_DATA_LA.0, CODE_LA, GDT_LA);
    let mut tracker = PtpTracker::new();

    let err = create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN)
        .unwrap_err();
    assert!(matches!(err, SwitchError::MonitorOverlap { .. }));

    cleanup(&host, &mut tracker);
}

#[test]
fn collision_with_existing_mapping_fails() {
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    // Pre-populate the L4 slot the patch wants.
    let l4_idx = worldswitch_arch_amd64::pte_index(La(DATA_LA).lpn().0, PageTableLevel::L4);
    host.write_physical_u64(ROOT_MPN.address() + l4_idx * 8, table_pte(Mpn(0x999)))
        .unwrap();

    let mut cp = crosspage(DATA_LA, CODE_LA, GDT_LA);
    let mut tracker = PtpTracker::new();
    create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN).unwrap();

    let err = apply_patches(&host, &cp).unwrap_err();
    assert!(matches!(err, SwitchError::PatchCollision { level: 4 }));

    cleanup(&host, &mut tracker);
}

#[test]
fn deep_patch_shares_monitor_ancestry() {
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    // Addresses in the monitor's 1GiB region but below its 64MiB: the
    // patch roots at L2, inside the monitor's own L2 table.
    let base = 0xFFFF_FFFF_C000_0000u64;
    let mut cp = crosspage(base, base + 0x1000, base + 0x2000);
    let mut tracker = PtpTracker::new();

    let pages = create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN)
        .expect("patch creation");

    // Only the L1 table needed allocating.
    assert_eq!(pages, 1);
    assert_eq!(cp.vmm_ptp[0].level, PageTableLevel::L2 as u32);

    apply_patches(&host, &cp).expect("patch application");
    verify_patches(&host, &cp, GDT_MPN).expect("patch verification");

    cleanup(&host, &mut tracker);
}

#[test]
fn missing_upper_level_fails_application() {
    let host = MockHost::new(1);
    // Monitor root exists but has no L3 under entry 511.
    host.install_page(ROOT_MPN, page_with_ptes(&[]));

    let base = 0xFFFF_FFFF_C000_0000u64;
    let mut cp = crosspage(base, base + 0x1000, base + 0x2000);
    let mut tracker = PtpTracker::new();
    create_patches(&host, &mut tracker, &mut cp, MON_START, MON_END, GDT_MPN).unwrap();

    let err = apply_patches(&host, &cp).unwrap_err();
    assert!(matches!(err, SwitchError::PatchPathNotPresent { level: 4 }));

    cleanup(&host, &mut tracker);
}

#[test]
fn patch_table_capacity_is_bounded() {
    // Eight distinct L4-rooted patches fill the table; a ninth fails.
    let host = MockHost::new(1);
    install_monitor_tables(&host);

    let mut cp = crosspage(DATA_LA, CODE_LA, GDT_LA);
    let mut tracker = PtpTracker::new();

    for i in 0..MAX_SWITCH_PT_PATCHES as u64 {
        let lpn = La(0xFFFF_0080_0000_0000 + i * (1u64 << 39)).lpn();
        super::save_patch(&mut cp, lpn, PageTableLevel::L4).expect("slot available");
    }

    let extra = La(0xFFFF_8880_0000_1000).lpn();
    let err = super::save_patch(&mut cp, extra, PageTableLevel::L4).unwrap_err();
    assert!(matches!(err, SwitchError::PatchTableFull));

    cleanup(&host, &mut tracker);
}
