use worldswitch_arch_amd64::{VmxBasic, VmxMisc, msr_index, vmcs_enum_max_index};

use super::{MsrCache, VMX_MSRS, VmxCaps};

fn cache_with(num_cpus: usize, entries: &[(u32, &[u64])]) -> MsrCache {
    let mut cache = MsrCache::new(num_cpus, VMX_MSRS);
    for &(msr, values) in entries {
        for (cpu, &value) in values.iter().enumerate() {
            cache.set(msr, cpu, value);
        }
    }
    cache
}

#[test]
fn control_pairs_or_required_and_allowed() {
    // CPU 0 requires bit 0 and allows bits 0..4; CPU 1 requires bit 1 and
    // allows bits 1..8.  The common vector must require both and allow only
    // the intersection.
    let cache = cache_with(
        2,
        &[(
            msr_index::IA32_VMX_PINBASED_CTLS,
            &[0x0000_000F_0000_0001, 0x0000_00FE_0000_0002],
        )],
    );

    let common = cache.common_ctls(msr_index::IA32_VMX_PINBASED_CTLS);
    assert_eq!(common as u32, 0x3); // required-ones ORed
    assert_eq!((common >> 32) as u32, 0xE); // allowed-ones ANDed
}

#[test]
fn fixed_msrs_combine_asymmetrically() {
    let cache = cache_with(
        2,
        &[
            (msr_index::IA32_VMX_CR0_FIXED0, &[0x21, 0x31]),
            (msr_index::IA32_VMX_CR0_FIXED1, &[0xFFFF_FFFF, 0x7FFF_FFFF]),
        ],
    );

    assert_eq!(cache.common_fixed0(msr_index::IA32_VMX_CR0_FIXED0), 0x31);
    assert_eq!(cache.common_fixed1(msr_index::IA32_VMX_CR0_FIXED1), 0x7FFF_FFFF);
}

#[test]
fn basic_requires_identical_vmcs_identity() {
    // Same revision/size/memtype, differing feature bits.
    let rev = 0x12u64;
    let size = 0x400u64 << 32;
    let memtype = 0x6u64 << 50;
    let identity = rev | size | memtype;

    let cache = cache_with(
        2,
        &[(
            msr_index::IA32_VMX_BASIC,
            &[
                identity | VmxBasic::TRUE_CTLS | VmxBasic::DUAL_VMM,
                identity | VmxBasic::TRUE_CTLS | VmxBasic::PA_32BIT,
            ],
        )],
    );

    let common = VmxBasic(cache.common_basic());
    assert_eq!(common.identity_fields(), identity);
    assert!(common.has_true_ctls()); // ANDed, both have it
    assert_eq!(common.0 & VmxBasic::DUAL_VMM, 0); // ANDed away
    assert_ne!(common.0 & VmxBasic::PA_32BIT, 0); // ORed in

    // Now a revision mismatch.
    let cache = cache_with(2, &[(msr_index::IA32_VMX_BASIC, &[identity, identity | 1])]);
    assert_eq!(cache.common_basic(), VmxBasic::INVALID);
    assert!(VmxCaps::from_cache(&cache).is_none());
}

#[test]
fn misc_takes_minimum_counts_and_exact_mseg() {
    let mseg = 0x55u64 << 32;
    let a = mseg | (4 << 16) | (2 << 25) | 0x1F; // 4 CR3 targets, 2 MSR lists
    let b = mseg | (8 << 16) | (1 << 25) | 0x03;

    let cache = cache_with(2, &[(msr_index::IA32_VMX_MISC, &[a, b])]);
    let common = VmxMisc(cache.common_misc().expect("mseg matches"));
    assert_eq!(common.cr3_targets(), 4);
    assert_eq!(common.max_msr_lists(), 1);
    assert_eq!(common.0 & VmxMisc::TIMER_RATE_MASK, 0x03); // ANDed
    assert_eq!(common.mseg_revision(), 0x55);

    // MSEG mismatch kills the whole vector.
    let cache = cache_with(2, &[(msr_index::IA32_VMX_MISC, &[a, a ^ (1 << 40)])]);
    assert!(cache.common_misc().is_none());
}

#[test]
fn vmcs_enum_takes_minimum_index() {
    let cache = cache_with(
        2,
        &[(msr_index::IA32_VMX_VMCS_ENUM, &[0x34 << 1, 0x20 << 1])],
    );
    assert_eq!(vmcs_enum_max_index(cache.common_vmcs_enum()), 0x20);
}

#[test]
fn single_cpu_cache_is_identity() {
    let value = 0x0000_00FF_0000_0055;
    let cache = cache_with(1, &[(msr_index::IA32_VMX_PROCBASED_CTLS, &[value])]);
    assert_eq!(cache.common_ctls(msr_index::IA32_VMX_PROCBASED_CTLS), value);
}
