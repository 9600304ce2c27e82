//! Hardware-virtualization capability probe.
//!
//! Reads the vendor and feature CPUID leaves once, then collects the
//! virtualization capability MSRs from *every* logical CPU and reduces them
//! to the feature vector all of them can honor.  A VM powered on against
//! the common vector can be scheduled on any pCPU.
//!
//! The combining rules are the architecturally documented ones:
//!
//! - Control-pair MSRs carry required-ones in the low dword and allowed-ones
//!   in the high dword; the common value ORs the former and ANDs the latter.
//! - "fixed0" MSRs combine by OR, "fixed1" by AND.
//! - `IA32_VMX_BASIC` must agree exactly on the VMCS revision, size and
//!   memory type; its feature bits are AND-combined except the 32-bit-PA
//!   limitation, which ORs.
//! - `IA32_VMX_MISC` must agree on the MSEG revision; the CR3-target and
//!   MSR-list-size fields take the minimum, everything else ANDs.
//! - `IA32_VMX_VMCS_ENUM` takes the minimum of the max-index field.

use indexmap::IndexMap;

use worldswitch_arch_amd64::{CpuVendor, VmxBasic, VmxMisc, msr_index, vmcs_enum_max_index};

use crate::{
    PcpuId,
    cpu::Cpu,
    host::HostCpuInfo,
};

/// Per-CPU MSR values collected by the probe.
#[derive(Debug, Default)]
pub struct MsrCache {
    num_cpus: usize,
    values: IndexMap<u32, Vec<u64>>,
}

impl MsrCache {
    /// Creates an empty cache for `num_cpus` CPUs and the given MSR list.
    pub fn new(num_cpus: usize, msrs: &[u32]) -> MsrCache {
        let mut values = IndexMap::with_capacity(msrs.len());
        for &msr in msrs {
            values.insert(msr, vec![0u64; num_cpus]);
        }
        MsrCache { num_cpus, values }
    }

    /// Number of CPUs in the cache.
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Returns the cached value of `msr` on `cpu`, zero if never read.
    pub fn get(&self, msr: u32, cpu: usize) -> u64 {
        self.values.get(&msr).map_or(0, |v| v[cpu])
    }

    /// Stores a value into the cache.
    pub fn set(&mut self, msr: u32, cpu: usize, value: u64) {
        if let Some(v) = self.values.get_mut(&msr) {
            v[cpu] = value;
        }
    }

    /// Fills the cache by running the host's cross-CPU callback and issuing
    /// fault-tolerant MSR reads on each CPU.
    pub fn populate<H: HostCpuInfo>(&mut self, host: &H) {
        let msrs: Vec<u32> = self.values.keys().copied().collect();
        host.for_each_pcpu(&mut |pcpu: PcpuId| {
            let cpu = pcpu.0 as usize;
            for &msr in &msrs {
                if let Some(value) = host.safe_rdmsr(msr) {
                    self.set(msr, cpu, value);
                }
            }
        });
    }

    fn fold(&self, msr: u32, f: impl Fn(u64, u64) -> u64) -> u64 {
        let mut common = self.get(msr, 0);
        for cpu in 1..self.num_cpus {
            common = f(common, self.get(msr, cpu));
        }
        common
    }

    /// Combines a control-pair MSR: required-ones (low dword) OR, allowed-
    /// ones (high dword) AND.
    pub fn common_ctls(&self, msr: u32) -> u64 {
        self.fold(msr, |common, this| {
            let zeros = (common as u32) | (this as u32);
            let ones = ((common >> 32) as u32) & ((this >> 32) as u32);
            (u64::from(ones) << 32) | u64::from(zeros)
        })
    }

    /// Combines a fixed0 MSR (bits that must be one): OR.
    pub fn common_fixed0(&self, msr: u32) -> u64 {
        self.fold(msr, |a, b| a | b)
    }

    /// Combines a fixed1 MSR (bits allowed to be one): AND.
    pub fn common_fixed1(&self, msr: u32) -> u64 {
        self.fold(msr, |a, b| a & b)
    }

    /// Combines `IA32_VMX_BASIC`.
    pub fn common_basic(&self) -> u64 {
        const OR_FIELDS: u64 = VmxBasic::PA_32BIT;
        const AND_FIELDS: u64 =
            VmxBasic::TRUE_CTLS | VmxBasic::DUAL_VMM | VmxBasic::ADVANCED_IOINFO;

        self.fold(msr_index::IA32_VMX_BASIC, |common, this| {
            if common == VmxBasic::INVALID {
                return common;
            }
            if VmxBasic(common).identity_fields() != VmxBasic(this).identity_fields() {
                return VmxBasic::INVALID;
            }
            let mut merged = common;
            merged |= this & OR_FIELDS;
            merged &= !AND_FIELDS | (this & AND_FIELDS);
            merged
        })
    }

    /// Combines `IA32_VMX_MISC`.  Returns `None` when the MSEG revisions
    /// disagree.
    pub fn common_misc(&self) -> Option<u64> {
        let mut common = VmxMisc(self.get(msr_index::IA32_VMX_MISC, 0));
        for cpu in 1..self.num_cpus {
            let this = VmxMisc(self.get(msr_index::IA32_VMX_MISC, cpu));
            if this.mseg_revision() != common.mseg_revision() {
                return None;
            }
            let cr3_targets = common.cr3_targets().min(this.cr3_targets());
            let max_msr_lists = common.max_msr_lists().min(this.max_msr_lists());
            let fields_cleared = common.with_fields(0, 0).0 & this.with_fields(0, 0).0;
            common = VmxMisc(fields_cleared).with_fields(cr3_targets, max_msr_lists);
        }
        Some(common.0)
    }

    /// Combines `IA32_VMX_VMCS_ENUM`: minimum of the max-index field.
    pub fn common_vmcs_enum(&self) -> u64 {
        self.fold(msr_index::IA32_VMX_VMCS_ENUM, |a, b| {
            if vmcs_enum_max_index(a) <= vmcs_enum_max_index(b) { a } else { b }
        })
    }
}

/// The MSRs the probe collects on VMX hosts.
pub const VMX_MSRS: &[u32] = &[
    msr_index::IA32_VMX_BASIC,
    msr_index::IA32_VMX_PINBASED_CTLS,
    msr_index::IA32_VMX_PROCBASED_CTLS,
    msr_index::IA32_VMX_EXIT_CTLS,
    msr_index::IA32_VMX_ENTRY_CTLS,
    msr_index::IA32_VMX_MISC,
    msr_index::IA32_VMX_CR0_FIXED0,
    msr_index::IA32_VMX_CR0_FIXED1,
    msr_index::IA32_VMX_CR4_FIXED0,
    msr_index::IA32_VMX_CR4_FIXED1,
    msr_index::IA32_VMX_VMCS_ENUM,
    msr_index::IA32_VMX_PROCBASED_CTLS2,
    msr_index::IA32_VMX_EPT_VPID_CAP,
    msr_index::IA32_VMX_TRUE_PINBASED_CTLS,
    msr_index::IA32_VMX_TRUE_PROCBASED_CTLS,
    msr_index::IA32_VMX_TRUE_EXIT_CTLS,
    msr_index::IA32_VMX_TRUE_ENTRY_CTLS,
    msr_index::IA32_VMX_VMFUNC,
    msr_index::IA32_VMX_PROCBASED_CTLS3,
    msr_index::IA32_FEATURE_CONTROL,
];

/// The MSRs the probe collects on SVM hosts.
pub const SVM_MSRS: &[u32] = &[msr_index::AMD_VM_CR, msr_index::IA32_EFER];

/// The common VMX feature vector across all pCPUs.
#[derive(Debug, Default, Clone, Copy)]
#[allow(missing_docs)]
pub struct VmxCaps {
    pub basic: u64,
    pub pinbased_ctls: u64,
    pub procbased_ctls: u64,
    pub procbased_ctls2: u64,
    pub procbased_ctls3: u64,
    pub exit_ctls: u64,
    pub entry_ctls: u64,
    pub true_pinbased_ctls: u64,
    pub true_procbased_ctls: u64,
    pub true_exit_ctls: u64,
    pub true_entry_ctls: u64,
    pub misc: u64,
    pub ept_vpid_cap: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub vmcs_enum: u64,
}

impl VmxCaps {
    /// Reduces a populated MSR cache to the common feature vector.
    ///
    /// Returns `None` when the CPUs cannot be reconciled (mismatched VMCS
    /// identity or MSEG revision).
    pub fn from_cache(cache: &MsrCache) -> Option<VmxCaps> {
        let basic = cache.common_basic();
        if basic == VmxBasic::INVALID {
            return None;
        }
        Some(VmxCaps {
            basic,
            pinbased_ctls: cache.common_ctls(msr_index::IA32_VMX_PINBASED_CTLS),
            procbased_ctls: cache.common_ctls(msr_index::IA32_VMX_PROCBASED_CTLS),
            procbased_ctls2: cache.common_ctls(msr_index::IA32_VMX_PROCBASED_CTLS2),
            procbased_ctls3: cache.common_fixed1(msr_index::IA32_VMX_PROCBASED_CTLS3),
            exit_ctls: cache.common_ctls(msr_index::IA32_VMX_EXIT_CTLS),
            entry_ctls: cache.common_ctls(msr_index::IA32_VMX_ENTRY_CTLS),
            true_pinbased_ctls: cache.common_ctls(msr_index::IA32_VMX_TRUE_PINBASED_CTLS),
            true_procbased_ctls: cache.common_ctls(msr_index::IA32_VMX_TRUE_PROCBASED_CTLS),
            true_exit_ctls: cache.common_ctls(msr_index::IA32_VMX_TRUE_EXIT_CTLS),
            true_entry_ctls: cache.common_ctls(msr_index::IA32_VMX_TRUE_ENTRY_CTLS),
            misc: cache.common_misc()?,
            ept_vpid_cap: cache.common_fixed1(msr_index::IA32_VMX_EPT_VPID_CAP),
            cr0_fixed0: cache.common_fixed0(msr_index::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: cache.common_fixed1(msr_index::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: cache.common_fixed0(msr_index::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: cache.common_fixed1(msr_index::IA32_VMX_CR4_FIXED1),
            vmcs_enum: cache.common_vmcs_enum(),
        })
    }
}

/// The common SVM feature vector across all pCPUs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvmCaps {
    /// SVM feature bits (CPUID `0x8000_000A` EDX), AND-combined.
    pub features: u32,

    /// Number of available ASIDs (CPUID `0x8000_000A` EBX), minimum.
    pub num_asids: u32,

    /// `VM_CR` contents of CPU 0 (lock/disable state).
    pub vm_cr: u64,
}

/// What the host hardware supports, published by [`probe`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HostHvSupport {
    /// CPU vendor.
    pub vendor: CpuVendor,

    /// Physical address width in bits.
    pub phys_address_bits: u8,

    /// Checks whether the host supports XSAVE (needed to decide the
    /// monitor's CR4.OSXSAVE).
    pub xsave: bool,

    /// The common VMX feature vector, when the vendor uses VMX and every
    /// CPU advertises it.
    pub vmx: Option<VmxCaps>,

    /// The common SVM feature vector, when the vendor uses SVM and every
    /// CPU advertises it.
    pub svm: Option<SvmCaps>,
}

impl HostHvSupport {
    /// Checks whether hardware virtualization is usable at all.
    pub fn hv_supported(&self) -> bool {
        self.vmx.is_some() || self.svm.is_some()
    }

    /// Checks whether the host uses VT-x.
    pub fn uses_vmx(&self) -> bool {
        self.vmx.is_some()
    }

    /// Checks whether the host uses SVM.
    pub fn uses_svm(&self) -> bool {
        self.svm.is_some()
    }
}

const CPUID_FEATURE_VMX: u32 = 1 << 5; // leaf 1 ECX
const CPUID_FEATURE_XSAVE: u32 = 1 << 26; // leaf 1 ECX
const CPUID_EXT_FEATURE_SVM: u32 = 1 << 2; // leaf 0x8000_0001 ECX

/// Probes the host CPUs and publishes the common capability vector.
pub fn probe<C: Cpu, H: HostCpuInfo>(cpu: &mut C, host: &H) -> HostHvSupport {
    let leaf0 = cpu.cpuid(0, 0);
    let vendor = CpuVendor::from_cpuid(leaf0.ebx, leaf0.ecx, leaf0.edx);

    let leaf1 = cpu.cpuid(1, 0);
    let ext_leaf1 = cpu.cpuid(0x8000_0001, 0);
    let addr_leaf = cpu.cpuid(0x8000_0008, 0);
    let phys_address_bits = (addr_leaf.eax & 0xFF) as u8;
    let xsave = leaf1.ecx & CPUID_FEATURE_XSAVE != 0;

    let mut support = HostHvSupport {
        vendor,
        phys_address_bits,
        xsave,
        vmx: None,
        svm: None,
    };

    if vendor.uses_vmx() && leaf1.ecx & CPUID_FEATURE_VMX != 0 {
        let mut cache = MsrCache::new(host.num_pcpus(), VMX_MSRS);
        cache.populate(host);
        support.vmx = VmxCaps::from_cache(&cache);
        if support.vmx.is_none() {
            tracing::warn!("VMX capability MSRs disagree across pCPUs; disabling VT");
        }
    }

    if vendor.uses_svm() && ext_leaf1.ecx & CPUID_EXT_FEATURE_SVM != 0 {
        let svm_leaf = cpu.cpuid(0x8000_000A, 0);
        let mut cache = MsrCache::new(host.num_pcpus(), SVM_MSRS);
        cache.populate(host);
        support.svm = Some(SvmCaps {
            features: svm_leaf.edx,
            num_asids: svm_leaf.ebx,
            vm_cr: cache.get(msr_index::AMD_VM_CR, 0),
        });
    }

    support
}

#[cfg(test)]
#[path = "caps_tests.rs"]
mod caps_tests;
