//! Model-specific registers touched by the world switch.

/// MSR indices.
#[allow(missing_docs)]
pub mod msr_index {
    pub const IA32_FEATURE_CONTROL: u32 = 0x3A;
    pub const IA32_SPEC_CTRL: u32 = 0x48;
    pub const IA32_MISC_ENABLE: u32 = 0x1A0;
    pub const IA32_PAT: u32 = 0x277;
    pub const IA32_PEBS_ENABLE: u32 = 0x3F1;
    pub const IA32_RTIT_CTL: u32 = 0x570;

    pub const IA32_VMX_BASIC: u32 = 0x480;
    pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
    pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
    pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
    pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
    pub const IA32_VMX_MISC: u32 = 0x485;
    pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
    pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
    pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
    pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
    pub const IA32_VMX_VMCS_ENUM: u32 = 0x48A;
    pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
    pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;
    pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48D;
    pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x48E;
    pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
    pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;
    pub const IA32_VMX_VMFUNC: u32 = 0x491;
    pub const IA32_VMX_PROCBASED_CTLS3: u32 = 0x492;

    pub const IA32_EFER: u32 = 0xC000_0080;
    pub const IA32_FS_BASE: u32 = 0xC000_0100;
    pub const IA32_GS_BASE: u32 = 0xC000_0101;
    pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

    pub const AMD_VM_CR: u32 = 0xC001_0114;
    pub const AMD_VM_HSAVE_PA: u32 = 0xC001_0117;
}

/// `IA32_RTIT_CTL.TraceEn`.
pub const RTIT_CTL_TRACE_EN: u64 = 1 << 0;

/// `IA32_MISC_ENABLE.EMON` (performance monitoring available).
pub const MISC_ENABLE_EMON: u64 = 1 << 7;

/// `IA32_MISC_ENABLE.PEBS_UNAVAILABLE`.
pub const MISC_ENABLE_PEBS_UNAVAILABLE: u64 = 1 << 12;

/// `IA32_FEATURE_CONTROL` contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeatureControl(pub u64);

impl FeatureControl {
    /// The lock bit; once set, the MSR cannot be written until reset.
    pub const LOCK: u64 = 1 << 0;

    /// VMXON enable outside SMX operation.
    pub const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

    /// Checks if the MSR is locked.
    pub fn locked(self) -> bool {
        self.0 & Self::LOCK != 0
    }

    /// Checks if VMXON outside SMX is enabled.
    pub fn vmxon_enabled(self) -> bool {
        self.0 & Self::VMXON_OUTSIDE_SMX != 0
    }
}

/// `IA32_EFER` contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrEfer(pub u64);

impl MsrEfer {
    /// EFER.SVME (bit 12), secure virtual machine enable.
    pub const SVME: u64 = 1 << 12;

    /// Checks if EFER.SVME is set.
    pub fn svm_enable(self) -> bool {
        self.0 & Self::SVME != 0
    }
}

/// Field accessors for `IA32_VMX_BASIC`.
///
/// When the per-CPU values of the identity fields disagree, the common
/// value is forced to [`VmxBasic::INVALID`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic(pub u64);

impl VmxBasic {
    /// Sentinel for an unusable common value.
    pub const INVALID: u64 = u64::MAX;

    /// 32-bit-physical-address limitation (bit 48); OR-combined.
    pub const PA_32BIT: u64 = 1 << 48;

    /// Dual-monitor treatment of SMIs (bit 49); AND-combined.
    pub const DUAL_VMM: u64 = 1 << 49;

    /// INS/OUTS reporting in instruction information (bit 54); AND-combined.
    pub const ADVANCED_IOINFO: u64 = 1 << 54;

    /// TRUE capability MSR support (bit 55); AND-combined.
    pub const TRUE_CTLS: u64 = 1 << 55;

    /// Returns the VMCS revision identifier (bits 30:0).
    pub fn revision(self) -> u32 {
        (self.0 & 0x7FFF_FFFF) as u32
    }

    /// Returns the VMCS region size (bits 44:32).
    pub fn vmcs_size(self) -> u32 {
        ((self.0 >> 32) & 0x1FFF) as u32
    }

    /// Returns the VMCS memory type (bits 53:50).
    pub fn memory_type(self) -> u8 {
        ((self.0 >> 50) & 0xF) as u8
    }

    /// Checks if the TRUE capability MSRs exist.
    pub fn has_true_ctls(self) -> bool {
        self.0 & Self::TRUE_CTLS != 0
    }

    /// Bits that must be identical on every logical CPU.
    pub fn identity_fields(self) -> u64 {
        const REVISION: u64 = 0x7FFF_FFFF;
        const SIZE: u64 = 0x1FFF << 32;
        const MEMTYPE: u64 = 0xF << 50;
        self.0 & (REVISION | SIZE | MEMTYPE)
    }
}

/// Field accessors for `IA32_VMX_MISC`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxMisc(pub u64);

impl VmxMisc {
    /// Mask of the preemption-timer rate field (bits 4:0); AND-combined.
    pub const TIMER_RATE_MASK: u64 = 0x1F;

    /// Returns the supported CR3-target count (bits 24:16); combined by
    /// minimum.
    pub fn cr3_targets(self) -> u64 {
        (self.0 >> 16) & 0x1FF
    }

    /// Returns the maximum MSR-list size field (bits 27:25); combined by
    /// minimum.
    pub fn max_msr_lists(self) -> u64 {
        (self.0 >> 25) & 0x7
    }

    /// Returns the MSEG revision identifier (bits 63:32); must be identical
    /// on every logical CPU.
    pub fn mseg_revision(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Rebuilds the value from combined fields, preserving the remaining
    /// bits of `self`.
    pub fn with_fields(self, cr3_targets: u64, max_msr_lists: u64) -> VmxMisc {
        let cleared = self.0 & !((0x1FF << 16) | (0x7 << 25));
        VmxMisc(cleared | (cr3_targets << 16) | (max_msr_lists << 25))
    }
}

/// Returns the highest VMCS field index from `IA32_VMX_VMCS_ENUM`
/// (bits 9:1); combined by minimum.
pub fn vmcs_enum_max_index(value: u64) -> u64 {
    (value >> 1) & 0x1FF
}
