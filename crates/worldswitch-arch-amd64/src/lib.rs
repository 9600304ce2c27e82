//! AMD64 architecture definitions for the world-switch engine.
//!
//! Raw images of the architectural state that a world switch saves,
//! composes, and restores: control registers, debug registers, RFLAGS,
//! segmentation, 4-level paging, IDT gates and the 64-bit TSS, the MSRs the
//! switch path touches, and the local APIC's LVT registers.
//!
//! Everything here is a plain value type over the architectural bit layout;
//! nothing in this crate executes a privileged instruction.

mod apic;
mod cr;
mod descriptor;
mod dr;
mod interrupt;
mod msr;
mod paging;
mod rflags;
mod segment;
mod vendor;

pub use self::{
    apic::{
        max_lvt, ApicLvt, LvtDeliveryMode, LvtRegister, APIC_MAX_LVT_THERMAL, X2APIC_MSR_BASE,
    },
    cr::{Cr0, Cr2, Cr3, Cr4},
    descriptor::DescriptorTableRegister,
    dr::{Dr6, Dr7},
    interrupt::{ExceptionVector, Gate64, Tss64, NUM_EXCEPTIONS},
    msr::{
        msr_index, vmcs_enum_max_index, FeatureControl, MsrEfer, VmxBasic, VmxMisc,
        MISC_ENABLE_EMON, MISC_ENABLE_PEBS_UNAVAILABLE, RTIT_CTL_TRACE_EN,
    },
    paging::{
        pte_global_index, pte_index, PageTableEntry, PageTableLevel, PteFlags, LPN_CANONICAL_MASK,
        PTES_PER_TABLE,
    },
    rflags::Rflags,
    segment::{DescriptorTable, SegmentDescriptor, Selector},
    vendor::CpuVendor,
};

/// The architectural page size.
pub const PAGE_SIZE: u64 = 0x1000;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;
