//! The per-VM state the switch driver operates on.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use worldswitch_arch_amd64::PAGE_SIZE;

use crate::{
    Mpn, PcpuId, SwitchError, VcpuId,
    apic::ApicDescriptor,
    crosspage::CrossPageData,
    host::{HostAlloc, KernelPages},
    ptpatch::PtpTracker,
    ptsc::PtscState,
};

/// Sentinel for "this VCPU is not on any pCPU right now".
pub const INVALID_PCPU: u32 = u32::MAX;

/// Configuration for creating a [`Vm`].
pub struct VmConfig {
    /// Number of VCPUs.
    pub num_vcpus: usize,

    /// The monitor's page-table root for each VCPU.
    pub pt_root_mpns: Vec<Mpn>,

    /// How to reach the host's local APIC.
    pub apic: ApicDescriptor,
}

pub(crate) struct Vcpu {
    /// The crosspage data page allocation.
    pub crosspage: KernelPages,

    /// The monitor's page-table root.
    pub pt_root: Mpn,

    /// Pages allocated for this VCPU's page-table patches.
    pub tracker: Mutex<PtpTracker>,

    /// pCPU currently running this VCPU's switch, or [`INVALID_PCPU`].
    pub current_host_cpu: AtomicU32,
}

/// One virtual machine: its VCPUs' crosspages and the shared PTSC state.
///
/// Each VCPU's crosspage has exactly one writer at any time (the pinned
/// switch thread, or the monitor while switched in); only the PTSC fields
/// are shared across VCPU threads, and those are atomics.
pub struct Vm {
    pub(crate) vcpus: Vec<Vcpu>,

    /// Shared pseudo-TSC coordination.
    pub ptsc: PtscState,

    /// The host APIC.
    pub apic: ApicDescriptor,

    /// Pages allocated for page-table patches, reported to the bootstrap
    /// for memory accounting.
    num_ptp_pages: AtomicU16,
}

// Per-VCPU single-writer discipline; shared fields are atomics.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// Allocates the per-VCPU crosspages and writes the layout template
    /// into each, the way the monitor's userspace side would before
    /// handing them to the driver.
    pub fn new<H: HostAlloc>(host: &H, config: VmConfig) -> Result<Vm, SwitchError> {
        assert!(config.num_vcpus > 0);
        assert_eq!(config.pt_root_mpns.len(), config.num_vcpus);

        let mut vcpus = Vec::with_capacity(config.num_vcpus);
        for vcpu in 0..config.num_vcpus {
            let crosspage = host.alloc_kernel_pages(1)?;
            // Sized at compile time, but the allocation is what must hold
            // it.
            debug_assert!(size_of::<CrossPageData>() <= PAGE_SIZE as usize);
            unsafe {
                crosspage
                    .ptr
                    .cast::<CrossPageData>()
                    .write(CrossPageData::template());
            }
            vcpus.push(Vcpu {
                crosspage,
                pt_root: config.pt_root_mpns[vcpu],
                tracker: Mutex::new(PtpTracker::new()),
                current_host_cpu: AtomicU32::new(INVALID_PCPU),
            });
        }

        Ok(Vm {
            ptsc: PtscState::new(config.num_vcpus),
            vcpus,
            apic: config.apic,
            num_ptp_pages: AtomicU16::new(0),
        })
    }

    /// Number of VCPUs.
    pub fn num_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    /// Raw pointer to a VCPU's crosspage.
    ///
    /// The caller must be that VCPU's single writer: either its pinned
    /// switch thread, or power-on code running before any switch.
    pub(crate) fn crosspage_ptr(&self, vcpu: VcpuId) -> *mut CrossPageData {
        self.vcpus[vcpu.0 as usize].crosspage.ptr.cast().as_ptr()
    }

    /// Shared view of a VCPU's crosspage, for inspection between switches.
    pub fn crosspage(&self, vcpu: VcpuId) -> &CrossPageData {
        unsafe { &*self.crosspage_ptr(vcpu) }
    }

    /// The pCPU a VCPU is currently switching on, if any.
    pub fn current_host_cpu(&self, vcpu: VcpuId) -> Option<PcpuId> {
        match self.vcpus[vcpu.0 as usize].current_host_cpu.load(Ordering::Acquire) {
            INVALID_PCPU => None,
            pcpu => Some(PcpuId(pcpu)),
        }
    }

    pub(crate) fn set_num_ptp_pages(&self, pages: u16) {
        self.num_ptp_pages.store(pages, Ordering::Relaxed);
    }

    /// Pages allocated for this VM's page-table patches.
    pub fn num_ptp_pages(&self) -> u16 {
        self.num_ptp_pages.load(Ordering::Relaxed)
    }

    /// Frees the patch pages and crosspages.  The VM must not switch
    /// again.
    pub fn destroy<H: HostAlloc>(mut self, host: &H) {
        for vcpu in &mut self.vcpus {
            let mut tracker = vcpu.tracker.lock().unwrap();
            crate::ptpatch::cleanup(host, &mut tracker);
        }
        for vcpu in self.vcpus.drain(..) {
            unsafe { host.free_kernel_pages(1, vcpu.crosspage) };
        }
    }
}

#[cfg(test)]
#[path = "vm_tests.rs"]
mod vm_tests;
