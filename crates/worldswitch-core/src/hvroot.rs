//! Per-pCPU lazily allocated resources: the HV root page and the temporary
//! GDT.
//!
//! Both are created on first use by whichever switch thread gets there
//! first.  Threads race to install their allocation into the slot; exactly
//! one wins, the losers free their attempt.  Slots are only ever freed at
//! driver teardown.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use worldswitch_arch_amd64::{PAGE_SIZE, VmxBasic, msr_index};

use crate::{
    INVALID_MPN, Mpn, PcpuId,
    host::{HostAlloc, HostCpuInfo, KernelPages},
};

/// Size of a temporary GDT: the architectural maximum.
pub const TMP_GDT_SIZE: usize = 0x10000;

const TMP_GDT_PAGES: usize = TMP_GDT_SIZE / PAGE_SIZE as usize;

/// The per-pCPU HV root pages.
///
/// On VMX hardware the root page is the VMXON region and carries the VMCS
/// revision identifier in its first dword; on SVM hardware it is the
/// zero-filled host save area.
pub struct HvRootPages {
    slots: Box<[AtomicU64]>,
}

impl HvRootPages {
    /// Creates the slot array, all invalid.
    pub fn new(num_pcpus: usize) -> HvRootPages {
        let slots = (0..num_pcpus)
            .map(|_| AtomicU64::new(INVALID_MPN.0))
            .collect();
        HvRootPages { slots }
    }

    /// Returns the root page of `pcpu` without allocating.
    pub fn get(&self, pcpu: PcpuId) -> Mpn {
        Mpn(self.slots[pcpu.0 as usize].load(Ordering::Acquire))
    }

    /// Returns the root page of `pcpu`, allocating it on first use.
    ///
    /// Returns [`INVALID_MPN`] when allocation fails; the switch driver
    /// converts that into a module call so userspace can retry the
    /// allocation from a friendlier context.
    pub fn get_or_alloc<H: HostAlloc + HostCpuInfo>(&self, host: &H, pcpu: PcpuId) -> Mpn {
        let mpn = self.get(pcpu);
        if !mpn.is_invalid() {
            return mpn;
        }

        self.alloc(host, &self.slots[pcpu.0 as usize]);
        self.get(pcpu)
    }

    fn alloc<H: HostAlloc + HostCpuInfo>(&self, host: &H, slot: &AtomicU64) {
        let mut content = vec![0u8; PAGE_SIZE as usize];

        // On VMX-capable hardware the first dword must hold the VMCS
        // revision identifier; SVM leaves the page zeroed.
        if let Some(vmx_basic) = host.safe_rdmsr(msr_index::IA32_VMX_BASIC) {
            let revision = VmxBasic(vmx_basic).revision();
            content[0..4].copy_from_slice(&revision.to_le_bytes());
        }

        let Ok(mpn) = host.alloc_machine_page() else {
            tracing::warn!("failed to allocate HV root page");
            return;
        };

        if host.write_machine_page(mpn, &content).is_err()
            || slot
                .compare_exchange(INVALID_MPN.0, mpn.0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            // Either the page could not be written or another thread won
            // the race; give this attempt back.
            host.free_machine_page(mpn);
        }
    }

    /// Frees every allocated root page.  Teardown only.
    pub fn free_all<H: HostAlloc>(&self, host: &H) {
        for slot in &self.slots {
            let mpn = Mpn(slot.swap(INVALID_MPN.0, Ordering::AcqRel));
            if !mpn.is_invalid() {
                host.free_machine_page(mpn);
            }
        }
    }
}

/// The per-pCPU temporary GDTs.
///
/// Hosts whose live GDT must not be written (read-only GDT mappings) need a
/// writable copy to unbusy the TSS descriptor while restoring TR.  Each
/// pCPU gets a maximal-size GDT so any host selector is in range.
pub struct TmpGdts {
    slots: Box<[OnceLock<KernelPages>]>,
}

// Slot installation is raced through the OnceLock; a populated GDT is only
// ever written by the pCPU using it, under disabled interrupts.
unsafe impl Send for TmpGdts {}
unsafe impl Sync for TmpGdts {}

impl TmpGdts {
    /// Creates the slot array, all unallocated.
    pub fn new(num_pcpus: usize) -> TmpGdts {
        let slots = (0..num_pcpus).map(|_| OnceLock::new()).collect();
        TmpGdts { slots }
    }

    /// Returns the temporary GDT of `pcpu` without allocating.
    pub fn get(&self, pcpu: PcpuId) -> Option<KernelPages> {
        self.slots[pcpu.0 as usize].get().copied()
    }

    /// Returns the temporary GDT of `pcpu`, allocating it on first use.
    pub fn get_or_alloc<H: HostAlloc>(&self, host: &H, pcpu: PcpuId) -> Option<KernelPages> {
        let slot = &self.slots[pcpu.0 as usize];
        if let Some(pages) = slot.get() {
            return Some(*pages);
        }

        let pages = match host.alloc_kernel_pages(TMP_GDT_PAGES) {
            Ok(pages) => pages,
            Err(_) => {
                tracing::warn!("failed to allocate temporary GDT");
                return None;
            }
        };

        if slot.set(pages).is_err() {
            // Lost the race.
            unsafe { host.free_kernel_pages(TMP_GDT_PAGES, pages) };
        }
        slot.get().copied()
    }

    /// Frees every allocated temporary GDT.  Teardown only.
    pub fn free_all<H: HostAlloc>(&mut self, host: &H) {
        for slot in &mut self.slots {
            if let Some(pages) = slot.take() {
                unsafe { host.free_kernel_pages(TMP_GDT_PAGES, pages) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;

    #[test]
    fn root_page_allocates_once() {
        let host = MockHost::new(2);
        let pages = HvRootPages::new(2);

        assert!(pages.get(PcpuId(0)).is_invalid());

        let first = pages.get_or_alloc(&host, PcpuId(0));
        assert!(!first.is_invalid());

        let second = pages.get_or_alloc(&host, PcpuId(0));
        assert_eq!(first, second);

        // The other slot is untouched.
        assert!(pages.get(PcpuId(1)).is_invalid());

        pages.free_all(&host);
        assert!(pages.get(PcpuId(0)).is_invalid());
    }

    #[test]
    fn failed_allocation_leaves_slot_invalid() {
        let host = MockHost::new(1);
        host.fail_next_allocs(1);

        let pages = HvRootPages::new(1);
        assert!(pages.get_or_alloc(&host, PcpuId(0)).is_invalid());

        // The next attempt succeeds and installs the slot.
        assert!(!pages.get_or_alloc(&host, PcpuId(0)).is_invalid());
        pages.free_all(&host);
    }

    #[test]
    fn root_page_carries_vmcs_revision() {
        let host = MockHost::new(1);
        host.set_msr(msr_index::IA32_VMX_BASIC, 0x0000_0400_0000_0012);

        let pages = HvRootPages::new(1);
        let mpn = pages.get_or_alloc(&host, PcpuId(0));

        let mut dword = [0u8; 4];
        host.read_page_prefix(mpn, &mut dword);
        assert_eq!(u32::from_le_bytes(dword), 0x12);

        pages.free_all(&host);
    }
}
