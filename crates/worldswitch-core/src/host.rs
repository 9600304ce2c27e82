//! Host-OS callback trait hierarchy.
//!
//! The engine runs inside somebody else's kernel.  Everything it needs from
//! that kernel — memory, physical access, locking, CPU identity, and a
//! reference clock — is expressed as one trait per capability; the platform
//! shim implements them all and hands the engine a single object.
//!
//! # Trait hierarchy
//!
//! ```text
//! HostAlloc       kernel pages, machine pages, crosspage code placement
//! HostPhysMem     byte-level machine memory access
//! HostCpuInfo     current pCPU, cross-CPU execution, safe MSR reads
//! HostSync        driver-global and per-VM locks
//! HostTime        reference-clock pseudo-TSC and TSC topology
//! ```
//!
//! # Convenience supertrait
//!
//! ```text
//! HostOps = HostAlloc + HostPhysMem + HostCpuInfo + HostSync + HostTime
//! ```
//!
//! A type implementing all five automatically implements [`HostOps`] via a
//! blanket implementation.  Tests implement the subset they exercise plus
//! no-op stubs for the rest.

use std::ptr::NonNull;

use crate::{Ma, Mpn, PcpuId, SwitchError};

/// A kernel allocation whose machine pages are known.
#[derive(Debug, Clone, Copy)]
pub struct KernelPages {
    /// Kernel virtual address of the first byte.
    pub ptr: NonNull<u8>,

    /// Machine page number of the first page.
    pub mpn: Mpn,
}

/// Capability to allocate kernel and machine memory.
pub trait HostAlloc {
    /// Allocates `n` physically-contiguous, page-aligned kernel pages.
    fn alloc_kernel_pages(&self, n: usize) -> Result<KernelPages, SwitchError>;

    /// Frees pages returned by [`alloc_kernel_pages`].
    ///
    /// # Safety
    ///
    /// `pages` must come from `alloc_kernel_pages(n)` on this host and must
    /// not be used afterwards.
    ///
    /// [`alloc_kernel_pages`]: Self::alloc_kernel_pages
    unsafe fn free_kernel_pages(&self, n: usize, pages: KernelPages);

    /// Allocates a machine page that need not be mapped into the kernel.
    fn alloc_machine_page(&self) -> Result<Mpn, SwitchError>;

    /// Frees a page returned by [`alloc_machine_page`].
    ///
    /// [`alloc_machine_page`]: Self::alloc_machine_page
    fn free_machine_page(&self, mpn: Mpn);

    /// Copies one page of data into an unmapped machine page.
    fn write_machine_page(&self, mpn: Mpn, content: &[u8]) -> Result<(), SwitchError>;

    /// Returns the machine page backing the crosspage code page.
    ///
    /// The code page is a link-time constant of this driver; the shim knows
    /// where the kernel loaded it.
    fn crosspage_code_mpn(&self) -> Mpn;
}

/// Capability to access machine memory by machine address.
pub trait HostPhysMem {
    /// Reads `buf.len()` bytes of machine memory at `ma`.
    fn read_physical(&self, ma: Ma, buf: &mut [u8]) -> Result<(), SwitchError>;

    /// Writes `buf` to machine memory at `ma`.
    fn write_physical(&self, ma: Ma, buf: &[u8]) -> Result<(), SwitchError>;

    /// Reads a single 64-bit value of machine memory at `ma`.
    fn read_physical_u64(&self, ma: Ma) -> Result<u64, SwitchError> {
        let mut buf = [0u8; 8];
        self.read_physical(ma, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a single 64-bit value of machine memory at `ma`.
    fn write_physical_u64(&self, ma: Ma, value: u64) -> Result<(), SwitchError> {
        self.write_physical(ma, &value.to_le_bytes())
    }
}

/// Capability to identify and enumerate physical CPUs.
pub trait HostCpuInfo {
    /// Returns the index of the CPU the calling thread currently runs on.
    ///
    /// Only meaningful while preemption is off; the switch driver calls it
    /// from a pinned thread.
    fn current_pcpu(&self) -> PcpuId;

    /// Returns the number of logical CPUs in the host.
    fn num_pcpus(&self) -> usize;

    /// Runs `f` once on every logical CPU.
    fn for_each_pcpu(&self, f: &mut dyn FnMut(PcpuId));

    /// Reads an MSR, tolerating #GP for MSRs the CPU does not implement.
    fn safe_rdmsr(&self, msr: u32) -> Option<u64>;

    /// Checks whether the host's live GDT must not be written, so TR
    /// restoration has to go through a per-pCPU temporary GDT.
    fn needs_temporary_gdt(&self) -> bool {
        false
    }
}

/// Capability to serialize driver-global and per-VM state.
///
/// Lock tags are opaque small integers used only for lock-debugging, the
/// way the rest of the driver stack numbers its call sites.
pub trait HostSync {
    /// Acquires the driver-global lock.
    fn global_lock(&self, tag: u32);

    /// Releases the driver-global lock.
    fn global_unlock(&self, tag: u32);

    /// Checks whether the calling thread holds the driver-global lock.
    fn global_lock_is_held(&self) -> bool;

    /// Acquires the owning VM's lock.
    fn vm_lock(&self, tag: u32);

    /// Releases the owning VM's lock.
    fn vm_unlock(&self, tag: u32);
}

/// Capability to read the host reference clock and TSC topology.
pub trait HostTime {
    /// Returns the current pseudo-TSC value derived from the host
    /// reference clock.
    fn pseudo_tsc(&self) -> u64;

    /// Returns the pseudo-TSC rate in Hz.
    fn pseudo_tsc_hz(&self) -> u64;

    /// Returns the constant offset between the hardware TSC and the
    /// pseudo-TSC, valid while the pseudo-TSC is TSC-based.
    fn pseudo_tsc_offset(&self) -> u64;

    /// Checks whether the pseudo-TSC is currently derived from the
    /// reference clock rather than the TSC.
    fn pseudo_tsc_uses_ref_clock(&self) -> bool;

    /// Switches the pseudo-TSC over to the reference clock.  Returns
    /// `true` if the switch happened (or had already happened).
    fn set_pseudo_tsc_use_ref_clock(&self) -> bool;

    /// Checks whether the hardware TSCs are synchronized across pCPUs.
    fn hw_tscs_synced(&self) -> bool;
}

/// The full host-OS interface consumed by the engine.
pub trait HostOps: HostAlloc + HostPhysMem + HostCpuInfo + HostSync + HostTime {}

impl<T> HostOps for T where T: HostAlloc + HostPhysMem + HostCpuInfo + HostSync + HostTime {}

#[cfg(test)]
pub(crate) mod mock {
    //! A host backed by plain process memory, for exercising the engine
    //! without a kernel.

    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::collections::HashMap;
    use std::ptr::NonNull;
    use std::sync::Mutex;

    use worldswitch_arch_amd64::PAGE_SIZE;

    use super::{HostAlloc, HostCpuInfo, HostPhysMem, HostSync, HostTime, KernelPages};
    use crate::{Ma, Mpn, PcpuId, SwitchError};

    enum PageBacking {
        /// A machine page with no kernel mapping.
        Owned(Box<[u8]>),

        /// One page of a kernel allocation; reads and writes go through
        /// the same memory the engine's pointers reach.
        Kernel(*mut u8),
    }

    struct Inner {
        next_mpn: u64,
        pages: HashMap<u64, PageBacking>,
        kernel_allocs: HashMap<*mut u8, usize>,
        msrs: HashMap<u32, u64>,
        current_pcpu: u32,
        global_lock_depth: i32,
        vm_lock_depth: i32,
        alloc_failures: u32,
        needs_tmp_gdt: bool,

        pseudo_tsc: u64,
        pseudo_tsc_hz: u64,
        pseudo_tsc_offset: u64,
        uses_ref_clock: bool,
        tscs_synced: bool,
    }

    /// The mock host.
    pub struct MockHost {
        num_pcpus: usize,
        inner: Mutex<Inner>,
    }

    impl MockHost {
        pub fn new(num_pcpus: usize) -> MockHost {
            MockHost {
                num_pcpus,
                inner: Mutex::new(Inner {
                    next_mpn: 0x1000,
                    pages: HashMap::new(),
                    kernel_allocs: HashMap::new(),
                    msrs: HashMap::new(),
                    current_pcpu: 0,
                    global_lock_depth: 0,
                    vm_lock_depth: 0,
                    alloc_failures: 0,
                    needs_tmp_gdt: false,
                    pseudo_tsc: 1_000_000,
                    pseudo_tsc_hz: 1_000_000_000,
                    pseudo_tsc_offset: 0,
                    uses_ref_clock: false,
                    tscs_synced: true,
                }),
            }
        }

        pub fn set_msr(&self, msr: u32, value: u64) {
            self.inner.lock().unwrap().msrs.insert(msr, value);
        }

        pub fn set_current_pcpu(&self, pcpu: u32) {
            self.inner.lock().unwrap().current_pcpu = pcpu;
        }

        /// Makes the next `n` allocations fail.
        pub fn fail_next_allocs(&self, n: u32) {
            self.inner.lock().unwrap().alloc_failures = n;
        }

        pub fn set_pseudo_tsc(&self, value: u64) {
            self.inner.lock().unwrap().pseudo_tsc = value;
        }

        pub fn set_needs_temporary_gdt(&self, needs: bool) {
            self.inner.lock().unwrap().needs_tmp_gdt = needs;
        }

        pub fn set_tscs_synced(&self, synced: bool) {
            self.inner.lock().unwrap().tscs_synced = synced;
        }

        pub fn pseudo_tsc_ref_clock_active(&self) -> bool {
            self.inner.lock().unwrap().uses_ref_clock
        }

        /// Installs an externally built page (e.g. a monitor page table).
        pub fn install_page(&self, mpn: Mpn, content: Vec<u8>) {
            assert_eq!(content.len(), PAGE_SIZE as usize);
            self.inner
                .lock()
                .unwrap()
                .pages
                .insert(mpn.0, PageBacking::Owned(content.into_boxed_slice()));
        }

        /// Copies the first bytes of a page out for inspection.
        pub fn read_page_prefix(&self, mpn: Mpn, buf: &mut [u8]) {
            self.read_physical(mpn.address(), buf).unwrap();
        }

        fn take_alloc_failure(inner: &mut Inner) -> bool {
            if inner.alloc_failures > 0 {
                inner.alloc_failures -= 1;
                true
            } else {
                false
            }
        }
    }

    impl Drop for MockHost {
        fn drop(&mut self) {
            let inner = self.inner.get_mut().unwrap();
            for (&ptr, &pages) in &inner.kernel_allocs {
                let layout =
                    Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize)
                        .unwrap();
                unsafe { dealloc(ptr, layout) };
            }
        }
    }

    impl HostAlloc for MockHost {
        fn alloc_kernel_pages(&self, n: usize) -> Result<KernelPages, SwitchError> {
            let mut inner = self.inner.lock().unwrap();
            if Self::take_alloc_failure(&mut inner) {
                return Err(SwitchError::Alloc);
            }

            let layout =
                Layout::from_size_align(n * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).ok_or(SwitchError::Alloc)?;

            let mpn = Mpn(inner.next_mpn);
            inner.next_mpn += n as u64;
            for i in 0..n {
                inner.pages.insert(
                    mpn.0 + i as u64,
                    PageBacking::Kernel(unsafe { ptr.as_ptr().add(i * PAGE_SIZE as usize) }),
                );
            }
            inner.kernel_allocs.insert(ptr.as_ptr(), n);

            Ok(KernelPages { ptr, mpn })
        }

        unsafe fn free_kernel_pages(&self, n: usize, pages: KernelPages) {
            let mut inner = self.inner.lock().unwrap();
            for i in 0..n {
                inner.pages.remove(&(pages.mpn.0 + i as u64));
            }
            if inner.kernel_allocs.remove(&pages.ptr.as_ptr()).is_some() {
                let layout =
                    Layout::from_size_align(n * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
                unsafe { dealloc(pages.ptr.as_ptr(), layout) };
            }
        }

        fn alloc_machine_page(&self) -> Result<Mpn, SwitchError> {
            let mut inner = self.inner.lock().unwrap();
            if Self::take_alloc_failure(&mut inner) {
                return Err(SwitchError::Alloc);
            }

            let mpn = Mpn(inner.next_mpn);
            inner.next_mpn += 1;
            inner.pages.insert(
                mpn.0,
                PageBacking::Owned(vec![0u8; PAGE_SIZE as usize].into_boxed_slice()),
            );
            Ok(mpn)
        }

        fn free_machine_page(&self, mpn: Mpn) {
            self.inner.lock().unwrap().pages.remove(&mpn.0);
        }

        fn write_machine_page(&self, mpn: Mpn, content: &[u8]) -> Result<(), SwitchError> {
            self.write_physical(mpn.address(), content)
        }

        fn crosspage_code_mpn(&self) -> Mpn {
            Mpn(0xC0DE)
        }
    }

    impl HostPhysMem for MockHost {
        fn read_physical(&self, ma: Ma, buf: &mut [u8]) -> Result<(), SwitchError> {
            let inner = self.inner.lock().unwrap();
            let offset = (ma.0 % PAGE_SIZE) as usize;
            assert!(offset + buf.len() <= PAGE_SIZE as usize, "access crosses a page");
            match inner.pages.get(&ma.mpn().0) {
                Some(PageBacking::Owned(page)) => {
                    buf.copy_from_slice(&page[offset..offset + buf.len()]);
                    Ok(())
                }
                Some(PageBacking::Kernel(ptr)) => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr.add(offset), buf.as_mut_ptr(), buf.len())
                    };
                    Ok(())
                }
                None => Err(SwitchError::Physical { ma }),
            }
        }

        fn write_physical(&self, ma: Ma, buf: &[u8]) -> Result<(), SwitchError> {
            let mut inner = self.inner.lock().unwrap();
            let offset = (ma.0 % PAGE_SIZE) as usize;
            assert!(offset + buf.len() <= PAGE_SIZE as usize, "access crosses a page");
            match inner.pages.get_mut(&ma.mpn().0) {
                Some(PageBacking::Owned(page)) => {
                    page[offset..offset + buf.len()].copy_from_slice(buf);
                    Ok(())
                }
                Some(PageBacking::Kernel(ptr)) => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr.add(offset), buf.len())
                    };
                    Ok(())
                }
                None => Err(SwitchError::Physical { ma }),
            }
        }
    }

    impl HostCpuInfo for MockHost {
        fn current_pcpu(&self) -> PcpuId {
            PcpuId(self.inner.lock().unwrap().current_pcpu)
        }

        fn num_pcpus(&self) -> usize {
            self.num_pcpus
        }

        fn for_each_pcpu(&self, f: &mut dyn FnMut(PcpuId)) {
            for pcpu in 0..self.num_pcpus as u32 {
                f(PcpuId(pcpu));
            }
        }

        fn safe_rdmsr(&self, msr: u32) -> Option<u64> {
            self.inner.lock().unwrap().msrs.get(&msr).copied()
        }

        fn needs_temporary_gdt(&self) -> bool {
            self.inner.lock().unwrap().needs_tmp_gdt
        }
    }

    impl HostSync for MockHost {
        fn global_lock(&self, _tag: u32) {
            self.inner.lock().unwrap().global_lock_depth += 1;
        }

        fn global_unlock(&self, _tag: u32) {
            self.inner.lock().unwrap().global_lock_depth -= 1;
        }

        fn global_lock_is_held(&self) -> bool {
            self.inner.lock().unwrap().global_lock_depth > 0
        }

        fn vm_lock(&self, _tag: u32) {
            self.inner.lock().unwrap().vm_lock_depth += 1;
        }

        fn vm_unlock(&self, _tag: u32) {
            self.inner.lock().unwrap().vm_lock_depth -= 1;
        }
    }

    impl HostTime for MockHost {
        fn pseudo_tsc(&self) -> u64 {
            self.inner.lock().unwrap().pseudo_tsc
        }

        fn pseudo_tsc_hz(&self) -> u64 {
            self.inner.lock().unwrap().pseudo_tsc_hz
        }

        fn pseudo_tsc_offset(&self) -> u64 {
            self.inner.lock().unwrap().pseudo_tsc_offset
        }

        fn pseudo_tsc_uses_ref_clock(&self) -> bool {
            self.inner.lock().unwrap().uses_ref_clock
        }

        fn set_pseudo_tsc_use_ref_clock(&self) -> bool {
            self.inner.lock().unwrap().uses_ref_clock = true;
            true
        }

        fn hw_tscs_synced(&self) -> bool {
            self.inner.lock().unwrap().tscs_synced
        }
    }
}
