//! The crossGDT: one descriptor page shared by every VM the driver runs.
//!
//! During a world switch the CPU needs a GDT that is valid on both sides of
//! the CR3 change.  The crossGDT provides it: the host phase copies the
//! first page of the live host GDT in (host code/data/TSS segments stay
//! loadable mid-switch), and each VM power-on writes the monitor's
//! descriptors into designated high slots.  A slot, once populated, may
//! never be repopulated with a semantically different descriptor; the
//! accessed bit is the only tolerated difference.

use std::ptr::NonNull;

use worldswitch_arch_amd64::{DescriptorTableRegister, PAGE_SIZE, SegmentDescriptor};

use crate::{
    La, Mpn, SwitchError,
    cpu::Cpu,
    host::{HostAlloc, HostSync, KernelPages},
};

/// Number of descriptor slots in the crossGDT page.
pub const CROSS_GDT_SLOTS: usize = PAGE_SIZE as usize / size_of::<SegmentDescriptor>();

/// One monitor descriptor to install into the crossGDT.
#[derive(Debug, Clone, Copy)]
pub struct CrossGdtInitEntry {
    /// Destination slot index.
    pub index: u16,

    /// Present flag; non-present entries are skipped.
    pub present: bool,

    /// Segment base.
    pub base: u32,

    /// Segment limit.
    pub limit: u32,

    /// Descriptor type field.
    pub typ: u8,

    /// S flag (code/data vs system).
    pub s: bool,

    /// Descriptor privilege level.
    pub dpl: u8,

    /// D/B flag.
    pub db: bool,

    /// Granularity flag.
    pub granularity: bool,

    /// L flag (64-bit code).
    pub long_mode: bool,
}

impl CrossGdtInitEntry {
    fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor::new(
            self.base,
            self.limit,
            self.typ,
            self.s,
            self.dpl,
            self.present,
            self.db,
            self.granularity,
            self.long_mode,
        )
    }
}

/// The monitor's GDT init table, passed to VM power-on.
#[derive(Debug, Clone, Default)]
pub struct CrossGdtInit {
    /// Descriptors to install.
    pub entries: Vec<CrossGdtInitEntry>,
}

/// The allocated crossGDT page.
pub struct CrossGdt {
    pages: KernelPages,
}

// One writer at a time by the global-lock discipline; readers are the
// switch paths of pinned threads.
unsafe impl Send for CrossGdt {}
unsafe impl Sync for CrossGdt {}

impl CrossGdt {
    /// Allocates the page and copies the host phase in.  Caller holds the
    /// driver global lock.
    pub fn create<H, C>(host: &H, cpu: &mut C) -> Result<CrossGdt, SwitchError>
    where
        H: HostAlloc + HostSync,
        C: Cpu,
    {
        debug_assert!(host.global_lock_is_held());

        let pages = host.alloc_kernel_pages(1)?;
        let gdt = CrossGdt { pages };
        gdt.copy_host_gdt(cpu);
        Ok(gdt)
    }

    /// Host linear address of the page.
    pub fn la(&self) -> La {
        La(self.pages.ptr.as_ptr() as u64)
    }

    /// Machine page of the page.
    pub fn mpn(&self) -> Mpn {
        self.pages.mpn
    }

    /// The descriptor used to `lgdt` this page by its host linear address.
    pub fn descriptor(&self) -> DescriptorTableRegister {
        DescriptorTableRegister::new(self.la().0, PAGE_SIZE as u32)
    }

    fn slots(&self) -> NonNull<SegmentDescriptor> {
        self.pages.ptr.cast()
    }

    /// Reads one descriptor slot.
    pub fn slot(&self, index: usize) -> SegmentDescriptor {
        assert!(index < CROSS_GDT_SLOTS);
        // Page owned by this allocation; index checked above.
        unsafe { self.slots().add(index).read() }
    }

    fn write_slot(&self, index: usize, descriptor: SegmentDescriptor) {
        assert!(index < CROSS_GDT_SLOTS);
        unsafe { self.slots().add(index).write(descriptor) };
    }

    /// Host phase: copy the first page of the live host GDT in.
    ///
    /// All host segments the switch will ever load are assumed to come from
    /// the first page of the host GDT.
    fn copy_host_gdt<C: Cpu>(&self, cpu: &mut C) {
        let host_gdt = cpu.get_gdt();
        let len = (host_gdt.size() as usize).min(PAGE_SIZE as usize);
        // The host GDT is kernel-mapped at its descriptor base for at
        // least `limit + 1` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                host_gdt.base as *const u8,
                self.pages.ptr.as_ptr(),
                len,
            );
        }
    }

    /// Fills one slot, or verifies it already holds the same descriptor
    /// modulo the accessed bit.  Caller holds the driver global lock.
    fn set_entry<H: HostSync>(
        &self,
        host: &H,
        index: usize,
        descriptor: SegmentDescriptor,
    ) -> Result<(), SwitchError> {
        debug_assert!(host.global_lock_is_held());
        debug_assert!(descriptor.present());

        if index >= CROSS_GDT_SLOTS {
            tracing::warn!(index, "crossGDT slot out of range");
            return Err(SwitchError::DescriptorOutOfRange { slot: index });
        }

        let existing = self.slot(index);
        if !existing.present() {
            self.write_slot(index, descriptor);
            return Ok(());
        }
        if existing.equal_ignore_accessed(descriptor) {
            return Ok(());
        }

        tracing::warn!(
            index,
            existing = format_args!("{:016x}", existing.0),
            proposed = format_args!("{:016x}", descriptor.0),
            "crossGDT descriptor conflict",
        );
        Err(SwitchError::DescriptorConflict { slot: index })
    }

    /// Monitor phase: install the VM's descriptor init table.  Caller
    /// holds the driver global lock.
    pub fn set_monitor_entries<H: HostSync>(
        &self,
        host: &H,
        init: &CrossGdtInit,
    ) -> Result<(), SwitchError> {
        for entry in &init.entries {
            if entry.present {
                self.set_entry(host, usize::from(entry.index), entry.descriptor())?;
            }
        }
        Ok(())
    }

    /// Frees the page.  Teardown only.
    pub fn free<H: HostAlloc>(self, host: &H) {
        unsafe { host.free_kernel_pages(1, self.pages) };
    }
}

#[cfg(test)]
#[path = "crossgdt_tests.rs"]
mod crossgdt_tests;
