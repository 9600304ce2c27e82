use crate::{Lpn, Ma};

/// An error surfaced by the world-switch engine.
///
/// The engine fails fast at VM power-on and (almost) never at switch time:
/// every variant except [`UndefinedOpcode`] and [`UnexpectedInterrupt`] is
/// produced before the first switch of a VCPU completes.
///
/// [`UndefinedOpcode`]: SwitchError::UndefinedOpcode
/// [`UnexpectedInterrupt`]: SwitchError::UnexpectedInterrupt
#[derive(thiserror::Error, Debug)]
pub enum SwitchError {
    /// A kernel memory or machine page allocation failed.
    #[error("kernel memory allocation failed")]
    Alloc,

    /// The host CPUs do not support hardware virtualization, or their
    /// feature sets cannot be reconciled.
    #[error("hardware virtualization is not usable on this host")]
    HvUnsupported,

    /// VT-x is disabled and locked by firmware.
    #[error("VT-x is disabled and locked by firmware")]
    VtDisabledByFirmware,

    /// The monitor's crosspage was built against a different layout.
    #[error("crosspage version mismatch: driver {driver:#010x}, monitor {monitor:#010x}")]
    VersionMismatch {
        /// The version this driver was built with.
        driver: u32,
        /// The version found in the crosspage.
        monitor: u32,
    },

    /// A crosspage linear address falls inside the monitor address space,
    /// so no page-table patch can map it.
    #[error("LPN {lpn:?} overlaps with the monitor address space")]
    MonitorOverlap {
        /// The unpatchable linear page number.
        lpn: Lpn,
    },

    /// A page-table patch would overwrite a live monitor mapping.
    #[error("page table patch collision at level {level}")]
    PatchCollision {
        /// The level at which the existing entry was found.
        level: u32,
    },

    /// The per-VCPU patch table is out of slots.
    #[error("page table patch table is full")]
    PatchTableFull,

    /// The monitor page tables lack an upper-level entry the patch
    /// application walk needs to traverse.
    #[error("monitor page walk not present at level {level}")]
    PatchPathNotPresent {
        /// The level whose entry was not present.
        level: u32,
    },

    /// A patch landed at a level the application walk does not support.
    #[error("page table patch has unsupported level {level}")]
    InvalidPatchLevel {
        /// The offending level value.
        level: u32,
    },

    /// A patched LPN does not walk to its registered MPN.
    #[error("page table patch verification failed for LPN {lpn:?}")]
    PatchVerifyFailed {
        /// The mispatched linear page number.
        lpn: Lpn,
    },

    /// A crossGDT slot is already populated with a different descriptor.
    #[error("crossGDT descriptor conflict in slot {slot}")]
    DescriptorConflict {
        /// The conflicting slot index.
        slot: usize,
    },

    /// A crossGDT slot index is outside the single descriptor page.
    #[error("crossGDT slot {slot} out of range")]
    DescriptorOutOfRange {
        /// The offending slot index.
        slot: usize,
    },

    /// The crossGDT has not been created yet.
    #[error("crossGDT is not initialized")]
    NoCrossGdt,

    /// A physical memory access through the host failed.
    #[error("physical memory access failed at {ma:?}")]
    Physical {
        /// The inaccessible machine address.
        ma: Ma,
    },

    /// No flat writeable kernel data segment was found in the host GDT.
    #[error("host GDT has no flat writeable data segment")]
    NoKernelDataSegment,

    /// The crosspage code does not fit within a single page.
    #[error("crosspage code exceeds one page")]
    CrosspageCodeTooLarge,

    /// A `#UD` was raised while switching; the VCPU is considered lost.
    #[error("#UD occurred during the world switch")]
    UndefinedOpcode,

    /// The monitor asked the driver to forward an interrupt vector that the
    /// host cannot accept.
    #[error("unexpected interrupt vector {vector:#x} forwarded from the monitor")]
    UnexpectedInterrupt {
        /// The rejected vector.
        vector: u64,
    },
}
