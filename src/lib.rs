//! # World switch
//!
//! The core of a hosted ("type 1.5") x86-64 hypervisor driver: the engine
//! that transitions a physical CPU between *host context* (running under the
//! host kernel) and *monitor context* (running the virtual machine monitor,
//! which in turn runs guest code).
//!
//! Each side of the switch owns a complete CPU state: page tables, descriptor
//! tables, control and debug registers, segment bases, and interrupt
//! delivery.  The only common ground during the transition is the
//! *crosspage* — a code page and a data page mapped at identical linear
//! addresses in both address spaces — plus a shared descriptor table page
//! (the *crossGDT*).  Everything in this workspace exists to set up that
//! common ground and to walk a CPU across it without dropping an NMI, a
//! machine check, or a debug trap on the floor.
//!
//! # Crates
//!
//! - [`worldswitch_core`] — the engine: hardware-capability probe, HV
//!   root-mode management, crossGDT construction, page-table patching,
//!   the crosspage runtime, the switch driver, and the pseudo-TSC.
//! - [`worldswitch_arch_amd64`] — AMD64 state definitions: control and
//!   debug registers, segmentation, 4-level paging, IDT gates, MSRs, and
//!   the local APIC.
//!
//! The host operating system is abstracted behind the capability traits in
//! [`worldswitch_core::host`]; privileged instructions behind
//! [`worldswitch_core::cpu`].  A platform shim supplies both.

pub use worldswitch_core as core;

#[cfg(feature = "arch-amd64")]
pub use worldswitch_arch_amd64 as amd64;

pub use worldswitch_core::{
    CrossGdtInit, CrossGdtInitEntry, ModuleCall, SwitchError, SwitchSummary, Vm, VmConfig,
    WorldSwitch,
};
