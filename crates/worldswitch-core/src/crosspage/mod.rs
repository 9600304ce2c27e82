//! The crosspage: the code and data pages both worlds share.

#[cfg(target_arch = "x86_64")]
pub mod code;
mod data;

pub use self::data::{
    CROSSPAGE_VERSION, CrossPageData, DRIVER_VERSION, MAX_SWITCH_PT_PATCHES, PTP_EMPTY,
    PageTablePatch, PtscConv, TINY_STACK_SENTINEL, module_call,
};
