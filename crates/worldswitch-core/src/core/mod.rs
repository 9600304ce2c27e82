//! Typed quantities used throughout the engine.

mod addr;
pub(crate) mod macros;

pub use self::addr::{INVALID_MPN, La, Lpn, Ma, Mpn, PcpuId, VcpuId};
