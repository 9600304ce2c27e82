use worldswitch_arch_amd64::{PAGE_MASK, PAGE_SHIFT};

use super::macros::impl_addr;

impl_addr!(Mpn, "machine page number");
impl_addr!(Ma, "machine address");
impl_addr!(La, "linear address");
impl_addr!(Lpn, "linear page number");

/// Sentinel for an unallocated or failed machine page.
pub const INVALID_MPN: Mpn = Mpn(u64::MAX);

impl Mpn {
    /// Returns the machine address of the first byte of this page.
    pub const fn address(self) -> Ma {
        Ma(self.0 << PAGE_SHIFT)
    }

    /// Checks against [`INVALID_MPN`].
    pub const fn is_invalid(self) -> bool {
        self.0 == INVALID_MPN.0
    }
}

impl Ma {
    /// Returns the machine page number containing this address.
    pub const fn mpn(self) -> Mpn {
        Mpn(self.0 >> PAGE_SHIFT)
    }
}

impl La {
    /// Returns the linear page number containing this address.
    pub const fn lpn(self) -> Lpn {
        Lpn(self.0 >> PAGE_SHIFT)
    }

    /// Rounds down to the containing page boundary.
    pub const fn page_base(self) -> La {
        La(self.0 & PAGE_MASK)
    }
}

impl Lpn {
    /// Returns the linear address of the first byte of this page.
    pub const fn address(self) -> La {
        La(self.0 << PAGE_SHIFT)
    }
}

/// A physical CPU index.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PcpuId(pub u32);

/// A virtual CPU index within a VM.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct VcpuId(pub u32);

impl From<u32> for PcpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<u32> for VcpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
