//! Control registers.

mod cr0;
mod cr2;
mod cr3;
mod cr4;

pub use self::{cr0::Cr0, cr2::Cr2, cr3::Cr3, cr4::Cr4};
