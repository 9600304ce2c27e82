//! Segmentation: selectors and descriptors.

mod descriptor;
mod selector;

pub use self::{
    descriptor::SegmentDescriptor,
    selector::{DescriptorTable, Selector},
};
