//! The result of placing a block graph into an address space.

use crate::address::RelativeAddress;
use crate::block_graph::BlockAddressSpace;
use crate::pe::SectionHeader;

/// Per-section metadata an image writer needs to emit section headers.
#[derive(Clone, Debug)]
pub struct LayoutSection {
    pub name: String,
    pub addr: RelativeAddress,
    /// Virtual size of the section.
    pub size: u32,
    /// Initialized (on-disk) size of the section.
    pub data_size: u32,
    pub characteristics: u32,
}

impl LayoutSection {
    pub fn from_header(header: &SectionHeader) -> Self {
        LayoutSection {
            name: header.name.clone(),
            addr: header.virtual_address,
            size: header.virtual_size,
            data_size: header.size_of_raw_data,
            characteristics: header.characteristics,
        }
    }
}

/// A block graph plus a placement of its blocks into an address space with
/// section-header metadata.
#[derive(Default)]
pub struct ImageLayout {
    pub sections: Vec<LayoutSection>,
    pub blocks: BlockAddressSpace,
}

impl ImageLayout {
    pub fn new() -> Self {
        ImageLayout::default()
    }
}
