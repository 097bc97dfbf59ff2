//! The PE side of the toolchain: the consumed reader surfaces and the
//! image-level decomposer.
//!
//! The PE file reader itself is a collaborator; this module defines the
//! minimum surface the decomposer consumes from it ([`PeImage`]) plus the
//! plain data it produces for consumers ([`ImageLayout`]).

use std::collections::BTreeMap;

use crate::address::{AbsoluteAddress, Address, RelativeAddress};
use crate::block_graph::{BlockType, ReferenceType};

pub mod decomposer;
pub mod image_layout;
pub mod pdb;

pub use decomposer::{DecomposedImage, Decomposer};
pub use image_layout::{ImageLayout, LayoutSection};

// IMAGE_SCN_* characteristics bits consumed here.
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Characteristics that mark a section as read-only data.
pub const READONLY_DATA_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_CNT_UNINITIALIZED_DATA;

pub const RESOURCE_SECTION_NAME: &str = ".rsrc";

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SectionType {
    Code,
    Data,
    Unknown,
}

/// One section header, as exposed by the PE reader.
#[derive(Clone, Debug)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_address: RelativeAddress,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn section_type(&self) -> SectionType {
        if self.characteristics & IMAGE_SCN_CNT_CODE != 0 {
            return SectionType::Code;
        }
        if self.characteristics & READONLY_DATA_CHARACTERISTICS != 0 {
            return SectionType::Data;
        }
        SectionType::Unknown
    }

    pub fn contains(&self, addr: RelativeAddress, size: u32) -> bool {
        !(addr < self.virtual_address)
            && !(self.virtual_address.offset_by(self.virtual_size) < addr.offset_by(size))
    }
}

/// Identity of a module, used to pair an image with its debug data.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeSignature {
    pub path: String,
    pub module_size: u32,
    pub module_checksum: u32,
    pub module_time_date_stamp: u32,
    pub module_base_address: AbsoluteAddress,
}

/// A reference discovered by the PE parser while carving image structures.
#[derive(Copy, Clone, Debug)]
pub struct ParsedReference {
    /// Offset of the reference within its header block.
    pub offset: u32,
    pub kind: ReferenceType,
    pub size: u8,
    pub target: RelativeAddress,
}

/// One header or metadata structure the PE parser carved out: DOS header,
/// NT headers, data directories, import and export tables, and so on.
#[derive(Clone, Debug)]
pub struct HeaderBlock {
    pub name: String,
    pub addr: RelativeAddress,
    pub size: u32,
    pub block_type: BlockType,
    pub references: Vec<ParsedReference>,
}

/// The surface the decomposer consumes from the PE file reader.
pub trait PeImage {
    fn sections(&self) -> &[SectionHeader];

    /// The image bytes at `[addr, addr + len)`, or `None` when the range is
    /// not backed by file data (BSS and the like).
    fn image_data(&self, addr: RelativeAddress, len: u32) -> Option<&[u8]>;

    fn image_base(&self) -> AbsoluteAddress;

    fn size_of_image(&self) -> u32;

    /// Absolute-address relocation entries: location -> target.
    fn relocs(&self) -> &BTreeMap<RelativeAddress, AbsoluteAddress>;

    /// The header and metadata blocks the parser carved, with the
    /// references it discovered inside them.
    fn header_blocks(&self) -> Vec<HeaderBlock>;

    fn signature(&self) -> PeSignature;

    fn translate_to_relative(&self, addr: AbsoluteAddress) -> Option<RelativeAddress> {
        let delta = addr - self.image_base();
        if delta < 0 || delta >= i64::from(self.size_of_image()) {
            return None;
        }
        Some(RelativeAddress(delta as u32))
    }

    fn translate_to_absolute(&self, addr: RelativeAddress) -> Option<AbsoluteAddress> {
        if addr.value() >= self.size_of_image() {
            return None;
        }
        Some(self.image_base() + addr.value())
    }

    /// True iff `[addr, addr + len)` lies within the image.
    fn contains(&self, addr: RelativeAddress, len: u32) -> bool {
        u64::from(addr.value()) + u64::from(len) <= u64::from(self.size_of_image())
    }

    /// The index of the section containing `[addr, addr + len)`, if any.
    fn section_index_of(&self, addr: RelativeAddress, len: u32) -> Option<u32> {
        self.sections()
            .iter()
            .position(|s| s.contains(addr, len))
            .map(|i| i as u32)
    }
}
