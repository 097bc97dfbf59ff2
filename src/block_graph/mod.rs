//! An abstract graph of blocks.
//!
//! A block is a contiguous run of bytes with an id, a type, a size and a few
//! other properties. Each block represents either code or data, and blocks
//! reference one another through typed references. The graph also keeps
//! minimum knowledge of sections (names and characteristics); each block
//! belongs to at most one section.
//!
//! Because blocks get split up and glued together in arbitrary ways, each
//! block carries a mapping from ranges of its bytes to the ranges of bytes in
//! the original image they came from. This effectively encodes OMAP data,
//! which is what allows the PDB file to be updated after a rewrite.
//!
//! Blocks are addressed by stable ids; every operation that touches both ends
//! of a reference edge ([`BlockGraph::set_reference`] and friends) lives on
//! the graph so the forward reference map and the reverse referrer sets can
//! never be observed out of sync.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use log::warn;

use crate::address::{Address, RelativeAddress};
use crate::address_range_map::AddressRangeMap;
use crate::address_space::{AddressRange, AddressSpace};
use crate::error::{Error, Result};

pub mod basic_block;
pub mod basic_block_decomposer;
pub mod block_builder;
pub mod block_util;
pub mod serialization;
pub mod transform;

pub type BlockId = u32;
pub type SectionId = u32;

pub const INVALID_SECTION_ID: SectionId = SectionId::MAX;

/// A range of bytes within a block.
pub type DataRange = AddressRange<u32>;
/// A range of bytes in the original image.
pub type SourceRange = AddressRange<RelativeAddress>;
/// The bytes of a block mapped back to the image bytes they came from.
pub type SourceRanges = AddressRangeMap<u32, RelativeAddress>;

bitflags! {
    /// Block attributes are phrased so that if one is true for a part it is
    /// also true for the whole: merging two blocks ORs their attributes.
    /// `PADDING_BLOCK` and `BUILT_BY_SYZYGY` are post-merge markers and are
    /// excluded from that rule.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct BlockAttributes: u32 {
        /// Set for functions declared non-returning.
        const NON_RETURN_FUNCTION = 1 << 0;
        /// Set for blocks inferred to fill gaps between known blocks.
        const GAP_BLOCK = 1 << 1;
        /// Set for blocks carved out of the PE headers and structures. These
        /// blocks are unmovable and indivisible.
        const PE_PARSED = 1 << 2;
        /// Set for blocks created from section contribution information.
        const SECTION_CONTRIB = 1 << 3;
        /// The block consists purely of padding data.
        const PADDING_BLOCK = 1 << 4;
        /// The block contains inline assembly.
        const HAS_INLINE_ASSEMBLY = 1 << 5;
        /// The block was built by a compiler whose conventions we do not
        /// fully understand.
        const BUILT_BY_UNSUPPORTED_COMPILER = 1 << 6;
        /// The block was emitted by this toolchain and is inherently safe to
        /// decompose without the usual checks.
        const BUILT_BY_SYZYGY = 1 << 7;
        /// The block contains exception handling records.
        const HAS_EXCEPTION_HANDLING = 1 << 8;
        /// Disassembly of this block failed.
        const ERRORED_DISASSEMBLY = 1 << 9;
        /// Disassembly ran off the end of this block.
        const DISASSEMBLED_PAST_END = 1 << 10;
        /// Disassembly did not cover every byte of this block.
        const INCOMPLETE_DISASSEMBLY = 1 << 11;
        /// The block contains instructions the decoder does not understand.
        const UNSUPPORTED_INSTRUCTIONS = 1 << 12;
    }
}

impl BlockAttributes {
    /// Attributes that describe a finished block rather than any of its
    /// parts; they do not survive a merge.
    pub const NON_MONOTONE: BlockAttributes =
        BlockAttributes::PADDING_BLOCK.union(BlockAttributes::BUILT_BY_SYZYGY);
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct LabelAttributes: u32 {
        /// An instruction boundary at which disassembly can begin.
        const CODE = 1 << 0;
        /// The start of embedded data.
        const DATA = 1 << 1;
        /// The end of the function prologue (first safe patch point).
        const DEBUG_START = 1 << 2;
        /// The start of the function epilogue.
        const DEBUG_END = 1 << 3;
        /// The start of a lexical scope.
        const SCOPE_START = 1 << 4;
        /// The end of a lexical scope.
        const SCOPE_END = 1 << 5;
        /// A call site, as recorded by the compiler.
        const CALL_SITE = 1 << 6;
        /// The start of a jump table (data inside a code block).
        const JUMP_TABLE = 1 << 7;
        /// The start of a case table (data inside a code block).
        const CASE_TABLE = 1 << 8;
        /// Padding bytes.
        const PADDING = 1 << 9;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum BlockType {
    Code = 0,
    Data = 1,
}

impl BlockType {
    pub fn from_u8(v: u8) -> Option<BlockType> {
        match v {
            0 => Some(BlockType::Code),
            1 => Some(BlockType::Data),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum ReferenceType {
    PcRelative = 0,
    Absolute = 1,
    Relative = 2,
    FileOffset = 3,
}

impl ReferenceType {
    pub fn from_u8(v: u8) -> Option<ReferenceType> {
        match v {
            0 => Some(ReferenceType::PcRelative),
            1 => Some(ReferenceType::Absolute),
            2 => Some(ReferenceType::Relative),
            3 => Some(ReferenceType::FileOffset),
            _ => None,
        }
    }
}

/// A typed reference from a byte range in one block to a location in
/// another.
///
/// References may be offset: they refer to an *entity* at `base`, but the
/// encoded bytes may point some fixed distance away from it, allowing
/// non-zero based indexing into tables. `base` must lie strictly within the
/// referenced block; `offset` need not. A direct reference has
/// `offset == base`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Reference {
    kind: ReferenceType,
    size: u8,
    referenced: BlockId,
    offset: i32,
    base: u32,
}

/// The widest reference that can appear on the wire.
pub const MAXIMUM_REFERENCE_SIZE: u8 = 4;

impl Reference {
    pub fn new(kind: ReferenceType, size: u8, referenced: BlockId, offset: i32, base: u32) -> Self {
        debug_assert!(Reference::is_valid_type_size(kind, size));
        Reference { kind, size, referenced, offset, base }
    }

    /// A direct reference to `base` within `referenced`.
    pub fn direct(kind: ReferenceType, size: u8, referenced: BlockId, base: u32) -> Self {
        Reference::new(kind, size, referenced, base as i32, base)
    }

    pub fn kind(&self) -> ReferenceType {
        self.kind
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn referenced(&self) -> BlockId {
        self.referenced
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn is_direct(&self) -> bool {
        self.offset == self.base as i32
    }

    /// PC-relative references come in 1, 2 and 4 byte widths; everything
    /// else is pointer wide.
    pub fn is_valid_type_size(kind: ReferenceType, size: u8) -> bool {
        match kind {
            ReferenceType::PcRelative => size == 1 || size == 2 || size == 4,
            ReferenceType::Absolute | ReferenceType::Relative | ReferenceType::FileOffset => {
                size == 4
            }
        }
    }
}

/// A label denotes the beginning (or end) of a sub-region within a block: an
/// instruction boundary where disassembly can begin, the start of embedded
/// data, scope and debug-range markers, and so on.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Label {
    name: String,
    attributes: LabelAttributes,
}

impl Label {
    pub fn new(name: impl Into<String>, attributes: LabelAttributes) -> Self {
        Label { name: name.into(), attributes }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> LabelAttributes {
        self.attributes
    }

    /// True iff this label carries all of `attributes`.
    pub fn has_attributes(&self, attributes: LabelAttributes) -> bool {
        self.attributes.contains(attributes)
    }

    /// True iff this label carries any of `attributes`.
    pub fn has_any_attributes(&self, attributes: LabelAttributes) -> bool {
        self.attributes.intersects(attributes)
    }

    pub fn set_attributes(&mut self, attributes: LabelAttributes) {
        self.attributes |= attributes;
    }

    /// Checks internal attribute consistency. Table labels imply data;
    /// debug, scope and call-site markers imply code. A label that is both
    /// code and data is a known toolchain artifact: tolerated, but worth a
    /// warning at the call site.
    pub fn is_valid(&self) -> bool {
        let a = self.attributes;
        if a.intersects(LabelAttributes::JUMP_TABLE | LabelAttributes::CASE_TABLE)
            && !a.contains(LabelAttributes::DATA)
        {
            return false;
        }
        if a.intersects(
            LabelAttributes::DEBUG_START
                | LabelAttributes::DEBUG_END
                | LabelAttributes::SCOPE_START
                | LabelAttributes::SCOPE_END
                | LabelAttributes::CALL_SITE,
        ) && !a.contains(LabelAttributes::CODE)
        {
            return false;
        }
        true
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.attributes)
    }
}

/// A section of the image: a name and the characteristics it was declared
/// with. Section ids are stable for the life of the graph.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Section {
    id: SectionId,
    name: String,
    characteristics: u32,
}

impl Section {
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn characteristics(&self) -> u32 {
        self.characteristics
    }

    pub fn set_characteristics(&mut self, characteristics: u32) {
        self.characteristics = characteristics;
    }
}

/// The bytes a block refers to: nothing (pure BSS), a borrowed slice of the
/// image's backing buffer, or an owned buffer. Borrowed data must never be
/// mutated in place; [`Block::get_mutable_data`] coerces to `Owned` first.
#[derive(Clone, Debug, Default)]
pub enum BlockData<'a> {
    #[default]
    None,
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl<'a> BlockData<'a> {
    fn as_slice(&self) -> &[u8] {
        match self {
            BlockData::None => &[],
            BlockData::Borrowed(bytes) => bytes,
            BlockData::Owned(bytes) => bytes,
        }
    }
}

/// A block of either code or data.
pub struct Block<'a> {
    id: BlockId,
    block_type: BlockType,
    size: u32,
    alignment: u32,
    name: String,
    addr: RelativeAddress,
    section: SectionId,
    attributes: BlockAttributes,
    references: BTreeMap<u32, Reference>,
    referrers: BTreeSet<(BlockId, u32)>,
    source_ranges: SourceRanges,
    labels: BTreeMap<u32, Label>,
    data: BlockData<'a>,
    data_size: u32,
}

impl<'a> Block<'a> {
    fn new(id: BlockId, block_type: BlockType, size: u32, name: impl Into<String>) -> Self {
        Block {
            id,
            block_type,
            size,
            alignment: 1,
            name: name.into(),
            addr: RelativeAddress::INVALID,
            section: INVALID_SECTION_ID,
            attributes: BlockAttributes::empty(),
            references: BTreeMap::new(),
            referrers: BTreeSet::new(),
            source_ranges: SourceRanges::new(),
            labels: BTreeMap::new(),
            data: BlockData::None,
            data_size: 0,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn set_block_type(&mut self, block_type: BlockType) {
        self.block_type = block_type;
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn set_alignment(&mut self, alignment: u32) {
        debug_assert!(alignment.is_power_of_two());
        self.alignment = alignment;
    }

    /// The address of the block, set whenever the block is placed in an
    /// address space.
    pub fn addr(&self) -> RelativeAddress {
        self.addr
    }

    pub fn set_addr(&mut self, addr: RelativeAddress) {
        self.addr = addr;
    }

    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn set_section(&mut self, section: SectionId) {
        self.section = section;
    }

    pub fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    pub fn set_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes = attributes;
    }

    pub fn set_attribute(&mut self, attribute: BlockAttributes) {
        self.attributes |= attribute;
    }

    pub fn clear_attribute(&mut self, attribute: BlockAttributes) {
        self.attributes &= !attribute;
    }

    pub fn references(&self) -> &BTreeMap<u32, Reference> {
        &self.references
    }

    pub fn get_reference(&self, offset: u32) -> Option<Reference> {
        self.references.get(&offset).copied()
    }

    pub fn referrers(&self) -> &BTreeSet<(BlockId, u32)> {
        &self.referrers
    }

    /// True iff some other block refers to this one.
    pub fn has_external_referrers(&self) -> bool {
        self.referrers.iter().any(|&(id, _)| id != self.id)
    }

    pub fn source_ranges(&self) -> &SourceRanges {
        &self.source_ranges
    }

    pub fn source_ranges_mut(&mut self) -> &mut SourceRanges {
        &mut self.source_ranges
    }

    pub fn labels(&self) -> &BTreeMap<u32, Label> {
        &self.labels
    }

    pub fn get_label(&self, offset: u32) -> Option<&Label> {
        self.labels.get(&offset)
    }

    pub fn has_label(&self, offset: u32) -> bool {
        self.labels.contains_key(&offset)
    }

    /// Sets a label at `offset`. If a label already exists there the two are
    /// combined: attributes are unioned and a differing name is appended,
    /// with a warning. Returns true iff a new label was inserted.
    pub fn set_label(&mut self, offset: u32, label: Label) -> bool {
        debug_assert!(offset <= self.size);
        if !label.is_valid() {
            warn!(
                "inconsistent label attributes for '{}' at {}+{}",
                label.name(),
                self.name,
                offset
            );
        }
        match self.labels.entry(offset) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(label);
                true
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                let existing = e.get_mut();
                warn!(
                    "colliding labels '{}' and '{}' at {}+{}",
                    existing.name(),
                    label.name(),
                    self.name,
                    offset
                );
                if !label.name().is_empty() && existing.name != label.name {
                    if existing.name.is_empty() {
                        existing.name = label.name;
                    } else {
                        existing.name.push_str(", ");
                        existing.name.push_str(&label.name);
                    }
                }
                existing.attributes |= label.attributes;
                false
            }
        }
    }

    pub fn remove_label(&mut self, offset: u32) -> bool {
        self.labels.remove(&offset).is_some()
    }

    /// The bytes this block carries. May be shorter than `size`; the
    /// implicit tail is zero-initialized by the loader.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn owns_data(&self) -> bool {
        matches!(self.data, BlockData::Owned(_))
    }

    /// True iff the block has a recorded data size but no bytes bound to it;
    /// this is the state of a borrowed-data block fresh off deserialization.
    pub fn needs_data_rebind(&self) -> bool {
        self.data_size > 0 && matches!(self.data, BlockData::None)
    }

    /// Points this block at bytes owned by someone else; the backing buffer
    /// must outlive the graph.
    pub fn set_data(&mut self, data: &'a [u8]) {
        debug_assert!(data.len() as u32 <= self.size);
        self.data_size = data.len() as u32;
        self.data = if data.is_empty() { BlockData::None } else { BlockData::Borrowed(data) };
    }

    /// Gives this block a zero-initialized owned buffer of `data_size`
    /// bytes.
    pub fn allocate_data(&mut self, data_size: u32) -> &mut [u8] {
        debug_assert!(data_size <= self.size);
        self.data = BlockData::Owned(vec![0; data_size as usize]);
        self.data_size = data_size;
        match &mut self.data {
            BlockData::Owned(bytes) => bytes,
            _ => unreachable!(),
        }
    }

    // Records the data size of a block whose bytes will be re-bound
    // against the image later (a deserialized stream without inline data).
    pub(crate) fn expect_data_size(&mut self, data_size: u32) {
        debug_assert!(data_size <= self.size);
        self.data = BlockData::None;
        self.data_size = data_size;
    }

    /// Copies `data` into an owned buffer.
    pub fn copy_data(&mut self, data: &[u8]) {
        debug_assert!(data.len() as u32 <= self.size);
        self.data = BlockData::Owned(data.to_vec());
        self.data_size = data.len() as u32;
    }

    /// Truncates or zero-extends the block's data to `new_size` bytes,
    /// coercing to owned data if it grows.
    pub fn resize_data(&mut self, new_size: u32) {
        debug_assert!(new_size <= self.size);
        if new_size == self.data_size {
            return;
        }
        if new_size < self.data_size {
            self.data = match std::mem::take(&mut self.data) {
                BlockData::Owned(mut bytes) => {
                    bytes.truncate(new_size as usize);
                    BlockData::Owned(bytes)
                }
                BlockData::Borrowed(bytes) => BlockData::Borrowed(&bytes[..new_size as usize]),
                BlockData::None => BlockData::None,
            };
            if new_size == 0 {
                self.data = BlockData::None;
            }
        } else {
            let mut bytes = self.data.as_slice().to_vec();
            bytes.resize(new_size as usize, 0);
            self.data = BlockData::Owned(bytes);
        }
        self.data_size = new_size;
    }

    /// A mutable view of the block's data. Borrowed data is copied first, so
    /// the backing image buffer is never written through.
    pub fn get_mutable_data(&mut self) -> &mut [u8] {
        if !matches!(self.data, BlockData::Owned(_)) {
            self.data = BlockData::Owned(self.data.as_slice().to_vec());
        }
        match &mut self.data {
            BlockData::Owned(bytes) => bytes,
            _ => unreachable!(),
        }
    }

    /// True iff this block, as placed, covers `[addr, addr + size)`.
    pub fn contains(&self, addr: RelativeAddress, size: u32) -> bool {
        self.addr != RelativeAddress::INVALID
            && !(addr < self.addr)
            && !(self.addr.offset_by(self.size) < addr.offset_by(size))
    }
}

impl fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("type", &self.block_type)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("addr", &self.addr)
            .finish()
    }
}

/// The top-level container for blocks and sections.
#[derive(Default)]
pub struct BlockGraph<'a> {
    sections: Vec<Section>,
    blocks: BTreeMap<BlockId, Block<'a>>,
    next_block_id: BlockId,
}

impl<'a> BlockGraph<'a> {
    pub fn new() -> Self {
        BlockGraph::default()
    }

    // -- Sections. --

    pub fn add_section(&mut self, name: impl Into<String>, characteristics: u32) -> SectionId {
        let id = self.sections.len() as SectionId;
        self.sections.push(Section { id, name: name.into(), characteristics });
        id
    }

    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Finds a section by name, updating its characteristics, or adds one.
    pub fn find_or_add_section(&mut self, name: &str, characteristics: u32) -> SectionId {
        if let Some(section) = self.sections.iter_mut().find(|s| s.name == name) {
            section.characteristics |= characteristics;
            return section.id;
        }
        self.add_section(name, characteristics)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id == id)
    }

    /// Removes the section with the given id. Blocks keep their section ids;
    /// the caller is responsible for not leaving them dangling.
    pub fn remove_section_by_id(&mut self, id: SectionId) -> bool {
        match self.sections.iter().position(|s| s.id == id) {
            Some(pos) => {
                self.sections.remove(pos);
                true
            }
            None => false,
        }
    }

    // -- Blocks. --

    pub fn add_block(
        &mut self,
        block_type: BlockType,
        size: u32,
        name: impl Into<String>,
    ) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.insert(id, Block::new(id, block_type, size, name));
        id
    }

    // Used by deserialization to reconstruct a graph with the original ids.
    pub(crate) fn add_block_with_id(
        &mut self,
        id: BlockId,
        block_type: BlockType,
        size: u32,
        name: impl Into<String>,
    ) -> Result<()> {
        if self.blocks.contains_key(&id) {
            return Err(Error::Serialization(format!("duplicate block id {id}")));
        }
        self.blocks.insert(id, Block::new(id, block_type, size, name));
        self.next_block_id = self.next_block_id.max(id + 1);
        Ok(())
    }

    /// Removes a block. The block must exist and must have neither
    /// references nor referrers; on failure the graph is unchanged.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        let block = self
            .blocks
            .get(&id)
            .ok_or_else(|| Error::Consistency(format!("no block with id {id}")))?;
        if !block.references.is_empty() || !block.referrers.is_empty() {
            return Err(Error::Consistency(format!(
                "block '{}' still has references or referrers",
                block.name
            )));
        }
        self.blocks.remove(&id);
        Ok(())
    }

    pub fn block(&self, id: BlockId) -> Option<&Block<'a>> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block<'a>> {
        self.blocks.get_mut(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block<'a>> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block<'a>> {
        self.blocks.values_mut()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    // -- References. --

    /// Sets the reference at `(src, offset)`, replacing any existing one and
    /// keeping the target's referrer set in sync. Returns true iff this
    /// inserted a new reference.
    pub fn set_reference(&mut self, src: BlockId, offset: u32, reference: Reference) -> Result<bool> {
        if !Reference::is_valid_type_size(reference.kind, reference.size) {
            return Err(Error::Consistency(format!(
                "invalid reference type/size combination {:?}/{}",
                reference.kind, reference.size
            )));
        }

        let target = self
            .blocks
            .get(&reference.referenced)
            .ok_or_else(|| Error::Consistency(format!("no block with id {}", reference.referenced)))?;
        if reference.base >= target.size {
            return Err(Error::Consistency(format!(
                "reference base {} outside target '{}' (size {})",
                reference.base, target.name, target.size
            )));
        }

        let src_block = self
            .blocks
            .get_mut(&src)
            .ok_or_else(|| Error::Consistency(format!("no block with id {src}")))?;
        if offset + u32::from(reference.size) > src_block.size {
            return Err(Error::Consistency(format!(
                "reference at {}+{} runs off the end of the block",
                src_block.name, offset
            )));
        }

        let old = src_block.references.insert(offset, reference);

        // Unhook the old back-edge if it pointed somewhere else.
        if let Some(old) = old {
            if old.referenced != reference.referenced {
                if let Some(old_target) = self.blocks.get_mut(&old.referenced) {
                    old_target.referrers.remove(&(src, offset));
                }
            }
        }

        let target = self.blocks.get_mut(&reference.referenced).unwrap();
        target.referrers.insert((src, offset));
        Ok(old.is_none())
    }

    /// Removes the reference at `(src, offset)`, unhooking the back-edge.
    pub fn remove_reference(&mut self, src: BlockId, offset: u32) -> bool {
        let Some(src_block) = self.blocks.get_mut(&src) else {
            return false;
        };
        let Some(old) = src_block.references.remove(&offset) else {
            return false;
        };
        if let Some(target) = self.blocks.get_mut(&old.referenced) {
            target.referrers.remove(&(src, offset));
        }
        true
    }

    /// Removes every reference the block makes, unhooking back-edges.
    pub fn remove_all_references(&mut self, id: BlockId) -> Result<()> {
        let block = self
            .blocks
            .get_mut(&id)
            .ok_or_else(|| Error::Consistency(format!("no block with id {id}")))?;
        let references = std::mem::take(&mut block.references);
        for (offset, reference) in references {
            if let Some(target) = self.blocks.get_mut(&reference.referenced) {
                target.referrers.remove(&(id, offset));
            }
        }
        Ok(())
    }

    /// Redirects every reference to `from` to point at `to` instead, with
    /// each reference's offset and base shifted by `offset`. Fails without
    /// modifying anything if a shifted reference would escape `to`.
    pub fn transfer_referrers(&mut self, from: BlockId, to: BlockId, offset: i32) -> Result<()> {
        let to_size = self
            .blocks
            .get(&to)
            .ok_or_else(|| Error::Consistency(format!("no block with id {to}")))?
            .size;
        let referrers: Vec<(BlockId, u32)> = self
            .blocks
            .get(&from)
            .ok_or_else(|| Error::Consistency(format!("no block with id {from}")))?
            .referrers
            .iter()
            .copied()
            .collect();

        // Validate the whole batch before touching anything.
        for &(r_id, r_off) in &referrers {
            let reference = self
                .blocks
                .get(&r_id)
                .and_then(|b| b.get_reference(r_off))
                .ok_or_else(|| {
                    Error::Consistency(format!("referrer ({r_id}, {r_off}) has no reference"))
                })?;
            let new_base = i64::from(reference.base) + i64::from(offset);
            if new_base < 0 || new_base >= i64::from(to_size) {
                return Err(Error::Consistency(format!(
                    "transferred reference base {new_base} escapes target block"
                )));
            }
        }

        for (r_id, r_off) in referrers {
            let reference = self.blocks.get(&r_id).and_then(|b| b.get_reference(r_off)).unwrap();
            let new_ref = Reference::new(
                reference.kind,
                reference.size,
                to,
                reference.offset + offset,
                (i64::from(reference.base) + i64::from(offset)) as u32,
            );
            self.set_reference(r_id, r_off, new_ref)?;
        }
        Ok(())
    }

    // -- In-place data edits. --

    /// Makes room for `size` bytes at `offset` in the block, shifting
    /// references, referrers, labels and source ranges that land at or
    /// beyond `offset`. If the edit point lies within the initialized data
    /// (or `always_allocate_data` is set) the data buffer grows too, with
    /// the new bytes zeroed.
    pub fn insert_data(
        &mut self,
        id: BlockId,
        offset: u32,
        size: u32,
        always_allocate_data: bool,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let block = self
            .blocks
            .get_mut(&id)
            .ok_or_else(|| Error::Consistency(format!("no block with id {id}")))?;
        if offset > block.size {
            return Err(Error::Consistency(format!(
                "insert at {} outside block '{}' (size {})",
                offset, block.name, block.size
            )));
        }

        // Shift our own references and labels past the edit point. Remove
        // the whole run before re-inserting: a shifted key may land on a
        // not-yet-shifted neighbor.
        let shifted: Vec<(u32, Reference)> = block
            .references
            .range(offset..)
            .map(|(&o, &r)| (o, r))
            .collect();
        for (o, _) in &shifted {
            block.references.remove(o);
        }
        for &(o, r) in &shifted {
            block.references.insert(o + size, r);
        }

        let labels: Vec<(u32, Label)> = block
            .labels
            .range(offset..)
            .map(|(&o, l)| (o, l.clone()))
            .collect();
        for (o, _) in &labels {
            block.labels.remove(o);
        }
        for (o, l) in labels {
            block.labels.insert(o + size, l);
        }

        block.source_ranges.insert_unmapped_range(&DataRange::new(offset, size));

        // Grow the data if the insertion point is inside it.
        if offset < block.data_size || always_allocate_data {
            let data_size = block.data_size.max(offset);
            let mut bytes = block.data.as_slice().to_vec();
            bytes.resize(data_size as usize, 0);
            let zeros = vec![0u8; size as usize];
            bytes.splice(offset as usize..offset as usize, zeros);
            block.data = BlockData::Owned(bytes);
            block.data_size = data_size + size;
        }
        block.size += size;

        // The shifted references moved their source offsets; their targets'
        // referrer entries must follow.
        for (o, r) in shifted {
            let target = self.blocks.get_mut(&r.referenced).unwrap();
            target.referrers.remove(&(id, o));
            target.referrers.insert((id, o + size));
        }

        // Shift incoming references that point at or beyond the edit.
        let referrers: Vec<(BlockId, u32)> =
            self.blocks[&id].referrers.iter().copied().collect();
        for (r_id, r_off) in referrers {
            let Some(reference) = self.blocks.get(&r_id).and_then(|b| b.get_reference(r_off))
            else {
                continue;
            };
            let mut base = reference.base;
            let mut ref_offset = reference.offset;
            if base >= offset {
                base += size;
            }
            if ref_offset >= offset as i32 {
                ref_offset += size as i32;
            }
            if base != reference.base || ref_offset != reference.offset {
                let new_ref = Reference::new(
                    reference.kind,
                    reference.size,
                    reference.referenced,
                    ref_offset,
                    base,
                );
                self.blocks.get_mut(&r_id).unwrap().references.insert(r_off, new_ref);
            }
        }
        Ok(())
    }

    /// Removes `size` bytes at `offset` from the block. Refuses if any
    /// label, reference, or referrer lands in the removed range; shifts
    /// everything beyond it left.
    pub fn remove_data(&mut self, id: BlockId, offset: u32, size: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = offset + size;
        let block = self
            .blocks
            .get(&id)
            .ok_or_else(|| Error::Consistency(format!("no block with id {id}")))?;
        if end > block.size {
            return Err(Error::Consistency(format!(
                "removal of [{}, {}) escapes block '{}' (size {})",
                offset, end, block.name, block.size
            )));
        }

        if block.labels.range(offset..end).next().is_some() {
            return Err(Error::Consistency(format!(
                "removed range carries labels in block '{}'",
                block.name
            )));
        }
        // A reference is in the way if its byte range intersects the removed
        // range.
        for (&o, r) in &block.references {
            if o < end && o + u32::from(r.size) > offset {
                return Err(Error::Consistency(format!(
                    "removed range carries references in block '{}'",
                    block.name
                )));
            }
        }
        for &(r_id, r_off) in &block.referrers {
            let Some(reference) = self.blocks.get(&r_id).and_then(|b| b.get_reference(r_off))
            else {
                continue;
            };
            if reference.base >= offset && reference.base < end {
                return Err(Error::Consistency(format!(
                    "removed range is referenced by ({r_id}, {r_off})"
                )));
            }
        }

        let block = self.blocks.get_mut(&id).unwrap();

        let shifted: Vec<(u32, Reference)> =
            block.references.range(end..).map(|(&o, &r)| (o, r)).collect();
        for (o, _) in &shifted {
            block.references.remove(o);
        }
        for &(o, r) in &shifted {
            block.references.insert(o - size, r);
        }

        let labels: Vec<(u32, Label)> =
            block.labels.range(end..).map(|(&o, l)| (o, l.clone())).collect();
        for (o, _) in &labels {
            block.labels.remove(o);
        }
        for (o, l) in labels {
            block.labels.insert(o - size, l);
        }

        block.source_ranges.remove_mapped_range(&DataRange::new(offset, size));

        if offset < block.data_size {
            let removed_data = (block.data_size - offset).min(size);
            let mut bytes = block.data.as_slice().to_vec();
            bytes.drain(offset as usize..(offset + removed_data) as usize);
            block.data_size -= removed_data;
            block.data =
                if bytes.is_empty() { BlockData::None } else { BlockData::Owned(bytes) };
        }
        block.size -= size;

        // The shifted references moved their source offsets; their targets'
        // referrer entries must follow.
        for (o, r) in shifted {
            let target = self.blocks.get_mut(&r.referenced).unwrap();
            target.referrers.remove(&(id, o));
            target.referrers.insert((id, o - size));
        }

        // Shift incoming references that point beyond the removed range.
        let referrers: Vec<(BlockId, u32)> =
            self.blocks[&id].referrers.iter().copied().collect();
        for (r_id, r_off) in referrers {
            let Some(reference) = self.blocks.get(&r_id).and_then(|b| b.get_reference(r_off))
            else {
                continue;
            };
            let mut base = reference.base;
            let mut ref_offset = reference.offset;
            if base >= end {
                base -= size;
            }
            if ref_offset >= end as i32 {
                ref_offset -= size as i32;
            }
            if base != reference.base || ref_offset != reference.offset {
                let new_ref = Reference::new(
                    reference.kind,
                    reference.size,
                    reference.referenced,
                    ref_offset,
                    base,
                );
                self.blocks.get_mut(&r_id).unwrap().references.insert(r_off, new_ref);
            }
        }
        Ok(())
    }

    /// Resizes a range of data in place: shrinking removes, growing inserts.
    pub fn insert_or_remove_data(
        &mut self,
        id: BlockId,
        offset: u32,
        current_size: u32,
        new_size: u32,
        always_allocate_data: bool,
    ) -> Result<()> {
        if new_size > current_size {
            self.insert_data(id, offset + current_size, new_size - current_size, always_allocate_data)
        } else if new_size < current_size {
            self.remove_data(id, offset + new_size, current_size - new_size)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for BlockGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockGraph")
            .field("sections", &self.sections.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// A placement of blocks into the relative address space: a non-overlapping
/// ordering where each block occupies at most one range.
#[derive(Default)]
pub struct BlockAddressSpace {
    space: AddressSpace<RelativeAddress, BlockId>,
    addrs: BTreeMap<BlockId, RelativeAddress>,
}

impl BlockAddressSpace {
    pub fn new() -> Self {
        BlockAddressSpace::default()
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    /// Iterates `(range, block id)` in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceRange, BlockId)> + '_ {
        self.space.iter().map(|(r, &id)| (r, id))
    }

    /// Adds a new block to the graph and places it at `addr`.
    pub fn add_block(
        &mut self,
        graph: &mut BlockGraph<'_>,
        block_type: BlockType,
        addr: RelativeAddress,
        size: u32,
        name: impl Into<String>,
    ) -> Result<BlockId> {
        let range = SourceRange::new(addr, size);
        if self.space.intersects(&range) {
            return Err(Error::Layout(format!("block collision at {addr} (size {size})")));
        }
        let id = graph.add_block(block_type, size, name);
        let inserted = self.space.insert(range, id);
        debug_assert!(inserted);
        self.addrs.insert(id, addr);
        graph.block_mut(id).unwrap().set_addr(addr);
        Ok(id)
    }

    /// Places an existing block at `addr`.
    pub fn insert_block(
        &mut self,
        graph: &mut BlockGraph<'_>,
        addr: RelativeAddress,
        id: BlockId,
    ) -> Result<()> {
        let block = graph
            .block_mut(id)
            .ok_or_else(|| Error::Consistency(format!("no block with id {id}")))?;
        let range = SourceRange::new(addr, block.size());
        if !self.space.insert(range, id) {
            return Err(Error::Layout(format!("block collision at {addr} (size {})", block.size())));
        }
        self.addrs.insert(id, addr);
        block.set_addr(addr);
        Ok(())
    }

    /// Removes a block's placement; the block itself stays in the graph.
    pub fn remove_block(&mut self, id: BlockId) -> bool {
        let Some(addr) = self.addrs.remove(&id) else {
            return false;
        };
        // The placed range size is not known from the id alone; scan the
        // containing entry.
        if let Some((range, _)) = self.space.find_containing(&SourceRange::new(addr, 1)) {
            self.space.remove(&range);
            return true;
        }
        false
    }

    pub fn contains_block(&self, id: BlockId) -> bool {
        self.addrs.contains_key(&id)
    }

    pub fn address_of(&self, id: BlockId) -> Option<RelativeAddress> {
        self.addrs.get(&id).copied()
    }

    pub fn get_block_by_address(&self, addr: RelativeAddress) -> Option<BlockId> {
        self.space
            .find_containing(&SourceRange::new(addr, 1))
            .map(|(_, &id)| id)
    }

    /// The block wholly containing `[addr, addr + size)`, if any.
    pub fn get_containing_block(&self, addr: RelativeAddress, size: u32) -> Option<BlockId> {
        self.space
            .find_containing(&SourceRange::new(addr, size))
            .map(|(_, &id)| id)
    }

    pub fn get_first_intersecting_block(
        &self,
        addr: RelativeAddress,
        size: u32,
    ) -> Option<BlockId> {
        self.space
            .find_first_intersection(&SourceRange::new(addr, size))
            .map(|(_, &id)| id)
    }

    pub fn get_intersecting_blocks(&self, addr: RelativeAddress, size: u32) -> Vec<BlockId> {
        self.space
            .find_intersecting(&SourceRange::new(addr, size))
            .map(|(_, &id)| id)
            .collect()
    }

    /// Merges every block intersecting `range` into one block covering all
    /// of them: labels, references, data and source ranges move into the
    /// merged block, external referrers are redirected, and the original
    /// blocks are removed from the graph. Returns the merged block, or
    /// `None` if nothing intersects `range`.
    pub fn merge_intersecting_blocks(
        &mut self,
        graph: &mut BlockGraph<'_>,
        range: SourceRange,
    ) -> Result<Option<BlockId>> {
        let intersecting: Vec<(SourceRange, BlockId)> = self
            .space
            .find_intersecting(&range)
            .map(|(r, &id)| (r, id))
            .collect();
        if intersecting.is_empty() {
            return Ok(None);
        }

        let start = intersecting[0].0.start().min(range.start());
        let end = intersecting
            .last()
            .unwrap()
            .0
            .end()
            .max(range.end());
        let merged_size = start.distance_to(end);

        let first_id = intersecting[0].1;
        let first = graph.block(first_id).unwrap();
        let block_type = first.block_type();
        let section = first.section();
        let alignment = first.alignment();

        // Union the attributes, dropping the post-merge markers.
        let mut attributes = BlockAttributes::empty();
        for &(_, id) in &intersecting {
            attributes |= graph.block(id).unwrap().attributes();
        }
        attributes &= !BlockAttributes::NON_MONOTONE;

        let merged_id = graph.add_block(block_type, merged_size, "merged");
        {
            let merged = graph.block_mut(merged_id).unwrap();
            merged.set_section(section);
            merged.set_alignment(alignment);
            merged.set_attributes(attributes);
        }

        // Materialize data up to the furthest initialized byte.
        let data_size = intersecting
            .iter()
            .map(|&(r, id)| {
                let b = graph.block(id).unwrap();
                if b.data_size() == 0 {
                    0
                } else {
                    range_offset(start, r.start()) + b.data_size()
                }
            })
            .max()
            .unwrap_or(0);
        if data_size > 0 {
            graph.block_mut(merged_id).unwrap().allocate_data(data_size);
        }

        for &(r, id) in &intersecting {
            let offset = range_offset(start, r.start());

            // Move data bytes.
            let data: Vec<u8> = graph.block(id).unwrap().data().to_vec();
            if !data.is_empty() {
                let merged = graph.block_mut(merged_id).unwrap();
                let buffer = merged.get_mutable_data();
                buffer[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
            }

            // Move labels and source ranges.
            let labels: Vec<(u32, Label)> = graph
                .block(id)
                .unwrap()
                .labels()
                .iter()
                .map(|(&o, l)| (o, l.clone()))
                .collect();
            let source_pairs: Vec<(DataRange, SourceRange)> = graph
                .block(id)
                .unwrap()
                .source_ranges()
                .range_pairs()
                .to_vec();
            {
                let merged = graph.block_mut(merged_id).unwrap();
                for (o, l) in labels {
                    merged.set_label(offset + o, l);
                }
                for (src, dst) in source_pairs {
                    merged
                        .source_ranges_mut()
                        .insert(DataRange::new(offset + src.start(), src.size()), dst);
                }
            }

            // Move outgoing references.
            let references: Vec<(u32, Reference)> = graph
                .block(id)
                .unwrap()
                .references()
                .iter()
                .map(|(&o, &r)| (o, r))
                .collect();
            for (o, _) in &references {
                graph.remove_reference(id, *o);
            }
            for (o, r) in references {
                // A self-reference follows the block into its new home.
                let r = if r.referenced() == id {
                    Reference::new(r.kind(), r.size(), merged_id, r.offset() + offset as i32, r.base() + offset)
                } else {
                    r
                };
                graph.set_reference(merged_id, offset + o, r)?;
            }

            // Redirect incoming references, then retire the old block.
            graph.transfer_referrers(id, merged_id, offset as i32)?;
            self.space.remove(&r);
            self.addrs.remove(&id);
            graph.remove_block(id)?;
        }

        let inserted = self.space.insert(SourceRange::new(start, merged_size), merged_id);
        debug_assert!(inserted);
        self.addrs.insert(merged_id, start);
        graph.block_mut(merged_id).unwrap().set_addr(start);
        Ok(Some(merged_id))
    }
}

fn range_offset(base: RelativeAddress, addr: RelativeAddress) -> u32 {
    base.distance_to(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_graph<'a>() -> (BlockGraph<'a>, BlockId, BlockId) {
        let mut graph = BlockGraph::new();
        let code = graph.add_block(BlockType::Code, 0x20, "code");
        let data = graph.add_block(BlockType::Data, 0x10, "data");
        (graph, code, data)
    }

    #[test]
    fn sections() {
        let mut graph = BlockGraph::new();
        let text = graph.add_section(".text", 0x6000_0020);
        let rdata = graph.add_section(".rdata", 0x4000_0040);
        assert_eq!(text, 0);
        assert_eq!(rdata, 1);
        assert_eq!(graph.find_section(".text").unwrap().id(), text);
        assert_eq!(graph.find_or_add_section(".rdata", 0), rdata);
        assert_eq!(graph.find_or_add_section(".data", 0xC000_0040), 2);
        assert!(graph.remove_section_by_id(1));
        assert!(!graph.remove_section_by_id(1));
        assert!(graph.find_section(".rdata").is_none());
    }

    #[test]
    fn references_keep_referrers_in_sync() {
        let (mut graph, code, data) = simple_graph();

        let r = Reference::direct(ReferenceType::Absolute, 4, data, 4);
        assert!(graph.set_reference(code, 8, r).unwrap());
        assert!(graph.block(data).unwrap().referrers().contains(&(code, 8)));

        // Replacing the reference with one to a new target unhooks the old
        // back-edge.
        let other = graph.add_block(BlockType::Data, 0x10, "other");
        let r2 = Reference::direct(ReferenceType::Absolute, 4, other, 0);
        assert!(!graph.set_reference(code, 8, r2).unwrap());
        assert!(!graph.block(data).unwrap().referrers().contains(&(code, 8)));
        assert!(graph.block(other).unwrap().referrers().contains(&(code, 8)));

        assert!(graph.remove_reference(code, 8));
        assert!(graph.block(other).unwrap().referrers().is_empty());
        assert!(!graph.remove_reference(code, 8));
    }

    #[test]
    fn set_reference_validates() {
        let (mut graph, code, data) = simple_graph();

        // Base must be strictly inside the target.
        let r = Reference::direct(ReferenceType::Absolute, 4, data, 0x10);
        assert!(graph.set_reference(code, 0, r).is_err());

        // Source bytes must fit in the source block.
        let r = Reference::direct(ReferenceType::Absolute, 4, data, 0);
        assert!(graph.set_reference(code, 0x1E, r).is_err());

        // Type/size combinations are constrained.
        assert!(!Reference::is_valid_type_size(ReferenceType::Absolute, 2));
        assert!(Reference::is_valid_type_size(ReferenceType::PcRelative, 2));
    }

    #[test]
    fn remove_block_requires_disconnection() {
        let (mut graph, code, data) = simple_graph();
        let r = Reference::direct(ReferenceType::Absolute, 4, data, 0);
        graph.set_reference(code, 0, r).unwrap();

        assert!(graph.remove_block(data).is_err());
        assert!(graph.remove_block(code).is_err());

        graph.remove_reference(code, 0);
        assert!(graph.remove_block(data).is_ok());
        assert!(graph.remove_block(code).is_ok());
        assert!(graph.is_empty());
    }

    #[test]
    fn transfer_referrers_shifts_offsets() {
        let (mut graph, code, data) = simple_graph();
        let other = graph.add_block(BlockType::Data, 0x40, "target");

        let r = Reference::direct(ReferenceType::Absolute, 4, data, 4);
        graph.set_reference(code, 0, r).unwrap();

        graph.transfer_referrers(data, other, 0x10).unwrap();
        let moved = graph.block(code).unwrap().get_reference(0).unwrap();
        assert_eq!(moved.referenced(), other);
        assert_eq!(moved.base(), 0x14);
        assert_eq!(moved.offset(), 0x14);
        assert!(graph.block(data).unwrap().referrers().is_empty());

        // A transfer that would escape the target fails atomically.
        assert!(graph.transfer_referrers(other, data, 0x20).is_err());
        assert_eq!(
            graph.block(code).unwrap().get_reference(0).unwrap().referenced(),
            other
        );
    }

    #[test]
    fn labels_merge_on_collision() {
        let (mut graph, code, _) = simple_graph();
        let block = graph.block_mut(code).unwrap();
        assert!(block.set_label(0, Label::new("a", LabelAttributes::CODE)));
        assert!(!block.set_label(0, Label::new("b", LabelAttributes::CALL_SITE)));
        let label = block.get_label(0).unwrap();
        assert_eq!(label.name(), "a, b");
        assert!(label.has_attributes(LabelAttributes::CODE | LabelAttributes::CALL_SITE));
        assert!(block.remove_label(0));
        assert!(!block.remove_label(0));
    }

    #[test]
    fn label_validity() {
        assert!(Label::new("t", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE).is_valid());
        assert!(!Label::new("t", LabelAttributes::JUMP_TABLE).is_valid());
        assert!(!Label::new("d", LabelAttributes::DEBUG_START).is_valid());
        assert!(Label::new("d", LabelAttributes::CODE | LabelAttributes::DEBUG_START).is_valid());
    }

    #[test]
    fn block_data_ownership() {
        let backing = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Data, 8, "d");
        let block = graph.block_mut(id).unwrap();

        block.set_data(&backing);
        assert!(!block.owns_data());
        assert_eq!(block.data(), &backing);

        // Mutation forces a copy; the backing buffer is untouched.
        block.get_mutable_data()[0] = 0xFF;
        assert!(block.owns_data());
        assert_eq!(backing[0], 1);
        assert_eq!(block.data()[0], 0xFF);

        block.resize_data(4);
        assert_eq!(block.data_size(), 4);
        block.resize_data(6);
        assert_eq!(block.data(), &[0xFF, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn insert_data_shifts_everything() {
        let (mut graph, code, data) = simple_graph();

        // code refers to data, and data back into code beyond the edit.
        graph
            .set_reference(code, 8, Reference::direct(ReferenceType::Absolute, 4, data, 4))
            .unwrap();
        graph
            .set_reference(data, 0, Reference::direct(ReferenceType::Absolute, 4, code, 0x10))
            .unwrap();
        {
            let block = graph.block_mut(code).unwrap();
            block.copy_data(&[0xAA; 0x20]);
            block.set_label(0x10, Label::new("mid", LabelAttributes::CODE));
            assert!(block
                .source_ranges_mut()
                .push(DataRange::new(0, 0x20), SourceRange::new(RelativeAddress(0x1000), 0x20)));
        }

        graph.insert_data(code, 4, 8, false).unwrap();

        let block = graph.block(code).unwrap();
        assert_eq!(block.size(), 0x28);
        assert_eq!(block.data_size(), 0x28);
        // The inserted window is zeroed.
        assert_eq!(&block.data()[4..12], &[0u8; 8]);
        // Own reference and label shifted.
        assert!(block.get_reference(16).is_some());
        assert!(block.get_label(0x18).is_some());
        // The incoming reference shifted too.
        let incoming = graph.block(data).unwrap().get_reference(0).unwrap();
        assert_eq!(incoming.base(), 0x18);
        // Source ranges were split around the hole.
        assert_eq!(block.source_ranges().range_pairs().len(), 2);
    }

    #[test]
    fn remove_data_refuses_occupied_ranges() {
        let (mut graph, code, data) = simple_graph();
        graph
            .set_reference(code, 8, Reference::direct(ReferenceType::Absolute, 4, data, 4))
            .unwrap();

        assert!(graph.remove_data(code, 8, 4).is_err());
        assert!(graph.remove_data(code, 6, 4).is_err());

        graph.remove_data(code, 0, 4).unwrap();
        let block = graph.block(code).unwrap();
        assert_eq!(block.size(), 0x1C);
        assert!(block.get_reference(4).is_some());
    }

    #[test]
    fn address_space_placement() {
        let mut graph = BlockGraph::new();
        let mut space = BlockAddressSpace::new();

        let a = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1000), 0x10, "a")
            .unwrap();
        let b = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1020), 0x10, "b")
            .unwrap();

        assert!(space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1008), 0x10, "bad")
            .is_err());

        assert_eq!(space.get_block_by_address(RelativeAddress(0x1004)), Some(a));
        assert_eq!(space.get_containing_block(RelativeAddress(0x1020), 0x10), Some(b));
        assert_eq!(space.get_containing_block(RelativeAddress(0x1028), 0x10), None);
        assert_eq!(space.address_of(b), Some(RelativeAddress(0x1020)));
        assert_eq!(graph.block(a).unwrap().addr(), RelativeAddress(0x1000));
        assert_eq!(
            space.get_intersecting_blocks(RelativeAddress(0x1000), 0x30),
            vec![a, b]
        );
    }

    #[test]
    fn merge_intersecting_blocks_merges_everything() {
        let mut graph = BlockGraph::new();
        let mut space = BlockAddressSpace::new();

        let a = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1000), 0x10, "a")
            .unwrap();
        let b = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1010), 0x10, "b")
            .unwrap();
        let c = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1030), 0x10, "c")
            .unwrap();
        let external = graph.add_block(BlockType::Code, 0x10, "ext");

        graph.block_mut(a).unwrap().copy_data(&[1; 0x10]);
        graph.block_mut(b).unwrap().copy_data(&[2; 0x10]);
        graph.block_mut(b).unwrap().set_label(0, Label::new("b", LabelAttributes::DATA));
        graph.block_mut(b).unwrap().set_attribute(BlockAttributes::SECTION_CONTRIB);
        graph
            .set_reference(external, 0, Reference::direct(ReferenceType::Absolute, 4, b, 4))
            .unwrap();

        let merged = space
            .merge_intersecting_blocks(&mut graph, SourceRange::new(RelativeAddress(0x1000), 0x40))
            .unwrap()
            .unwrap();

        assert!(graph.block(a).is_none());
        assert!(graph.block(b).is_none());
        assert!(graph.block(c).is_none());

        let block = graph.block(merged).unwrap();
        assert_eq!(block.size(), 0x40);
        assert_eq!(block.addr(), RelativeAddress(0x1000));
        assert!(block.attributes().contains(BlockAttributes::SECTION_CONTRIB));
        // b's label landed at its offset inside the merged block.
        assert!(block.get_label(0x10).is_some());
        // The external reference was redirected with a shifted base.
        let reference = graph.block(external).unwrap().get_reference(0).unwrap();
        assert_eq!(reference.referenced(), merged);
        assert_eq!(reference.base(), 0x14);
        // Data carried over at the right offsets; the tail stays implicit.
        assert_eq!(block.data()[0x00], 1);
        assert_eq!(block.data()[0x10], 2);
        assert_eq!(block.data_size(), 0x20);
    }
}
