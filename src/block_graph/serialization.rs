//! The block-graph stream format.
//!
//! A decomposed image can be cached inside its PDB as a named stream, which
//! lets later tools skip the expensive decomposition entirely. The stream
//! holds the sections, the blocks (properties, labels, references) and the
//! address-space placement; block data is stored inline only when the block
//! owns its bytes. Borrowed bytes are never serialized; on load such blocks
//! report [`Block::needs_data_rebind`](crate::block_graph::Block::needs_data_rebind)
//! and are re-bound against the image's backing buffer by the caller.
//!
//! All integers are little-endian. Strings are a `u32` length followed by
//! UTF-8 bytes.

use bitflags::bitflags;
use scroll::{Pread, Pwrite, LE};

use crate::address::RelativeAddress;
use crate::block_graph::{
    Block, BlockAddressSpace, BlockAttributes, BlockGraph, BlockId, BlockType, DataRange, Label,
    LabelAttributes, Reference, ReferenceType, SourceRange,
};
use crate::error::{Error, Result};

/// Version of the stream layout; bumped on any incompatible change.
pub const BLOCK_GRAPH_STREAM_VERSION: u32 = 2;

bitflags! {
    /// What the writer left out of a stream.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct SerializationAttributes: u32 {
        const OMIT_DATA = 1 << 0;
        const OMIT_STRINGS = 1 << 1;
        const OMIT_LABELS = 1 << 2;
    }
}

fn string_size(s: &str, omit: bool) -> usize {
    4 + if omit { 0 } else { s.len() }
}

fn measure(
    graph: &BlockGraph<'_>,
    address_space: &BlockAddressSpace,
    attributes: SerializationAttributes,
) -> usize {
    let omit_strings = attributes.contains(SerializationAttributes::OMIT_STRINGS);
    let omit_labels = attributes.contains(SerializationAttributes::OMIT_LABELS);
    let omit_data = attributes.contains(SerializationAttributes::OMIT_DATA);

    let mut size = 8; // version + attributes
    size += 4;
    for section in graph.sections() {
        size += 4 + string_size(section.name(), omit_strings) + 4;
    }

    size += 4;
    for block in graph.blocks() {
        size += 4 + 1 + 4 + 4; // id, type, size, alignment
        size += string_size(block.name(), omit_strings);
        size += 4 + 4 + 4; // section, attributes, data_size
        size += 1;
        if block.owns_data() && !omit_data {
            size += block.data().len();
        }
        if !omit_labels {
            size += 4;
            for label in block.labels().values() {
                size += 4 + string_size(label.name(), omit_strings) + 4;
            }
        }
        size += 4 + block.references().len() * 18;
    }

    size += 4 + address_space.len() * 8;
    size
}

struct Writer {
    buf: Vec<u8>,
    offset: usize,
}

impl Writer {
    fn u8(&mut self, v: u8) -> Result<()> {
        self.buf.gwrite_with(v, &mut self.offset, LE)?;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        self.buf.gwrite_with(v, &mut self.offset, LE)?;
        Ok(())
    }

    fn i32(&mut self, v: i32) -> Result<()> {
        self.buf.gwrite_with(v, &mut self.offset, LE)?;
        Ok(())
    }

    fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.buf.gwrite::<&[u8]>(v, &mut self.offset)?;
        Ok(())
    }

    fn string(&mut self, s: &str, omit: bool) -> Result<()> {
        if omit {
            self.u32(0)
        } else {
            self.u32(s.len() as u32)?;
            self.bytes(s.as_bytes())
        }
    }
}

/// Serializes `graph` and its placement into a fresh stream.
pub fn save(
    graph: &BlockGraph<'_>,
    address_space: &BlockAddressSpace,
    attributes: SerializationAttributes,
) -> Result<Vec<u8>> {
    let omit_strings = attributes.contains(SerializationAttributes::OMIT_STRINGS);

    let size = measure(graph, address_space, attributes);
    let mut w = Writer { buf: vec![0; size], offset: 0 };

    w.u32(BLOCK_GRAPH_STREAM_VERSION)?;
    w.u32(attributes.bits())?;

    w.u32(graph.sections().len() as u32)?;
    for section in graph.sections() {
        w.u32(section.id())?;
        w.string(section.name(), omit_strings)?;
        w.u32(section.characteristics())?;
    }

    w.u32(graph.len() as u32)?;
    for block in graph.blocks() {
        save_block(&mut w, block, attributes)?;
    }

    w.u32(address_space.len() as u32)?;
    for (range, id) in address_space.iter() {
        w.u32(id)?;
        w.u32(range.start().value())?;
    }

    debug_assert_eq!(w.offset, size);
    Ok(w.buf)
}

fn save_block(
    w: &mut Writer,
    block: &Block<'_>,
    attributes: SerializationAttributes,
) -> Result<()> {
    let omit_strings = attributes.contains(SerializationAttributes::OMIT_STRINGS);
    let omit_labels = attributes.contains(SerializationAttributes::OMIT_LABELS);
    let omit_data = attributes.contains(SerializationAttributes::OMIT_DATA);

    w.u32(block.id())?;
    w.u8(block.block_type() as u8)?;
    w.u32(block.size())?;
    w.u32(block.alignment())?;
    w.string(block.name(), omit_strings)?;
    w.u32(block.section())?;
    w.u32(block.attributes().bits())?;
    w.u32(block.data_size())?;

    if block.owns_data() && !omit_data {
        w.u8(1)?;
        w.bytes(block.data())?;
    } else {
        // Borrowed or omitted bytes are re-bound against the image later.
        w.u8(0)?;
    }

    if !omit_labels {
        w.u32(block.labels().len() as u32)?;
        for (&offset, label) in block.labels() {
            w.u32(offset)?;
            w.string(label.name(), omit_strings)?;
            w.u32(label.attributes().bits())?;
        }
    }

    w.u32(block.references().len() as u32)?;
    for (&offset, reference) in block.references() {
        w.u32(offset)?;
        w.u8(reference.kind() as u8)?;
        w.u8(reference.size())?;
        w.u32(reference.referenced())?;
        w.i32(reference.offset())?;
        w.u32(reference.base())?;
    }
    Ok(())
}

struct Reader<'b> {
    buf: &'b [u8],
    offset: usize,
}

impl<'b> Reader<'b> {
    fn u8(&mut self) -> Result<u8> {
        Ok(self.buf.gread_with(&mut self.offset, LE)?)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(self.buf.gread_with(&mut self.offset, LE)?)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.buf.gread_with(&mut self.offset, LE)?)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        if self.offset + len > self.buf.len() {
            return Err(Error::Serialization("string runs past end of stream".into()));
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Serialization("string is not valid UTF-8".into()))
    }
}

/// The result of loading a stream. Blocks whose data was not inlined carry
/// a `data_size` but no bytes until the caller re-binds them.
pub struct LoadedBlockGraph<'a> {
    pub graph: BlockGraph<'a>,
    pub address_space: BlockAddressSpace,
    pub attributes: SerializationAttributes,
}

/// Deserializes a stream produced by [`save`].
pub fn load<'a>(bytes: &[u8]) -> Result<LoadedBlockGraph<'a>> {
    let mut r = Reader { buf: bytes, offset: 0 };

    let version = r.u32()?;
    if version != BLOCK_GRAPH_STREAM_VERSION {
        return Err(Error::Serialization(format!(
            "block-graph stream version {version} (expected {BLOCK_GRAPH_STREAM_VERSION})"
        )));
    }
    let attributes = SerializationAttributes::from_bits_truncate(r.u32()?);
    let omit_labels = attributes.contains(SerializationAttributes::OMIT_LABELS);

    let mut graph = BlockGraph::new();

    let section_count = r.u32()?;
    for _ in 0..section_count {
        let id = r.u32()?;
        let name = r.string()?;
        let characteristics = r.u32()?;
        let actual = graph.add_section(name, characteristics);
        if actual != id {
            return Err(Error::Serialization(format!(
                "non-contiguous section id {id} in stream"
            )));
        }
    }

    // References can point forward, so they are applied after all blocks
    // exist.
    let mut pending_references: Vec<(BlockId, u32, Reference)> = Vec::new();

    let block_count = r.u32()?;
    for _ in 0..block_count {
        let id = r.u32()?;
        let block_type = BlockType::from_u8(r.u8()?)
            .ok_or_else(|| Error::Serialization("invalid block type".into()))?;
        let size = r.u32()?;
        let alignment = r.u32()?;
        let name = r.string()?;
        let section = r.u32()?;
        let block_attributes = BlockAttributes::from_bits_truncate(r.u32()?);
        let data_size = r.u32()?;
        let has_inline_data = r.u8()? != 0;

        graph.add_block_with_id(id, block_type, size, name)?;
        let block = graph.block_mut(id).unwrap();
        if alignment.is_power_of_two() {
            block.set_alignment(alignment);
        }
        block.set_section(section);
        block.set_attributes(block_attributes);

        if has_inline_data {
            if data_size > size {
                return Err(Error::Serialization(format!(
                    "block {id} carries more data than its size"
                )));
            }
            let start = r.offset;
            if start + data_size as usize > r.buf.len() {
                return Err(Error::Serialization("block data runs past end of stream".into()));
            }
            block.copy_data(&r.buf[start..start + data_size as usize]);
            r.offset += data_size as usize;
        } else {
            block.expect_data_size(data_size);
        }

        if !omit_labels {
            let label_count = r.u32()?;
            for _ in 0..label_count {
                let offset = r.u32()?;
                let name = r.string()?;
                let label_attributes = LabelAttributes::from_bits_truncate(r.u32()?);
                graph
                    .block_mut(id)
                    .unwrap()
                    .set_label(offset, Label::new(name, label_attributes));
            }
        }

        let reference_count = r.u32()?;
        for _ in 0..reference_count {
            let offset = r.u32()?;
            let kind = ReferenceType::from_u8(r.u8()?)
                .ok_or_else(|| Error::Serialization("invalid reference type".into()))?;
            let ref_size = r.u8()?;
            let referenced = r.u32()?;
            let ref_offset = r.i32()?;
            let base = r.u32()?;
            if !Reference::is_valid_type_size(kind, ref_size) {
                return Err(Error::Serialization("invalid reference type/size".into()));
            }
            pending_references
                .push((id, offset, Reference::new(kind, ref_size, referenced, ref_offset, base)));
        }
    }

    for (src, offset, reference) in pending_references {
        graph.set_reference(src, offset, reference)?;
    }

    let mut address_space = BlockAddressSpace::new();
    let placement_count = r.u32()?;
    for _ in 0..placement_count {
        let id = r.u32()?;
        let rva = RelativeAddress(r.u32()?);
        address_space.insert_block(&mut graph, rva, id).map_err(|e| {
            Error::Serialization(format!("block placement failed on load: {e}"))
        })?;
        // The stream does not carry source ranges; a placed block came
        // verbatim from the image bytes it sits on.
        let block = graph.block_mut(id).unwrap();
        let block_size = block.size();
        if block.source_ranges().is_empty() && block_size > 0 {
            block
                .source_ranges_mut()
                .push(DataRange::new(0, block_size), SourceRange::new(rva, block_size));
        }
    }

    Ok(LoadedBlockGraph { graph, address_space, attributes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_graph<'a>() -> (BlockGraph<'a>, BlockAddressSpace) {
        let mut graph = BlockGraph::new();
        let mut space = BlockAddressSpace::new();
        graph.add_section(".text", 0x6000_0020);
        graph.add_section(".data", 0xC000_0040);

        let code = space
            .add_block(&mut graph, BlockType::Code, RelativeAddress(0x1000), 8, "f")
            .unwrap();
        let data = space
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x2000), 8, "d")
            .unwrap();
        {
            let block = graph.block_mut(code).unwrap();
            block.set_section(0);
            block.copy_data(&[0x55, 0x8B, 0xEC, 0x5D, 0xC3, 0xCC, 0xCC, 0xCC]);
            block.set_label(0, Label::new("f", LabelAttributes::CODE));
        }
        {
            let block = graph.block_mut(data).unwrap();
            block.set_section(1);
            block.set_alignment(4);
            block.copy_data(&[0; 8]);
        }
        graph
            .set_reference(code, 1, Reference::direct(ReferenceType::Absolute, 4, data, 4))
            .unwrap();
        (graph, space)
    }

    #[test]
    fn round_trip() {
        let (graph, space) = build_graph();
        let stream = save(&graph, &space, SerializationAttributes::empty()).unwrap();
        let loaded = load(&stream).unwrap();

        assert_eq!(loaded.graph.sections().len(), 2);
        assert_eq!(loaded.graph.len(), 2);
        assert_eq!(loaded.address_space.len(), 2);

        let code = loaded.graph.blocks().find(|b| b.name() == "f").unwrap();
        assert_eq!(code.block_type(), BlockType::Code);
        assert_eq!(code.size(), 8);
        assert_eq!(code.data()[0], 0x55);
        assert!(code.get_label(0).is_some());
        let reference = code.get_reference(1).unwrap();
        assert_eq!(reference.base(), 4);

        let data = loaded.graph.blocks().find(|b| b.name() == "d").unwrap();
        assert_eq!(data.alignment(), 4);
        assert!(data.referrers().contains(&(code.id(), 1)));

        // Source ranges were reconstituted from the placement.
        assert_eq!(code.source_ranges().range_pairs().len(), 1);
        assert_eq!(
            code.source_ranges().range_pairs()[0].1.start(),
            RelativeAddress(0x1000)
        );
    }

    #[test]
    fn omit_data_leaves_blocks_unbound() {
        let (graph, space) = build_graph();
        let stream = save(&graph, &space, SerializationAttributes::OMIT_DATA).unwrap();
        let loaded = load(&stream).unwrap();

        let code = loaded.graph.blocks().find(|b| b.name() == "f").unwrap();
        assert!(code.needs_data_rebind());
        assert_eq!(code.data_size(), 8);
        assert!(code.data().is_empty());
    }

    #[test]
    fn omit_labels_and_strings() {
        let (graph, space) = build_graph();
        let attributes =
            SerializationAttributes::OMIT_LABELS | SerializationAttributes::OMIT_STRINGS;
        let stream = save(&graph, &space, attributes).unwrap();
        let loaded = load(&stream).unwrap();
        assert_eq!(loaded.attributes, attributes);

        let code = loaded.graph.block(0).unwrap();
        assert!(code.labels().is_empty());
        assert!(code.name().is_empty());
        // References survive regardless.
        assert!(code.get_reference(1).is_some());
    }

    #[test]
    fn rejects_version_mismatch() {
        let (graph, space) = build_graph();
        let mut stream = save(&graph, &space, SerializationAttributes::empty()).unwrap();
        stream[0] = 0xFF;
        assert!(matches!(load(&stream), Err(Error::Serialization(_))));
    }

    #[test]
    fn rejects_truncated_streams() {
        let (graph, space) = build_graph();
        let stream = save(&graph, &space, SerializationAttributes::empty()).unwrap();
        assert!(load(&stream[..stream.len() - 6]).is_err());
    }
}
