//! Transform interfaces and the drivers that apply them.
//!
//! Three granularities, each a pure interface: whole-graph transforms,
//! image-layout transforms (contents-only edits of placed blocks), and
//! basic-block transforms applied to one decomposed code block at a time.
//! The drivers verify the post-conditions the interfaces promise, so a
//! misbehaving transform is caught at its boundary instead of corrupting
//! the image further downstream.

use log::{error, warn};

use crate::block_graph::basic_block::BasicBlockSubGraph;
use crate::block_graph::basic_block_decomposer::BasicBlockDecomposer;
use crate::block_graph::block_builder::BlockBuilder;
use crate::block_graph::block_util::code_block_attributes_are_basic_block_safe;
use crate::block_graph::{BlockAttributes, BlockGraph, BlockId, BlockType};
use crate::error::{Error, Result};
use crate::pe::image_layout::ImageLayout;

/// A transform over a whole block graph. It may do anything to the graph
/// except invalidate the header block.
pub trait BlockGraphTransform {
    fn name(&self) -> &str;

    fn transform_block_graph(
        &mut self,
        graph: &mut BlockGraph<'_>,
        header_block: BlockId,
    ) -> Result<()>;
}

/// A transform over a laid-out image. It may only modify the contents of
/// existing blocks: no adding, removing, resizing or reordering of blocks
/// or sections.
pub trait ImageLayoutTransform {
    fn name(&self) -> &str;

    fn transform_image_layout(
        &mut self,
        graph: &mut BlockGraph<'_>,
        image_layout: &ImageLayout,
    ) -> Result<()>;
}

/// A transform over the basic-block decomposition of a single code block.
pub trait BasicBlockSubGraphTransform {
    fn name(&self) -> &str;

    fn transform_basic_block_subgraph(
        &mut self,
        graph: &mut BlockGraph<'_>,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<()>;
}

/// Applies a whole-graph transform and verifies that the header block
/// survived it.
pub fn apply_block_graph_transform(
    transform: &mut dyn BlockGraphTransform,
    graph: &mut BlockGraph<'_>,
    header_block: BlockId,
) -> Result<()> {
    debug_assert!(!transform.name().is_empty());

    transform.transform_block_graph(graph, header_block).map_err(|e| {
        error!("transform \"{}\" failed: {}", transform.name(), e);
        e
    })?;

    if graph.block(header_block).is_none() {
        return Err(Error::Transform(format!(
            "header block not found after \"{}\" transform",
            transform.name()
        )));
    }
    Ok(())
}

pub fn apply_block_graph_transforms(
    transforms: &mut [&mut dyn BlockGraphTransform],
    graph: &mut BlockGraph<'_>,
    header_block: BlockId,
) -> Result<()> {
    for transform in transforms {
        apply_block_graph_transform(&mut **transform, graph, header_block)?;
    }
    Ok(())
}

/// Applies a layout transform and verifies it changed neither the block
/// population nor any block's size.
pub fn apply_image_layout_transform(
    transform: &mut dyn ImageLayoutTransform,
    graph: &mut BlockGraph<'_>,
    image_layout: &ImageLayout,
) -> Result<()> {
    debug_assert!(!transform.name().is_empty());

    let block_count = graph.len();
    let block_sizes: Vec<(BlockId, u32)> = image_layout
        .blocks
        .iter()
        .map(|(range, id)| (id, range.size()))
        .collect();

    transform.transform_image_layout(graph, image_layout).map_err(|e| {
        error!("layout transform \"{}\" failed: {}", transform.name(), e);
        e
    })?;

    if graph.len() != block_count {
        return Err(Error::Transform(format!(
            "layout transform \"{}\" changed the number of blocks",
            transform.name()
        )));
    }
    for (id, size) in block_sizes {
        let ok = graph.block(id).is_some_and(|b| b.size() == size);
        if !ok {
            return Err(Error::Transform(format!(
                "layout transform \"{}\" resized or removed block {}",
                transform.name(),
                id
            )));
        }
    }
    Ok(())
}

pub fn apply_image_layout_transforms(
    transforms: &mut [&mut dyn ImageLayoutTransform],
    graph: &mut BlockGraph<'_>,
    image_layout: &ImageLayout,
) -> Result<()> {
    for transform in transforms {
        apply_image_layout_transform(&mut **transform, graph, image_layout)?;
    }
    Ok(())
}

/// Decomposes `block`, applies the transform, and re-emits the result. If
/// decomposition fails because of instructions the decoder does not
/// understand, the block is marked [`BlockAttributes::UNSUPPORTED_INSTRUCTIONS`]
/// and skipped rather than failing the pass; any new blocks are returned.
pub fn apply_basic_block_subgraph_transform(
    transform: &mut dyn BasicBlockSubGraphTransform,
    graph: &mut BlockGraph<'_>,
    block: BlockId,
) -> Result<Vec<BlockId>> {
    apply_basic_block_subgraph_transforms(&mut [transform], graph, block)
}

/// As [`apply_basic_block_subgraph_transform`], with a single decomposition
/// shared by a sequence of transforms.
pub fn apply_basic_block_subgraph_transforms(
    transforms: &mut [&mut dyn BasicBlockSubGraphTransform],
    graph: &mut BlockGraph<'_>,
    block: BlockId,
) -> Result<Vec<BlockId>> {
    let mut decomposer = BasicBlockDecomposer::new(graph, block)?;
    let mut subgraph = match decomposer.decompose() {
        Ok(subgraph) => subgraph,
        Err(e) => {
            if decomposer.contains_unsupported_instructions() {
                warn!(
                    "block {} contains unsupported instructions; skipping transform",
                    block
                );
                graph
                    .block_mut(block)
                    .unwrap()
                    .set_attribute(BlockAttributes::UNSUPPORTED_INSTRUCTIONS);
                return Ok(Vec::new());
            }
            return Err(e);
        }
    };

    for transform in transforms {
        debug_assert!(!transform.name().is_empty());
        transform
            .transform_basic_block_subgraph(graph, &mut subgraph)
            .map_err(|e| {
                error!("basic-block transform \"{}\" failed: {}", transform.name(), e);
                e
            })?;
    }

    let mut builder = BlockBuilder::new();
    builder.merge(graph, &mut subgraph)?;
    Ok(builder.new_blocks().to_vec())
}

/// Applies a basic-block transform to every decomposable code block of the
/// graph, in block-id order. Blocks whose attributes make them unsafe are
/// skipped silently; blocks that turn out to hold unsupported instructions
/// are marked and skipped.
pub fn apply_basic_block_subgraph_transform_to_all(
    transform: &mut dyn BasicBlockSubGraphTransform,
    graph: &mut BlockGraph<'_>,
) -> Result<Vec<BlockId>> {
    let candidates: Vec<BlockId> = graph
        .blocks()
        .filter(|b| {
            b.block_type() == BlockType::Code && code_block_attributes_are_basic_block_safe(b)
        })
        .map(|b| b.id())
        .collect();

    let mut new_blocks = Vec::new();
    for block in candidates {
        new_blocks.extend(apply_basic_block_subgraph_transform(transform, graph, block)?);
    }
    Ok(new_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::{Label, LabelAttributes, Reference, ReferenceType};

    struct Renamer;

    impl BlockGraphTransform for Renamer {
        fn name(&self) -> &str {
            "renamer"
        }

        fn transform_block_graph(
            &mut self,
            graph: &mut BlockGraph<'_>,
            _header_block: BlockId,
        ) -> Result<()> {
            for block in graph.blocks_mut() {
                let name = format!("renamed_{}", block.name());
                block.set_name(name);
            }
            Ok(())
        }
    }

    struct HeaderKiller;

    impl BlockGraphTransform for HeaderKiller {
        fn name(&self) -> &str {
            "header_killer"
        }

        fn transform_block_graph(
            &mut self,
            graph: &mut BlockGraph<'_>,
            header_block: BlockId,
        ) -> Result<()> {
            graph.remove_block(header_block)
        }
    }

    #[test]
    fn block_graph_transform_post_condition() {
        let mut graph = BlockGraph::new();
        let header = graph.add_block(BlockType::Data, 0x400, "headers");

        apply_block_graph_transform(&mut Renamer, &mut graph, header).unwrap();
        assert_eq!(graph.block(header).unwrap().name(), "renamed_headers");

        assert!(apply_block_graph_transform(&mut HeaderKiller, &mut graph, header).is_err());
    }

    struct Resizer;

    impl ImageLayoutTransform for Resizer {
        fn name(&self) -> &str {
            "resizer"
        }

        fn transform_image_layout(
            &mut self,
            graph: &mut BlockGraph<'_>,
            image_layout: &ImageLayout,
        ) -> Result<()> {
            let (_, id) = image_layout.blocks.iter().next().unwrap();
            graph.block_mut(id).unwrap().set_size(1);
            Ok(())
        }
    }

    #[test]
    fn image_layout_transform_rejects_resizes() {
        use crate::address::RelativeAddress;

        let mut graph = BlockGraph::new();
        let mut layout = ImageLayout::new();
        layout
            .blocks
            .add_block(&mut graph, BlockType::Data, RelativeAddress(0x1000), 0x10, "d")
            .unwrap();

        assert!(apply_image_layout_transform(&mut Resizer, &mut graph, &layout).is_err());
    }

    // Flips a conditional entry block's successors, which forces the
    // builder to re-synthesize branches.
    struct Identity;

    impl BasicBlockSubGraphTransform for Identity {
        fn name(&self) -> &str {
            "identity"
        }

        fn transform_basic_block_subgraph(
            &mut self,
            _graph: &mut BlockGraph<'_>,
            _subgraph: &mut BasicBlockSubGraph,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn basic_block_transform_round_trip() {
        let mut graph = BlockGraph::new();
        let bytes = [0x55, 0x8B, 0xEC, 0x5D, 0xC3]; // push; mov; pop; ret
        let func = graph.add_block(BlockType::Code, bytes.len() as u32, "f");
        graph.block_mut(func).unwrap().copy_data(&bytes);
        graph
            .block_mut(func)
            .unwrap()
            .set_label(0, Label::new("f", LabelAttributes::CODE));
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();

        let new_blocks =
            apply_basic_block_subgraph_transform(&mut Identity, &mut graph, func).unwrap();
        assert_eq!(new_blocks.len(), 1);

        // The original is gone and the caller follows the replacement.
        assert!(graph.block(func).is_none());
        let replacement = graph.block(new_blocks[0]).unwrap();
        assert_eq!(replacement.size(), bytes.len() as u32);
        assert_eq!(replacement.data(), &bytes);
        let re = graph.block(caller).unwrap().get_reference(0).unwrap();
        assert_eq!(re.referenced(), new_blocks[0]);
    }

    #[test]
    fn unsupported_blocks_are_marked_and_skipped() {
        let mut graph = BlockGraph::new();
        let bytes = [0x0F, 0x04, 0xC3]; // undefined opcode
        let func = graph.add_block(BlockType::Code, bytes.len() as u32, "weird");
        graph.block_mut(func).unwrap().copy_data(&bytes);
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();

        let new_blocks =
            apply_basic_block_subgraph_transform(&mut Identity, &mut graph, func).unwrap();
        assert!(new_blocks.is_empty());
        assert!(graph
            .block(func)
            .unwrap()
            .attributes()
            .contains(BlockAttributes::UNSUPPORTED_INSTRUCTIONS));
    }
}
