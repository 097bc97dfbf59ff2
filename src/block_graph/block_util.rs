//! Small predicates over blocks shared by the decomposers.

use crate::block_graph::{Block, BlockAttributes, BlockType, SourceRange};

/// True iff the code block can be safely decomposed into basic blocks.
///
/// A block emitted by this toolchain is whitelisted outright; otherwise any
/// attribute that marks the block as inferred, hand-written, or previously
/// mis-disassembled makes it unsafe.
pub fn code_block_attributes_are_basic_block_safe(block: &Block<'_>) -> bool {
    debug_assert_eq!(block.block_type(), BlockType::Code);

    if block.attributes().contains(BlockAttributes::BUILT_BY_SYZYGY) {
        return true;
    }

    const INVALID_ATTRIBUTES: BlockAttributes = BlockAttributes::GAP_BLOCK
        .union(BlockAttributes::PADDING_BLOCK)
        .union(BlockAttributes::HAS_INLINE_ASSEMBLY)
        .union(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER)
        .union(BlockAttributes::ERRORED_DISASSEMBLY)
        .union(BlockAttributes::HAS_EXCEPTION_HANDLING)
        .union(BlockAttributes::DISASSEMBLED_PAST_END);

    !block.attributes().intersects(INVALID_ATTRIBUTES)
}

/// If `data` consists of one repeated byte, returns it.
pub fn repeated_value(data: &[u8]) -> Option<u8> {
    let (&first, rest) = data.split_first()?;
    rest.iter().all(|&b| b == first).then_some(first)
}

/// Reconstitutes a single contiguous source range from a sorted list of
/// per-element source ranges, or `None` if they do not join up.
pub fn combine_source_ranges(ranges: &mut Vec<SourceRange>) -> Option<SourceRange> {
    ranges.retain(|r| !r.is_empty());
    if ranges.is_empty() {
        return None;
    }
    ranges.sort_by(|a, b| a.start().cmp(&b.start()).then(a.size().cmp(&b.size())));

    let mut size = ranges[0].size();
    for window in ranges.windows(2) {
        if window[0].end() != window[1].start() {
            return None;
        }
        size += window[1].size();
    }
    Some(SourceRange::new(ranges[0].start(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RelativeAddress;
    use crate::block_graph::BlockGraph;

    #[test]
    fn basic_block_safety() {
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 16, "f");
        assert!(code_block_attributes_are_basic_block_safe(graph.block(id).unwrap()));

        graph.block_mut(id).unwrap().set_attribute(BlockAttributes::HAS_INLINE_ASSEMBLY);
        assert!(!code_block_attributes_are_basic_block_safe(graph.block(id).unwrap()));

        // The toolchain whitelist wins over everything else.
        graph.block_mut(id).unwrap().set_attribute(BlockAttributes::BUILT_BY_SYZYGY);
        assert!(code_block_attributes_are_basic_block_safe(graph.block(id).unwrap()));
    }

    #[test]
    fn repeated_values() {
        assert_eq!(repeated_value(&[0xCC, 0xCC, 0xCC]), Some(0xCC));
        assert_eq!(repeated_value(&[0xCC, 0xCD]), None);
        assert_eq!(repeated_value(&[]), None);
        assert_eq!(repeated_value(&[7]), Some(7));
    }

    #[test]
    fn combining_source_ranges() {
        let mut ranges = vec![
            SourceRange::new(RelativeAddress(0x1004), 4),
            SourceRange::new(RelativeAddress(0x1000), 4),
            SourceRange::new(RelativeAddress(0x1008), 8),
        ];
        let combined = combine_source_ranges(&mut ranges).unwrap();
        assert_eq!(combined.start(), RelativeAddress(0x1000));
        assert_eq!(combined.size(), 16);

        let mut gappy = vec![
            SourceRange::new(RelativeAddress(0x1000), 4),
            SourceRange::new(RelativeAddress(0x1008), 4),
        ];
        assert!(combine_source_ranges(&mut gappy).is_none());
    }
}
