//! Emits concrete blocks from a (possibly transformed) basic-block
//! subgraph.
//!
//! Each block description becomes one new block: instruction and data bytes
//! are copied, successors are synthesized as branch instructions (or elided
//! when control falls through to the next basic block in the order), and the
//! branch encodings are chosen by a promote-only fixpoint — every branch
//! starts short and grows to its rel32 form only when its displacement
//! demands it, so the loop converges in at most one promotion per branch.
//! Once offsets are final, references are materialized in the enclosing
//! graph, external referrers of the original block are redirected, labels
//! are replayed, and the original block is retired.

use std::collections::BTreeMap;

use log::warn;

use crate::assembler::{self, BranchKind};
use crate::block_graph::basic_block::{
    BasicBlockId, BasicBlockKind, BasicBlockReference, BasicBlockSubGraph, Condition,
    ReferenceTarget, Successor,
};
use crate::block_graph::{
    BlockGraph, BlockId, DataRange, Label, Reference, ReferenceType, SourceRange,
};
use crate::error::{Error, Result};

/// Merges basic-block subgraphs back into a block graph.
#[derive(Default)]
pub struct BlockBuilder {
    new_blocks: Vec<BlockId>,
}

// One layout element of a block under construction.
enum Item {
    // Instruction or data bytes; fixed size.
    Bytes {
        bb: BasicBlockId,
        // Index into the basic block's instruction list; None for the byte
        // run of a data or padding basic block.
        instruction: Option<usize>,
        size: u32,
    },
    // A synthesized branch; its size is subject to the fixpoint.
    Branch {
        bb: BasicBlockId,
        successor: usize,
        kind: BranchKind,
        // A same-description basic block the displacement is measured to,
        // or None when the target lives outside this description (always
        // encoded long).
        local_target: Option<BasicBlockId>,
        long: bool,
    },
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder::default()
    }

    /// The blocks created by the merges performed so far.
    pub fn new_blocks(&self) -> &[BlockId] {
        &self.new_blocks
    }

    /// Generates a block for every description in `subgraph`, transfers all
    /// references to the new blocks, and retires the original block.
    pub fn merge(
        &mut self,
        graph: &mut BlockGraph<'_>,
        subgraph: &mut BasicBlockSubGraph,
    ) -> Result<()> {
        // Where every basic block, instruction and successor slot ended up.
        let mut bb_locations: BTreeMap<BasicBlockId, (BlockId, u32)> = BTreeMap::new();
        let mut instruction_locations: BTreeMap<(BasicBlockId, usize), (BlockId, u32)> =
            BTreeMap::new();
        // (block, slot offset, emitted reference width) per successor.
        let mut successor_slots: BTreeMap<(BasicBlockId, usize), (BlockId, u32, u8)> =
            BTreeMap::new();

        let mut generated = Vec::new();
        for description in subgraph.block_descriptions() {
            if description.basic_block_order.is_empty() {
                continue;
            }

            let items = build_items(subgraph, &description.basic_block_order)?;
            let (offsets, bb_offsets, total_size) =
                solve_layout(&items, &description.basic_block_order)?;

            let block_id = graph.add_block(description.block_type, total_size, &*description.name);
            generated.push(block_id);
            {
                let block = graph.block_mut(block_id).unwrap();
                block.set_section(description.section);
                block.set_alignment(description.alignment.max(1));
                block.set_attributes(description.attributes);
                block.allocate_data(total_size);
            }

            for (&bb, &offset) in &bb_offsets {
                bb_locations.insert(bb, (block_id, offset));
                // Replay the basic block's label at its final position.
                if let Some(label) = subgraph.basic_block(bb).unwrap().label() {
                    graph.block_mut(block_id).unwrap().set_label(offset, label.clone());
                }
            }

            emit_items(
                graph,
                subgraph,
                block_id,
                &items,
                &offsets,
                &bb_offsets,
                &mut instruction_locations,
                &mut successor_slots,
            )?;
        }

        // With every element placed, resolve and set the references.
        transfer_references(
            graph,
            subgraph,
            &bb_locations,
            &instruction_locations,
            &successor_slots,
        )?;
        update_referrers(graph, subgraph, &bb_locations)?;
        remove_original_block(graph, subgraph)?;

        self.new_blocks.extend(generated);
        Ok(())
    }
}

fn branch_kind_for(condition: Condition) -> Result<BranchKind> {
    if let Some(cc) = condition.condition_code() {
        return Ok(BranchKind::Jcc(cc));
    }
    match condition {
        Condition::True => Ok(BranchKind::Jmp),
        Condition::CounterIsZero => Ok(BranchKind::Jecxz),
        Condition::Loop => Ok(BranchKind::Loop),
        Condition::LoopEqual => Ok(BranchKind::Loope),
        Condition::LoopNotEqual => Ok(BranchKind::Loopne),
        _ => Err(Error::Layout(format!(
            "inverse loop condition {condition:?} cannot be synthesized"
        ))),
    }
}

// Lays out the description's basic blocks as a flat item list, deciding
// which successors need a branch at all.
fn build_items(subgraph: &BasicBlockSubGraph, order: &[BasicBlockId]) -> Result<Vec<Item>> {
    let mut items = Vec::new();

    for (position, &bb_id) in order.iter().enumerate() {
        let bb = subgraph
            .basic_block(bb_id)
            .ok_or_else(|| Error::Transform(format!("description names unknown basic block {bb_id}")))?;
        let next_bb = order.get(position + 1).copied();

        match bb.kind() {
            BasicBlockKind::Data(data) | BasicBlockKind::Padding(data) => {
                items.push(Item::Bytes { bb: bb_id, instruction: None, size: data.size() });
            }
            BasicBlockKind::Code(code) => {
                for (i, instruction) in code.instructions.iter().enumerate() {
                    items.push(Item::Bytes { bb: bb_id, instruction: Some(i), size: instruction.size() });
                }

                debug_assert!(code.successors.len() <= 2);
                let mut branch_already_generated = false;
                for (i, successor) in code.successors.iter().enumerate() {
                    if successor_is_elided(successor, next_bb) {
                        continue;
                    }
                    // With both successors manifest, the second one covers
                    // the branch-not-taken arc and degenerates to an
                    // unconditional jump.
                    let condition = if i == 1 && branch_already_generated {
                        Condition::True
                    } else {
                        successor.condition()
                    };
                    let kind = branch_kind_for(condition)?;

                    let local_target = match successor_target_bb(successor) {
                        Some(target) if order.contains(&target) => Some(target),
                        _ => None,
                    };
                    // A target outside this description is out of reach of
                    // the fixpoint; only the long form can span it.
                    let long = local_target.is_none();
                    if long && !kind.has_long_form() {
                        return Err(Error::Layout(format!(
                            "{kind:?} successor cannot reach outside its block"
                        )));
                    }

                    items.push(Item::Branch { bb: bb_id, successor: i, kind, local_target, long });
                    branch_already_generated = true;
                }
            }
        }
    }
    Ok(items)
}

fn successor_is_elided(successor: &Successor, next_bb: Option<BasicBlockId>) -> bool {
    match (successor_target_bb(successor), next_bb) {
        (Some(target), Some(next)) => target == next,
        _ => false,
    }
}

fn successor_target_bb(successor: &Successor) -> Option<BasicBlockId> {
    successor.reference().and_then(BasicBlockReference::basic_block)
}

// Computes final offsets for every item, promoting short branches to their
// long forms until every displacement is representable.
fn solve_layout(
    items: &[Item],
    order: &[BasicBlockId],
) -> Result<(Vec<u32>, BTreeMap<BasicBlockId, u32>, u32)> {
    // First item index per basic block; blocks with no items start where
    // the next item would.
    let mut first_item: BTreeMap<BasicBlockId, usize> = BTreeMap::new();
    {
        let mut index = 0;
        for &bb in order {
            first_item.insert(bb, index);
            while index < items.len() && item_bb(&items[index]) == bb {
                index += 1;
            }
        }
    }

    let branch_count = items
        .iter()
        .filter(|i| matches!(i, Item::Branch { .. }))
        .count();
    let mut long_flags: Vec<bool> = items
        .iter()
        .map(|i| matches!(i, Item::Branch { long: true, .. }))
        .collect();

    let mut iterations = 0;
    loop {
        iterations += 1;
        if iterations > 2 * branch_count + 1 {
            return Err(Error::Layout(
                "branch layout failed to reach a fixpoint".to_string(),
            ));
        }

        // Current offsets under the current short/long choices.
        let mut offsets = Vec::with_capacity(items.len());
        let mut cursor = 0u32;
        for (i, item) in items.iter().enumerate() {
            offsets.push(cursor);
            cursor += match item {
                Item::Bytes { size, .. } => *size,
                Item::Branch { kind, .. } => kind.size(long_flags[i]),
            };
        }
        let total = cursor;
        let bb_offsets: BTreeMap<BasicBlockId, u32> = first_item
            .iter()
            .map(|(&bb, &idx)| (bb, offsets.get(idx).copied().unwrap_or(total)))
            .collect();

        // Promote any short branch whose displacement no longer fits.
        let mut promoted = false;
        for (i, item) in items.iter().enumerate() {
            let Item::Branch { kind, local_target: Some(target), .. } = item else {
                continue;
            };
            if long_flags[i] {
                continue;
            }
            let branch_end = i64::from(offsets[i]) + i64::from(kind.size(false));
            let disp = i64::from(bb_offsets[target]) - branch_end;
            if !assembler::fits_short(disp) {
                if !kind.has_long_form() {
                    return Err(Error::Layout(format!(
                        "{kind:?} displacement {disp} exceeds rel8 reach"
                    )));
                }
                long_flags[i] = true;
                promoted = true;
            }
        }

        if !promoted {
            return Ok((offsets, bb_offsets, total));
        }
    }
}

fn item_bb(item: &Item) -> BasicBlockId {
    match *item {
        Item::Bytes { bb, .. } => bb,
        Item::Branch { bb, .. } => bb,
    }
}

// Writes the bytes of every item into the new block, records element
// locations, replays labels, and accumulates source ranges.
#[allow(clippy::too_many_arguments)]
fn emit_items(
    graph: &mut BlockGraph<'_>,
    subgraph: &BasicBlockSubGraph,
    block_id: BlockId,
    items: &[Item],
    offsets: &[u32],
    bb_offsets: &BTreeMap<BasicBlockId, u32>,
    instruction_locations: &mut BTreeMap<(BasicBlockId, usize), (BlockId, u32)>,
    successor_slots: &mut BTreeMap<(BasicBlockId, usize), (BlockId, u32, u8)>,
) -> Result<()> {
    // Labels on elided successors still need a home: the next byte emitted
    // for their basic block. Collect them up front.
    let mut pending_labels: Vec<(u32, Label)> = Vec::new();
    for (&bb_id, &bb_offset) in bb_offsets {
        let bb = subgraph.basic_block(bb_id).unwrap();
        if let Some(code) = bb.as_code() {
            let successors_offset = code_successors_offset(items, offsets, bb_id)
                .unwrap_or(bb_offset + code.instruction_byte_size());
            for successor in &code.successors {
                if let Some(label) = successor.label() {
                    pending_labels.push((successors_offset, label.clone()));
                }
            }
        }
    }

    let mut source_ranges: Vec<(DataRange, SourceRange)> = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let offset = offsets[i];
        match item {
            Item::Bytes { bb, instruction, size } => {
                let basic_block = subgraph.basic_block(*bb).unwrap();
                match instruction {
                    Some(index) => {
                        let inst = &basic_block.as_code().unwrap().instructions[*index];
                        instruction_locations.insert((*bb, *index), (block_id, offset));
                        let block = graph.block_mut(block_id).unwrap();
                        block.get_mutable_data()[offset as usize..(offset + size) as usize]
                            .copy_from_slice(inst.data());
                        if let Some(label) = inst.label() {
                            block.set_label(offset, label.clone());
                        }
                        if let Some(range) = inst.source_range() {
                            source_ranges.push((DataRange::new(offset, *size), range));
                        }
                    }
                    None => {
                        let data = basic_block.as_data().unwrap();
                        let block = graph.block_mut(block_id).unwrap();
                        block.get_mutable_data()[offset as usize..(offset + size) as usize]
                            .copy_from_slice(&data.data);
                        if let Some(range) = data.source_range {
                            source_ranges.push((DataRange::new(offset, *size), range));
                        }
                    }
                }
            }
            Item::Branch { bb, successor, kind, local_target, long, .. } => {
                let basic_block = subgraph.basic_block(*bb).unwrap();
                let succ = &basic_block.as_code().unwrap().successors[*successor];

                let size = kind.size(*long);
                let disp = match local_target {
                    Some(target) => {
                        i64::from(bb_offsets[target]) - (i64::from(offset) + i64::from(size))
                    }
                    // The reference fills this in; emit a zero placeholder.
                    None => 0,
                };
                let mut bytes = Vec::with_capacity(size as usize);
                assembler::assemble_branch(*kind, *long, disp, &mut bytes)?;

                let block = graph.block_mut(block_id).unwrap();
                block.get_mutable_data()[offset as usize..(offset + size) as usize]
                    .copy_from_slice(&bytes);

                let slot = offset + kind.reference_offset(*long);
                successor_slots
                    .insert((*bb, *successor), (block_id, slot, kind.reference_size(*long)));

                // Synthesized bytes map back to the branch they replace, if
                // it existed in the source image.
                if let Some(range) = succ.source_range() {
                    source_ranges.push((DataRange::new(offset, size), range));
                }
            }
        }
    }

    let block = graph.block_mut(block_id).unwrap();
    for (offset, label) in pending_labels {
        block.set_label(offset, label);
    }
    // Emission runs in ascending offset order, so pushes suffice and
    // adjacent linear ranges coalesce on the way in.
    for (data_range, source_range) in source_ranges {
        if !block.source_ranges_mut().push(data_range, source_range) {
            return Err(Error::Layout(format!(
                "source range for '{}' is not monotonic",
                block.name()
            )));
        }
    }
    Ok(())
}

// The offset where a code basic block's successor branches begin, if any
// branch was emitted for it.
fn code_successors_offset(items: &[Item], offsets: &[u32], bb: BasicBlockId) -> Option<u32> {
    items
        .iter()
        .enumerate()
        .find(|(_, item)| matches!(item, Item::Branch { bb: b, .. } if *b == bb))
        .map(|(i, _)| offsets[i])
}

fn resolve(
    bb_locations: &BTreeMap<BasicBlockId, (BlockId, u32)>,
    reference: &BasicBlockReference,
    size: u8,
) -> Result<Reference> {
    match reference.target() {
        ReferenceTarget::Block(block) => Ok(Reference::new(
            reference.kind(),
            size,
            block,
            reference.offset(),
            reference.base(),
        )),
        ReferenceTarget::BasicBlock(bb) => {
            let &(block, base) = bb_locations.get(&bb).ok_or_else(|| {
                Error::Transform(format!("basic block {bb} was never placed in a description"))
            })?;
            debug_assert_eq!(reference.base(), 0);
            Ok(Reference::new(
                reference.kind(),
                size,
                block,
                base as i32 + reference.offset(),
                base,
            ))
        }
    }
}

fn transfer_references(
    graph: &mut BlockGraph<'_>,
    subgraph: &BasicBlockSubGraph,
    bb_locations: &BTreeMap<BasicBlockId, (BlockId, u32)>,
    instruction_locations: &BTreeMap<(BasicBlockId, usize), (BlockId, u32)>,
    successor_slots: &BTreeMap<(BasicBlockId, usize), (BlockId, u32, u8)>,
) -> Result<()> {
    for bb in subgraph.basic_blocks() {
        match bb.kind() {
            BasicBlockKind::Code(code) => {
                for (index, instruction) in code.instructions.iter().enumerate() {
                    let Some(&(block, offset)) = instruction_locations.get(&(bb.id(), index))
                    else {
                        continue;
                    };
                    for (&local, bb_ref) in instruction.references() {
                        let reference = resolve(bb_locations, bb_ref, bb_ref.size())?;
                        graph.set_reference(block, offset + local, reference)?;
                    }
                }
                for (index, successor) in code.successors.iter().enumerate() {
                    // Elided successors synthesized no instruction.
                    let Some(&(block, slot, size)) = successor_slots.get(&(bb.id(), index))
                    else {
                        continue;
                    };
                    let bb_ref = successor.reference().ok_or_else(|| {
                        Error::Transform(format!(
                            "unresolved successor survived to block building"
                        ))
                    })?;
                    let reference = resolve(bb_locations, bb_ref, size)?;
                    graph.set_reference(block, slot, reference)?;
                }
            }
            BasicBlockKind::Data(data) | BasicBlockKind::Padding(data) => {
                let Some(&(block, offset)) = bb_locations.get(&bb.id()) else {
                    continue;
                };
                for (&local, bb_ref) in &data.references {
                    let reference = resolve(bb_locations, bb_ref, bb_ref.size())?;
                    graph.set_reference(block, offset + local, reference)?;
                }
            }
        }
    }
    Ok(())
}

// Redirects every external referrer of a basic block to its new home.
fn update_referrers(
    graph: &mut BlockGraph<'_>,
    subgraph: &BasicBlockSubGraph,
    bb_locations: &BTreeMap<BasicBlockId, (BlockId, u32)>,
) -> Result<()> {
    for bb in subgraph.basic_blocks() {
        if bb.referrers.is_empty() {
            continue;
        }
        let &(new_block, new_base) = bb_locations.get(&bb.id()).ok_or_else(|| {
            Error::Transform(format!(
                "referenced basic block {} was dropped from the layout",
                bb.id()
            ))
        })?;
        let bb_offset = bb.offset().unwrap_or(0);

        for &(referrer, r_offset) in &bb.referrers {
            let old = graph
                .block(referrer)
                .and_then(|b| b.get_reference(r_offset))
                .ok_or_else(|| {
                    Error::Consistency(format!("referrer ({referrer}, {r_offset}) has no reference"))
                })?;
            // Preserve the referrer's position within the basic block and
            // its offset-from-base indexing.
            let base_delta = i64::from(old.base()) - i64::from(bb_offset);
            let offset_delta = i64::from(old.offset()) - i64::from(old.base());
            let new_base = (i64::from(new_base) + base_delta) as u32;
            let reference = Reference::new(
                old.kind(),
                old.size(),
                new_block,
                (i64::from(new_base) + offset_delta) as i32,
                new_base,
            );
            graph.set_reference(referrer, r_offset, reference)?;
        }
    }
    Ok(())
}

fn remove_original_block(
    graph: &mut BlockGraph<'_>,
    subgraph: &mut BasicBlockSubGraph,
) -> Result<()> {
    let Some(original) = subgraph.original_block() else {
        return Ok(());
    };
    graph.remove_all_references(original)?;
    let block = graph
        .block(original)
        .ok_or_else(|| Error::Consistency(format!("no block with id {original}")))?;
    if !block.referrers().is_empty() {
        warn!(
            "original block '{}' still has referrers after merge; leaving it in place",
            block.name()
        );
        return Ok(());
    }
    graph.remove_block(original)?;
    subgraph.set_original_block(None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::basic_block::{Instruction, SuccessorTarget};
    use crate::block_graph::{BlockAttributes, BlockType, LabelAttributes};
    use crate::disasm::MAX_INSTRUCTION_LENGTH;

    fn add_instructions(subgraph: &mut BasicBlockSubGraph, bb: BasicBlockId, mut len: usize) {
        let code = subgraph.basic_block_mut(bb).unwrap().as_code_mut().unwrap();
        while len > 0 {
            let step = len.min(MAX_INSTRUCTION_LENGTH);
            code.instructions.push(Instruction::new(vec![0x90; step]));
            len -= step;
        }
    }

    fn bb_successor(subgraph: &mut BasicBlockSubGraph, from: BasicBlockId, condition: Condition, to: BasicBlockId) {
        let code = subgraph.basic_block_mut(from).unwrap().as_code_mut().unwrap();
        code.successors.push(Successor::new(
            condition,
            SuccessorTarget::Reference(BasicBlockReference::to_basic_block(
                ReferenceType::PcRelative,
                4,
                to,
            )),
            None,
            0,
        ));
    }

    // The four-block layout puzzle: BB1 conditionally branches to BB4, BB2
    // jumps back to BB1, BB3 falls through to BB4.
    fn build_layout<'a>(
        size1: usize,
        size2: usize,
        size3: usize,
        size4: usize,
    ) -> (BlockGraph<'a>, BlockId) {
        let mut graph = BlockGraph::new();
        let mut subgraph = BasicBlockSubGraph::new();

        let bb1 = subgraph.add_basic_code_block("bb1");
        let bb2 = subgraph.add_basic_code_block("bb2");
        let bb3 = subgraph.add_basic_code_block("bb3");
        let bb4 = subgraph.add_basic_code_block("bb4");
        add_instructions(&mut subgraph, bb1, size1);
        add_instructions(&mut subgraph, bb2, size2);
        add_instructions(&mut subgraph, bb3, size3);
        add_instructions(&mut subgraph, bb4, size4);

        bb_successor(&mut subgraph, bb1, Condition::Equal, bb4);
        bb_successor(&mut subgraph, bb1, Condition::NotEqual, bb2);
        bb_successor(&mut subgraph, bb2, Condition::True, bb1);
        bb_successor(&mut subgraph, bb3, Condition::True, bb4);

        let description = subgraph.add_block_description(
            "new_block",
            BlockType::Code,
            0,
            1,
            BlockAttributes::empty(),
        );
        description.basic_block_order.extend([bb1, bb2, bb3, bb4]);

        let mut builder = BlockBuilder::new();
        builder.merge(&mut graph, &mut subgraph).unwrap();
        assert_eq!(builder.new_blocks().len(), 1);
        let new_block = builder.new_blocks()[0];
        (graph, new_block)
    }

    #[test]
    fn short_layout() {
        // Both branches fit their rel8 forms exactly:
        //   0   [BB1] 62 bytes
        //   62  jeq BB4 (+127)
        //   64  [BB2] 62 bytes
        //   126 jmp BB1 (-128)
        //   128 [BB3] 63 bytes
        //   191 [BB4] 1 byte
        let (graph, new_block) = build_layout(62, 62, 63, 1);
        let block = graph.block(new_block).unwrap();
        assert_eq!(block.size(), 192);

        let refs: Vec<(u32, u8, i32)> = block
            .references()
            .iter()
            .map(|(&o, r)| (o, r.size(), r.offset()))
            .collect();
        assert_eq!(refs, vec![(63, 1, 191), (127, 1, 0)]);
        // The encoded displacements match the references.
        assert_eq!(block.data()[62], 0x74);
        assert_eq!(block.data()[63] as i8, 127);
        assert_eq!(block.data()[126], 0xEB);
        assert_eq!(block.data()[127] as i8, -128);
    }

    #[test]
    fn out_of_reach_branch_layout() {
        // 54 + 72 + 2 = 128: the BB1 -> BB4 branch is just out of reach and
        // promotes to its six-byte form.
        let (graph, new_block) = build_layout(62, 54, 72, 1);
        let block = graph.block(new_block).unwrap();

        let expected_size = 62 + 6 + 54 + 2 + 72 + 1;
        assert_eq!(block.size(), expected_size);

        let refs: Vec<(u32, u8, i32)> = block
            .references()
            .iter()
            .map(|(&o, r)| (o, r.size(), r.offset()))
            .collect();
        assert_eq!(
            refs,
            vec![(62 + 2, 4, expected_size as i32 - 1), (62 + 6 + 54 + 1, 1, 0)]
        );
        assert_eq!(&block.data()[62..64], &[0x0F, 0x84]);
    }

    #[test]
    fn out_of_reach_jmp_layout() {
        // 0 - (62 + 2 + 63 + 2) = -129: the BB2 -> BB1 jump is just out of
        // reach and promotes to its five-byte form.
        let (graph, new_block) = build_layout(62, 63, 55, 1);
        let block = graph.block(new_block).unwrap();

        let expected_size = 62 + 2 + 63 + 5 + 55 + 1;
        assert_eq!(block.size(), expected_size);

        let refs: Vec<(u32, u8, i32)> = block
            .references()
            .iter()
            .map(|(&o, r)| (o, r.size(), r.offset()))
            .collect();
        assert_eq!(
            refs,
            vec![(62 + 1, 1, expected_size as i32 - 1), (62 + 2 + 63 + 1, 4, 0)]
        );
        assert_eq!(block.data()[62 + 2 + 63], 0xE9);
    }

    #[test]
    fn merge_rewrites_references_and_labels() {
        let mut graph = BlockGraph::new();
        let mut subgraph = BasicBlockSubGraph::new();

        // A data block outside the subgraph references the original block.
        let original = graph.add_block(BlockType::Code, 32, "original");
        let other = graph.add_block(BlockType::Data, 4, "other");
        graph
            .set_reference(other, 0, Reference::direct(ReferenceType::Absolute, 4, original, 0))
            .unwrap();
        subgraph.set_original_block(Some(original));

        let bb1 = subgraph.add_basic_code_block("bb1");
        let bb2 = subgraph.add_basic_code_block("bb2");
        let table = subgraph.add_basic_data_block("table", vec![0; 8]);

        // bb1: one instruction with a reference to `other` plus a label,
        // then a conditional branch over bb2's jump table reference.
        {
            subgraph.basic_block_mut(bb1).unwrap().set_offset(0);
            let code = subgraph.basic_block_mut(bb1).unwrap().as_code_mut().unwrap();
            let mut inst = Instruction::new(vec![0xB8, 0, 0, 0, 0]);
            inst.set_label(Label::new("entry", LabelAttributes::CODE));
            inst.set_reference(1, BasicBlockReference::to_block(ReferenceType::Absolute, 4, other, 0, 0));
            code.instructions.push(inst);
        }
        bb_successor(&mut subgraph, bb1, Condition::Equal, bb1);
        bb_successor(&mut subgraph, bb1, Condition::NotEqual, bb2);
        subgraph.basic_block_mut(bb1).unwrap().referrers.insert((other, 0));

        {
            subgraph.basic_block_mut(bb2).unwrap().set_offset(5);
            let code = subgraph.basic_block_mut(bb2).unwrap().as_code_mut().unwrap();
            code.instructions.push(Instruction::new(vec![0xC3]));
        }

        {
            let bb = subgraph.basic_block_mut(table).unwrap();
            bb.set_label(Label::new("table", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE));
            let data = bb.as_data_mut().unwrap();
            data.references
                .insert(0, BasicBlockReference::to_basic_block(ReferenceType::Absolute, 4, bb1));
            data.references
                .insert(4, BasicBlockReference::to_basic_block(ReferenceType::Absolute, 4, bb2));
        }

        let description = subgraph.add_block_description(
            "rebuilt",
            BlockType::Code,
            0,
            1,
            BlockAttributes::empty(),
        );
        description.basic_block_order.extend([bb1, bb2, table]);

        let mut builder = BlockBuilder::new();
        builder.merge(&mut graph, &mut subgraph).unwrap();
        let new_block = builder.new_blocks()[0];

        // Layout: bb1 insn [0,5), jeq bb1 [5,7), bb2 [7,8), table [8,16).
        // The NotEqual successor to bb2 is elided (bb2 is next in order).
        let block = graph.block(new_block).unwrap();
        assert_eq!(block.size(), 16);

        // The original block is gone; `other` points at the new block.
        assert!(graph.block(original).is_none());
        let redirected = graph.block(other).unwrap().get_reference(0).unwrap();
        assert_eq!(redirected.referenced(), new_block);
        assert_eq!(redirected.base(), 0);

        // Instruction reference, successor self-reference and table
        // references all landed.
        let refs: Vec<(u32, u32)> = block
            .references()
            .iter()
            .map(|(&o, r)| (o, r.base()))
            .collect();
        assert_eq!(refs, vec![(1, 0), (6, 0), (8, 0), (12, 7)]);

        // Labels: instruction label at 0, table label at 8.
        assert!(block.get_label(0).unwrap().has_attributes(LabelAttributes::CODE));
        assert!(block.get_label(8).unwrap().has_attributes(LabelAttributes::JUMP_TABLE));

        // The new block owns fully materialized data.
        assert_eq!(block.data_size(), block.size());
        assert_eq!(block.data()[7], 0xC3);
    }

    #[test]
    fn loop_branch_out_of_reach_is_an_error() {
        let mut graph = BlockGraph::new();
        let mut subgraph = BasicBlockSubGraph::new();

        let bb1 = subgraph.add_basic_code_block("bb1");
        let bb2 = subgraph.add_basic_code_block("bb2");
        let bb3 = subgraph.add_basic_code_block("bb3");
        add_instructions(&mut subgraph, bb1, 4);
        add_instructions(&mut subgraph, bb2, 200);
        add_instructions(&mut subgraph, bb3, 1);

        // loop back past 200 bytes: no rel8 encoding, no rel32 fallback.
        bb_successor(&mut subgraph, bb2, Condition::Loop, bb1);
        let description = subgraph.add_block_description(
            "looped",
            BlockType::Code,
            0,
            1,
            BlockAttributes::empty(),
        );
        description.basic_block_order.extend([bb1, bb2, bb3]);

        let mut builder = BlockBuilder::new();
        assert!(builder.merge(&mut graph, &mut subgraph).is_err());
    }
}
