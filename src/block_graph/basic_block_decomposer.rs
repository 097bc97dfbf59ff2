//! Splits one code block into a basic-block subgraph via disassembly.
//!
//! The walk is seeded from every referrer of the block (each is a known jump
//! target unless it lands under a data label), then proceeds as a linear
//! sweep: each run of instructions ends at a branch, a return, a call to a
//! non-returning function, a data boundary, or previously visited bytes.
//! After the sweep, basic blocks are split wherever a jump target landed in
//! their middle, data labels carve out data basic blocks, leftover gaps
//! become padding, and finally the original block's references, referrers
//! and labels are re-attached to the elements they fall on.

use std::collections::BTreeSet;

use log::{error, warn};

use crate::address::Address;
use crate::address_space::{AddressRange, AddressSpace};
use crate::block_graph::basic_block::{
    BasicBlockId, BasicBlockReference, BasicBlockSubGraph, BasicBlockType, Condition, Instruction,
    Successor, SuccessorTarget,
};
use crate::block_graph::block_util::code_block_attributes_are_basic_block_safe;
use crate::block_graph::{
    Block, BlockGraph, BlockId, BlockType, LabelAttributes, Reference, ReferenceType, SourceRange,
};
use crate::disasm::{self, FlowClass};
use crate::error::{Error, Result};

type OffsetRange = AddressRange<u32>;

/// Decomposes one code block of a graph into a [`BasicBlockSubGraph`].
pub struct BasicBlockDecomposer<'g, 'a> {
    graph: &'g BlockGraph<'a>,
    block_id: BlockId,
    contains_unsupported_instructions: bool,
}

// Working state for one decomposition.
struct Walker<'g, 'a> {
    graph: &'g BlockGraph<'a>,
    block: &'g Block<'a>,
    subgraph: BasicBlockSubGraph,
    // Basic-block ranges carved out of the original block so far.
    ranges: AddressSpace<u32, BasicBlockId>,
    jump_targets: BTreeSet<u32>,
    unvisited: BTreeSet<u32>,
    // The instruction/successor accumulators for the current run.
    current_instructions: Vec<Instruction>,
    current_successors: Vec<Successor>,
}

impl<'g, 'a> BasicBlockDecomposer<'g, 'a> {
    /// The block must be a code block whose attributes make it safe to
    /// decompose.
    pub fn new(graph: &'g BlockGraph<'a>, block_id: BlockId) -> Result<Self> {
        let block = graph
            .block(block_id)
            .ok_or_else(|| Error::Decomposition(format!("no block with id {block_id}")))?;
        if block.block_type() != BlockType::Code {
            return Err(Error::Decomposition(format!(
                "block '{}' is not a code block",
                block.name()
            )));
        }
        if !code_block_attributes_are_basic_block_safe(block) {
            return Err(Error::Decomposition(format!(
                "block '{}' is not safe for basic-block decomposition",
                block.name()
            )));
        }
        if block.data_size() != block.size() {
            return Err(Error::Decomposition(format!(
                "code block '{}' does not carry all of its bytes",
                block.name()
            )));
        }
        Ok(BasicBlockDecomposer { graph, block_id, contains_unsupported_instructions: false })
    }

    /// True, after a failed decomposition, iff the failure was an opcode the
    /// decoder does not understand. Callers use this to skip the block
    /// rather than fail an entire pass.
    pub fn contains_unsupported_instructions(&self) -> bool {
        self.contains_unsupported_instructions
    }

    pub fn decompose(&mut self) -> Result<BasicBlockSubGraph> {
        let block = self.graph.block(self.block_id).unwrap();
        let mut walker = Walker {
            graph: self.graph,
            block,
            subgraph: BasicBlockSubGraph::new(),
            ranges: AddressSpace::new(),
            jump_targets: BTreeSet::new(),
            unvisited: BTreeSet::new(),
            current_instructions: Vec::new(),
            current_successors: Vec::new(),
        };
        walker.subgraph.set_original_block(Some(self.block_id));

        walker.init_unvisited_and_jump_targets();
        let walked = walker.walk();
        if let Err(e) = walked {
            if matches!(e, Error::Decomposition(ref msg) if msg.contains("unsupported opcode")) {
                self.contains_unsupported_instructions = true;
            }
            return Err(e);
        }

        walker.split_at_jump_targets()?;
        walker.check_jump_targets_start_code_blocks()?;
        walker.fill_in_data_blocks()?;
        walker.fill_in_padding_blocks()?;
        walker.check_complete_coverage()?;
        walker.copy_external_referrers()?;
        walker.copy_references()?;
        walker.resolve_successors()?;
        walker.check_labels_preserved()?;

        // A single description reproducing the original layout; transforms
        // rearrange it from here.
        let block = walker.block;
        let description = walker.subgraph.add_block_description(
            block.name(),
            block.block_type(),
            block.section(),
            block.alignment(),
            block.attributes(),
        );
        for (_, bb) in walker.ranges.iter() {
            description.basic_block_order.push(*bb);
        }

        if !walker.subgraph.is_valid() {
            return Err(Error::Decomposition(format!(
                "decomposition of '{}' produced an invalid subgraph",
                block.name()
            )));
        }
        Ok(walker.subgraph)
    }
}

impl<'g, 'a> Walker<'g, 'a> {
    fn init_unvisited_and_jump_targets(&mut self) {
        // Every referenced code location is a jump target: externally
        // referenced entry points as well as branch and jump-table targets
        // inside the block. A location preceded by a data label is table
        // data, not code.
        for &(referrer, r_offset) in self.block.referrers() {
            let Some(reference) =
                self.graph.block(referrer).and_then(|b| b.get_reference(r_offset))
            else {
                continue;
            };
            debug_assert_eq!(reference.referenced(), self.block.id());
            debug_assert!(reference.base() < self.block.size());

            // Find the closest label at or before the target.
            let preceding = self
                .block
                .labels()
                .range(..=reference.base())
                .next_back();
            let is_code = match preceding {
                None => true,
                Some((_, label)) => !label.has_attributes(LabelAttributes::DATA),
            };
            if is_code {
                self.unvisited.insert(reference.base());
                self.jump_targets.insert(reference.base());
            }
        }
    }

    fn walk(&mut self) -> Result<()> {
        while let Some(start) = self.unvisited.pop_first() {
            if self.ranges.intersects(&OffsetRange::new(start, 1)) {
                continue;
            }
            self.walk_from(start)?;
        }
        Ok(())
    }

    // Disassembles one linear run starting at `start`, accumulating
    // instructions until control flow breaks, then inserts the basic block.
    fn walk_from(&mut self, start: u32) -> Result<()> {
        debug_assert!(self.current_instructions.is_empty());
        debug_assert!(self.current_successors.is_empty());

        let data = self.block.data();
        let size = self.block.size();
        let mut offset = start;
        // The run covers [start, run_end), branch bytes included even when
        // the branch is lifted out as a successor.
        let mut run_end = start;

        loop {
            if offset >= size {
                // Ran off the end of the block without a flow break. The
                // run is closed with no successor; the whole-image pass
                // flags such blocks before they ever get here.
                break;
            }
            if self.ranges.intersects(&OffsetRange::new(offset, 1)) {
                // We have rejoined previously disassembled code; close the
                // run with an implicit fall-through arc.
                self.current_successors.push(Successor::fall_through(offset));
                self.jump_targets.insert(offset);
                break;
            }
            if let Some(label) = self.block.get_label(offset) {
                if label.has_attributes(LabelAttributes::DATA) {
                    return Err(Error::Decomposition(format!(
                        "disassembling into data at offset {} of '{}'",
                        offset,
                        self.block.name()
                    )));
                }
            }

            let inst = disasm::decode(&data[offset as usize..])?;
            let end = offset + inst.size();
            if end > size {
                return Err(Error::Decomposition(format!(
                    "instruction at offset {} runs past the end of '{}'",
                    offset,
                    self.block.name()
                )));
            }

            let mut instruction = Instruction::from_block_bytes(
                data[offset as usize..end as usize].to_vec(),
                offset,
            );
            if let Some(range) = self.source_range_for(offset, inst.size()) {
                instruction.set_source_range(range);
            }
            if let Some(label) = self.block.get_label(offset) {
                instruction.set_label(label.clone());
            }
            self.current_instructions.push(instruction);
            run_end = end;

            // A data label at the next boundary means a jump table starts
            // there; the run must not continue into it.
            let data_follows = match self.block.get_label(end) {
                Some(label) => label.has_attributes(LabelAttributes::DATA),
                None => false,
            };

            match inst.flow {
                FlowClass::Call => {
                    if (inst.pc_rel.is_some() || inst.abs_disp)
                        && self.calls_non_returning_function(offset, inst.size())
                    {
                        // Control does not continue here. Anything after is
                        // unreachable, but still gets disassembled into its
                        // own basic block.
                        self.unvisited.insert(end);
                        break;
                    }
                    if data_follows {
                        break;
                    }
                    offset = end;
                }
                FlowClass::CondBranch | FlowClass::UncBranch => {
                    self.handle_branch(&inst, offset, end)?;
                    break;
                }
                FlowClass::Ret => break,
                FlowClass::None | FlowClass::Interrupt | FlowClass::Syscall => {
                    if data_follows {
                        break;
                    }
                    offset = end;
                }
            }
        }

        if run_end == start {
            debug_assert!(self.current_successors.is_empty());
            return Ok(());
        }
        self.insert_basic_block_range(start, run_end - start, BasicBlockType::BasicCode)
    }

    // Turns an explicit branch into successors. The branch instruction has
    // already been pushed; when it has a resolvable destination it is
    // popped and represented as a successor instead.
    fn handle_branch(&mut self, inst: &disasm::Inst, offset: u32, end: u32) -> Result<()> {
        let condition = branch_condition(inst).ok_or_else(|| {
            Error::Decomposition(format!(
                "unknown branch condition for opcode 0x{:X} at offset {}",
                inst.opcode, offset
            ))
        })?;

        if inst.flow == FlowClass::CondBranch {
            let inverse = condition.invert().ok_or_else(|| {
                Error::Decomposition(format!(
                    "non-invertible branch condition at offset {offset}"
                ))
            })?;
            // The branch-not-taken arc, resolved to a basic block later.
            self.current_successors.push(Successor::new(
                inverse,
                SuccessorTarget::Offset(end),
                None,
                0,
            ));
            self.jump_targets.insert(end);
            self.unvisited.insert(end);
        }

        // Computed branches (and returns) have no explicit destination; the
        // instruction stays in the list with its references intact.
        let Some(pc_rel) = inst.pc_rel else {
            return Ok(());
        };

        let instruction = self.current_instructions.pop().unwrap();
        let instr_offset = instruction.offset().unwrap();
        debug_assert_eq!(instr_offset, offset);

        // The destination comes from the embedded reference when one
        // exists; the raw displacement is only a fallback.
        let reference = get_reference_of_instruction_at(self.block, offset, inst.size());

        let mut successor = match reference {
            Some(r) if r.referenced() != self.block.id() => Successor::new(
                condition,
                SuccessorTarget::Reference(BasicBlockReference::to_block(
                    r.kind(),
                    r.size(),
                    r.referenced(),
                    r.offset(),
                    r.base(),
                )),
                Some(offset),
                inst.size(),
            ),
            Some(r) => {
                let target = r.base();
                self.jump_targets.insert(target);
                self.unvisited.insert(target);
                Successor::new(condition, SuccessorTarget::Offset(target), Some(offset), inst.size())
            }
            None => {
                let target = i64::from(end) + i64::from(pc_rel.disp);
                if target < 0 || target >= i64::from(self.block.size()) {
                    return Err(Error::Decomposition(format!(
                        "branch at offset {} of '{}' leaves the block without a reference",
                        offset,
                        self.block.name()
                    )));
                }
                let target = target as u32;
                self.jump_targets.insert(target);
                self.unvisited.insert(target);
                Successor::new(condition, SuccessorTarget::Offset(target), Some(offset), inst.size())
            }
        };

        if let Some(range) = self.source_range_for(offset, inst.size()) {
            successor.set_source_range(range);
        }
        if let Some(label) = instruction.label() {
            successor.set_label(label.clone());
        }
        // Successor order is [taken, fall-through].
        self.current_successors.insert(0, successor);
        Ok(())
    }

    fn calls_non_returning_function(&self, offset: u32, size: u32) -> bool {
        let Some(reference) = get_reference_of_instruction_at(self.block, offset, size) else {
            return false;
        };
        if reference.base() != 0 {
            return false;
        }
        match self.graph.block(reference.referenced()) {
            Some(target) => target
                .attributes()
                .contains(crate::block_graph::BlockAttributes::NON_RETURN_FUNCTION),
            None => false,
        }
    }

    fn source_range_for(&self, offset: u32, size: u32) -> Option<SourceRange> {
        let pair = self
            .block
            .source_ranges()
            .find_range_pair(&AddressRange::new(offset, size))?;
        let (src, dst) = pair;
        if src.size() == dst.size() {
            let delta = offset - src.start();
            Some(SourceRange::new(dst.start().offset_by(delta), size))
        } else if src.start() == offset && src.size() == size {
            Some(*dst)
        } else {
            None
        }
    }

    // Creates a basic block covering `[offset, offset + size)`, moving the
    // accumulated instructions and successors into it when it is code.
    fn insert_basic_block_range(
        &mut self,
        offset: u32,
        size: u32,
        bb_type: BasicBlockType,
    ) -> Result<()> {
        debug_assert!(bb_type == BasicBlockType::BasicCode || self.current_instructions.is_empty());
        debug_assert!(bb_type == BasicBlockType::BasicCode || self.current_successors.is_empty());

        let label = self.block.get_label(offset).cloned();
        let name = match &label {
            Some(label) => label.name().to_string(),
            None => format!("<anonymous-{offset:04X}>"),
        };

        let range = OffsetRange::new(offset, size);
        if self.ranges.intersects(&range) {
            return Err(Error::Decomposition(format!(
                "overlapping basic block at offset {} of '{}'",
                offset,
                self.block.name()
            )));
        }

        let data = self.block.data()[offset as usize..(offset + size) as usize].to_vec();
        let id = match bb_type {
            BasicBlockType::BasicCode => {
                let id = self.subgraph.add_basic_code_block(name);
                let code = self.subgraph.basic_block_mut(id).unwrap().as_code_mut().unwrap();
                code.instructions = std::mem::take(&mut self.current_instructions);
                code.successors = std::mem::take(&mut self.current_successors);
                id
            }
            BasicBlockType::BasicData => self.subgraph.add_basic_data_block(name, data),
            BasicBlockType::BasicPadding => self.subgraph.add_basic_padding_block(name, data),
        };

        let source_range = self.source_range_for(offset, size);
        let bb = self.subgraph.basic_block_mut(id).unwrap();
        bb.set_offset(offset);
        if bb_type != BasicBlockType::BasicCode {
            if let Some(label) = label {
                bb.set_label(label);
            }
            if let Some(range) = source_range {
                if let Some(data) = bb.as_data_mut() {
                    data.source_range = Some(range);
                }
            }
        }

        let inserted = self.ranges.insert(range, id);
        debug_assert!(inserted);
        Ok(())
    }

    // Splits any basic block with a jump target in its middle, wiring the
    // left half to the right with an implicit fall-through arc.
    fn split_at_jump_targets(&mut self) -> Result<()> {
        let jump_targets: Vec<u32> = self.jump_targets.iter().copied().collect();
        for target in jump_targets {
            let Some((range, &bb_id)) =
                self.ranges.find_first_intersection(&OffsetRange::new(target, 1))
            else {
                return Err(Error::Decomposition(format!(
                    "jump target {target} is not covered by any basic block"
                )));
            };
            if range.start() == target {
                continue;
            }

            self.ranges.remove(&range);
            let bb = self.subgraph.remove_basic_block(bb_id).unwrap();
            let bb_type = bb.block_type();
            if bb_type != BasicBlockType::BasicCode {
                return Err(Error::Decomposition(format!(
                    "jump target {target} lands inside non-code bytes of '{}'",
                    self.block.name()
                )));
            }

            let code = match bb.kind() {
                crate::block_graph::basic_block::BasicBlockKind::Code(code) => code.clone(),
                _ => unreachable!(),
            };

            debug_assert!(self.current_instructions.is_empty());
            debug_assert!(self.current_successors.is_empty());

            let mut right_instructions = Vec::new();
            for instruction in code.instructions {
                if instruction.offset().unwrap() < target {
                    self.current_instructions.push(instruction);
                } else {
                    right_instructions.push(instruction);
                }
            }

            // The first half flows straight into the second.
            self.current_successors.push(Successor::fall_through(target));
            self.insert_basic_block_range(
                range.start(),
                target - range.start(),
                BasicBlockType::BasicCode,
            )?;

            self.current_instructions = right_instructions;
            self.current_successors = code.successors;
            self.insert_basic_block_range(
                target,
                range.end() - target,
                BasicBlockType::BasicCode,
            )?;
        }
        Ok(())
    }

    fn check_jump_targets_start_code_blocks(&self) -> Result<()> {
        for &target in &self.jump_targets {
            let starts_code = self
                .ranges
                .find_first_intersection(&OffsetRange::new(target, 1))
                .is_some_and(|(range, &id)| {
                    range.start() == target
                        && self.subgraph.basic_block(id).unwrap().block_type()
                            == BasicBlockType::BasicCode
                });
            if !starts_code {
                return Err(Error::Decomposition(format!(
                    "jump target {} does not begin a code basic block in '{}'",
                    target,
                    self.block.name()
                )));
            }
        }
        Ok(())
    }

    // Carves a data basic block for every data-labeled run. A run extends
    // to the next label of any kind, or the end of the block.
    fn fill_in_data_blocks(&mut self) -> Result<()> {
        let labels: Vec<(u32, bool)> = self
            .block
            .labels()
            .iter()
            .map(|(&o, l)| (o, l.has_attributes(LabelAttributes::DATA)))
            .collect();
        for (i, &(offset, is_data)) in labels.iter().enumerate() {
            if !is_data {
                continue;
            }
            let end = labels.get(i + 1).map(|&(o, _)| o).unwrap_or(self.block.size());
            self.insert_basic_block_range(offset, end - offset, BasicBlockType::BasicData)?;
        }
        Ok(())
    }

    // Fills every uncovered gap with a padding basic block; this includes
    // unreachable code in unoptimized binaries.
    fn fill_in_padding_blocks(&mut self) -> Result<()> {
        let covered: Vec<OffsetRange> = self.ranges.iter().map(|(r, _)| r).collect();
        let mut gaps = Vec::new();
        let mut cursor = 0u32;
        for range in covered {
            if cursor < range.start() {
                gaps.push((cursor, range.start() - cursor));
            }
            cursor = range.end();
        }
        if cursor < self.block.size() {
            gaps.push((cursor, self.block.size() - cursor));
        }
        for (offset, size) in gaps {
            self.insert_basic_block_range(offset, size, BasicBlockType::BasicPadding)?;
        }
        Ok(())
    }

    fn check_complete_coverage(&self) -> Result<()> {
        let mut next_start = 0u32;
        for (range, _) in self.ranges.iter() {
            if range.start() != next_start {
                return Err(Error::Decomposition(format!(
                    "basic blocks of '{}' leave a gap at offset {}",
                    self.block.name(),
                    next_start
                )));
            }
            next_start = range.end();
        }
        if next_start != self.block.size() {
            return Err(Error::Decomposition(format!(
                "basic blocks of '{}' do not cover the block tail",
                self.block.name()
            )));
        }
        Ok(())
    }

    fn copy_external_referrers(&mut self) -> Result<()> {
        for &(referrer, r_offset) in self.block.referrers() {
            if referrer == self.block.id() {
                continue;
            }
            let reference = self
                .graph
                .block(referrer)
                .and_then(|b| b.get_reference(r_offset))
                .ok_or_else(|| {
                    Error::Consistency(format!("referrer ({referrer}, {r_offset}) has no reference"))
                })?;

            let (_, &bb_id) = self
                .ranges
                .find_first_intersection(&OffsetRange::new(reference.base(), 1))
                .ok_or_else(|| {
                    Error::Decomposition(format!(
                        "referrer target {} is not covered in '{}'",
                        reference.base(),
                        self.block.name()
                    ))
                })?;
            self.subgraph
                .basic_block_mut(bb_id)
                .unwrap()
                .referrers
                .insert((referrer, r_offset));
        }
        Ok(())
    }

    // Re-attaches the original block's references to the instructions and
    // data basic blocks whose bytes they live in. Branch references were
    // captured as successors during the walk and are not copied here.
    fn copy_references(&mut self) -> Result<()> {
        let block_id = self.block.id();
        let references: Vec<(u32, Reference)> =
            self.block.references().iter().map(|(&o, &r)| (o, r)).collect();

        for (offset, reference) in references {
            let bb_ref = if reference.referenced() != block_id {
                BasicBlockReference::to_block(
                    reference.kind(),
                    reference.size(),
                    reference.referenced(),
                    reference.offset(),
                    reference.base(),
                )
            } else {
                let (range, &target_bb) = self
                    .ranges
                    .find_first_intersection(&OffsetRange::new(reference.base(), 1))
                    .ok_or_else(|| {
                        Error::Decomposition(format!(
                            "self-reference to uncovered offset {}",
                            reference.base()
                        ))
                    })?;
                if range.start() != reference.base() {
                    // Referencing the middle of a basic block; only data
                    // basic blocks can absorb this as an offset reference.
                    warn!(
                        "self-reference into the middle of a basic block in '{}'",
                        self.block.name()
                    );
                }
                BasicBlockReference::to_basic_block(
                    reference.kind(),
                    reference.size(),
                    target_bb,
                )
            };

            // Locate the element whose bytes hold the reference.
            let (range, &holder) = self
                .ranges
                .find_first_intersection(&OffsetRange::new(offset, 1))
                .ok_or_else(|| {
                    Error::Decomposition(format!("reference at uncovered offset {offset}"))
                })?;
            let bb = self.subgraph.basic_block_mut(holder).unwrap();
            match bb.block_type() {
                BasicBlockType::BasicCode => {
                    let code = bb.as_code_mut().unwrap();
                    let Some(instruction) = code.instructions.iter_mut().find(|i| {
                        let start = i.offset().unwrap();
                        offset >= start && offset < start + i.size()
                    }) else {
                        // The reference lives in a successor's branch bytes;
                        // the successor carries it already.
                        continue;
                    };
                    let local = offset - instruction.offset().unwrap();
                    instruction.set_reference(local, bb_ref);
                }
                BasicBlockType::BasicData | BasicBlockType::BasicPadding => {
                    let local = offset - range.start();
                    bb.as_data_mut().unwrap().references.insert(local, bb_ref);
                }
            }
        }
        Ok(())
    }

    // Resolves every still-unresolved successor to the basic block at its
    // target offset, as a 4-byte PC-relative reference.
    fn resolve_successors(&mut self) -> Result<()> {
        let targets: Vec<(BasicBlockId, usize, u32)> = self
            .subgraph
            .basic_blocks()
            .filter_map(|bb| bb.as_code().map(|code| (bb.id(), code)))
            .flat_map(|(id, code)| {
                code.successors
                    .iter()
                    .enumerate()
                    .filter_map(move |(i, s)| s.bb_target_offset().map(|o| (id, i, o)))
            })
            .collect();

        for (bb_id, index, offset) in targets {
            let target = self
                .ranges
                .find_first_intersection(&OffsetRange::new(offset, 1))
                .filter(|(range, _)| range.start() == offset)
                .map(|(_, &id)| id)
                .ok_or_else(|| {
                    Error::Decomposition(format!(
                        "successor target {offset} does not begin a basic block"
                    ))
                })?;
            let successor = &mut self
                .subgraph
                .basic_block_mut(bb_id)
                .unwrap()
                .as_code_mut()
                .unwrap()
                .successors[index];
            successor.set_reference(BasicBlockReference::to_basic_block(
                ReferenceType::PcRelative,
                4,
                target,
            ));
        }
        Ok(())
    }

    // Every label of the original block must reappear on exactly one
    // element of the subgraph.
    fn check_labels_preserved(&self) -> Result<()> {
        let mut found: BTreeSet<u32> = BTreeSet::new();
        for bb in self.subgraph.basic_blocks() {
            if bb.has_label() {
                found.insert(bb.offset().unwrap());
            }
            if let Some(code) = bb.as_code() {
                for instruction in &code.instructions {
                    if instruction.has_label() {
                        found.insert(instruction.offset().unwrap());
                    }
                }
                for successor in &code.successors {
                    if successor.has_label() {
                        found.insert(successor.instruction_offset().unwrap());
                    }
                }
            }
        }
        for &offset in self.block.labels().keys() {
            if !found.contains(&offset) {
                error!(
                    "label at offset {} of '{}' was lost during decomposition",
                    offset,
                    self.block.name()
                );
                return Err(Error::Decomposition(format!(
                    "label at offset {offset} was lost during decomposition"
                )));
            }
        }
        Ok(())
    }
}

/// Maps a decoded branch to its successor condition.
fn branch_condition(inst: &disasm::Inst) -> Option<Condition> {
    match inst.opcode {
        0x70..=0x7F => Condition::from_condition_code((inst.opcode & 0xF) as u8),
        0x0F80..=0x0F8F => Condition::from_condition_code((inst.opcode & 0xF) as u8),
        0xEB | 0xE9 | 0xEA => Some(Condition::True),
        0xE3 => Some(Condition::CounterIsZero),
        0xE2 => Some(Condition::Loop),
        0xE1 => Some(Condition::LoopEqual),
        0xE0 => Some(Condition::LoopNotEqual),
        // Computed jumps (group 5) carry no condition; they are not
        // represented as successors at all.
        0xFF => Some(Condition::True),
        _ => None,
    }
}

/// Finds the reference embedded in an instruction's byte range. The
/// reference must start after the instruction's first byte and be the only
/// one in the range.
fn get_reference_of_instruction_at(
    block: &Block<'_>,
    instr_offset: u32,
    instr_size: u32,
) -> Option<Reference> {
    let end = instr_offset + instr_size;
    let mut in_range = block
        .references()
        .range(instr_offset + 1..end)
        .map(|(&o, &r)| (o, r));
    let (offset, reference) = in_range.next()?;
    debug_assert!(in_range.next().is_none());
    debug_assert!(offset + u32::from(reference.size()) <= end);
    Some(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::basic_block::BasicBlockKind;
    use crate::block_graph::{BlockAttributes, Label};

    // push ebp; mov ebp, esp; cmp eax, 0; je +5;
    // mov eax, 1; pop ebp; ret; int3
    const FUNC: &[u8] = &[
        0x55, // 0: push ebp
        0x8B, 0xEC, // 1: mov ebp, esp
        0x83, 0xF8, 0x00, // 3: cmp eax, 0
        0x74, 0x05, // 6: je 13
        0xB8, 0x01, 0x00, 0x00, 0x00, // 8: mov eax, 1
        0x5D, // 13: pop ebp
        0xC3, // 14: ret
        0xCC, // 15: int3
    ];

    fn build_func<'a>() -> (BlockGraph<'a>, BlockId) {
        let mut graph = BlockGraph::new();
        let func = graph.add_block(BlockType::Code, FUNC.len() as u32, "func");
        graph.block_mut(func).unwrap().copy_data(FUNC);
        graph
            .block_mut(func)
            .unwrap()
            .set_label(0, Label::new("func", LabelAttributes::CODE));

        // An external caller seeds the entry point.
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();
        (graph, func)
    }

    fn ranges_of(subgraph: &BasicBlockSubGraph, graph_block_size: u32) -> Vec<(u32, u32, BasicBlockType)> {
        let mut bbs: Vec<(u32, u32, BasicBlockType)> = subgraph
            .basic_blocks()
            .map(|bb| {
                let start = bb.offset().unwrap();
                let size = match bb.kind() {
                    BasicBlockKind::Code(code) => {
                        code.instruction_byte_size()
                            + code
                                .successors
                                .iter()
                                .map(Successor::instruction_size)
                                .sum::<u32>()
                    }
                    BasicBlockKind::Data(d) | BasicBlockKind::Padding(d) => d.size(),
                };
                (start, size, bb.block_type())
            })
            .collect();
        bbs.sort();
        assert_eq!(bbs.iter().map(|&(_, s, _)| s).sum::<u32>(), graph_block_size);
        bbs
    }

    #[test]
    fn decomposes_simple_function() {
        let (graph, func) = build_func();
        let mut decomposer = BasicBlockDecomposer::new(&graph, func).unwrap();
        let subgraph = decomposer.decompose().unwrap();

        // [0, 8) code, [8, 13) code, [13, 15) code, [15, 16) padding.
        let bbs = ranges_of(&subgraph, 16);
        assert_eq!(
            bbs,
            vec![
                (0, 8, BasicBlockType::BasicCode),
                (8, 5, BasicBlockType::BasicCode),
                (13, 2, BasicBlockType::BasicCode),
                (15, 1, BasicBlockType::BasicPadding),
            ]
        );

        // The entry block ends in [taken je -> 13, fall-through -> 8].
        let entry = subgraph
            .basic_blocks()
            .find(|bb| bb.offset() == Some(0))
            .unwrap();
        let code = entry.as_code().unwrap();
        assert_eq!(code.instructions.len(), 3);
        assert_eq!(code.successors.len(), 2);
        assert_eq!(code.successors[0].condition(), Condition::Equal);
        assert_eq!(code.successors[1].condition(), Condition::NotEqual);
        assert!(code.successors[1].is_synthesized());

        // Both successors resolved to basic blocks.
        let taken_bb = code.successors[0].reference().unwrap().basic_block().unwrap();
        assert_eq!(subgraph.basic_block(taken_bb).unwrap().offset(), Some(13));
        let fall_bb = code.successors[1].reference().unwrap().basic_block().unwrap();
        assert_eq!(subgraph.basic_block(fall_bb).unwrap().offset(), Some(8));

        // The middle block was split at the jump target and flows through.
        let middle = subgraph
            .basic_blocks()
            .find(|bb| bb.offset() == Some(8))
            .unwrap();
        let code = middle.as_code().unwrap();
        assert_eq!(code.successors.len(), 1);
        assert_eq!(code.successors[0].condition(), Condition::True);

        // The external referrer landed on the entry basic block.
        assert_eq!(entry.referrers.len(), 1);

        // One description, in layout order.
        assert_eq!(subgraph.block_descriptions().len(), 1);
        let order = &subgraph.block_descriptions()[0].basic_block_order;
        assert_eq!(order.len(), 4);
        assert_eq!(subgraph.basic_block(order[0]).unwrap().offset(), Some(0));
    }

    #[test]
    fn decomposes_jump_table() {
        let mut graph = BlockGraph::new();
        // jmp [eax*4 + table]; 3-entry table; ret; ret; ret.
        let bytes: Vec<u8> = vec![
            0xFF, 0x24, 0x85, 0, 0, 0, 0, // 0: jmp [eax*4 + disp32]
            0, 0, 0, 0, // 7: table[0] -> 19
            0, 0, 0, 0, // 11: table[1] -> 20
            0, 0, 0, 0, // 15: table[2] -> 21
            0xC3, // 19: ret
            0xC3, // 20: ret
            0xC3, // 21: ret
        ];
        let func = graph.add_block(BlockType::Code, bytes.len() as u32, "dispatch");
        graph.block_mut(func).unwrap().copy_data(&bytes);
        {
            let block = graph.block_mut(func).unwrap();
            block.set_label(
                7,
                Label::new("table", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE),
            );
            block.set_label(19, Label::new("case", LabelAttributes::CODE));
        }
        graph
            .set_reference(func, 3, Reference::direct(ReferenceType::Absolute, 4, func, 7))
            .unwrap();
        graph
            .set_reference(func, 7, Reference::direct(ReferenceType::Absolute, 4, func, 19))
            .unwrap();
        graph
            .set_reference(func, 11, Reference::direct(ReferenceType::Absolute, 4, func, 20))
            .unwrap();
        graph
            .set_reference(func, 15, Reference::direct(ReferenceType::Absolute, 4, func, 21))
            .unwrap();
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();

        let mut decomposer = BasicBlockDecomposer::new(&graph, func).unwrap();
        let subgraph = decomposer.decompose().unwrap();

        let bbs = ranges_of(&subgraph, 22);
        assert_eq!(
            bbs,
            vec![
                (0, 7, BasicBlockType::BasicCode),
                (7, 12, BasicBlockType::BasicData),
                (19, 1, BasicBlockType::BasicCode),
                (20, 1, BasicBlockType::BasicCode),
                (21, 1, BasicBlockType::BasicCode),
            ]
        );

        // The computed jump stays an instruction with its table reference.
        let dispatch = subgraph.basic_blocks().find(|bb| bb.offset() == Some(0)).unwrap();
        let code = dispatch.as_code().unwrap();
        assert_eq!(code.instructions.len(), 1);
        assert!(code.successors.is_empty());
        let table_ref = code.instructions[0].references().get(&3).unwrap();
        assert!(table_ref.basic_block().is_some());

        // The table carries a reference per case, labeled as a jump table.
        let table = subgraph.basic_blocks().find(|bb| bb.offset() == Some(7)).unwrap();
        assert!(table.label().unwrap().has_attributes(LabelAttributes::JUMP_TABLE));
        let data = table.as_data().unwrap();
        assert_eq!(data.references.len(), 3);
        assert!(data.references.contains_key(&0));
        assert!(data.references.contains_key(&4));
        assert!(data.references.contains_key(&8));
    }

    #[test]
    fn non_returning_call_ends_the_block() {
        let mut graph = BlockGraph::new();
        let noret = graph.add_block(BlockType::Code, 1, "_CxxThrowException");
        graph
            .block_mut(noret)
            .unwrap()
            .set_attribute(BlockAttributes::NON_RETURN_FUNCTION);

        // call noret; int3; int3 (unreachable tail, still disassembled)
        let bytes = [0xE8, 0x00, 0x00, 0x00, 0x00, 0xCC, 0xCC];
        let func = graph.add_block(BlockType::Code, bytes.len() as u32, "thrower");
        graph.block_mut(func).unwrap().copy_data(&bytes);
        graph
            .set_reference(func, 1, Reference::direct(ReferenceType::PcRelative, 4, noret, 0))
            .unwrap();
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();

        let mut decomposer = BasicBlockDecomposer::new(&graph, func).unwrap();
        let subgraph = decomposer.decompose().unwrap();

        let bbs = ranges_of(&subgraph, 7);
        // The call run ends at the non-returning call; the unreachable
        // bytes after it form their own (code) basic block.
        assert_eq!(bbs[0], (0, 5, BasicBlockType::BasicCode));
        let entry = subgraph.basic_blocks().find(|bb| bb.offset() == Some(0)).unwrap();
        assert!(entry.as_code().unwrap().successors.is_empty());
    }

    #[test]
    fn unsupported_instructions_are_reported() {
        let mut graph = BlockGraph::new();
        // 0x0F 0x04 is not a defined opcode.
        let bytes = [0x0F, 0x04, 0xC3];
        let func = graph.add_block(BlockType::Code, bytes.len() as u32, "weird");
        graph.block_mut(func).unwrap().copy_data(&bytes);
        let caller = graph.add_block(BlockType::Data, 4, "caller");
        graph
            .set_reference(caller, 0, Reference::direct(ReferenceType::Absolute, 4, func, 0))
            .unwrap();

        let mut decomposer = BasicBlockDecomposer::new(&graph, func).unwrap();
        assert!(decomposer.decompose().is_err());
        assert!(decomposer.contains_unsupported_instructions());
    }

    #[test]
    fn refuses_unsafe_blocks() {
        let mut graph = BlockGraph::new();
        let func = graph.add_block(BlockType::Code, 4, "asm");
        graph.block_mut(func).unwrap().copy_data(&[0xC3, 0xCC, 0xCC, 0xCC]);
        graph
            .block_mut(func)
            .unwrap()
            .set_attribute(BlockAttributes::HAS_INLINE_ASSEMBLY);
        assert!(BasicBlockDecomposer::new(&graph, func).is_err());
    }
}
