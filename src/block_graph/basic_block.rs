//! The fine-grained view of one code block under transformation.
//!
//! A [`BasicBlockSubGraph`] owns a set of basic blocks of three kinds —
//! straight-line code with up to two successors, uninterpreted data (jump
//! and case tables living inside a function), and padding runs — plus block
//! descriptions that group basic blocks into an ordered layout. When the
//! subgraph is handed back to the
//! [`BlockBuilder`](crate::block_graph::block_builder::BlockBuilder) each
//! description becomes one new top-level block.
//!
//! Subgraph elements own copies of their bytes, so transforms can mutate the
//! graph and the subgraph freely without aliasing the original block's data.

use std::collections::{BTreeMap, BTreeSet};

use crate::block_graph::{
    BlockAttributes, BlockId, BlockType, Label, ReferenceType, SectionId, SourceRange,
};

pub type BasicBlockId = u32;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum BasicBlockType {
    BasicCode,
    BasicData,
    BasicPadding,
}

/// What a subgraph-local reference points at: either a block in the
/// enclosing graph or another basic block in this subgraph.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReferenceTarget {
    Block(BlockId),
    BasicBlock(BasicBlockId),
}

/// The subgraph-local analog of a
/// [`Reference`](crate::block_graph::Reference). References to basic blocks
/// are always direct (offset and base zero): a basic block is an
/// indivisible entity until it is laid out again.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BasicBlockReference {
    kind: ReferenceType,
    size: u8,
    target: ReferenceTarget,
    offset: i32,
    base: u32,
}

impl BasicBlockReference {
    /// A reference to a location in a block of the enclosing graph.
    pub fn to_block(kind: ReferenceType, size: u8, block: BlockId, offset: i32, base: u32) -> Self {
        BasicBlockReference { kind, size, target: ReferenceTarget::Block(block), offset, base }
    }

    /// A direct reference to a basic block of this subgraph.
    pub fn to_basic_block(kind: ReferenceType, size: u8, bb: BasicBlockId) -> Self {
        BasicBlockReference { kind, size, target: ReferenceTarget::BasicBlock(bb), offset: 0, base: 0 }
    }

    pub fn kind(&self) -> ReferenceType {
        self.kind
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn target(&self) -> ReferenceTarget {
        self.target
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn block(&self) -> Option<BlockId> {
        match self.target {
            ReferenceTarget::Block(id) => Some(id),
            ReferenceTarget::BasicBlock(_) => None,
        }
    }

    pub fn basic_block(&self) -> Option<BasicBlockId> {
        match self.target {
            ReferenceTarget::BasicBlock(id) => Some(id),
            ReferenceTarget::Block(_) => None,
        }
    }
}

/// The branching condition of a [`Successor`]: the sixteen x86 condition
/// codes, the unconditional `True`, and the loop/counter pseudo-conditions
/// with their (non-encodable) inverses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Condition {
    Overflow,
    NoOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    ParityEven,
    ParityOdd,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    True,
    CounterIsZero,
    Loop,
    LoopEqual,
    LoopNotEqual,
    InverseCounterIsZero,
    InverseLoop,
    InverseLoopEqual,
    InverseLoopNotEqual,
}

impl Condition {
    /// Maps an x86 `tttn` condition code (the low nibble of a Jcc opcode) to
    /// a condition.
    pub fn from_condition_code(cc: u8) -> Option<Condition> {
        use Condition::*;
        Some(match cc {
            0 => Overflow,
            1 => NoOverflow,
            2 => Below,
            3 => AboveOrEqual,
            4 => Equal,
            5 => NotEqual,
            6 => BelowOrEqual,
            7 => Above,
            8 => Sign,
            9 => NotSign,
            10 => ParityEven,
            11 => ParityOdd,
            12 => Less,
            13 => GreaterOrEqual,
            14 => LessOrEqual,
            15 => Greater,
            _ => return None,
        })
    }

    /// The `tttn` condition code, for the sixteen encodable conditions.
    pub fn condition_code(self) -> Option<u8> {
        use Condition::*;
        Some(match self {
            Overflow => 0,
            NoOverflow => 1,
            Below => 2,
            AboveOrEqual => 3,
            Equal => 4,
            NotEqual => 5,
            BelowOrEqual => 6,
            Above => 7,
            Sign => 8,
            NotSign => 9,
            ParityEven => 10,
            ParityOdd => 11,
            Less => 12,
            GreaterOrEqual => 13,
            LessOrEqual => 14,
            Greater => 15,
            _ => return None,
        })
    }

    /// The branch-not-taken condition. Total except for `True`, which has no
    /// complement.
    pub fn invert(self) -> Option<Condition> {
        use Condition::*;
        if let Some(cc) = self.condition_code() {
            return Condition::from_condition_code(cc ^ 1);
        }
        Some(match self {
            True => return None,
            CounterIsZero => InverseCounterIsZero,
            Loop => InverseLoop,
            LoopEqual => InverseLoopEqual,
            LoopNotEqual => InverseLoopNotEqual,
            InverseCounterIsZero => CounterIsZero,
            InverseLoop => Loop,
            InverseLoopEqual => LoopEqual,
            InverseLoopNotEqual => LoopNotEqual,
            _ => unreachable!(),
        })
    }
}

/// A decoded instruction carried by a basic code block: its raw bytes, an
/// optional label that fell on its boundary, the symbolic references living
/// inside its bytes, and the source range its bytes came from.
#[derive(Clone, Debug)]
pub struct Instruction {
    data: Vec<u8>,
    offset: Option<u32>,
    label: Option<Label>,
    references: BTreeMap<u32, BasicBlockReference>,
    source_range: Option<SourceRange>,
}

impl Instruction {
    pub fn new(data: Vec<u8>) -> Self {
        Instruction { data, offset: None, label: None, references: BTreeMap::new(), source_range: None }
    }

    /// An instruction lifted out of an original block at `offset`.
    pub fn from_block_bytes(data: Vec<u8>, offset: u32) -> Self {
        Instruction {
            data,
            offset: Some(offset),
            label: None,
            references: BTreeMap::new(),
            source_range: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// The offset in the original block, if these bytes came from one.
    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn set_label(&mut self, label: Label) {
        self.label = Some(label);
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    pub fn references(&self) -> &BTreeMap<u32, BasicBlockReference> {
        &self.references
    }

    pub fn references_mut(&mut self) -> &mut BTreeMap<u32, BasicBlockReference> {
        &mut self.references
    }

    pub fn set_reference(&mut self, offset: u32, reference: BasicBlockReference) -> bool {
        self.references.insert(offset, reference).is_none()
    }

    pub fn source_range(&self) -> Option<SourceRange> {
        self.source_range
    }

    pub fn set_source_range(&mut self, source_range: SourceRange) {
        self.source_range = Some(source_range);
    }
}

/// Where a successor's control flow goes before and after resolution: an
/// offset into the original block (to be wired to a basic block once all
/// splits are done), or a full reference.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SuccessorTarget {
    Offset(u32),
    Reference(BasicBlockReference),
}

/// An outgoing control-flow arc of a basic code block.
#[derive(Clone, Debug)]
pub struct Successor {
    condition: Condition,
    target: SuccessorTarget,
    /// Offset and size of the branch instruction this successor was lifted
    /// from; `None` for synthesized fall-through arcs.
    instruction_offset: Option<u32>,
    instruction_size: u32,
    label: Option<Label>,
    source_range: Option<SourceRange>,
}

impl Successor {
    pub fn new(
        condition: Condition,
        target: SuccessorTarget,
        instruction_offset: Option<u32>,
        instruction_size: u32,
    ) -> Self {
        Successor {
            condition,
            target,
            instruction_offset,
            instruction_size,
            label: None,
            source_range: None,
        }
    }

    /// A synthesized fall-through arc to `target_offset` in the original
    /// block.
    pub fn fall_through(target_offset: u32) -> Self {
        Successor::new(Condition::True, SuccessorTarget::Offset(target_offset), None, 0)
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn set_condition(&mut self, condition: Condition) {
        self.condition = condition;
    }

    pub fn target(&self) -> &SuccessorTarget {
        &self.target
    }

    pub fn reference(&self) -> Option<&BasicBlockReference> {
        match &self.target {
            SuccessorTarget::Reference(r) => Some(r),
            SuccessorTarget::Offset(_) => None,
        }
    }

    pub fn set_reference(&mut self, reference: BasicBlockReference) {
        self.target = SuccessorTarget::Reference(reference);
    }

    /// The unresolved target offset, before successor wiring.
    pub fn bb_target_offset(&self) -> Option<u32> {
        match self.target {
            SuccessorTarget::Offset(o) => Some(o),
            SuccessorTarget::Reference(_) => None,
        }
    }

    pub fn instruction_offset(&self) -> Option<u32> {
        self.instruction_offset
    }

    pub fn instruction_size(&self) -> u32 {
        self.instruction_size
    }

    /// True iff this successor was synthesized rather than lifted from an
    /// explicit branch instruction.
    pub fn is_synthesized(&self) -> bool {
        self.instruction_offset.is_none()
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn set_label(&mut self, label: Label) {
        self.label = Some(label);
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    pub fn source_range(&self) -> Option<SourceRange> {
        self.source_range
    }

    pub fn set_source_range(&mut self, source_range: SourceRange) {
        self.source_range = Some(source_range);
    }
}

/// A basic code block: ordered instructions plus up to two successors.
#[derive(Clone, Debug, Default)]
pub struct BasicCodeBlock {
    pub instructions: Vec<Instruction>,
    pub successors: Vec<Successor>,
}

impl BasicCodeBlock {
    /// The number of bytes the instructions occupy, successors excluded.
    pub fn instruction_byte_size(&self) -> u32 {
        self.instructions.iter().map(Instruction::size).sum()
    }
}

/// A basic data (or padding) block: an uninterpreted byte run with
/// block-level references.
#[derive(Clone, Debug, Default)]
pub struct BasicDataBlock {
    pub data: Vec<u8>,
    pub references: BTreeMap<u32, BasicBlockReference>,
    pub source_range: Option<SourceRange>,
}

impl BasicDataBlock {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

#[derive(Clone, Debug)]
pub enum BasicBlockKind {
    Code(BasicCodeBlock),
    Data(BasicDataBlock),
    Padding(BasicDataBlock),
}

/// One node of a [`BasicBlockSubGraph`].
#[derive(Clone, Debug)]
pub struct BasicBlock {
    id: BasicBlockId,
    name: String,
    /// Offset in the original block, for basic blocks lifted from one.
    offset: Option<u32>,
    label: Option<Label>,
    /// External blocks pointing at this basic block. Tracked here (with no
    /// mirrored reference update) so the block builder can redirect them to
    /// the basic block's final home.
    pub referrers: BTreeSet<(BlockId, u32)>,
    kind: BasicBlockKind,
}

impl BasicBlock {
    pub fn id(&self) -> BasicBlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u32) {
        self.offset = Some(offset);
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn set_label(&mut self, label: Label) {
        self.label = Some(label);
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    pub fn block_type(&self) -> BasicBlockType {
        match self.kind {
            BasicBlockKind::Code(_) => BasicBlockType::BasicCode,
            BasicBlockKind::Data(_) => BasicBlockType::BasicData,
            BasicBlockKind::Padding(_) => BasicBlockType::BasicPadding,
        }
    }

    pub fn kind(&self) -> &BasicBlockKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut BasicBlockKind {
        &mut self.kind
    }

    pub fn as_code(&self) -> Option<&BasicCodeBlock> {
        match &self.kind {
            BasicBlockKind::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut BasicCodeBlock> {
        match &mut self.kind {
            BasicBlockKind::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&BasicDataBlock> {
        match &self.kind {
            BasicBlockKind::Data(data) | BasicBlockKind::Padding(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_data_mut(&mut self) -> Option<&mut BasicDataBlock> {
        match &mut self.kind {
            BasicBlockKind::Data(data) | BasicBlockKind::Padding(data) => Some(data),
            _ => None,
        }
    }
}

/// Groups basic blocks into the ordered layout of one future block.
#[derive(Clone, Debug)]
pub struct BlockDescription {
    pub name: String,
    pub block_type: BlockType,
    pub section: SectionId,
    pub alignment: u32,
    pub attributes: BlockAttributes,
    pub basic_block_order: Vec<BasicBlockId>,
}

/// A local, fine-grained decomposition of one code block.
#[derive(Default)]
pub struct BasicBlockSubGraph {
    original_block: Option<BlockId>,
    basic_blocks: BTreeMap<BasicBlockId, BasicBlock>,
    block_descriptions: Vec<BlockDescription>,
    next_id: BasicBlockId,
}

impl BasicBlockSubGraph {
    pub fn new() -> Self {
        BasicBlockSubGraph::default()
    }

    pub fn original_block(&self) -> Option<BlockId> {
        self.original_block
    }

    pub fn set_original_block(&mut self, block: Option<BlockId>) {
        self.original_block = block;
    }

    pub fn basic_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.basic_blocks.values()
    }

    pub fn basic_blocks_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.basic_blocks.values_mut()
    }

    pub fn basic_block(&self, id: BasicBlockId) -> Option<&BasicBlock> {
        self.basic_blocks.get(&id)
    }

    pub fn basic_block_mut(&mut self, id: BasicBlockId) -> Option<&mut BasicBlock> {
        self.basic_blocks.get_mut(&id)
    }

    pub fn basic_block_count(&self) -> usize {
        self.basic_blocks.len()
    }

    pub fn remove_basic_block(&mut self, id: BasicBlockId) -> Option<BasicBlock> {
        self.basic_blocks.remove(&id)
    }

    fn add(&mut self, name: impl Into<String>, kind: BasicBlockKind) -> BasicBlockId {
        let id = self.next_id;
        self.next_id += 1;
        self.basic_blocks.insert(
            id,
            BasicBlock {
                id,
                name: name.into(),
                offset: None,
                label: None,
                referrers: BTreeSet::new(),
                kind,
            },
        );
        id
    }

    pub fn add_basic_code_block(&mut self, name: impl Into<String>) -> BasicBlockId {
        self.add(name, BasicBlockKind::Code(BasicCodeBlock::default()))
    }

    pub fn add_basic_data_block(&mut self, name: impl Into<String>, data: Vec<u8>) -> BasicBlockId {
        self.add(
            name,
            BasicBlockKind::Data(BasicDataBlock { data, ..BasicDataBlock::default() }),
        )
    }

    pub fn add_basic_padding_block(
        &mut self,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> BasicBlockId {
        self.add(
            name,
            BasicBlockKind::Padding(BasicDataBlock { data, ..BasicDataBlock::default() }),
        )
    }

    pub fn block_descriptions(&self) -> &[BlockDescription] {
        &self.block_descriptions
    }

    pub fn block_descriptions_mut(&mut self) -> &mut Vec<BlockDescription> {
        &mut self.block_descriptions
    }

    pub fn add_block_description(
        &mut self,
        name: impl Into<String>,
        block_type: BlockType,
        section: SectionId,
        alignment: u32,
        attributes: BlockAttributes,
    ) -> &mut BlockDescription {
        self.block_descriptions.push(BlockDescription {
            name: name.into(),
            block_type,
            section,
            alignment,
            attributes,
            basic_block_order: Vec::new(),
        });
        self.block_descriptions.last_mut().unwrap()
    }

    /// Checks the structural invariants of the subgraph: descriptions only
    /// reference basic blocks that exist, no basic block appears in two
    /// descriptions, code basic blocks have at most two successors, and a
    /// pair of successors carries inverse conditions.
    pub fn is_valid(&self) -> bool {
        let mut seen = BTreeSet::new();
        for description in &self.block_descriptions {
            for &bb in &description.basic_block_order {
                if !self.basic_blocks.contains_key(&bb) || !seen.insert(bb) {
                    return false;
                }
            }
        }

        for bb in self.basic_blocks.values() {
            let Some(code) = bb.as_code() else {
                continue;
            };
            match code.successors.len() {
                0 | 1 => {}
                2 => {
                    let a = code.successors[0].condition();
                    let b = code.successors[1].condition();
                    if a.invert() != Some(b) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_graph::LabelAttributes;

    #[test]
    fn condition_codes_and_inverses() {
        assert_eq!(Condition::from_condition_code(4), Some(Condition::Equal));
        assert_eq!(Condition::Equal.condition_code(), Some(4));
        assert_eq!(Condition::Equal.invert(), Some(Condition::NotEqual));
        assert_eq!(Condition::Below.invert(), Some(Condition::AboveOrEqual));
        assert_eq!(Condition::True.invert(), None);
        assert_eq!(Condition::Loop.invert(), Some(Condition::InverseLoop));
        assert_eq!(Condition::InverseLoop.invert(), Some(Condition::Loop));
        // Inverting twice round-trips each of the sixteen codes.
        for cc in 0..16 {
            let c = Condition::from_condition_code(cc).unwrap();
            assert_eq!(c.invert().unwrap().invert(), Some(c));
        }
    }

    #[test]
    fn subgraph_validity() {
        let mut subgraph = BasicBlockSubGraph::new();
        let bb1 = subgraph.add_basic_code_block("bb1");
        let bb2 = subgraph.add_basic_code_block("bb2");

        {
            let code = subgraph.basic_block_mut(bb1).unwrap().as_code_mut().unwrap();
            code.successors.push(Successor::new(
                Condition::Equal,
                SuccessorTarget::Reference(BasicBlockReference::to_basic_block(
                    ReferenceType::PcRelative,
                    4,
                    bb2,
                )),
                Some(0),
                2,
            ));
            code.successors.push(Successor::new(
                Condition::NotEqual,
                SuccessorTarget::Reference(BasicBlockReference::to_basic_block(
                    ReferenceType::PcRelative,
                    4,
                    bb2,
                )),
                None,
                0,
            ));
        }

        let description = subgraph.add_block_description(
            "f",
            BlockType::Code,
            0,
            1,
            BlockAttributes::empty(),
        );
        description.basic_block_order.push(bb1);
        description.basic_block_order.push(bb2);
        assert!(subgraph.is_valid());

        // Non-inverse successor pair.
        subgraph
            .basic_block_mut(bb1)
            .unwrap()
            .as_code_mut()
            .unwrap()
            .successors[1]
            .set_condition(Condition::Above);
        assert!(!subgraph.is_valid());
    }

    #[test]
    fn instruction_carries_labels_and_references() {
        let mut inst = Instruction::from_block_bytes(vec![0xE8, 0, 0, 0, 0], 10);
        assert_eq!(inst.size(), 5);
        assert_eq!(inst.offset(), Some(10));
        inst.set_label(Label::new("call", LabelAttributes::CODE));
        assert!(inst.has_label());
        assert!(inst.set_reference(
            1,
            BasicBlockReference::to_block(ReferenceType::PcRelative, 4, 7, 0, 0)
        ));
        assert_eq!(inst.references().len(), 1);
    }
}
