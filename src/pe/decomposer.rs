//! Rebuilds a whole block graph and image layout from a PE image plus its
//! PDB-derived debug data.
//!
//! The pipeline reconciles three views of the same bytes against each
//! other: the image itself (section headers, relocations, instruction
//! bytes), the linker's FIXUP stream, and the symbol records. Every
//! reference discovered along the way is first collected in an
//! address-to-address intermediate form, cross-checked against the fixups,
//! and only finalized into block-to-block references once every block
//! exists. A decomposition is complete when every byte of every section
//! lives in exactly one block and every fixup has been accounted for.

use std::collections::{BTreeMap, BTreeSet};

use log::{error, warn};
use regex::Regex;
use scroll::{Pread, LE};

use crate::address::{Address, RelativeAddress};
use crate::block_graph::block_util::{
    code_block_attributes_are_basic_block_safe, repeated_value,
};
use crate::block_graph::{
    serialization, BlockAddressSpace, BlockAttributes, BlockGraph, BlockId, BlockType, DataRange,
    Label, LabelAttributes, Reference, ReferenceType, SourceRange,
};
use crate::disasm::{self, FlowClass};
use crate::error::{Error, Result};
use crate::pe::pdb::{self, ChildKind, DebugData};
use crate::pe::{ImageLayout, LayoutSection, PeImage, SectionType, RESOURCE_SECTION_NAME};

const POINTER_SIZE: u8 = 4;
const INT3: u8 = 0xCC;

/// Functions known to never return, whatever their symbols claim.
const NON_RETURNING_FUNCTIONS_RE: &str = "_CxxThrowException";

// The bracketing symbol patterns the CRT emits around must-stay-contiguous
// initializer runs.
const STATIC_INITIALIZER_PATTERNS: &[(&str, &str)] = &[
    // CRT C/C++ initializers.
    ("(__x.*)_a", "(__x.*)_z"),
    // Run-time checks initializers (also part of the CRT).
    ("(__rtc_[it])aa", "(__rtc_[it])zz"),
    // ATL object map initializers.
    ("(__pobjMapEntry)First", "(__pobjMapEntry)Last"),
    // Thread-local storage template.
    ("(_tls_)start", "(_tls_)end"),
];

/// The output of a decomposition.
pub struct DecomposedImage<'a> {
    pub graph: BlockGraph<'a>,
    pub image_layout: ImageLayout,
    /// The block holding the DOS header; transforms must keep it alive.
    pub header_block: BlockId,
}

struct FixupEntry {
    kind: ReferenceType,
    base: RelativeAddress,
    visited: bool,
}

// An address-to-address reference awaiting block resolution: the referenced
// entity lives at `base`, the encoded destination `offset` bytes away.
#[derive(Copy, Clone, Debug)]
struct IntermediateReference {
    kind: ReferenceType,
    size: u8,
    base: RelativeAddress,
    offset: i64,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ValidateMode {
    // Validate against a fixup if one exists, then record the reference.
    FixupMayExist,
    // A fixup must exist; validate and do not record a new reference.
    FixupMustExist,
    // No fixup may exist; record the reference.
    FixupMustNotExist,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum FindOrCreateDirective {
    ExpectNoBlock,
    AllowCoveringBlock,
}

struct Context<'a> {
    graph: BlockGraph<'a>,
    image: BlockAddressSpace,
    fixup_map: BTreeMap<RelativeAddress, FixupEntry>,
    references: BTreeMap<RelativeAddress, IntermediateReference>,
    reloc_set: BTreeSet<RelativeAddress>,
    header_block: Option<BlockId>,
}

/// Decomposes a PE image plus its debug data into a block graph.
pub struct Decomposer<'a, P: PeImage> {
    pe: &'a P,
    debug_data: &'a DebugData,
    non_returning_re: Regex,
    initializer_patterns: Vec<(Regex, Regex)>,
}

impl<'a, P: PeImage> Decomposer<'a, P> {
    pub fn new(pe: &'a P, debug_data: &'a DebugData) -> Result<Self> {
        let mut decomposer = Decomposer {
            pe,
            debug_data,
            non_returning_re: compile_anchored(NON_RETURNING_FUNCTIONS_RE)?,
            initializer_patterns: Vec::new(),
        };
        for &(begin, end) in STATIC_INITIALIZER_PATTERNS {
            decomposer.register_static_initializer_patterns(begin, end)?;
        }
        Ok(decomposer)
    }

    /// Registers an extra pair of bracketing-symbol patterns. Each pattern
    /// must carry exactly one capture group; the captured text pairs a
    /// begin symbol with its end symbol.
    pub fn register_static_initializer_patterns(&mut self, begin: &str, end: &str) -> Result<()> {
        let begin = compile_anchored(begin)?;
        let end = compile_anchored(end)?;
        if begin.captures_len() != 2 || end.captures_len() != 2 {
            return Err(Error::Malformed(
                "initializer patterns need exactly one capture group".to_string(),
            ));
        }
        self.initializer_patterns.push((begin, end));
        Ok(())
    }

    pub fn decompose(&self) -> Result<DecomposedImage<'a>> {
        // Fast path: a previous decomposition serialized into the PDB. A
        // present-but-unloadable stream is an error, not a fallback.
        if let Some(stream) = &self.debug_data.block_graph_stream {
            return self.load_from_stream(stream);
        }

        let mut ctx = Context {
            graph: BlockGraph::new(),
            image: BlockAddressSpace::new(),
            fixup_map: BTreeMap::new(),
            references: BTreeMap::new(),
            reloc_set: BTreeSet::new(),
            header_block: None,
        };

        self.create_sections(&mut ctx)?;
        self.load_fixups(&mut ctx)?;
        self.create_references_from_fixups(&mut ctx)?;
        self.create_pe_image_blocks_and_references(&mut ctx)?;
        self.parse_relocs(&mut ctx)?;
        self.create_blocks_from_section_contribs(&mut ctx)?;
        self.process_function_symbols(&mut ctx)?;
        self.process_data_symbols(&mut ctx)?;
        self.create_global_labels(&mut ctx)?;
        self.create_gap_blocks(&mut ctx)?;
        self.process_public_symbols(&mut ctx)?;
        self.process_static_initializers(&mut ctx)?;
        self.guess_data_block_alignments(&mut ctx)?;
        self.create_code_references(&mut ctx)?;
        self.finalize_intermediate_references(&mut ctx)?;
        self.confirm_fixups_visited(&ctx)?;
        self.find_padding_blocks(&mut ctx)?;

        let header_block = ctx
            .header_block
            .ok_or_else(|| Error::Decomposition("image has no header blocks".to_string()))?;

        let mut image_layout = ImageLayout::new();
        image_layout.sections =
            self.pe.sections().iter().map(LayoutSection::from_header).collect();
        image_layout.blocks = ctx.image;

        Ok(DecomposedImage { graph: ctx.graph, image_layout, header_block })
    }

    fn load_from_stream(&self, stream: &[u8]) -> Result<DecomposedImage<'a>> {
        let loaded = serialization::load(stream)?;
        let mut graph = loaded.graph;
        let address_space = loaded.address_space;

        // Re-bind borrowed data pointers against the image buffer.
        for id in graph.block_ids() {
            let block = graph.block(id).unwrap();
            if !block.needs_data_rebind() {
                continue;
            }
            let data_size = block.data_size();
            let addr = address_space.address_of(id).ok_or_else(|| {
                Error::Serialization(format!(
                    "block '{}' has unbound data but no placement",
                    block.name()
                ))
            })?;
            let data = self.pe.image_data(addr, data_size).ok_or_else(|| {
                Error::Serialization(format!(
                    "image bytes at {addr} are gone; cannot re-bind block data"
                ))
            })?;
            graph.block_mut(id).unwrap().set_data(data);
        }

        let header_block = address_space
            .get_block_by_address(RelativeAddress(0))
            .ok_or_else(|| Error::Serialization("stream carries no header block".to_string()))?;

        let mut image_layout = ImageLayout::new();
        image_layout.sections =
            self.pe.sections().iter().map(LayoutSection::from_header).collect();
        image_layout.blocks = address_space;

        Ok(DecomposedImage { graph, image_layout, header_block })
    }

    // -- Step 2: sections. --

    fn create_sections(&self, ctx: &mut Context<'a>) -> Result<()> {
        for (i, header) in self.pe.sections().iter().enumerate() {
            let id = ctx.graph.add_section(header.name.as_str(), header.characteristics);
            if id != i as u32 {
                return Err(Error::Consistency(format!(
                    "section '{}' came out with id {} instead of {}",
                    header.name, id, i
                )));
            }
        }
        Ok(())
    }

    // -- Step 3: fixups. --

    fn load_fixups(&self, ctx: &mut Context<'a>) -> Result<()> {
        // A tool that rewrites the resource section post-link invalidates
        // every fixup at or beyond it. That is tolerable only while .rsrc
        // is the last section.
        let mut rsrc_start = RelativeAddress(u32::MAX);
        let mut max_start = RelativeAddress(0);
        for header in self.pe.sections() {
            if header.virtual_address > max_start {
                max_start = header.virtual_address;
            }
            if header.name == RESOURCE_SECTION_NAME {
                rsrc_start = header.virtual_address;
            }
        }
        if max_start > rsrc_start {
            return Err(Error::Consistency(format!(
                "{RESOURCE_SECTION_NAME} is not the last section"
            )));
        }

        let have_omap = !self.debug_data.omap_from.is_empty();
        for fixup in &self.debug_data.fixups {
            // Offset fixups only show up for TLS data access; TLS
            // structures are left alone.
            if fixup.is_offset {
                continue;
            }

            let mut location = fixup.location;
            let mut base = fixup.base;
            if have_omap {
                location = pdb::translate_address_via_omap(&self.debug_data.omap_from, location);
                base = pdb::translate_address_via_omap(&self.debug_data.omap_from, base);
            }

            if location >= rsrc_start {
                continue;
            }

            if !self.pe.contains(location, u32::from(POINTER_SIZE)) || !self.pe.contains(base, 1) {
                return Err(Error::Consistency(format!(
                    "fixup at {location} refers outside the image"
                )));
            }

            let entry =
                FixupEntry { kind: fixup.kind.reference_type(), base, visited: false };
            if ctx.fixup_map.insert(location, entry).is_some() {
                return Err(Error::Consistency(format!("colliding fixups at {location}")));
            }
        }
        Ok(())
    }

    fn create_references_from_fixups(&self, ctx: &mut Context<'a>) -> Result<()> {
        let locations: Vec<(RelativeAddress, ReferenceType, RelativeAddress)> = ctx
            .fixup_map
            .iter()
            .map(|(&l, e)| (l, e.kind, e.base))
            .collect();
        for (location, kind, base) in locations {
            let bytes = self
                .pe
                .image_data(location, u32::from(POINTER_SIZE))
                .ok_or_else(|| {
                    Error::Consistency(format!("fixup at {location} has no backing bytes"))
                })?;
            let value: u32 = bytes.pread_with(0, LE)?;

            // Interpret the patched bytes per the fixup kind to recover the
            // destination the code actually encodes.
            let dst = match kind {
                ReferenceType::Absolute => self
                    .pe
                    .translate_to_relative(crate::address::AbsoluteAddress(value))
                    .ok_or_else(|| {
                        Error::Consistency(format!(
                            "absolute fixup at {location} points outside the image"
                        ))
                    })?,
                ReferenceType::Relative => RelativeAddress(value),
                ReferenceType::PcRelative => RelativeAddress(
                    (location.value() + u32::from(POINTER_SIZE)).wrapping_add(value),
                ),
                ReferenceType::FileOffset => {
                    return Err(Error::Consistency(
                        "file-offset fixups do not occur in the FIXUP stream".to_string(),
                    ));
                }
            };

            add_reference(&mut ctx.references, location, kind, POINTER_SIZE, base, dst - base)?;
        }
        Ok(())
    }

    // -- Step 4: PE-parsed header structures. --

    fn create_pe_image_blocks_and_references(&self, ctx: &mut Context<'a>) -> Result<()> {
        let header_blocks = self.pe.header_blocks();
        if header_blocks.is_empty() {
            return Err(Error::Decomposition("the PE parser carved no blocks".to_string()));
        }
        for hb in &header_blocks {
            let id = self.create_block(ctx, hb.block_type, hb.addr, hb.size, &hb.name)?;
            ctx.graph.block_mut(id).unwrap().set_attribute(BlockAttributes::PE_PARSED);
            ctx.header_block.get_or_insert(id);

            for parsed in &hb.references {
                validate_or_add_reference(
                    ctx,
                    ValidateMode::FixupMayExist,
                    hb.addr.offset_by(parsed.offset),
                    parsed.kind,
                    parsed.size,
                    parsed.target,
                    0,
                )?;
            }
        }
        Ok(())
    }

    // -- Step 4b: relocations. --

    fn parse_relocs(&self, ctx: &mut Context<'a>) -> Result<()> {
        for (&location, &abs_target) in self.pe.relocs() {
            ctx.reloc_set.insert(location);
            let target = self.pe.translate_to_relative(abs_target).ok_or_else(|| {
                Error::Consistency(format!("reloc at {location} targets outside the image"))
            })?;
            // Every base relocation must be backed by an absolute fixup.
            validate_or_add_reference(
                ctx,
                ValidateMode::FixupMustExist,
                location,
                ReferenceType::Absolute,
                POINTER_SIZE,
                target,
                0,
            )?;
        }
        Ok(())
    }

    // -- Step 5: section contributions. --

    fn create_blocks_from_section_contribs(&self, ctx: &mut Context<'a>) -> Result<()> {
        let rsrc = self
            .pe
            .sections()
            .iter()
            .position(|s| s.name == RESOURCE_SECTION_NAME)
            .map(|i| i as u32);

        for contrib in &self.debug_data.section_contributions {
            if contrib.length == 0 || Some(contrib.section) == rsrc {
                continue;
            }
            let block_type = if contrib.is_code { BlockType::Code } else { BlockType::Data };
            let id = self.find_or_create_block(
                ctx,
                block_type,
                contrib.rva,
                contrib.length,
                &contrib.compiland,
                FindOrCreateDirective::ExpectNoBlock,
            )?;
            let block = ctx.graph.block_mut(id).unwrap();
            block.set_attribute(BlockAttributes::SECTION_CONTRIB);
            if !contrib.supported_compiler {
                block.set_attribute(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER);
            }
        }
        Ok(())
    }

    // -- Steps 6 and 7: function and thunk symbols, with their children. --

    fn process_function_symbols(&self, ctx: &mut Context<'a>) -> Result<()> {
        for function in &self.debug_data.functions {
            if function.length == 0 {
                continue;
            }
            let id = self.find_or_create_block(
                ctx,
                BlockType::Code,
                function.rva,
                function.length,
                &function.name,
                FindOrCreateDirective::AllowCoveringBlock,
            )?;

            {
                let block = ctx.graph.block_mut(id).unwrap();
                if function.no_return || self.non_returning_re.is_match(&function.name) {
                    block.set_attribute(BlockAttributes::NON_RETURN_FUNCTION);
                }
                if function.has_inline_assembly {
                    block.set_attribute(BlockAttributes::HAS_INLINE_ASSEMBLY);
                }
                if function.has_exception_handling {
                    block.set_attribute(BlockAttributes::HAS_EXCEPTION_HANDLING);
                }
            }

            self.add_label_to_block(ctx, id, function.rva, &function.name, LabelAttributes::CODE);

            for child in &function.children {
                match child.kind {
                    ChildKind::Label => {
                        self.add_label_to_block(ctx, id, child.rva, &child.name, LabelAttributes::CODE);
                    }
                    ChildKind::Data => {
                        self.add_label_to_block(ctx, id, child.rva, &child.name, LabelAttributes::DATA);
                    }
                    ChildKind::DebugStart => {
                        self.add_label_to_block(
                            ctx,
                            id,
                            child.rva,
                            &child.name,
                            LabelAttributes::CODE | LabelAttributes::DEBUG_START,
                        );
                    }
                    ChildKind::DebugEnd => {
                        self.add_end_label_to_block(
                            ctx,
                            id,
                            child.rva,
                            &child.name,
                            LabelAttributes::CODE | LabelAttributes::DEBUG_END,
                        );
                    }
                    ChildKind::ScopeBlock => {
                        self.add_label_to_block(
                            ctx,
                            id,
                            child.rva,
                            &child.name,
                            LabelAttributes::CODE | LabelAttributes::SCOPE_START,
                        );
                        if child.length > 0 {
                            self.add_end_label_to_block(
                                ctx,
                                id,
                                child.rva.offset_by(child.length),
                                &child.name,
                                LabelAttributes::CODE | LabelAttributes::SCOPE_END,
                            );
                        }
                    }
                    ChildKind::CallSite => {
                        self.add_label_to_block(
                            ctx,
                            id,
                            child.rva,
                            &child.name,
                            LabelAttributes::CODE | LabelAttributes::CALL_SITE,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // -- Step 8: data symbols. --

    fn process_data_symbols(&self, ctx: &mut Context<'a>) -> Result<()> {
        for symbol in &self.debug_data.data_symbols {
            // Zero-length data symbols are forward declarations.
            if symbol.length == 0 {
                continue;
            }
            let id = self.find_or_create_block(
                ctx,
                BlockType::Data,
                symbol.rva,
                symbol.length,
                &symbol.name,
                FindOrCreateDirective::AllowCoveringBlock,
            )?;
            self.add_label_to_block(ctx, id, symbol.rva, &symbol.name, LabelAttributes::DATA);
        }
        Ok(())
    }

    // -- Step 9: global labels. --

    fn create_global_labels(&self, ctx: &mut Context<'a>) -> Result<()> {
        for label in &self.debug_data.global_labels {
            let Some(id) = ctx.image.get_containing_block(label.rva, 1) else {
                error!("no block for label '{}' at {}", label.name, label.rva);
                return Err(Error::Consistency(format!(
                    "no block for label '{}' at {}",
                    label.name, label.rva
                )));
            };
            self.add_label_to_block(ctx, id, label.rva, &label.name, LabelAttributes::CODE);
        }
        Ok(())
    }

    // -- Step 10: gap blocks. --

    fn create_gap_blocks(&self, ctx: &mut Context<'a>) -> Result<()> {
        for header in self.pe.sections() {
            let block_type = match header.section_type() {
                SectionType::Code => BlockType::Code,
                _ => BlockType::Data,
            };
            let start = header.virtual_address;
            let end = start.offset_by(header.virtual_size);

            let covered: Vec<SourceRange> = ctx
                .image
                .iter()
                .filter(|(range, _)| range.start() < end && start < range.end())
                .map(|(range, _)| range)
                .collect();

            let mut cursor = start;
            for range in covered {
                if cursor < range.start() {
                    let id = self.create_block(
                        ctx,
                        block_type,
                        cursor,
                        cursor.distance_to(range.start()),
                        "Gap Block",
                    )?;
                    ctx.graph.block_mut(id).unwrap().set_attribute(BlockAttributes::GAP_BLOCK);
                }
                if range.end() > cursor {
                    cursor = range.end();
                }
            }
            if cursor < end {
                let id = self.create_block(
                    ctx,
                    block_type,
                    cursor,
                    cursor.distance_to(end),
                    "Gap Block",
                )?;
                ctx.graph.block_mut(id).unwrap().set_attribute(BlockAttributes::GAP_BLOCK);
            }
        }
        Ok(())
    }

    // -- Step 11: public symbols. --

    fn process_public_symbols(&self, ctx: &mut Context<'a>) -> Result<()> {
        for symbol in &self.debug_data.public_symbols {
            let Some(id) = ctx.image.get_containing_block(symbol.rva, 1) else {
                error!("no block found for public symbol '{}' at {}", symbol.name, symbol.rva);
                return Err(Error::Consistency(format!(
                    "no block found for public symbol '{}' at {}",
                    symbol.name, symbol.rva
                )));
            };
            let name = symbol.name.strip_prefix('_').unwrap_or(&symbol.name);
            let attributes =
                if symbol.is_code { LabelAttributes::CODE } else { LabelAttributes::DATA };
            self.add_label_to_block(ctx, id, symbol.rva, name, attributes);
        }
        Ok(())
    }

    // -- Step 12: static initializer bracketing. --

    fn process_static_initializers(&self, ctx: &mut Context<'a>) -> Result<()> {
        // Bracketing endpoints keyed by the pattern capture, so multiple
        // pairs can match through one pattern.
        let mut endpoints: BTreeMap<String, (Option<RelativeAddress>, Option<RelativeAddress>)> =
            BTreeMap::new();

        for (range, id) in ctx.image.iter() {
            let block = ctx.graph.block(id).unwrap();
            if block.block_type() != BlockType::Data {
                continue;
            }

            for (begin_re, end_re) in &self.initializer_patterns {
                if let Some(captures) = begin_re.captures(block.name()) {
                    let key = captures.get(1).unwrap().as_str().to_string();
                    let slot = &mut endpoints.entry(key).or_default().0;
                    if slot.is_some() {
                        return Err(Error::Consistency(format!(
                            "bracketing symbol '{}' appears multiple times",
                            block.name()
                        )));
                    }
                    *slot = Some(range.start());
                    break;
                }
                if let Some(captures) = end_re.captures(block.name()) {
                    let key = captures.get(1).unwrap().as_str().to_string();
                    let slot = &mut endpoints.entry(key).or_default().1;
                    if slot.is_some() {
                        return Err(Error::Consistency(format!(
                            "bracketing symbol '{}' appears multiple times",
                            block.name()
                        )));
                    }
                    *slot = Some(range.end());
                    break;
                }
            }
        }

        for (key, (begin, end)) in endpoints {
            let begin = begin.ok_or_else(|| {
                Error::Consistency(format!("bracketing start symbol missing for '{key}'"))
            })?;
            let end = end.ok_or_else(|| {
                Error::Consistency(format!("bracketing end symbol missing for '{key}'"))
            })?;
            if end < begin {
                return Err(Error::Consistency(format!(
                    "bracketing symbols out of order for '{key}'"
                )));
            }

            let range = SourceRange::new(begin, begin.distance_to(end));
            let merged = ctx
                .image
                .merge_intersecting_blocks(&mut ctx.graph, range)?
                .ok_or_else(|| {
                    Error::Consistency(format!("no blocks to bracket for '{key}'"))
                })?;
            ctx.graph
                .block_mut(merged)
                .unwrap()
                .set_name(format!("Bracketed Initializers: {key}"));
        }
        Ok(())
    }

    // -- Step 13: data alignment. --

    fn guess_data_block_alignments(&self, ctx: &mut Context<'a>) -> Result<()> {
        for header in self.pe.sections() {
            if header.section_type() != SectionType::Data {
                continue;
            }
            let ids =
                ctx.image.get_intersecting_blocks(header.virtual_address, header.virtual_size);
            for id in ids {
                let addr = ctx.image.address_of(id).unwrap();
                ctx.graph.block_mut(id).unwrap().set_alignment(addr.alignment(16));
            }
        }
        Ok(())
    }

    // -- Step 14: the disassembly pass. --

    fn create_code_references(&self, ctx: &mut Context<'a>) -> Result<()> {
        let code_blocks: Vec<BlockId> = ctx
            .graph
            .blocks()
            .filter(|b| b.block_type() == BlockType::Code)
            .map(|b| b.id())
            .collect();
        for id in code_blocks {
            self.create_code_references_for_block(ctx, id)?;
        }
        Ok(())
    }

    fn create_code_references_for_block(&self, ctx: &mut Context<'a>, id: BlockId) -> Result<()> {
        let outcome = disassemble_block(self.pe, ctx, id)?;
        let block = ctx.graph.block_mut(id).unwrap();
        for (offset, label) in outcome.labels_to_add {
            block.set_label(offset, label);
        }
        block.set_attribute(outcome.attributes);
        Ok(())
    }

    // -- Step 15: reference finalization. --

    fn finalize_intermediate_references(&self, ctx: &mut Context<'a>) -> Result<()> {
        let references = std::mem::take(&mut ctx.references);
        for (src_addr, iref) in references {
            let src = ctx.image.get_block_by_address(src_addr).ok_or_else(|| {
                Error::Consistency(format!("reference source {src_addr} is outside every block"))
            })?;
            let dst = ctx.image.get_block_by_address(iref.base).ok_or_else(|| {
                Error::Consistency(format!(
                    "reference base {} is outside every block",
                    iref.base
                ))
            })?;

            let src_start = ctx.image.address_of(src).unwrap();
            let dst_start = ctx.image.address_of(dst).unwrap();

            let dst_base = dst_start.distance_to(iref.base);
            let dst_offset = i64::from(iref.base - dst_start) + iref.offset;
            let reference = Reference::new(
                iref.kind,
                iref.size,
                dst,
                dst_offset as i32,
                dst_base,
            );
            ctx.graph
                .set_reference(src, src_start.distance_to(src_addr), reference)?;
        }
        Ok(())
    }

    // -- Step 16: every fixup must have been matched... --

    fn confirm_fixups_visited(&self, ctx: &Context<'a>) -> Result<()> {
        for (&location, entry) in &ctx.fixup_map {
            if entry.visited {
                continue;
            }
            // Unreachable code is not disassembled, so PC-relative fixups
            // inside code blocks may legitimately go unseen.
            let in_code = ctx
                .image
                .get_containing_block(location, u32::from(POINTER_SIZE))
                .and_then(|id| ctx.graph.block(id))
                .is_some_and(|b| b.block_type() == BlockType::Code);
            if in_code && entry.kind == ReferenceType::PcRelative {
                continue;
            }
            error!("unexpected unseen fixup at {location}");
            return Err(Error::Consistency(format!("unexpected unseen fixup at {location}")));
        }
        Ok(())
    }

    // -- Step 17: padding detection. --

    fn find_padding_blocks(&self, ctx: &mut Context<'a>) -> Result<()> {
        for block in ctx.graph.blocks_mut() {
            if !block.labels().is_empty()
                || !block.references().is_empty()
                || !block.referrers().is_empty()
                || !block.attributes().contains(BlockAttributes::GAP_BLOCK)
            {
                continue;
            }

            let is_padding = match block.block_type() {
                // Code padding is fully materialized int3 runs.
                BlockType::Code => {
                    block.data_size() == block.size() && repeated_value(block.data()) == Some(INT3)
                }
                // Data padding is uninitialized, or fully zero.
                BlockType::Data => {
                    block.data_size() == 0
                        || (block.data_size() == block.size()
                            && repeated_value(block.data()) == Some(0))
                }
            };
            if is_padding {
                block.set_attribute(BlockAttributes::PADDING_BLOCK);
            }
        }
        Ok(())
    }

    // -- Shared block plumbing. --

    fn create_block(
        &self,
        ctx: &mut Context<'a>,
        block_type: BlockType,
        addr: RelativeAddress,
        size: u32,
        name: &str,
    ) -> Result<BlockId> {
        let id = ctx.image.add_block(&mut ctx.graph, block_type, addr, size, name)?;
        let block = ctx.graph.block_mut(id).unwrap();

        let pushed = block
            .source_ranges_mut()
            .push(DataRange::new(0, size), SourceRange::new(addr, size));
        debug_assert!(pushed);

        if let Some(section) = self.pe.section_index_of(addr, size) {
            block.set_section(section);
        }

        // Bind as many bytes as the file backs; the tail of a section is
        // implicitly zero.
        let backed = self.backed_size(addr, size);
        if backed > 0 {
            if let Some(data) = self.pe.image_data(addr, backed) {
                ctx.graph.block_mut(id).unwrap().set_data(data);
            }
        }
        Ok(id)
    }

    // The number of bytes of `[addr, addr + size)` that on-disk data backs.
    fn backed_size(&self, addr: RelativeAddress, size: u32) -> u32 {
        if let Some(section) = self
            .pe
            .sections()
            .iter()
            .find(|s| s.contains(addr, 1))
        {
            let backed_end = section.virtual_address.offset_by(section.size_of_raw_data);
            if addr >= backed_end {
                return 0;
            }
            return size.min(addr.distance_to(backed_end));
        }
        // Outside every section: the header zone is fully backed.
        size
    }

    fn find_or_create_block(
        &self,
        ctx: &mut Context<'a>,
        block_type: BlockType,
        addr: RelativeAddress,
        size: u32,
        name: &str,
        mut directive: FindOrCreateDirective,
    ) -> Result<BlockId> {
        if let Some(id) = ctx.image.get_block_by_address(addr) {
            let block = ctx.graph.block(id).unwrap();
            // The PE parser knows more than the symbols do about blocks
            // that have to stick together; let it win.
            if block.attributes().contains(BlockAttributes::PE_PARSED) {
                directive = FindOrCreateDirective::AllowCoveringBlock;
            }
            let collision = match directive {
                FindOrCreateDirective::ExpectNoBlock => true,
                FindOrCreateDirective::AllowCoveringBlock => !block.contains(addr, size),
            };
            if collision {
                return Err(Error::Layout(format!(
                    "block collision at {addr} ({size} bytes) with '{}'",
                    block.name()
                )));
            }
            return Ok(id);
        }
        self.create_block(ctx, block_type, addr, size, name)
    }

    fn add_label_to_block(
        &self,
        ctx: &mut Context<'a>,
        id: BlockId,
        addr: RelativeAddress,
        name: &str,
        attributes: LabelAttributes,
    ) {
        let block = ctx.graph.block_mut(id).unwrap();
        if addr < block.addr() {
            warn!("label '{}' at {} precedes block '{}'", name, addr, block.name());
            return;
        }
        let offset = block.addr().distance_to(addr);
        if offset > block.size() {
            warn!("label '{}' at {} lies beyond block '{}'", name, addr, block.name());
            return;
        }
        block.set_label(offset, Label::new(name, attributes));
    }

    // End labels denote a boundary; they are stored on the last byte they
    // close over.
    fn add_end_label_to_block(
        &self,
        ctx: &mut Context<'a>,
        id: BlockId,
        addr: RelativeAddress,
        name: &str,
        attributes: LabelAttributes,
    ) {
        let block = ctx.graph.block(id).unwrap();
        let addr = if addr > block.addr() { addr - 1u32 } else { addr };
        self.add_label_to_block(ctx, id, addr, name, attributes);
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::Malformed(format!("bad pattern '{pattern}': {e}")))
}

fn add_reference(
    references: &mut BTreeMap<RelativeAddress, IntermediateReference>,
    src: RelativeAddress,
    kind: ReferenceType,
    size: u8,
    base: RelativeAddress,
    offset: i64,
) -> Result<()> {
    if let Some(existing) = references.get(&src) {
        if existing.kind != kind
            || existing.size != size
            || existing.base != base
            || existing.offset != offset
        {
            return Err(Error::Consistency(format!(
                "inconsistent colliding intermediate references at {src}"
            )));
        }
        return Ok(());
    }
    references.insert(src, IntermediateReference { kind, size, base, offset });
    Ok(())
}

fn validate_or_add_reference(
    ctx: &mut Context<'_>,
    mode: ValidateMode,
    src: RelativeAddress,
    kind: ReferenceType,
    size: u8,
    base: RelativeAddress,
    offset: i64,
) -> Result<()> {
    let fixup = ctx.fixup_map.get_mut(&src);
    match mode {
        ValidateMode::FixupMayExist => {
            if let Some(entry) = fixup {
                validate_fixup(src, kind, size, entry)?;
            }
            add_reference(&mut ctx.references, src, kind, size, base, offset)
        }
        ValidateMode::FixupMustExist => {
            let entry = fixup.ok_or_else(|| {
                Error::Consistency(format!("reference at {src} has no matching fixup"))
            })?;
            validate_fixup(src, kind, size, entry)
        }
        ValidateMode::FixupMustNotExist => {
            if fixup.is_some() {
                return Err(Error::Consistency(format!(
                    "reference at {src} collides with an existing fixup"
                )));
            }
            add_reference(&mut ctx.references, src, kind, size, base, offset)
        }
    }
}

fn validate_fixup(
    src: RelativeAddress,
    kind: ReferenceType,
    size: u8,
    entry: &mut FixupEntry,
) -> Result<()> {
    if entry.kind != kind || size != POINTER_SIZE {
        return Err(Error::Consistency(format!(
            "reference at {src} is not consistent with its fixup"
        )));
    }
    entry.visited = true;
    Ok(())
}

struct DisassemblyOutcome {
    attributes: BlockAttributes,
    labels_to_add: Vec<(u32, Label)>,
}

// The disassembly pass over one code block: synthesize PC-relative
// references (validated against fixups), detect jump tables, and grade the
// block's attributes by what the walk found.
fn disassemble_block<P: PeImage>(
    pe: &P,
    ctx: &mut Context<'_>,
    id: BlockId,
) -> Result<DisassemblyOutcome> {
    let block = ctx.graph.block(id).unwrap();
    let block_addr = block.addr();
    let block_size = block.size();
    let block_name = block.name().to_string();
    let strict = code_block_attributes_are_basic_block_safe(block);

    let mut outcome =
        DisassemblyOutcome { attributes: BlockAttributes::empty(), labels_to_add: Vec::new() };

    // Trim known trailing data off the code. Clean compiler output has all
    // of its embedded data at the end of the function.
    let mut code_size = block_size;
    let mut layout_clean = true;
    let mut in_data = false;
    for (&offset, label) in block.labels() {
        if label.has_attributes(LabelAttributes::DATA) {
            if !in_data {
                code_size = code_size.min(offset);
            }
            in_data = true;
        } else if in_data {
            layout_clean = false;
        }
    }
    if !layout_clean && strict {
        return Err(Error::Decomposition(format!(
            "block '{block_name}' has unexpected code/data layout"
        )));
    }
    code_size = code_size.min(block.data_size());

    // Disassembly starts from every code label.
    let mut unprocessed: Vec<u32> = block
        .labels()
        .iter()
        .filter(|&(&o, l)| l.has_attributes(LabelAttributes::CODE) && o < code_size)
        .map(|(&o, _)| o)
        .collect();

    let data = block.data().to_vec();
    let mut visited = vec![false; code_size as usize];

    'walks: while let Some(start) = unprocessed.pop() {
        let mut offset = start;
        while offset < code_size && !visited[offset as usize] {
            let inst = match disasm::decode(&data[offset as usize..]) {
                Ok(inst) => inst,
                Err(e) => {
                    if strict {
                        error!("disassembly of '{block_name}' failed at offset {offset}: {e}");
                        return Err(e);
                    }
                    outcome.attributes |= BlockAttributes::ERRORED_DISASSEMBLY;
                    break 'walks;
                }
            };
            let end = offset + inst.size();
            for o in offset..end.min(code_size) {
                visited[o as usize] = true;
            }

            // A relocation right at the end of an instruction marks the
            // start of a lookup table.
            let mut data_next = false;
            if ctx.reloc_set.contains(&block_addr.offset_by(end)) {
                let labeled = ctx
                    .graph
                    .block(id)
                    .unwrap()
                    .get_label(end)
                    .map(|l| {
                        l.has_attributes(LabelAttributes::DATA | LabelAttributes::JUMP_TABLE)
                    })
                    .unwrap_or(false)
                    || outcome.labels_to_add.iter().any(|(o, _)| *o == end);
                if !labeled {
                    if strict {
                        return Err(Error::Decomposition(format!(
                            "expected a jump table label at {block_name}+{end}"
                        )));
                    }
                    warn!("synthesizing a jump table label at {block_name}+{end}");
                    outcome.labels_to_add.push((
                        end,
                        Label::new(
                            format!("<JUMP-TABLE-{end}>"),
                            LabelAttributes::DATA | LabelAttributes::JUMP_TABLE,
                        ),
                    ));
                }
                data_next = true;
            }

            let end_of_code = data_next || end >= code_size;

            match inst.flow {
                FlowClass::None | FlowClass::Interrupt | FlowClass::Syscall => {
                    if end_of_code {
                        outcome.attributes |= BlockAttributes::DISASSEMBLED_PAST_END;
                        warn!("disassembly of '{block_name}' ran to the end of its code");
                    }
                    match visit_non_flow_instruction(ctx, id, block_addr, offset, end, strict)? {
                        Directive::Continue => {}
                        Directive::TerminateWalk => {
                            outcome.attributes |= BlockAttributes::ERRORED_DISASSEMBLY;
                            break 'walks;
                        }
                    }
                    if data_next {
                        break;
                    }
                    offset = end;
                }
                FlowClass::Call | FlowClass::CondBranch | FlowClass::UncBranch => {
                    if let Some(pc_rel) = inst.pc_rel {
                        let action = visit_pc_relative_flow_instruction(
                            pe, ctx, id, block_addr, end, pc_rel, inst.flow, strict,
                        )?;
                        match action {
                            BranchAction::Continue => {}
                            BranchAction::QueueIntra(target) => {
                                if !visited.get(target as usize).copied().unwrap_or(true) {
                                    unprocessed.push(target);
                                }
                            }
                            BranchAction::TerminatePath => break,
                        }
                    }
                    match inst.flow {
                        FlowClass::UncBranch => break,
                        FlowClass::CondBranch | FlowClass::Call => {
                            if !end_of_code {
                                offset = end;
                                continue;
                            }
                            if inst.flow != FlowClass::UncBranch {
                                outcome.attributes |= BlockAttributes::DISASSEMBLED_PAST_END;
                            }
                            break;
                        }
                        _ => unreachable!(),
                    }
                }
                FlowClass::Ret => break,
            }
        }
    }

    let covered = visited.iter().filter(|&&v| v).count() as u32;
    if covered < code_size {
        outcome.attributes |= BlockAttributes::INCOMPLETE_DISASSEMBLY;
    }
    Ok(outcome)
}

enum Directive {
    Continue,
    TerminateWalk,
}

// Non-control-flow instructions may still carry references (from fixups).
// Cross-block references into the middle of clean code, and intra-block
// references to unlabeled offsets, are both signs of mis-decomposition.
fn visit_non_flow_instruction(
    ctx: &Context<'_>,
    id: BlockId,
    block_addr: RelativeAddress,
    offset: u32,
    end: u32,
    strict: bool,
) -> Result<Directive> {
    let instr_start = block_addr.offset_by(offset);
    let instr_end = block_addr.offset_by(end);

    for (_, iref) in ctx
        .references
        .range(instr_start.offset_by(1)..instr_end)
    {
        let Some(ref_block) = ctx.image.get_containing_block(iref.base, 1) else {
            return Err(Error::Consistency(format!(
                "reference base {} lies outside every block",
                iref.base
            )));
        };

        if ref_block != id {
            let target = ctx.graph.block(ref_block).unwrap();
            // A pointer to the top of a code block is a function pointer;
            // one into the middle of a clean code block is not credible.
            if target.block_type() == BlockType::Code
                && iref.base != target.addr()
                && code_block_attributes_are_basic_block_safe(target)
            {
                if strict {
                    return Err(Error::Decomposition(format!(
                        "non-control-flow reference into the middle of code block '{}'",
                        target.name()
                    )));
                }
                return Ok(Directive::TerminateWalk);
            }
        } else {
            let ref_offset = block_addr.distance_to(iref.base);
            // Offset zero is a pointer to ourselves, which is fine.
            if ref_offset != 0 {
                let block = ctx.graph.block(id).unwrap();
                let label_ok = block.get_label(ref_offset).is_some_and(|l| {
                    l.has_attributes(LabelAttributes::DATA)
                        && !l.has_attributes(LabelAttributes::CODE)
                });
                if !label_ok {
                    if strict {
                        return Err(Error::Decomposition(format!(
                            "intra-block data reference with no data label in '{}'",
                            block.name()
                        )));
                    }
                    return Ok(Directive::TerminateWalk);
                }
            }
        }
    }
    Ok(Directive::Continue)
}

enum BranchAction {
    Continue,
    QueueIntra(u32),
    TerminatePath,
}

// PC-relative calls and branches turn into references, validated against
// the fixup stream per their shape.
#[allow(clippy::too_many_arguments)]
fn visit_pc_relative_flow_instruction<P: PeImage>(
    pe: &P,
    ctx: &mut Context<'_>,
    id: BlockId,
    block_addr: RelativeAddress,
    end: u32,
    pc_rel: disasm::PcRel,
    flow: FlowClass,
    strict: bool,
) -> Result<BranchAction> {
    let size = pc_rel.size;
    // The displacement is the very last thing in the instruction.
    let src = block_addr.offset_by(end - u32::from(size));
    let dst_value = i64::from(block_addr.offset_by(end).value()) + i64::from(pc_rel.disp);
    if dst_value < 0 || !pe.contains(RelativeAddress(dst_value as u32), 1) {
        return Err(Error::Decomposition(format!(
            "branch at {src} targets outside the image"
        )));
    }
    let dst = RelativeAddress(dst_value as u32);

    let Some(target_id) = ctx.image.get_containing_block(dst, 1) else {
        return Err(Error::Decomposition(format!(
            "branch target {dst} lies outside every block"
        )));
    };
    let target = ctx.graph.block(target_id).unwrap();
    if target.block_type() != BlockType::Code {
        return Err(Error::Decomposition(format!(
            "branch at {src} targets data block '{}'",
            target.name()
        )));
    }
    let target_addr = target.addr();
    let target_non_returning =
        target.attributes().contains(BlockAttributes::NON_RETURN_FUNCTION);

    let mode = if size == POINTER_SIZE {
        // Long references within a block need no fixup; across blocks the
        // linker must have recorded one.
        if target_id == id {
            ValidateMode::FixupMayExist
        } else {
            ValidateMode::FixupMustExist
        }
    } else {
        // Short references never leave a section contribution.
        if target_id != id {
            return Err(Error::Decomposition(format!(
                "short PC-relative reference out of block at {src}"
            )));
        }
        ValidateMode::FixupMustNotExist
    };

    validate_or_add_reference(
        ctx,
        mode,
        src,
        ReferenceType::PcRelative,
        size,
        dst,
        0,
    )?;

    if flow == FlowClass::Call && target_non_returning {
        // Only calls to the top of a non-returning function are credited;
        // anything else smells like a mis-decomposed block.
        if target_addr != dst {
            let message =
                format!("call into the body of non-returning block at {dst}");
            if strict {
                return Err(Error::Decomposition(message));
            }
            warn!("{message}");
        }
        return Ok(BranchAction::TerminatePath);
    }

    if target_id == id && flow != FlowClass::Call {
        return Ok(BranchAction::QueueIntra(block_addr.distance_to(dst)));
    }
    Ok(BranchAction::Continue)
}
