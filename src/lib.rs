//! # libsyzygy
//!
//! Decomposes a compiled 32-bit Windows PE image (and its matching PDB debug
//! information) into a fine-grained, relocatable *block graph*; lets callers
//! transform that graph at whole-graph, per-block, or basic-block
//! granularity; and reassembles concrete blocks from transformed subgraphs so
//! an image writer can emit a working binary again.
//!
//! The crate is layered bottom-up:
//!
//! - [`address`], [`address_space`], [`address_range_map`] — address newtypes,
//!   the disjoint-range map and the two-address-space mapping that every other
//!   layer is built on.
//! - [`disasm`] / [`assembler`] — the x86-32 instruction decode and branch
//!   encode surfaces consumed during decomposition and reassembly.
//! - [`block_graph`] — the graph of typed blocks and references, the
//!   basic-block subgraph view of a single code block, the decomposer that
//!   produces it and the builder that flattens it back into blocks.
//! - [`pe`] — the image-level decomposer that reconstructs a block graph and
//!   an [`pe::ImageLayout`] from PE bytes plus PDB-derived debug data.
//!
//! A typical round trip:
//!
//! ```text
//! PE bytes + debug data
//!     -> pe::Decomposer        -> BlockGraph + ImageLayout
//!     -> transforms            -> mutated graph / subgraphs
//!     -> block_graph::BlockBuilder (per touched code block)
//!     -> image writer (external)
//! ```

pub mod error;

pub mod address;
pub mod address_range_map;
pub mod address_space;

pub mod assembler;
pub mod disasm;

pub mod block_graph;

pub mod pe;

pub use crate::error::{Error, Result};
