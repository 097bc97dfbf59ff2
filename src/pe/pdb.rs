//! The surface the decomposer consumes from the PDB reader.
//!
//! PDB parsing is a collaborator concern; what arrives here is the
//! flattened result of walking the DBI and symbol streams: fixups, OMAP
//! tables, section contributions, and the symbol records the decomposition
//! needs. The optional `block_graph_stream` carries a previously serialized
//! decomposition (see [`crate::block_graph::serialization`]).

use crate::address::RelativeAddress;
use crate::block_graph::ReferenceType;

/// The PDB 7.0 info-stream header, used to pair debug data with an image.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PdbInfo {
    pub version: u32,
    pub timestamp: u32,
    pub age: u32,
    pub signature: [u8; 16],
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FixupKind {
    Absolute,
    Relative,
    PcRelative,
}

impl FixupKind {
    pub fn reference_type(self) -> ReferenceType {
        match self {
            FixupKind::Absolute => ReferenceType::Absolute,
            FixupKind::Relative => ReferenceType::Relative,
            FixupKind::PcRelative => ReferenceType::PcRelative,
        }
    }
}

/// One entry of the FIXUP stream: the linker patched `location` to refer to
/// `base`.
#[derive(Copy, Clone, Debug)]
pub struct Fixup {
    pub location: RelativeAddress,
    pub base: RelativeAddress,
    pub kind: FixupKind,
    /// The patched value is an offset, not an address. Seen for TLS data
    /// access; such fixups are skipped.
    pub is_offset: bool,
    pub refers_to_code: bool,
    pub is_data: bool,
}

/// One OMAP record: addresses at or beyond `rva` map to `rva_to`.
#[derive(Copy, Clone, Debug)]
pub struct OmapEntry {
    pub rva: u32,
    pub rva_to: u32,
}

/// Translates an address through an OMAP table. Addresses before the first
/// entry pass through unchanged; an entry mapping to zero drops its range.
pub fn translate_address_via_omap(omap: &[OmapEntry], addr: RelativeAddress) -> RelativeAddress {
    let idx = omap.partition_point(|e| e.rva <= addr.value());
    if idx == 0 {
        return addr;
    }
    let entry = &omap[idx - 1];
    if entry.rva_to == 0 {
        return RelativeAddress(0);
    }
    RelativeAddress(entry.rva_to + (addr.value() - entry.rva))
}

/// A section contribution: which compiland contributed a contiguous RVA
/// range of a section.
#[derive(Clone, Debug)]
pub struct SectionContribution {
    pub rva: RelativeAddress,
    pub length: u32,
    pub section: u32,
    pub is_code: bool,
    pub compiland: String,
    /// Whether the contributing compiler is one whose conventions the
    /// toolchain understands.
    pub supported_compiler: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChildKind {
    Label,
    Data,
    ScopeBlock,
    DebugStart,
    DebugEnd,
    CallSite,
}

/// A symbol nested within a function: labels, local data, lexical scopes,
/// debug range markers and call sites.
#[derive(Clone, Debug)]
pub struct ChildSymbol {
    pub kind: ChildKind,
    pub rva: RelativeAddress,
    pub length: u32,
    pub name: String,
}

/// A function or thunk symbol with a static location.
#[derive(Clone, Debug)]
pub struct FunctionSymbol {
    pub rva: RelativeAddress,
    pub length: u32,
    pub name: String,
    pub no_return: bool,
    pub has_inline_assembly: bool,
    pub has_exception_handling: bool,
    pub children: Vec<ChildSymbol>,
}

/// A static data symbol.
#[derive(Clone, Debug)]
pub struct DataSymbol {
    pub rva: RelativeAddress,
    pub length: u32,
    pub name: String,
}

/// A top-level label symbol.
#[derive(Clone, Debug)]
pub struct LabelSymbol {
    pub rva: RelativeAddress,
    pub name: String,
}

/// A public symbol.
#[derive(Clone, Debug)]
pub struct PublicSymbol {
    pub rva: RelativeAddress,
    pub name: String,
    pub is_code: bool,
}

/// Everything the decomposer needs out of a PDB.
#[derive(Clone, Debug, Default)]
pub struct DebugData {
    pub info: PdbInfo,
    pub fixups: Vec<Fixup>,
    pub omap_from: Vec<OmapEntry>,
    pub omap_to: Vec<OmapEntry>,
    pub section_contributions: Vec<SectionContribution>,
    /// Function and thunk symbols, in no particular order.
    pub functions: Vec<FunctionSymbol>,
    pub data_symbols: Vec<DataSymbol>,
    pub global_labels: Vec<LabelSymbol>,
    pub public_symbols: Vec<PublicSymbol>,
    /// A serialized block graph from an earlier run, if the PDB carries
    /// one.
    pub block_graph_stream: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omap_translation() {
        let omap = vec![
            OmapEntry { rva: 0x1000, rva_to: 0x2000 },
            OmapEntry { rva: 0x1800, rva_to: 0 },
            OmapEntry { rva: 0x1A00, rva_to: 0x3000 },
        ];
        // Before the first entry: unchanged.
        assert_eq!(translate_address_via_omap(&omap, RelativeAddress(0x800)), RelativeAddress(0x800));
        // Inside a mapped range: shifted.
        assert_eq!(
            translate_address_via_omap(&omap, RelativeAddress(0x1010)),
            RelativeAddress(0x2010)
        );
        // Inside a dropped range: zero.
        assert_eq!(translate_address_via_omap(&omap, RelativeAddress(0x1900)), RelativeAddress(0));
        assert_eq!(
            translate_address_via_omap(&omap, RelativeAddress(0x1A04)),
            RelativeAddress(0x3004)
        );
    }
}
