//! Branch and jump encodings synthesized during reassembly.
//!
//! This covers exactly the instructions the block builder emits for
//! successors: conditional branches in their short (rel8) and long (rel32)
//! forms, short and long unconditional jumps, and the short-only
//! JECXZ/LOOP/LOOPE/LOOPNE family.

use crate::error::{Error, Result};

pub const SHORT_BRANCH_OPCODE_SIZE: u32 = 1;
pub const SHORT_BRANCH_SIZE: u32 = 2;
pub const LONG_BRANCH_OPCODE_SIZE: u32 = 2;
pub const LONG_BRANCH_SIZE: u32 = 6;
pub const SHORT_JUMP_OPCODE_SIZE: u32 = 1;
pub const SHORT_JUMP_SIZE: u32 = 2;
pub const LONG_JUMP_OPCODE_SIZE: u32 = 1;
pub const LONG_JUMP_SIZE: u32 = 5;

/// The branch instructions the builder can synthesize. `Jcc` carries the
/// x86 `tttn` condition code.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BranchKind {
    Jcc(u8),
    Jmp,
    Jecxz,
    Loop,
    Loope,
    Loopne,
}

impl BranchKind {
    /// True iff the branch has a rel32 form.
    pub fn has_long_form(self) -> bool {
        matches!(self, BranchKind::Jcc(_) | BranchKind::Jmp)
    }

    /// Encoded size of the chosen form.
    pub fn size(self, long: bool) -> u32 {
        match (self, long) {
            (BranchKind::Jcc(_), true) => LONG_BRANCH_SIZE,
            (BranchKind::Jmp, true) => LONG_JUMP_SIZE,
            (_, false) => SHORT_BRANCH_SIZE,
            _ => unreachable!("no long form"),
        }
    }

    /// Offset of the displacement field within the instruction.
    pub fn reference_offset(self, long: bool) -> u32 {
        match (self, long) {
            (BranchKind::Jcc(_), true) => LONG_BRANCH_OPCODE_SIZE,
            (BranchKind::Jmp, true) => LONG_JUMP_OPCODE_SIZE,
            (_, false) => SHORT_BRANCH_OPCODE_SIZE,
            _ => unreachable!("no long form"),
        }
    }

    /// Width of the displacement field in bytes.
    pub fn reference_size(self, long: bool) -> u8 {
        if long { 4 } else { 1 }
    }
}

/// True iff `disp` is representable as a rel8 displacement.
pub fn fits_short(disp: i64) -> bool {
    (-128..=127).contains(&disp)
}

/// Assembles `kind` with the given displacement into `buf`.
///
/// The displacement is measured from the end of the instruction, exactly as
/// the hardware does.
pub fn assemble_branch(kind: BranchKind, long: bool, disp: i64, buf: &mut Vec<u8>) -> Result<()> {
    if long && !kind.has_long_form() {
        return Err(Error::Layout(format!("{kind:?} has no rel32 form")));
    }

    if !long {
        if !fits_short(disp) {
            return Err(Error::Layout(format!(
                "displacement {disp} does not fit a short {kind:?}"
            )));
        }
        let opcode = match kind {
            BranchKind::Jcc(cc) => {
                debug_assert!(cc < 16);
                0x70 | cc
            }
            BranchKind::Jmp => 0xEB,
            BranchKind::Jecxz => 0xE3,
            BranchKind::Loop => 0xE2,
            BranchKind::Loope => 0xE1,
            BranchKind::Loopne => 0xE0,
        };
        buf.push(opcode);
        buf.push(disp as i8 as u8);
        return Ok(());
    }

    if i32::try_from(disp).is_err() {
        return Err(Error::Layout(format!("displacement {disp} does not fit rel32")));
    }
    match kind {
        BranchKind::Jcc(cc) => {
            debug_assert!(cc < 16);
            buf.push(0x0F);
            buf.push(0x80 | cc);
        }
        BranchKind::Jmp => buf.push(0xE9),
        _ => unreachable!(),
    }
    buf.extend_from_slice(&(disp as i32).to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_slots() {
        assert_eq!(BranchKind::Jcc(4).size(false), 2);
        assert_eq!(BranchKind::Jcc(4).size(true), 6);
        assert_eq!(BranchKind::Jmp.size(false), 2);
        assert_eq!(BranchKind::Jmp.size(true), 5);
        assert_eq!(BranchKind::Jcc(4).reference_offset(true), 2);
        assert_eq!(BranchKind::Jmp.reference_offset(true), 1);
        assert_eq!(BranchKind::Loop.reference_offset(false), 1);
        assert!(!BranchKind::Jecxz.has_long_form());
    }

    #[test]
    fn short_encodings() {
        let mut buf = Vec::new();
        assemble_branch(BranchKind::Jcc(4), false, 0x10, &mut buf).unwrap();
        assert_eq!(buf, vec![0x74, 0x10]); // je +0x10

        buf.clear();
        assemble_branch(BranchKind::Jmp, false, -128, &mut buf).unwrap();
        assert_eq!(buf, vec![0xEB, 0x80]);

        buf.clear();
        assemble_branch(BranchKind::Jecxz, false, 2, &mut buf).unwrap();
        assert_eq!(buf, vec![0xE3, 0x02]);
    }

    #[test]
    fn long_encodings() {
        let mut buf = Vec::new();
        assemble_branch(BranchKind::Jcc(5), true, 0x100, &mut buf).unwrap();
        assert_eq!(buf, vec![0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]); // jne +0x100

        buf.clear();
        assemble_branch(BranchKind::Jmp, true, -0x129, &mut buf).unwrap();
        assert_eq!(buf, vec![0xE9, 0xD7, 0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn rejects_unreachable_displacements() {
        let mut buf = Vec::new();
        assert!(assemble_branch(BranchKind::Jmp, false, 128, &mut buf).is_err());
        assert!(assemble_branch(BranchKind::Loop, true, 0x100, &mut buf).is_err());
        assert!(fits_short(127));
        assert!(!fits_short(128));
        assert!(fits_short(-128));
        assert!(!fits_short(-129));
    }
}
