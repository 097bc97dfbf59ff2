//! x86-32 instruction decode surface.
//!
//! This is deliberately not a full disassembler: callers only need lengths,
//! flow classification, and PC-relative displacement extraction to walk
//! compiler-generated code. Anything the decoder does not recognize comes
//! back as an error, which the decomposition layers translate into their
//! unsupported-instruction paths rather than guessing at byte boundaries.
//!
//! Coverage is the one-byte opcode map, the `0F` page emitted by 32-bit
//! compilers (Jcc rel32, setcc, cmovcc, movzx/movsx, shld/shrd, the SSE
//! blocks, multi-byte nop), and the `0F 38` / `0F 3A` escapes, with full
//! modrm/sib/displacement sizing and prefix handling.

use crate::error::{Error, Result};

/// The architectural limit; anything longer is malformed.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FlowClass {
    /// Execution continues to the next instruction.
    None,
    Call,
    UncBranch,
    CondBranch,
    Ret,
    Interrupt,
    Syscall,
}

/// A PC-relative displacement operand. The displacement bytes always sit at
/// the tail of the instruction; the branch target is the end of the
/// instruction plus `disp`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PcRel {
    pub disp: i32,
    /// Width of the encoded displacement in bytes: 1, 2 or 4.
    pub size: u8,
}

/// A decoded instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Inst {
    pub length: u8,
    /// The raw opcode: one byte, or `0x0Fxx` / `0x0F38xx` / `0x0F3Axx` for
    /// the escape pages.
    pub opcode: u32,
    pub flow: FlowClass,
    pub pc_rel: Option<PcRel>,
    /// True iff the memory operand is a bare `[disp32]` (no base or index
    /// register), the shape of an indirect call or jump through a pointer.
    pub abs_disp: bool,
}

impl Inst {
    pub fn size(&self) -> u32 {
        u32::from(self.length)
    }
}

// How the bytes after the opcode are laid out.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Enc {
    None,
    ModRm,
    ModRmImm8,
    // Immediate whose width follows the operand size (4, or 2 under 0x66).
    ModRmImmZ,
    Imm8,
    Imm16,
    Imm16Imm8,
    ImmZ,
    Rel8,
    RelZ,
    // ptr16:32, or ptr16:16 under 0x66.
    FarPtr,
    // Memory offset whose width follows the address size.
    Moffs,
    // Group 3: the modrm reg field decides whether an immediate follows.
    Grp3B,
    Grp3Z,
    // Group 5: the modrm reg field decides the flow class.
    Grp5,
    Invalid,
}

struct Prefixes {
    len: usize,
    operand_size: bool,
    address_size: bool,
}

fn eat_prefixes(bytes: &[u8]) -> Prefixes {
    let mut p = Prefixes { len: 0, operand_size: false, address_size: false };
    for &b in bytes {
        match b {
            0x66 => p.operand_size = true,
            0x67 => p.address_size = true,
            0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {}
            _ => break,
        }
        p.len += 1;
    }
    p
}

// One-byte opcode map.
fn one_byte(op: u8) -> (Enc, FlowClass) {
    use Enc::{
        FarPtr, Grp3B, Grp3Z, Grp5, Imm8, Imm16, Imm16Imm8, ImmZ, Invalid, ModRm, ModRmImm8,
        ModRmImmZ, Moffs, Rel8, RelZ,
    };
    use FlowClass::{Call, CondBranch, Interrupt, Ret, UncBranch};
    const NONE: FlowClass = FlowClass::None;
    match op {
        // The arithmetic block repeats every 8 opcodes: op r/m,r; op r,r/m;
        // op al,imm8; op eax,immZ, with push/pop seg or an escape in the
        // trailing slots.
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B
        | 0x30..=0x33 | 0x38..=0x3B => (ModRm, NONE),
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => (Imm8, NONE),
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => (ImmZ, NONE),
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => (Enc::None, NONE),
        0x27 | 0x2F | 0x37 | 0x3F => (Enc::None, NONE),

        0x40..=0x5F => (Enc::None, NONE),
        0x60 | 0x61 => (Enc::None, NONE),
        0x62 | 0x63 => (ModRm, NONE),
        0x68 => (ImmZ, NONE),
        0x69 => (ModRmImmZ, NONE),
        0x6A => (Imm8, NONE),
        0x6B => (ModRmImm8, NONE),
        0x6C..=0x6F => (Enc::None, NONE),

        0x70..=0x7F => (Rel8, CondBranch),

        0x80 | 0x82 | 0x83 => (ModRmImm8, NONE),
        0x81 => (ModRmImmZ, NONE),
        0x84..=0x8F => (ModRm, NONE),

        0x90..=0x99 => (Enc::None, NONE),
        0x9A => (FarPtr, Call),
        0x9B..=0x9F => (Enc::None, NONE),

        0xA0..=0xA3 => (Moffs, NONE),
        0xA4..=0xA7 => (Enc::None, NONE),
        0xA8 => (Imm8, NONE),
        0xA9 => (ImmZ, NONE),
        0xAA..=0xAF => (Enc::None, NONE),

        0xB0..=0xB7 => (Imm8, NONE),
        0xB8..=0xBF => (ImmZ, NONE),

        0xC0 | 0xC1 => (ModRmImm8, NONE),
        0xC2 => (Imm16, Ret),
        0xC3 => (Enc::None, Ret),
        0xC4 | 0xC5 => (ModRm, NONE),
        0xC6 => (ModRmImm8, NONE),
        0xC7 => (ModRmImmZ, NONE),
        0xC8 => (Imm16Imm8, NONE),
        0xC9 => (Enc::None, NONE),
        0xCA => (Imm16, Ret),
        0xCB => (Enc::None, Ret),
        0xCC => (Enc::None, Interrupt),
        0xCD => (Imm8, Interrupt),
        0xCE => (Enc::None, Interrupt),
        0xCF => (Enc::None, Ret),

        0xD0..=0xD3 => (ModRm, NONE),
        0xD4 | 0xD5 => (Imm8, NONE),
        0xD6 | 0xD7 => (Enc::None, NONE),
        0xD8..=0xDF => (ModRm, NONE),

        0xE0..=0xE3 => (Rel8, CondBranch),
        0xE4..=0xE7 => (Imm8, NONE),
        0xE8 => (RelZ, Call),
        0xE9 => (RelZ, UncBranch),
        0xEA => (FarPtr, UncBranch),
        0xEB => (Rel8, UncBranch),
        0xEC..=0xEF => (Enc::None, NONE),

        0xF1 => (Enc::None, Interrupt),
        0xF4 | 0xF5 => (Enc::None, NONE),
        0xF6 => (Grp3B, NONE),
        0xF7 => (Grp3Z, NONE),
        0xF8..=0xFD => (Enc::None, NONE),
        0xFE => (ModRm, NONE),
        0xFF => (Grp5, NONE),

        // Prefix bytes were consumed already; 0x0F is the escape.
        _ => (Invalid, NONE),
    }
}

// Two-byte (0F xx) opcode map, covering what 32-bit compilers emit.
fn two_byte(op: u8) -> (Enc, FlowClass) {
    use Enc::{Invalid, ModRm, ModRmImm8, RelZ};
    use FlowClass::{CondBranch, Interrupt, Syscall};
    const NONE: FlowClass = FlowClass::None;
    match op {
        0x00 | 0x01 | 0x02 | 0x03 => (ModRm, NONE),
        0x05 => (Enc::None, Syscall),
        0x06 | 0x08 | 0x09 => (Enc::None, NONE),
        0x0B => (Enc::None, Interrupt),
        0x0D => (ModRm, NONE),
        0x10..=0x17 => (ModRm, NONE),
        0x18..=0x1F => (ModRm, NONE),
        0x20..=0x23 => (ModRm, NONE),
        0x28..=0x2F => (ModRm, NONE),
        0x30..=0x33 => (Enc::None, NONE),
        0x34 | 0x35 => (Enc::None, Syscall),
        0x40..=0x4F => (ModRm, NONE),
        0x50..=0x6F => (ModRm, NONE),
        0x70..=0x73 => (ModRmImm8, NONE),
        0x74..=0x7F => (ModRm, NONE),
        0x80..=0x8F => (RelZ, CondBranch),
        0x90..=0x9F => (ModRm, NONE),
        0xA0 | 0xA1 => (Enc::None, NONE),
        0xA2 => (Enc::None, NONE),
        0xA3 => (ModRm, NONE),
        0xA4 => (ModRmImm8, NONE),
        0xA5 => (ModRm, NONE),
        0xA8 | 0xA9 | 0xAA => (Enc::None, NONE),
        0xAB => (ModRm, NONE),
        0xAC => (ModRmImm8, NONE),
        0xAD..=0xAF => (ModRm, NONE),
        0xB0..=0xB7 => (ModRm, NONE),
        0xB9 => (ModRm, NONE),
        0xBA => (ModRmImm8, NONE),
        0xBB..=0xBF => (ModRm, NONE),
        0xC0 | 0xC1 => (ModRm, NONE),
        0xC2 => (ModRmImm8, NONE),
        0xC3 => (ModRm, NONE),
        0xC4..=0xC6 => (ModRmImm8, NONE),
        0xC7 => (ModRm, NONE),
        0xC8..=0xCF => (Enc::None, NONE),
        0xD0..=0xFE => (ModRm, NONE),
        _ => (Invalid, NONE),
    }
}

struct ModRmInfo {
    // Bytes consumed by modrm + sib + displacement.
    len: usize,
    reg: u8,
    // The operand is a bare [disp32] / [disp16].
    abs_disp: bool,
}

fn modrm_length(bytes: &[u8], address_size_16: bool) -> Result<ModRmInfo> {
    let modrm = *bytes
        .first()
        .ok_or_else(|| Error::Malformed("truncated instruction at modrm".into()))?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;

    if mode == 3 {
        return Ok(ModRmInfo { len: 1, reg, abs_disp: false });
    }

    if address_size_16 {
        let (disp, abs_disp) = match (mode, rm) {
            (0, 6) => (2, true),
            (0, _) => (0, false),
            (1, _) => (1, false),
            _ => (2, false),
        };
        return Ok(ModRmInfo { len: 1 + disp, reg, abs_disp });
    }

    let mut len = 1;
    let mut sib_base_disp32 = false;
    if rm == 4 {
        let sib = *bytes
            .get(1)
            .ok_or_else(|| Error::Malformed("truncated instruction at sib".into()))?;
        len += 1;
        sib_base_disp32 = mode == 0 && (sib & 7) == 5;
    }

    let (disp, abs_disp) = match mode {
        0 if rm == 5 => (4, true),
        0 if sib_base_disp32 => (4, false),
        0 => (0, false),
        1 => (1, false),
        _ => (4, false),
    };
    Ok(ModRmInfo { len: len + disp, reg, abs_disp })
}

fn read_disp(bytes: &[u8], size: usize) -> Result<i32> {
    if bytes.len() < size {
        return Err(Error::Malformed("truncated displacement".into()));
    }
    Ok(match size {
        1 => i32::from(bytes[0] as i8),
        2 => i32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => unreachable!(),
    })
}

/// Decodes the instruction at the head of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Inst> {
    let prefixes = eat_prefixes(bytes);
    let rest = &bytes[prefixes.len..];

    let &op = rest
        .first()
        .ok_or_else(|| Error::Malformed("empty instruction".into()))?;

    let (mut opcode_len, opcode, (enc, mut flow)) = if op == 0x0F {
        let &op2 = rest
            .get(1)
            .ok_or_else(|| Error::Malformed("truncated two-byte opcode".into()))?;
        match op2 {
            // Three-byte escapes; every opcode in them takes a modrm, and
            // the 3A page adds an imm8.
            0x38 => {
                let &op3 = rest
                    .get(2)
                    .ok_or_else(|| Error::Malformed("truncated three-byte opcode".into()))?;
                (3, 0x0F3800 | u32::from(op3), (Enc::ModRm, FlowClass::None))
            }
            0x3A => {
                let &op3 = rest
                    .get(2)
                    .ok_or_else(|| Error::Malformed("truncated three-byte opcode".into()))?;
                (3, 0x0F3A00 | u32::from(op3), (Enc::ModRmImm8, FlowClass::None))
            }
            _ => (2, 0x0F00 | u32::from(op2), two_byte(op2)),
        }
    } else {
        (1, u32::from(op), one_byte(op))
    };

    let imm_z: usize = if prefixes.operand_size { 2 } else { 4 };
    let mut abs_disp = false;
    let mut pc_rel = Option::<PcRel>::None;

    let operand_len = match enc {
        Enc::None => 0,
        Enc::Imm8 => 1,
        Enc::Imm16 => 2,
        Enc::Imm16Imm8 => 3,
        Enc::ImmZ => imm_z,
        Enc::FarPtr => 2 + imm_z,
        Enc::Moffs => {
            if prefixes.address_size {
                2
            } else {
                4
            }
        }
        Enc::Rel8 => {
            let disp = read_disp(&rest[opcode_len..], 1)?;
            pc_rel = Some(PcRel { disp, size: 1 });
            1
        }
        Enc::RelZ => {
            let disp = read_disp(&rest[opcode_len..], imm_z)?;
            pc_rel = Some(PcRel { disp, size: imm_z as u8 });
            imm_z
        }
        Enc::ModRm | Enc::ModRmImm8 | Enc::ModRmImmZ | Enc::Grp3B | Enc::Grp3Z | Enc::Grp5 => {
            let info = modrm_length(&rest[opcode_len..], prefixes.address_size)?;
            abs_disp = info.abs_disp;
            let imm = match enc {
                Enc::ModRmImm8 => 1,
                Enc::ModRmImmZ => imm_z,
                // test r/m, imm lives in group 3 slots 0 and 1.
                Enc::Grp3B if info.reg <= 1 => 1,
                Enc::Grp3Z if info.reg <= 1 => imm_z,
                Enc::Grp5 => {
                    flow = match info.reg {
                        2 | 3 => FlowClass::Call,
                        4 | 5 => FlowClass::UncBranch,
                        _ => FlowClass::None,
                    };
                    0
                }
                _ => 0,
            };
            info.len + imm
        }
        Enc::Invalid => {
            return Err(Error::Decomposition(format!("unsupported opcode 0x{opcode:02X}")));
        }
    };

    opcode_len += operand_len;
    let length = prefixes.len + opcode_len;
    if length > MAX_INSTRUCTION_LENGTH {
        return Err(Error::Malformed(format!("instruction longer than {MAX_INSTRUCTION_LENGTH} bytes")));
    }
    if bytes.len() < length {
        return Err(Error::Malformed("truncated instruction".into()));
    }

    Ok(Inst { length: length as u8, opcode, flow, pc_rel, abs_disp })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len(bytes: &[u8]) -> u8 {
        decode(bytes).unwrap().length
    }

    #[test]
    fn simple_lengths() {
        assert_eq!(len(&[0x55]), 1); // push ebp
        assert_eq!(len(&[0x8B, 0xEC]), 2); // mov ebp, esp
        assert_eq!(len(&[0x5D]), 1); // pop ebp
        assert_eq!(len(&[0xC3]), 1); // ret
        assert_eq!(len(&[0xC2, 0x04, 0x00]), 3); // ret 4
        assert_eq!(len(&[0x90]), 1); // nop
        assert_eq!(len(&[0xCC]), 1); // int3
        assert_eq!(len(&[0xB8, 1, 0, 0, 0]), 5); // mov eax, 1
        assert_eq!(len(&[0x6A, 0x10]), 2); // push 16
        assert_eq!(len(&[0x68, 1, 2, 3, 4]), 5); // push imm32
        assert_eq!(len(&[0x83, 0xC4, 0x08]), 3); // add esp, 8
        assert_eq!(len(&[0x81, 0xEC, 0, 1, 0, 0]), 6); // sub esp, 0x100
    }

    #[test]
    fn modrm_and_sib() {
        assert_eq!(len(&[0x8B, 0x45, 0x08]), 3); // mov eax, [ebp+8]
        assert_eq!(len(&[0x8B, 0x44, 0x24, 0x04]), 4); // mov eax, [esp+4]
        assert_eq!(len(&[0x8B, 0x84, 0x24, 0, 1, 0, 0]), 7); // mov eax, [esp+0x100]
        assert_eq!(len(&[0x8B, 0x04, 0x85, 0x10, 0x20, 0x30, 0x40]), 7); // mov eax, [eax*4+disp32]
        let inst = decode(&[0xA1, 0x10, 0x20, 0x30, 0x40]).unwrap(); // mov eax, moffs32
        assert_eq!(inst.length, 5);

        // mov eax, [disp32] via modrm
        let inst = decode(&[0x8B, 0x05, 0x10, 0x20, 0x30, 0x40]).unwrap();
        assert_eq!(inst.length, 6);
        assert!(inst.abs_disp);
    }

    #[test]
    fn prefixes() {
        assert_eq!(len(&[0x66, 0xB8, 0x34, 0x12]), 4); // mov ax, 0x1234
        assert_eq!(len(&[0xF3, 0xA4]), 2); // rep movsb
        assert_eq!(len(&[0x64, 0xA1, 0, 0, 0, 0]), 6); // mov eax, fs:[0]
        assert_eq!(len(&[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00]), 6); // multi-byte nop
    }

    #[test]
    fn flow_classification() {
        let call = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(call.flow, FlowClass::Call);
        assert_eq!(call.pc_rel, Some(PcRel { disp: 0x10, size: 4 }));
        assert_eq!(call.length, 5);

        let jmp = decode(&[0xEB, 0xFE]).unwrap();
        assert_eq!(jmp.flow, FlowClass::UncBranch);
        assert_eq!(jmp.pc_rel, Some(PcRel { disp: -2, size: 1 }));

        let je = decode(&[0x74, 0x05]).unwrap();
        assert_eq!(je.flow, FlowClass::CondBranch);
        assert_eq!(je.pc_rel, Some(PcRel { disp: 5, size: 1 }));

        let jne_long = decode(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(jne_long.flow, FlowClass::CondBranch);
        assert_eq!(jne_long.pc_rel, Some(PcRel { disp: 0x100, size: 4 }));
        assert_eq!(jne_long.length, 6);

        let ret = decode(&[0xC3]).unwrap();
        assert_eq!(ret.flow, FlowClass::Ret);

        let jecxz = decode(&[0xE3, 0x02]).unwrap();
        assert_eq!(jecxz.flow, FlowClass::CondBranch);

        let loop_ = decode(&[0xE2, 0xF0]).unwrap();
        assert_eq!(loop_.flow, FlowClass::CondBranch);
    }

    #[test]
    fn group_encodings() {
        // test r/m32, imm32 (group 3, reg 0)
        assert_eq!(len(&[0xF7, 0xC0, 1, 0, 0, 0]), 6);
        // not r/m32 (group 3, reg 2): no immediate
        assert_eq!(len(&[0xF7, 0xD0]), 2);
        // test r/m8, imm8
        assert_eq!(len(&[0xF6, 0xC1, 0x01]), 3);

        // call [disp32] (group 5, reg 2)
        let call = decode(&[0xFF, 0x15, 0x10, 0x20, 0x30, 0x40]).unwrap();
        assert_eq!(call.flow, FlowClass::Call);
        assert_eq!(call.length, 6);
        assert!(call.abs_disp);
        assert!(call.pc_rel.is_none());

        // jmp [eax*4 + disp32] (group 5, reg 4): a jump table dispatch
        let jmp = decode(&[0xFF, 0x24, 0x85, 0x10, 0x20, 0x30, 0x40]).unwrap();
        assert_eq!(jmp.flow, FlowClass::UncBranch);
        assert_eq!(jmp.length, 7);
        assert!(jmp.pc_rel.is_none());

        // push [ebx] (group 5, reg 6): not a branch
        let push = decode(&[0xFF, 0x33]).unwrap();
        assert_eq!(push.flow, FlowClass::None);
    }

    #[test]
    fn zero_page_coverage() {
        assert_eq!(len(&[0x0F, 0xB6, 0xC0]), 3); // movzx eax, al
        assert_eq!(len(&[0x0F, 0xAF, 0xC1]), 3); // imul eax, ecx
        assert_eq!(len(&[0x0F, 0x94, 0xC0]), 3); // sete al
        assert_eq!(len(&[0x0F, 0x44, 0xC1]), 3); // cmove eax, ecx
        assert_eq!(len(&[0x0F, 0x38, 0x00, 0xC1]), 4); // pshufb mm0, mm1
        assert_eq!(len(&[0x0F, 0x3A, 0x0F, 0xC1, 0x04]), 5); // palignr
        let sysenter = decode(&[0x0F, 0x34]).unwrap();
        assert_eq!(sysenter.flow, FlowClass::Syscall);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xE8, 0x01]).is_err()); // truncated call
        assert!(decode(&[0x8B]).is_err()); // truncated modrm
        assert!(decode(&[0x0F]).is_err()); // dangling escape
        // A lone prefix with nothing after it.
        assert!(decode(&[0x66]).is_err());
    }
}
