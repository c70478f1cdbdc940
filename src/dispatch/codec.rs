//! Relative displacement encoding for the two supported jump families.
//!
//! - `Rel32`: x86 / x86_64 `JMP rel32` (`E9 xx xx xx xx`), 5 bytes, the
//!   displacement is relative to the end of the instruction.
//! - `Branch26`: AArch64 `B imm26`, one 4-byte instruction word. The
//!   architectural displacement is relative to the branch itself and counted
//!   in words; callers still pass the end-relative displacement produced by
//!   [`compute_offset`] and the encoder rebases it.

use serde::Serialize;
use thiserror::Error;

/// Width of the mutable displacement field, identical for both families.
pub const FIELD_LEN: usize = 4;

/// `JMP rel32` opcode.
pub const JMP_REL32: u8 = 0xE9;

/// `B imm26` with a zero immediate.
const B_IMM26: u32 = 0x1400_0000;
const B_MASK: u32 = 0xFC00_0000;
const IMM26_MASK: u32 = 0x03FF_FFFF;

/// Encoded displacement field, already in the byte order the CPU fetches.
pub type FieldBytes = [u8; FIELD_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("displacement {offset:#x} exceeds the reachable range of +/-{limit:#x}")]
    OutOfRange { offset: i64, limit: i64 },
    #[error("displacement {offset:#x} is not word aligned")]
    Misaligned { offset: i64 },
    #[error("{word:#010x} is not an unconditional branch")]
    NotABranch { word: u32 },
}

/// Unconditional relative jump family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    Rel32,
    Branch26,
}

impl Family {
    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    pub const HOST: Option<Family> = Some(Family::Rel32);
    #[cfg(target_arch = "aarch64")]
    pub const HOST: Option<Family> = Some(Family::Branch26);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    pub const HOST: Option<Family> = None;

    /// Length `J` of the whole jump instruction.
    pub const fn jump_len(self) -> usize {
        match self {
            Family::Rel32 => 5,
            Family::Branch26 => 4,
        }
    }

    /// Offset of the displacement field from the start of the instruction.
    pub const fn field_offset(self) -> usize {
        match self {
            Family::Rel32 => 1,
            Family::Branch26 => 0,
        }
    }

    /// Opcode byte written once at install time, if the family has one that
    /// is separate from the displacement field.
    pub const fn opcode(self) -> Option<u8> {
        match self {
            Family::Rel32 => Some(JMP_REL32),
            Family::Branch26 => None,
        }
    }

    /// Byte order used for instruction fetch on a host with `data` order.
    pub const fn code_endian(self, data: Endian) -> Endian {
        match self {
            Family::Rel32 => data,
            // A64 instructions are little-endian even on big-endian data.
            Family::Branch26 => Endian::Little,
        }
    }

    /// Largest end-relative displacement magnitude the family can encode.
    pub const fn limit(self) -> i64 {
        match self {
            Family::Rel32 => i32::MAX as i64,
            Family::Branch26 => 1 << 27,
        }
    }

    /// Inclusive bounds of the end-relative displacement.
    pub const fn reach(self) -> (i64, i64) {
        match self {
            Family::Rel32 => (i32::MIN as i64, i32::MAX as i64),
            // imm26 * 4 covers [-2^27, 2^27 - 4] from the branch itself.
            Family::Branch26 => (-(1 << 27) - 4, (1 << 27) - 8),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Rel32 => "x86 jmp rel32",
            Family::Branch26 => "aarch64 b imm26",
        }
    }
}

/// Data byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// Signed distance from the end of a jump at `instruction` to `target`.
pub fn compute_offset(target: usize, instruction: usize, family: Family) -> i64 {
    let offset = target as i128 - instruction as i128 - family.jump_len() as i128;
    i64::try_from(offset).unwrap_or(if offset < 0 { i64::MIN } else { i64::MAX })
}

/// Pack an end-relative displacement into the family's field bytes.
pub fn encode(offset: i64, family: Family, endian: Endian) -> Result<FieldBytes, CodecError> {
    let (min, max) = family.reach();
    if offset < min || offset > max {
        return Err(CodecError::OutOfRange {
            offset,
            limit: family.limit(),
        });
    }

    let word = match family {
        Family::Rel32 => offset as i32 as u32,
        Family::Branch26 => {
            let from_branch = offset + family.jump_len() as i64;
            if from_branch % 4 != 0 {
                return Err(CodecError::Misaligned { offset });
            }
            B_IMM26 | (((from_branch >> 2) as u32) & IMM26_MASK)
        }
    };

    Ok(match endian {
        Endian::Little => word.to_le_bytes(),
        Endian::Big => word.to_be_bytes(),
    })
}

/// Inverse of [`encode`].
pub fn decode(bytes: FieldBytes, family: Family, endian: Endian) -> Result<i64, CodecError> {
    let word = match endian {
        Endian::Little => u32::from_le_bytes(bytes),
        Endian::Big => u32::from_be_bytes(bytes),
    };

    match family {
        Family::Rel32 => Ok(word as i32 as i64),
        Family::Branch26 => {
            if word & B_MASK != B_IMM26 {
                return Err(CodecError::NotABranch { word });
            }
            // Sign-extend the 26-bit immediate.
            let imm = ((word << 6) as i32 >> 6) as i64;
            Ok(imm * 4 - family.jump_len() as i64)
        }
    }
}

/// Complete jump instruction from `instruction` to `target`, as it would
/// appear in memory.
pub fn jump_instruction(
    target: usize,
    instruction: usize,
    family: Family,
    endian: Endian,
) -> Result<Vec<u8>, CodecError> {
    let field = encode(compute_offset(target, instruction, family), family, endian)?;
    let mut code = Vec::with_capacity(family.jump_len());
    if let Some(opcode) = family.opcode() {
        code.push(opcode);
    }
    code.extend_from_slice(&field);
    Ok(code)
}

/// Resolve the absolute target of the jump stored in `code`.
pub fn jump_target(
    code: &[u8],
    instruction: usize,
    family: Family,
    endian: Endian,
) -> Option<usize> {
    if code.len() < family.jump_len() {
        return None;
    }
    if let Some(opcode) = family.opcode() {
        if code[0] != opcode {
            return None;
        }
    }
    let start = family.field_offset();
    let field: FieldBytes = code[start..start + FIELD_LEN].try_into().ok()?;
    let offset = decode(field, family, endian).ok()?;
    let end = instruction as i128 + family.jump_len() as i128;
    usize::try_from(end + offset as i128).ok()
}
