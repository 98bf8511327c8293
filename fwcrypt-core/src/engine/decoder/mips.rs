//! MIPS32 Instruction Decoder
//!
//! Decodes the MIPS32 integer instruction set plus coarse coprocessor classes.
//! Branches and jumps carry a delay slot; the CFG builder keeps the slot instruction
//! inside the branching block.
//!
//! # Decoding Algorithm
//! 1. Extract the primary opcode (bits 26-31)
//! 2. Opcode 0 (SPECIAL) dispatches on the function field (bits 0-5)
//! 3. Opcode 1 (REGIMM) dispatches on the `rt` field (bits 16-20)

use super::{read_word, sign_extend, Instruction, InstructionDecoder, InstructionKind, Operand};
use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};

const RA: u8 = 31;

/// MIPS32 decoder (either byte order).
pub struct MipsDecoder;

impl InstructionDecoder for MipsDecoder {
    fn architecture(&self) -> Architecture {
        Architecture::Mips
    }

    fn alignment(&self) -> usize {
        4
    }

    #[inline]
    fn decode(&self, bytes: &[u8], address: u64, endianness: Endianness) -> Result<Instruction, DecodeError> {
        let word: u32 = read_word(bytes, address, endianness)?;
        decode_word(word, address)
    }
}

#[inline]
fn fields(word: u32) -> (u8, u8, u8, i64) {
    let rs: u8 = ((word >> 21) & 0x1F) as u8;
    let rt: u8 = ((word >> 16) & 0x1F) as u8;
    let rd: u8 = ((word >> 11) & 0x1F) as u8;
    let imm: i64 = sign_extend(u64::from(word & 0xFFFF), 16);
    (rs, rt, rd, imm)
}

#[inline]
fn branch_target(address: u64, imm: i64) -> u64 {
    (address as i64).wrapping_add(4).wrapping_add(imm << 2) as u64
}

/// Decode one MIPS32 instruction word located at `address`.
pub fn decode_word(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    let opcode: u32 = word >> 26;
    let (rs, rt, rd, imm) = fields(word);
    let invalid = DecodeError::InvalidEncoding {
        address,
        raw: u64::from(word),
    };

    let immediate_form = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[
            Operand::Register(rt),
            Operand::Register(rs),
            Operand::Immediate(imm),
        ])
    };
    let unsigned_form = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[
            Operand::Register(rt),
            Operand::Register(rs),
            Operand::Immediate(i64::from(word & 0xFFFF)),
        ])
    };
    let memory_form = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[
            Operand::Register(rt),
            Operand::Memory {
                base: rs,
                displacement: imm,
            },
        ])
    };

    let inst = match opcode {
        0x00 => return decode_special(word, address),
        0x01 => {
            let target: u64 = branch_target(address, imm);
            let (mnemonic, kind) = match rt {
                0x00 => ("bltz", InstructionKind::ConditionalBranch),
                0x01 => ("bgez", InstructionKind::ConditionalBranch),
                0x10 => ("bltzal", InstructionKind::Call),
                0x11 if rs == 0 => ("bal", InstructionKind::Call),
                0x11 => ("bgezal", InstructionKind::Call),
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, kind)
                .with_operands(&[Operand::Register(rs), Operand::Address(target)])
                .with_target(target)
                .with_delay_slot()
        }
        0x02 | 0x03 => {
            let region: u64 = address.wrapping_add(4) & 0xF000_0000;
            let target: u64 = region | (u64::from(word & 0x03FF_FFFF) << 2);
            let (mnemonic, kind) = if opcode == 0x02 {
                ("j", InstructionKind::Branch)
            } else {
                ("jal", InstructionKind::Call)
            };
            Instruction::new(address, 4, mnemonic, kind)
                .with_operands(&[Operand::Address(target)])
                .with_target(target)
                .with_delay_slot()
        }
        0x04..=0x07 => {
            let target: u64 = branch_target(address, imm);
            let (mnemonic, kind) = match opcode {
                0x04 if rs == 0 && rt == 0 => ("b", InstructionKind::Branch),
                0x04 => ("beq", InstructionKind::ConditionalBranch),
                0x05 => ("bne", InstructionKind::ConditionalBranch),
                0x06 => ("blez", InstructionKind::ConditionalBranch),
                _ => ("bgtz", InstructionKind::ConditionalBranch),
            };
            Instruction::new(address, 4, mnemonic, kind)
                .with_operands(&[Operand::Register(rs), Operand::Register(rt), Operand::Address(target)])
                .with_target(target)
                .with_delay_slot()
        }
        0x08 => immediate_form("addi", InstructionKind::Arithmetic),
        0x09 if rs == 0 => Instruction::new(address, 4, "li", InstructionKind::Move)
            .with_operands(&[Operand::Register(rt), Operand::Immediate(imm)]),
        0x09 => immediate_form("addiu", InstructionKind::Arithmetic),
        0x0A => immediate_form("slti", InstructionKind::Compare),
        0x0B => immediate_form("sltiu", InstructionKind::Compare),
        0x0C => unsigned_form("andi", InstructionKind::Logic),
        0x0D => unsigned_form("ori", InstructionKind::Logic),
        0x0E => unsigned_form("xori", InstructionKind::Logic),
        0x0F => Instruction::new(address, 4, "lui", InstructionKind::Move).with_operands(&[
            Operand::Register(rt),
            Operand::Immediate(i64::from(word & 0xFFFF) << 16),
        ]),
        0x10 | 0x12 => Instruction::new(address, 4, "cop", InstructionKind::System),
        0x11 => Instruction::new(address, 4, "cop1", InstructionKind::System),
        0x1C => match word & 0x3F {
            0x02 => Instruction::new(address, 4, "mul", InstructionKind::Arithmetic)
                .with_operands(&[Operand::Register(rd), Operand::Register(rs), Operand::Register(rt)]),
            0x00 | 0x01 | 0x04 | 0x05 => Instruction::new(address, 4, "madd", InstructionKind::Arithmetic),
            0x20 | 0x21 => Instruction::new(address, 4, "clz", InstructionKind::Arithmetic),
            _ => return Err(invalid),
        },
        0x1F => match word & 0x3F {
            0x00 | 0x04 => Instruction::new(address, 4, "ext", InstructionKind::Logic),
            0x20 => Instruction::new(address, 4, "bshfl", InstructionKind::Rotate),
            _ => Instruction::new(address, 4, "special3", InstructionKind::System),
        },
        0x20 => memory_form("lb", InstructionKind::Load),
        0x21 => memory_form("lh", InstructionKind::Load),
        0x22 | 0x26 => memory_form("lwl", InstructionKind::Load),
        0x23 => memory_form("lw", InstructionKind::Load),
        0x24 => memory_form("lbu", InstructionKind::Load),
        0x25 => memory_form("lhu", InstructionKind::Load),
        0x28 => memory_form("sb", InstructionKind::Store),
        0x29 => memory_form("sh", InstructionKind::Store),
        0x2A | 0x2E => memory_form("swl", InstructionKind::Store),
        0x2B => memory_form("sw", InstructionKind::Store),
        0x2F => Instruction::new(address, 4, "cache", InstructionKind::System),
        0x30 => memory_form("ll", InstructionKind::Load),
        0x31 | 0x35 => memory_form("lwc1", InstructionKind::Load),
        0x33 => Instruction::new(address, 4, "pref", InstructionKind::Nop),
        0x38 => memory_form("sc", InstructionKind::Store),
        0x39 | 0x3D => memory_form("swc1", InstructionKind::Store),
        _ => return Err(invalid),
    };
    Ok(inst)
}

fn decode_special(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    if word == 0 {
        return Ok(Instruction::new(address, 4, "nop", InstructionKind::Nop));
    }
    let (rs, rt, rd, _) = fields(word);
    let shamt: i64 = i64::from((word >> 6) & 0x1F);
    let funct: u32 = word & 0x3F;

    let three = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[
            Operand::Register(rd),
            Operand::Register(rs),
            Operand::Register(rt),
        ])
    };
    let shift = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[
            Operand::Register(rd),
            Operand::Register(rt),
            Operand::Immediate(shamt),
        ])
    };

    let inst = match funct {
        0x00 => shift("sll", InstructionKind::Shift),
        // srl with rs=1 is rotr on MIPS32r2
        0x02 if rs == 1 => shift("rotr", InstructionKind::Rotate),
        0x02 => shift("srl", InstructionKind::Shift),
        0x03 => shift("sra", InstructionKind::Shift),
        0x04 => three("sllv", InstructionKind::Shift),
        0x06 if shamt == 1 => three("rotrv", InstructionKind::Rotate),
        0x06 => three("srlv", InstructionKind::Shift),
        0x07 => three("srav", InstructionKind::Shift),
        0x08 => {
            let kind = if rs == RA {
                InstructionKind::Return
            } else {
                InstructionKind::IndirectJump
            };
            Instruction::new(address, 4, "jr", kind)
                .with_operands(&[Operand::Register(rs)])
                .with_delay_slot()
        }
        0x09 => Instruction::new(address, 4, "jalr", InstructionKind::IndirectCall)
            .with_operands(&[Operand::Register(rd), Operand::Register(rs)])
            .with_delay_slot(),
        0x0A | 0x0B => three("movz", InstructionKind::Move),
        0x0C => Instruction::new(address, 4, "syscall", InstructionKind::System),
        0x0D => Instruction::new(address, 4, "break", InstructionKind::System),
        0x0F => Instruction::new(address, 4, "sync", InstructionKind::System),
        0x10 | 0x12 => Instruction::new(address, 4, "mflo", InstructionKind::Move)
            .with_operands(&[Operand::Register(rd)]),
        0x11 | 0x13 => Instruction::new(address, 4, "mtlo", InstructionKind::Move)
            .with_operands(&[Operand::Register(rs)]),
        0x18..=0x1B => Instruction::new(address, 4, "mult", InstructionKind::Arithmetic)
            .with_operands(&[Operand::Register(rs), Operand::Register(rt)]),
        0x20 => three("add", InstructionKind::Arithmetic),
        0x21 if rt == 0 => Instruction::new(address, 4, "move", InstructionKind::Move)
            .with_operands(&[Operand::Register(rd), Operand::Register(rs)]),
        0x21 => three("addu", InstructionKind::Arithmetic),
        0x22 | 0x23 => three("subu", InstructionKind::Arithmetic),
        0x24 => three("and", InstructionKind::Logic),
        0x25 => three("or", InstructionKind::Logic),
        0x26 => three("xor", InstructionKind::Logic),
        0x27 => three("nor", InstructionKind::Logic),
        0x2A | 0x2B => three("slt", InstructionKind::Compare),
        0x30..=0x36 => Instruction::new(address, 4, "trap", InstructionKind::System),
        _ => {
            return Err(DecodeError::InvalidEncoding {
                address,
                raw: u64::from(word),
            })
        }
    };
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_jr_ra_is_return() {
        let inst = decode_word(0x03E0_0008, 0x8000_0100).unwrap();
        assert_eq!(inst.kind, InstructionKind::Return);
        assert!(inst.delay_slot);
    }

    #[test]
    fn test_decode_jal_target() {
        // jal 0x80001000 from 0x80000010
        let word: u32 = (0x03 << 26) | (0x8000_1000u32 >> 2 & 0x03FF_FFFF);
        let inst = decode_word(word, 0x8000_0010).unwrap();
        assert_eq!(inst.kind, InstructionKind::Call);
        assert_eq!(inst.target, Some(0x8000_1000));
    }

    #[test]
    fn test_decode_bne_backward() {
        // bne t0, zero, -4 instructions
        let word: u32 = (0x05 << 26) | (8 << 21) | 0xFFFC;
        let inst = decode_word(word, 0x100).unwrap();
        assert_eq!(inst.kind, InstructionKind::ConditionalBranch);
        assert_eq!(inst.target, Some(0x100 + 4 - 16));
    }

    #[test]
    fn test_decode_slti_and_lui() {
        // slti t0, t1, 10
        let slti = decode_word((0x0A << 26) | (9 << 21) | (8 << 16) | 10, 0).unwrap();
        assert_eq!(slti.kind, InstructionKind::Compare);
        assert_eq!(slti.immediate(), Some(10));
        // lui a0, 0x1234
        let lui = decode_word((0x0F << 26) | (4 << 16) | 0x1234, 0).unwrap();
        assert_eq!(lui.immediate(), Some(0x1234_0000));
    }

    #[test]
    fn test_invalid_special_function() {
        assert!(decode_word(0x0000_0001 | (1 << 11), 0).is_err());
    }
}
