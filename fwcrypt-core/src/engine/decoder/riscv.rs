//! RISC-V Instruction Decoder
//!
//! Decodes RV32I/RV64I base instructions, the M extension and the common subset of
//! the C (compressed) extension. Compressed `c.jal` is interpreted with RV32 semantics.

use super::{read_half, read_word, sign_extend, Instruction, InstructionDecoder, InstructionKind, Operand};
use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};

const ZERO: u8 = 0;
const RA: u8 = 1;
const SP: u8 = 2;

/// RISC-V decoder (little-endian instruction parcels).
pub struct RiscVDecoder;

impl InstructionDecoder for RiscVDecoder {
    fn architecture(&self) -> Architecture {
        Architecture::RiscV
    }

    fn alignment(&self) -> usize {
        2
    }

    fn decode(&self, bytes: &[u8], address: u64, _endianness: Endianness) -> Result<Instruction, DecodeError> {
        let low: u16 = read_half(bytes, address, Endianness::Little)?;
        if low & 0x3 != 0x3 {
            return decode_compressed(low, address);
        }
        let word: u32 = read_word(bytes, address, Endianness::Little)?;
        decode_word(word, address)
    }
}

#[inline]
fn rd(word: u32) -> u8 {
    ((word >> 7) & 0x1F) as u8
}

#[inline]
fn rs1(word: u32) -> u8 {
    ((word >> 15) & 0x1F) as u8
}

#[inline]
fn rs2(word: u32) -> u8 {
    ((word >> 20) & 0x1F) as u8
}

#[inline]
fn offset_target(address: u64, offset: i64) -> u64 {
    (address as i64).wrapping_add(offset) as u64
}

/// Decode one 32-bit RISC-V instruction.
pub fn decode_word(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    let invalid = DecodeError::InvalidEncoding {
        address,
        raw: u64::from(word),
    };
    let funct3: u32 = (word >> 12) & 0x7;
    let funct7: u32 = word >> 25;
    let imm_i: i64 = sign_extend(u64::from(word >> 20), 12);

    let inst = match word & 0x7F {
        0x37 => Instruction::new(address, 4, "lui", InstructionKind::Move).with_operands(&[
            Operand::Register(rd(word)),
            Operand::Immediate(sign_extend(u64::from(word & 0xFFFF_F000), 32)),
        ]),
        0x17 => {
            let value: u64 = offset_target(address, sign_extend(u64::from(word & 0xFFFF_F000), 32));
            Instruction::new(address, 4, "auipc", InstructionKind::Move)
                .with_operands(&[Operand::Register(rd(word)), Operand::Address(value)])
        }
        0x6F => {
            let imm: u64 = (u64::from(word >> 31) << 20)
                | (u64::from((word >> 21) & 0x3FF) << 1)
                | (u64::from((word >> 20) & 1) << 11)
                | (u64::from((word >> 12) & 0xFF) << 12);
            let target: u64 = offset_target(address, sign_extend(imm, 21));
            let (mnemonic, kind) = if rd(word) == ZERO {
                ("j", InstructionKind::Branch)
            } else {
                ("jal", InstructionKind::Call)
            };
            Instruction::new(address, 4, mnemonic, kind)
                .with_operands(&[Operand::Address(target)])
                .with_target(target)
        }
        0x67 => {
            let (mnemonic, kind) = match (rd(word), rs1(word), imm_i) {
                (ZERO, RA, 0) => ("ret", InstructionKind::Return),
                (ZERO, _, _) => ("jr", InstructionKind::IndirectJump),
                _ => ("jalr", InstructionKind::IndirectCall),
            };
            Instruction::new(address, 4, mnemonic, kind).with_operands(&[Operand::Memory {
                base: rs1(word),
                displacement: imm_i,
            }])
        }
        0x63 => {
            let imm: u64 = (u64::from(word >> 31) << 12)
                | (u64::from((word >> 7) & 1) << 11)
                | (u64::from((word >> 25) & 0x3F) << 5)
                | (u64::from((word >> 8) & 0xF) << 1);
            let target: u64 = offset_target(address, sign_extend(imm, 13));
            let mnemonic: &'static str = match funct3 {
                0 => "beq",
                1 => "bne",
                4 => "blt",
                5 => "bge",
                6 => "bltu",
                7 => "bgeu",
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, InstructionKind::ConditionalBranch)
                .with_operands(&[
                    Operand::Register(rs1(word)),
                    Operand::Register(rs2(word)),
                    Operand::Address(target),
                ])
                .with_target(target)
        }
        0x03 => {
            let mnemonic: &'static str = match funct3 {
                0 => "lb",
                1 => "lh",
                2 => "lw",
                3 => "ld",
                4 => "lbu",
                5 => "lhu",
                6 => "lwu",
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, InstructionKind::Load).with_operands(&[
                Operand::Register(rd(word)),
                Operand::Memory {
                    base: rs1(word),
                    displacement: imm_i,
                },
            ])
        }
        0x23 => {
            let imm: i64 = sign_extend(u64::from(((word >> 25) << 5) | ((word >> 7) & 0x1F)), 12);
            let mnemonic: &'static str = match funct3 {
                0 => "sb",
                1 => "sh",
                2 => "sw",
                3 => "sd",
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, InstructionKind::Store).with_operands(&[
                Operand::Register(rs2(word)),
                Operand::Memory {
                    base: rs1(word),
                    displacement: imm,
                },
            ])
        }
        0x13 | 0x1B => {
            if word == 0x0000_0013 {
                return Ok(Instruction::new(address, 4, "nop", InstructionKind::Nop));
            }
            let shamt: i64 = i64::from((word >> 20) & 0x3F);
            let (mnemonic, kind, imm) = match funct3 {
                0 if rs1(word) == ZERO => ("li", InstructionKind::Move, imm_i),
                0 => ("addi", InstructionKind::Arithmetic, imm_i),
                1 => ("slli", InstructionKind::Shift, shamt),
                2 => ("slti", InstructionKind::Compare, imm_i),
                3 => ("sltiu", InstructionKind::Compare, imm_i),
                4 => ("xori", InstructionKind::Logic, imm_i),
                5 if (word >> 26) == 0x18 => ("rori", InstructionKind::Rotate, shamt),
                5 if word & (1 << 30) != 0 => ("srai", InstructionKind::Shift, shamt),
                5 => ("srli", InstructionKind::Shift, shamt),
                6 => ("ori", InstructionKind::Logic, imm_i),
                _ => ("andi", InstructionKind::Logic, imm_i),
            };
            if kind == InstructionKind::Move {
                Instruction::new(address, 4, mnemonic, kind)
                    .with_operands(&[Operand::Register(rd(word)), Operand::Immediate(imm)])
            } else {
                Instruction::new(address, 4, mnemonic, kind).with_operands(&[
                    Operand::Register(rd(word)),
                    Operand::Register(rs1(word)),
                    Operand::Immediate(imm),
                ])
            }
        }
        0x33 | 0x3B => {
            let (mnemonic, kind) = match (funct7, funct3) {
                (0x01, 0..=3) => ("mul", InstructionKind::Arithmetic),
                (0x01, _) => ("div", InstructionKind::Arithmetic),
                (0x00, 0) => ("add", InstructionKind::Arithmetic),
                (0x20, 0) => ("sub", InstructionKind::Arithmetic),
                (0x00, 1) => ("sll", InstructionKind::Shift),
                (0x30, 1) => ("rol", InstructionKind::Rotate),
                (0x00, 2) | (0x00, 3) => ("slt", InstructionKind::Compare),
                (0x00, 4) => ("xor", InstructionKind::Logic),
                (0x00, 5) => ("srl", InstructionKind::Shift),
                (0x20, 5) => ("sra", InstructionKind::Shift),
                (0x30, 5) => ("ror", InstructionKind::Rotate),
                (0x00, 6) => ("or", InstructionKind::Logic),
                (0x00, 7) => ("and", InstructionKind::Logic),
                (0x20, 7) => ("andn", InstructionKind::Logic),
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, kind).with_operands(&[
                Operand::Register(rd(word)),
                Operand::Register(rs1(word)),
                Operand::Register(rs2(word)),
            ])
        }
        0x0F => Instruction::new(address, 4, "fence", InstructionKind::System),
        0x73 => {
            let mnemonic: &'static str = match word {
                0x0000_0073 => "ecall",
                0x0010_0073 => "ebreak",
                0x3020_0073 => "mret",
                0x1050_0073 => "wfi",
                _ if funct3 != 0 && funct3 != 4 => "csr",
                _ => return Err(invalid),
            };
            Instruction::new(address, 4, mnemonic, InstructionKind::System)
        }
        0x2F => Instruction::new(address, 4, "amo", InstructionKind::Load),
        0x07 | 0x27 | 0x53 => Instruction::new(address, 4, "fp", InstructionKind::System),
        _ => return Err(invalid),
    };
    Ok(inst)
}

/// Decode one 16-bit compressed instruction.
pub fn decode_compressed(half: u16, address: u64) -> Result<Instruction, DecodeError> {
    let invalid = DecodeError::InvalidEncoding {
        address,
        raw: u64::from(half),
    };
    if half == 0 {
        return Err(invalid);
    }
    let h: u32 = u32::from(half);
    let funct3: u32 = h >> 13;
    let rd_full: u8 = ((h >> 7) & 0x1F) as u8;
    let rs2_full: u8 = ((h >> 2) & 0x1F) as u8;
    let rd_prime: u8 = 8 + ((h >> 2) & 0x7) as u8;
    let rs1_prime: u8 = 8 + ((h >> 7) & 0x7) as u8;
    let imm6: i64 = sign_extend(u64::from(((h >> 12) & 1) << 5 | ((h >> 2) & 0x1F)), 6);

    let inst = match (h & 0x3, funct3) {
        (0, 0) => Instruction::new(address, 2, "c.addi4spn", InstructionKind::Arithmetic)
            .with_operands(&[Operand::Register(rd_prime), Operand::Register(SP)]),
        (0, 1 | 2 | 3) => Instruction::new(address, 2, "c.lw", InstructionKind::Load).with_operands(&[
            Operand::Register(rd_prime),
            Operand::Memory {
                base: rs1_prime,
                displacement: 0,
            },
        ]),
        (0, 5 | 6 | 7) => Instruction::new(address, 2, "c.sw", InstructionKind::Store).with_operands(&[
            Operand::Register(rd_prime),
            Operand::Memory {
                base: rs1_prime,
                displacement: 0,
            },
        ]),
        (1, 0) if rd_full == 0 => Instruction::new(address, 2, "c.nop", InstructionKind::Nop),
        (1, 0) => Instruction::new(address, 2, "c.addi", InstructionKind::Arithmetic).with_operands(&[
            Operand::Register(rd_full),
            Operand::Register(rd_full),
            Operand::Immediate(imm6),
        ]),
        (1, 1) | (1, 5) => {
            let target: u64 = offset_target(address, cj_offset(h));
            let (mnemonic, kind) = if funct3 == 1 {
                ("c.jal", InstructionKind::Call)
            } else {
                ("c.j", InstructionKind::Branch)
            };
            Instruction::new(address, 2, mnemonic, kind)
                .with_operands(&[Operand::Address(target)])
                .with_target(target)
        }
        (1, 2) => Instruction::new(address, 2, "c.li", InstructionKind::Move)
            .with_operands(&[Operand::Register(rd_full), Operand::Immediate(imm6)]),
        (1, 3) if rd_full == SP => Instruction::new(address, 2, "c.addi16sp", InstructionKind::Arithmetic)
            .with_operands(&[Operand::Register(SP)]),
        (1, 3) => Instruction::new(address, 2, "c.lui", InstructionKind::Move)
            .with_operands(&[Operand::Register(rd_full), Operand::Immediate(imm6 << 12)]),
        (1, 4) => {
            let (mnemonic, kind) = match (h >> 10) & 0x3 {
                0 => ("c.srli", InstructionKind::Shift),
                1 => ("c.srai", InstructionKind::Shift),
                2 => ("c.andi", InstructionKind::Logic),
                _ => match (h >> 5) & 0x3 {
                    0 => ("c.sub", InstructionKind::Arithmetic),
                    1 => ("c.xor", InstructionKind::Logic),
                    2 => ("c.or", InstructionKind::Logic),
                    _ => ("c.and", InstructionKind::Logic),
                },
            };
            Instruction::new(address, 2, mnemonic, kind).with_operands(&[Operand::Register(rs1_prime)])
        }
        (1, 6) | (1, 7) => {
            let offset: u64 = (((h >> 12) & 1) << 8) as u64
                | (((h >> 10) & 0x3) << 3) as u64
                | (((h >> 5) & 0x3) << 6) as u64
                | (((h >> 3) & 0x3) << 1) as u64
                | (((h >> 2) & 1) << 5) as u64;
            let target: u64 = offset_target(address, sign_extend(offset, 9));
            let mnemonic: &'static str = if funct3 == 6 { "c.beqz" } else { "c.bnez" };
            Instruction::new(address, 2, mnemonic, InstructionKind::ConditionalBranch)
                .with_operands(&[Operand::Register(rs1_prime), Operand::Address(target)])
                .with_target(target)
        }
        (2, 0) => Instruction::new(address, 2, "c.slli", InstructionKind::Shift)
            .with_operands(&[Operand::Register(rd_full)]),
        (2, 1 | 2 | 3) => Instruction::new(address, 2, "c.lwsp", InstructionKind::Load).with_operands(&[
            Operand::Register(rd_full),
            Operand::Memory {
                base: SP,
                displacement: 0,
            },
        ]),
        (2, 4) => {
            let bit12: bool = h & (1 << 12) != 0;
            match (bit12, rd_full, rs2_full) {
                (false, 0, 0) => return Err(invalid),
                (false, RA, 0) => Instruction::new(address, 2, "ret", InstructionKind::Return),
                (false, base, 0) => Instruction::new(address, 2, "c.jr", InstructionKind::IndirectJump)
                    .with_operands(&[Operand::Register(base)]),
                (false, dst, src) => Instruction::new(address, 2, "c.mv", InstructionKind::Move)
                    .with_operands(&[Operand::Register(dst), Operand::Register(src)]),
                (true, 0, 0) => Instruction::new(address, 2, "c.ebreak", InstructionKind::System),
                (true, base, 0) => Instruction::new(address, 2, "c.jalr", InstructionKind::IndirectCall)
                    .with_operands(&[Operand::Register(base)]),
                (true, dst, src) => Instruction::new(address, 2, "c.add", InstructionKind::Arithmetic)
                    .with_operands(&[Operand::Register(dst), Operand::Register(dst), Operand::Register(src)]),
            }
        }
        (2, 5 | 6 | 7) => Instruction::new(address, 2, "c.swsp", InstructionKind::Store).with_operands(&[
            Operand::Register(rs2_full),
            Operand::Memory {
                base: SP,
                displacement: 0,
            },
        ]),
        _ => return Err(invalid),
    };
    Ok(inst)
}

/// Offset of `c.j`/`c.jal`: imm[11|4|9:8|10|6|7|3:1|5] in bits 12..2.
fn cj_offset(h: u32) -> i64 {
    let bit = |from: u32, to: u32| -> u64 { u64::from((h >> from) & 1) << to };
    let offset: u64 = bit(12, 11)
        | bit(11, 4)
        | bit(10, 9)
        | bit(9, 8)
        | bit(8, 10)
        | bit(7, 6)
        | bit(6, 7)
        | bit(5, 3)
        | bit(4, 2)
        | bit(3, 1)
        | bit(2, 5);
    sign_extend(offset, 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], address: u64) -> Result<Instruction, DecodeError> {
        RiscVDecoder.decode(bytes, address, Endianness::Little)
    }

    #[test]
    fn test_decode_ret_and_nop() {
        assert_eq!(decode(&0x0000_8067u32.to_le_bytes(), 0).unwrap().kind, InstructionKind::Return);
        assert_eq!(decode(&0x0000_0013u32.to_le_bytes(), 0).unwrap().kind, InstructionKind::Nop);
        assert_eq!(decode(&0x8082u16.to_le_bytes(), 0).unwrap().kind, InstructionKind::Return);
        assert_eq!(decode(&0x0001u16.to_le_bytes(), 0).unwrap().kind, InstructionKind::Nop);
    }

    #[test]
    fn test_decode_jal_call() {
        // jal ra, +0x100
        let word: u32 = (0x100 >> 1 << 21) | (1 << 7) | 0x6F;
        let inst = decode(&word.to_le_bytes(), 0x1000).unwrap();
        assert_eq!(inst.kind, InstructionKind::Call);
        assert_eq!(inst.target, Some(0x1100));
    }

    #[test]
    fn test_decode_backward_bne() {
        // bne a0, a1, -8  (imm = 0x1FF8 as 13-bit)
        let imm: u32 = (-8i32 as u32) & 0x1FFF;
        let word: u32 = ((imm >> 12) & 1) << 31
            | ((imm >> 5) & 0x3F) << 25
            | (11 << 20)
            | (10 << 15)
            | (1 << 12)
            | ((imm >> 1) & 0xF) << 8
            | ((imm >> 11) & 1) << 7
            | 0x63;
        let inst = decode(&word.to_le_bytes(), 0x200).unwrap();
        assert_eq!(inst.kind, InstructionKind::ConditionalBranch);
        assert_eq!(inst.target, Some(0x1F8));
    }

    #[test]
    fn test_decode_li_and_slti() {
        // addi a0, zero, 10 -> li
        let li: u32 = (10 << 20) | (10 << 7) | 0x13;
        let inst = decode(&li.to_le_bytes(), 0).unwrap();
        assert_eq!(inst.mnemonic, "li");
        assert_eq!(inst.immediate(), Some(10));
    }

    #[test]
    fn test_zero_parcel_is_illegal() {
        assert!(decode(&[0, 0, 0, 0], 0).is_err());
    }
}
