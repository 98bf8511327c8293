//! ARM (A32) Instruction Decoder
//!
//! Decodes 32-bit ARM-state instructions. Covers branches, data processing, single and
//! multiple load/store, multiplies, halfword transfers and the system/coprocessor space
//! coarsely. Thumb is not decoded.
//!
//! # Decoding Algorithm
//! 1. Extract the condition field (bits 28-31); `0xF` selects the unconditional space
//! 2. Dispatch on bits 25-27 (instruction class)
//! 3. Compute PC-relative targets with the architectural `PC + 8` bias

use super::{read_word, sign_extend, Instruction, InstructionDecoder, InstructionKind, Operand};
use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};

const PC: u8 = 15;
const LR: u8 = 14;
const SP: u8 = 13;

const DATA_PROCESSING: [(&str, InstructionKind); 16] = [
    ("and", InstructionKind::Logic),
    ("eor", InstructionKind::Logic),
    ("sub", InstructionKind::Arithmetic),
    ("rsb", InstructionKind::Arithmetic),
    ("add", InstructionKind::Arithmetic),
    ("adc", InstructionKind::Arithmetic),
    ("sbc", InstructionKind::Arithmetic),
    ("rsc", InstructionKind::Arithmetic),
    ("tst", InstructionKind::Compare),
    ("teq", InstructionKind::Compare),
    ("cmp", InstructionKind::Compare),
    ("cmn", InstructionKind::Compare),
    ("orr", InstructionKind::Logic),
    ("mov", InstructionKind::Move),
    ("bic", InstructionKind::Logic),
    ("mvn", InstructionKind::Logic),
];

/// ARM A32 decoder.
pub struct ArmDecoder;

impl InstructionDecoder for ArmDecoder {
    fn architecture(&self) -> Architecture {
        Architecture::Arm
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

/// Decode one A32 instruction word located at `address`.
///
/// # Errors
/// Returns `DecodeError::InvalidEncoding` for the unconditional space (except `blx`/`pld`)
/// and for undefined encodings.
pub fn decode_word(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    let cond: u32 = word >> 28;
    let invalid = DecodeError::InvalidEncoding {
        address,
        raw: u64::from(word),
    };

    if cond == 0xF {
        if (word >> 25) & 0x7 == 0b101 {
            let h: i64 = i64::from((word >> 24) & 1) << 1;
            let offset: i64 = (sign_extend(u64::from(word & 0x00FF_FFFF), 24) << 2) | h;
            let target: u64 = pc_relative(address, offset);
            return Ok(Instruction::new(address, 4, "blx", InstructionKind::Call)
                .with_operands(&[Operand::Address(target)])
                .with_target(target));
        }
        if (word & 0x0D70_F000) == 0x0550_F000 {
            return Ok(Instruction::new(address, 4, "pld", InstructionKind::Nop));
        }
        return Err(invalid);
    }

    if (word & 0x0FFF_FFFF) == 0x0320_F000 || word == 0xE1A0_0000 {
        return Ok(Instruction::new(address, 4, "nop", InstructionKind::Nop));
    }

    let conditional: bool = cond != 0xE;
    match (word >> 25) & 0x7 {
        0b101 => Ok(decode_branch(word, address, conditional)),
        0b100 => Ok(decode_block_transfer(word, address)),
        0b010 | 0b011 => decode_single_transfer(word, address),
        0b000 | 0b001 => decode_data_processing(word, address),
        0b110 => Ok(Instruction::new(address, 4, "ldc", InstructionKind::System)),
        _ => {
            if word & (1 << 24) != 0 {
                Ok(Instruction::new(address, 4, "svc", InstructionKind::System)
                    .with_operands(&[Operand::Immediate(i64::from(word & 0x00FF_FFFF))]))
            } else {
                Ok(Instruction::new(address, 4, "mcr", InstructionKind::System))
            }
        }
    }
}

#[inline]
fn pc_relative(address: u64, offset: i64) -> u64 {
    (address as i64).wrapping_add(8).wrapping_add(offset) as u64
}

fn decode_branch(word: u32, address: u64, conditional: bool) -> Instruction {
    let link: bool = word & (1 << 24) != 0;
    let offset: i64 = sign_extend(u64::from(word & 0x00FF_FFFF), 24) << 2;
    let target: u64 = pc_relative(address, offset);
    let (mnemonic, kind) = match (link, conditional) {
        (true, _) => ("bl", InstructionKind::Call),
        (false, true) => ("bcc", InstructionKind::ConditionalBranch),
        (false, false) => ("b", InstructionKind::Branch),
    };
    Instruction::new(address, 4, mnemonic, kind)
        .with_operands(&[Operand::Address(target)])
        .with_target(target)
}

fn decode_block_transfer(word: u32, address: u64) -> Instruction {
    let load: bool = word & (1 << 20) != 0;
    let rn: u8 = ((word >> 16) & 0xF) as u8;
    let writeback: bool = word & (1 << 21) != 0;
    let register_list: u32 = word & 0xFFFF;
    let stack: bool = rn == SP && writeback;

    if load {
        let mnemonic: &'static str = if stack { "pop" } else { "ldm" };
        let kind = if register_list & (1 << PC) != 0 {
            InstructionKind::Return
        } else {
            InstructionKind::Load
        };
        Instruction::new(address, 4, mnemonic, kind).with_operands(&[Operand::Register(rn)])
    } else {
        let mnemonic: &'static str = if stack { "push" } else { "stm" };
        Instruction::new(address, 4, mnemonic, InstructionKind::Store).with_operands(&[Operand::Register(rn)])
    }
}

fn decode_single_transfer(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    let register_offset: bool = word & (1 << 25) != 0;
    if register_offset && word & 0x10 != 0 {
        // Media instructions (rev, uxtb, ...)
        return Ok(Instruction::new(address, 4, "media", InstructionKind::Arithmetic));
    }

    let load: bool = word & (1 << 20) != 0;
    let byte: bool = word & (1 << 22) != 0;
    let up: bool = word & (1 << 23) != 0;
    let pre_indexed: bool = word & (1 << 24) != 0;
    let rn: u8 = ((word >> 16) & 0xF) as u8;
    let rd: u8 = ((word >> 12) & 0xF) as u8;
    let offset12: i64 = i64::from(word & 0xFFF);
    let displacement: i64 = if up { offset12 } else { -offset12 };

    let mnemonic: &'static str = match (load, byte) {
        (true, false) => "ldr",
        (true, true) => "ldrb",
        (false, false) => "str",
        (false, true) => "strb",
    };

    let memory: Operand = if rn == PC && !register_offset && pre_indexed {
        Operand::Address(pc_relative(address, displacement))
    } else if register_offset {
        Operand::Memory {
            base: rn,
            displacement: 0,
        }
    } else {
        Operand::Memory { base: rn, displacement }
    };

    let kind = if load && rd == PC {
        if rn == SP && !pre_indexed {
            InstructionKind::Return
        } else {
            InstructionKind::IndirectJump
        }
    } else if load {
        InstructionKind::Load
    } else {
        InstructionKind::Store
    };

    Ok(Instruction::new(address, 4, mnemonic, kind).with_operands(&[Operand::Register(rd), memory]))
}

fn decode_data_processing(word: u32, address: u64) -> Result<Instruction, DecodeError> {
    let immediate: bool = word & (1 << 25) != 0;

    if !immediate {
        if (word & 0x0FFF_FFF0) == 0x012F_FF10 {
            let rm: u8 = (word & 0xF) as u8;
            let kind = if rm == LR {
                InstructionKind::Return
            } else {
                InstructionKind::IndirectJump
            };
            return Ok(Instruction::new(address, 4, "bx", kind).with_operands(&[Operand::Register(rm)]));
        }
        if (word & 0x0FFF_FFF0) == 0x012F_FF30 {
            let rm: u8 = (word & 0xF) as u8;
            return Ok(Instruction::new(address, 4, "blx", InstructionKind::IndirectCall)
                .with_operands(&[Operand::Register(rm)]));
        }
        if (word & 0x90) == 0x90 {
            return Ok(decode_multiply_or_extra(word, address));
        }
    }

    // Opcodes 8-11 without the S bit are the miscellaneous space (mrs/msr/movw/movt/clz)
    if (word & 0x0190_0000) == 0x0100_0000 {
        let rd: u8 = ((word >> 12) & 0xF) as u8;
        let imm16: i64 = i64::from(((word >> 4) & 0xF000) | (word & 0xFFF));
        return Ok(match word & 0x0FF0_0000 {
            0x0300_0000 => Instruction::new(address, 4, "movw", InstructionKind::Move)
                .with_operands(&[Operand::Register(rd), Operand::Immediate(imm16)]),
            0x0340_0000 => Instruction::new(address, 4, "movt", InstructionKind::Move)
                .with_operands(&[Operand::Register(rd), Operand::Immediate(imm16 << 16)]),
            _ if (word & 0x0FFF_0FF0) == 0x016F_0F10 => {
                Instruction::new(address, 4, "clz", InstructionKind::Arithmetic)
            }
            _ => Instruction::new(address, 4, "msr", InstructionKind::System),
        });
    }

    let opcode: usize = ((word >> 21) & 0xF) as usize;
    let rn: u8 = ((word >> 16) & 0xF) as u8;
    let rd: u8 = ((word >> 12) & 0xF) as u8;
    let (mut mnemonic, mut kind) = DATA_PROCESSING[opcode];

    let operand2: Operand = if immediate {
        let imm8: u32 = word & 0xFF;
        let rotate: u32 = ((word >> 8) & 0xF) * 2;
        Operand::Immediate(i64::from(imm8.rotate_right(rotate)))
    } else {
        let rm: u8 = (word & 0xF) as u8;
        let register_shift: bool = word & 0x10 != 0;
        let shift_type: u32 = (word >> 5) & 0x3;
        let shift_amount: u32 = (word >> 7) & 0x1F;
        if mnemonic == "mov" && (register_shift || shift_amount != 0) {
            let (shift_mnemonic, shift_kind) = match shift_type {
                0 => ("lsl", InstructionKind::Shift),
                1 => ("lsr", InstructionKind::Shift),
                2 => ("asr", InstructionKind::Shift),
                _ => ("ror", InstructionKind::Rotate),
            };
            mnemonic = shift_mnemonic;
            kind = shift_kind;
        }
        Operand::Register(rm)
    };

    // adr: PC-relative address materialization
    if immediate && rn == PC && (opcode == 2 || opcode == 4) {
        if let Operand::Immediate(imm) = operand2 {
            let offset: i64 = if opcode == 4 { imm } else { -imm };
            return Ok(Instruction::new(address, 4, "adr", InstructionKind::Move)
                .with_operands(&[Operand::Register(rd), Operand::Address(pc_relative(address, offset))]));
        }
    }

    if rd == PC && kind != InstructionKind::Compare {
        let returns: bool = mnemonic == "mov" && operand2 == Operand::Register(LR);
        let kind = if returns {
            InstructionKind::Return
        } else {
            InstructionKind::IndirectJump
        };
        return Ok(Instruction::new(address, 4, mnemonic, kind).with_operands(&[Operand::Register(rd), operand2]));
    }

    let instruction = Instruction::new(address, 4, mnemonic, kind);
    Ok(match kind {
        InstructionKind::Compare => instruction.with_operands(&[Operand::Register(rn), operand2]),
        InstructionKind::Move => instruction.with_operands(&[Operand::Register(rd), operand2]),
        _ if mnemonic == "mvn" => instruction.with_operands(&[Operand::Register(rd), operand2]),
        _ => instruction.with_operands(&[Operand::Register(rd), Operand::Register(rn), operand2]),
    })
}

fn decode_multiply_or_extra(word: u32, address: u64) -> Instruction {
    if (word & 0x0F00_00F0) == 0x0000_0090 {
        let rd: u8 = ((word >> 16) & 0xF) as u8;
        return Instruction::new(address, 4, "mul", InstructionKind::Arithmetic)
            .with_operands(&[Operand::Register(rd)]);
    }
    if (word >> 5) & 0x3 == 0 {
        return Instruction::new(address, 4, "swp", InstructionKind::Load);
    }
    let rn: u8 = ((word >> 16) & 0xF) as u8;
    let rd: u8 = ((word >> 12) & 0xF) as u8;
    let memory = Operand::Memory {
        base: rn,
        displacement: 0,
    };
    if word & (1 << 20) != 0 {
        Instruction::new(address, 4, "ldrh", InstructionKind::Load).with_operands(&[Operand::Register(rd), memory])
    } else {
        Instruction::new(address, 4, "strh", InstructionKind::Store).with_operands(&[Operand::Register(rd), memory])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_branch_and_link() {
        // bl +0x100 from 0x1000 -> 0x1000 + 8 + 0x100
        let inst = decode_word(0xEB00_0040, 0x1000).unwrap();
        assert_eq!(inst.kind, InstructionKind::Call);
        assert_eq!(inst.target, Some(0x1108));
    }

    #[test]
    fn test_decode_conditional_backward_branch() {
        // bne -16
        let inst = decode_word(0x1AFF_FFFA, 0x2018).unwrap();
        assert_eq!(inst.kind, InstructionKind::ConditionalBranch);
        assert_eq!(inst.target, Some(0x2008));
    }

    #[test]
    fn test_decode_returns() {
        assert_eq!(decode_word(0xE12F_FF1E, 0).unwrap().kind, InstructionKind::Return); // bx lr
        assert_eq!(decode_word(0xE8BD_8010, 0).unwrap().kind, InstructionKind::Return); // pop {r4, pc}
        assert_eq!(decode_word(0xE1A0_F00E, 0).unwrap().kind, InstructionKind::Return); // mov pc, lr
        assert_eq!(decode_word(0xE12F_FF13, 0).unwrap().kind, InstructionKind::IndirectJump); // bx r3
    }

    #[test]
    fn test_decode_compare_immediate() {
        // cmp r2, #10
        let inst = decode_word(0xE352_000A, 0).unwrap();
        assert_eq!(inst.kind, InstructionKind::Compare);
        assert_eq!(inst.immediate(), Some(10));
    }

    #[test]
    fn test_decode_literal_load() {
        // ldr r3, [pc, #8] at 0x100 -> literal at 0x110
        let inst = decode_word(0xE59F_3008, 0x100).unwrap();
        assert_eq!(inst.kind, InstructionKind::Load);
        assert_eq!(inst.operands[1], Operand::Address(0x110));
    }

    #[test]
    fn test_decode_logic_and_rotate() {
        assert_eq!(decode_word(0xE020_0001, 0).unwrap().mnemonic, "eor");
        // mov r0, r1, ror #8
        let inst = decode_word(0xE1A0_0461, 0).unwrap();
        assert_eq!(inst.kind, InstructionKind::Rotate);
    }

    #[test]
    fn test_unconditional_space_is_rejected() {
        assert!(decode_word(0xF000_0000, 0x40).is_err());
    }
}
