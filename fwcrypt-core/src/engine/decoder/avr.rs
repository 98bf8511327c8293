//! AVR Instruction Decoder
//!
//! Decodes the classic AVR 8-bit instruction set. Program memory is word addressed on
//! the device, but every address handled here is a byte address so AVR functions can be
//! placed in the same address space as the other architectures.

use super::{read_half, sign_extend, Instruction, InstructionDecoder, InstructionKind, Operand};
use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};

/// AVR decoder (16/32-bit little-endian opcodes).
pub struct AvrDecoder;

impl InstructionDecoder for AvrDecoder {
    fn architecture(&self) -> Architecture {
        Architecture::Avr
    }

    fn alignment(&self) -> usize {
        2
    }

    fn decode(&self, bytes: &[u8], address: u64, _endianness: Endianness) -> Result<Instruction, DecodeError> {
        let op: u16 = read_half(bytes, address, Endianness::Little)?;
        let second = || -> Result<u16, DecodeError> {
            match bytes.get(2..) {
                Some(rest) => read_half(rest, address, Endianness::Little),
                None => Err(DecodeError::Truncated {
                    address,
                    available: bytes.len(),
                }),
            }
        };
        decode_opcode(op, address, second)
    }
}

#[inline]
fn rd5(op: u16) -> u8 {
    ((op >> 4) & 0x1F) as u8
}

#[inline]
fn rr5(op: u16) -> u8 {
    (((op >> 5) & 0x10) | (op & 0x0F)) as u8
}

#[inline]
fn rd_upper(op: u16) -> u8 {
    16 + ((op >> 4) & 0x0F) as u8
}

#[inline]
fn imm8(op: u16) -> i64 {
    i64::from(((op >> 4) & 0xF0) | (op & 0x0F))
}

#[inline]
fn relative(address: u64, words: i64) -> u64 {
    (address as i64).wrapping_add(2 + words * 2) as u64
}

/// Decode one opcode; `second` fetches the extension word of 32-bit instructions.
pub fn decode_opcode<F>(op: u16, address: u64, second: F) -> Result<Instruction, DecodeError>
where
    F: FnOnce() -> Result<u16, DecodeError>,
{
    let invalid = DecodeError::InvalidEncoding {
        address,
        raw: u64::from(op),
    };
    let two_regs = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 2, mnemonic, kind)
            .with_operands(&[Operand::Register(rd5(op)), Operand::Register(rr5(op))])
    };
    let reg_imm = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 2, mnemonic, kind)
            .with_operands(&[Operand::Register(rd_upper(op)), Operand::Immediate(imm8(op))])
    };
    let single = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 2, mnemonic, kind).with_operands(&[Operand::Register(rd5(op))])
    };

    let inst = match op >> 12 {
        0x0 => match (op >> 10) & 0x3 {
            0 if op == 0 => Instruction::new(address, 2, "nop", InstructionKind::Nop),
            0 => match op >> 8 {
                0x01 => Instruction::new(address, 2, "movw", InstructionKind::Move),
                0x02 | 0x03 => Instruction::new(address, 2, "muls", InstructionKind::Arithmetic),
                _ => return Err(invalid),
            },
            1 => two_regs("cpc", InstructionKind::Compare),
            2 => two_regs("sbc", InstructionKind::Arithmetic),
            _ if rd5(op) == rr5(op) => single("lsl", InstructionKind::Shift),
            _ => two_regs("add", InstructionKind::Arithmetic),
        },
        0x1 => match (op >> 10) & 0x3 {
            0 => two_regs("cpse", InstructionKind::Compare),
            1 => two_regs("cp", InstructionKind::Compare),
            2 => two_regs("sub", InstructionKind::Arithmetic),
            _ if rd5(op) == rr5(op) => single("rol", InstructionKind::Rotate),
            _ => two_regs("adc", InstructionKind::Arithmetic),
        },
        0x2 => match (op >> 10) & 0x3 {
            0 => two_regs("and", InstructionKind::Logic),
            1 if rd5(op) == rr5(op) => single("clr", InstructionKind::Move),
            1 => two_regs("eor", InstructionKind::Logic),
            2 => two_regs("or", InstructionKind::Logic),
            _ => two_regs("mov", InstructionKind::Move),
        },
        0x3 => reg_imm("cpi", InstructionKind::Compare),
        0x4 => reg_imm("sbci", InstructionKind::Arithmetic),
        0x5 => reg_imm("subi", InstructionKind::Arithmetic),
        0x6 => reg_imm("ori", InstructionKind::Logic),
        0x7 => reg_imm("andi", InstructionKind::Logic),
        0x8 | 0xA => {
            let displacement: i64 = i64::from(((op >> 8) & 0x20) | ((op >> 7) & 0x18) | (op & 0x7));
            let base: u8 = if op & 0x8 != 0 { 28 } else { 30 };
            let memory = Operand::Memory { base, displacement };
            if op & 0x0200 != 0 {
                Instruction::new(address, 2, "std", InstructionKind::Store)
                    .with_operands(&[Operand::Register(rd5(op)), memory])
            } else {
                Instruction::new(address, 2, "ldd", InstructionKind::Load)
                    .with_operands(&[Operand::Register(rd5(op)), memory])
            }
        }
        0x9 => decode_group9(op, address, second, invalid)?,
        0xB => {
            let port: i64 = i64::from(((op >> 5) & 0x30) | (op & 0x0F));
            let (mnemonic, kind) = if op & 0x0800 != 0 {
                ("out", InstructionKind::Store)
            } else {
                ("in", InstructionKind::Load)
            };
            Instruction::new(address, 2, mnemonic, kind)
                .with_operands(&[Operand::Register(rd5(op)), Operand::Immediate(port)])
        }
        0xC | 0xD => {
            let target: u64 = relative(address, sign_extend(u64::from(op & 0x0FFF), 12));
            let (mnemonic, kind) = if op >> 12 == 0xC {
                ("rjmp", InstructionKind::Branch)
            } else {
                ("rcall", InstructionKind::Call)
            };
            Instruction::new(address, 2, mnemonic, kind)
                .with_operands(&[Operand::Address(target)])
                .with_target(target)
        }
        0xE => reg_imm("ldi", InstructionKind::Move),
        _ => match (op >> 10) & 0x3 {
            0 | 1 => {
                let target: u64 = relative(address, sign_extend(u64::from((op >> 3) & 0x7F), 7));
                let mnemonic: &'static str = if op & 0x0400 == 0 { "brbs" } else { "brbc" };
                Instruction::new(address, 2, mnemonic, InstructionKind::ConditionalBranch)
                    .with_operands(&[Operand::Immediate(i64::from(op & 0x7)), Operand::Address(target)])
                    .with_target(target)
            }
            _ if op & 0x0008 != 0 => return Err(invalid),
            2 => single(if op & 0x0200 != 0 { "bst" } else { "bld" }, InstructionKind::Move),
            _ => single(if op & 0x0200 != 0 { "sbrs" } else { "sbrc" }, InstructionKind::Compare),
        },
    };
    Ok(inst)
}

fn decode_group9<F>(op: u16, address: u64, second: F, invalid: DecodeError) -> Result<Instruction, DecodeError>
where
    F: FnOnce() -> Result<u16, DecodeError>,
{
    let single = |mnemonic: &'static str, kind: InstructionKind| {
        Instruction::new(address, 2, mnemonic, kind).with_operands(&[Operand::Register(rd5(op))])
    };
    let inst = match op {
        0x9409 => Instruction::new(address, 2, "ijmp", InstructionKind::IndirectJump),
        0x9419 => Instruction::new(address, 2, "eijmp", InstructionKind::IndirectJump),
        0x9509 => Instruction::new(address, 2, "icall", InstructionKind::IndirectCall),
        0x9519 => Instruction::new(address, 2, "eicall", InstructionKind::IndirectCall),
        0x9508 => Instruction::new(address, 2, "ret", InstructionKind::Return),
        0x9518 => Instruction::new(address, 2, "reti", InstructionKind::Return),
        0x9588 => Instruction::new(address, 2, "sleep", InstructionKind::System),
        0x9598 => Instruction::new(address, 2, "break", InstructionKind::System),
        0x95A8 => Instruction::new(address, 2, "wdr", InstructionKind::System),
        0x95C8 => Instruction::new(address, 2, "lpm", InstructionKind::Load)
            .with_operands(&[Operand::Register(0), Operand::Memory { base: 30, displacement: 0 }]),
        0x95E8 => Instruction::new(address, 2, "spm", InstructionKind::Store),
        _ => match (op >> 9) & 0x7 {
            0 | 1 => {
                let store: bool = op & 0x0200 != 0;
                match (op & 0xF, store) {
                    (0x0, false) => {
                        let addr: u16 = second()?;
                        Instruction::new(address, 4, "lds", InstructionKind::Load)
                            .with_operands(&[Operand::Register(rd5(op)), Operand::Address(u64::from(addr))])
                    }
                    (0x0, true) => {
                        let addr: u16 = second()?;
                        Instruction::new(address, 4, "sts", InstructionKind::Store)
                            .with_operands(&[Operand::Register(rd5(op)), Operand::Address(u64::from(addr))])
                    }
                    (0xF, false) => single("pop", InstructionKind::Load),
                    (0xF, true) => single("push", InstructionKind::Store),
                    (0x4 | 0x5 | 0x6 | 0x7, false) => {
                        let mnemonic: &'static str = if op & 0x2 != 0 { "elpm" } else { "lpm" };
                        Instruction::new(address, 2, mnemonic, InstructionKind::Load).with_operands(&[
                            Operand::Register(rd5(op)),
                            Operand::Memory { base: 30, displacement: 0 },
                        ])
                    }
                    (0x3 | 0x8 | 0xB, _) => return Err(invalid),
                    (low, store) => {
                        let base: u8 = match low {
                            0x1 | 0x2 => 30,
                            0x9 | 0xA => 28,
                            _ => 26,
                        };
                        let memory = Operand::Memory { base, displacement: 0 };
                        if store {
                            Instruction::new(address, 2, "st", InstructionKind::Store)
                                .with_operands(&[Operand::Register(rd5(op)), memory])
                        } else {
                            Instruction::new(address, 2, "ld", InstructionKind::Load)
                                .with_operands(&[Operand::Register(rd5(op)), memory])
                        }
                    }
                }
            }
            2 => match op & 0xF {
                0x0 => single("com", InstructionKind::Logic),
                0x1 => single("neg", InstructionKind::Arithmetic),
                0x2 => single("swap", InstructionKind::Rotate),
                0x3 => single("inc", InstructionKind::Arithmetic),
                0x5 => single("asr", InstructionKind::Shift),
                0x6 => single("lsr", InstructionKind::Shift),
                0x7 => single("ror", InstructionKind::Rotate),
                0x8 if op & 0x0100 == 0 => Instruction::new(address, 2, "bset", InstructionKind::System),
                0xA => single("dec", InstructionKind::Arithmetic),
                0xC..=0xF => {
                    let low: u16 = second()?;
                    let high: u64 = u64::from(((op >> 3) & 0x3E) | (op & 0x1));
                    let target: u64 = ((high << 16) | u64::from(low)) * 2;
                    let (mnemonic, kind) = if op & 0x2 == 0 {
                        ("jmp", InstructionKind::Branch)
                    } else {
                        ("call", InstructionKind::Call)
                    };
                    Instruction::new(address, 4, mnemonic, kind)
                        .with_operands(&[Operand::Address(target)])
                        .with_target(target)
                }
                _ => return Err(invalid),
            },
            3 => {
                let register: u8 = 24 + (((op >> 4) & 0x3) as u8) * 2;
                let value: i64 = i64::from(((op >> 2) & 0x30) | (op & 0x0F));
                let mnemonic: &'static str = if op & 0x0100 == 0 { "adiw" } else { "sbiw" };
                Instruction::new(address, 2, mnemonic, InstructionKind::Arithmetic)
                    .with_operands(&[Operand::Register(register), Operand::Immediate(value)])
            }
            4 | 5 => {
                let (mnemonic, kind) = match (op >> 8) & 0x3 {
                    0 => ("cbi", InstructionKind::Store),
                    1 => ("sbic", InstructionKind::Compare),
                    2 => ("sbi", InstructionKind::Store),
                    _ => ("sbis", InstructionKind::Compare),
                };
                Instruction::new(address, 2, mnemonic, kind)
            }
            _ => Instruction::new(address, 2, "mul", InstructionKind::Arithmetic)
                .with_operands(&[Operand::Register(rd5(op)), Operand::Register(rr5(op))]),
        },
    };
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], address: u64) -> Result<Instruction, DecodeError> {
        AvrDecoder.decode(bytes, address, Endianness::Little)
    }

    #[test]
    fn test_decode_ret_and_ldi() {
        assert_eq!(decode(&[0x08, 0x95], 0).unwrap().kind, InstructionKind::Return);
        // ldi r30, 0xA0
        let inst = decode(&[0xE0, 0xEA], 0).unwrap();
        assert_eq!(inst.mnemonic, "ldi");
        assert_eq!(inst.destination(), Some(30));
        assert_eq!(inst.immediate(), Some(0xA0));
    }

    #[test]
    fn test_decode_rcall_and_rjmp() {
        // rcall +4 words
        let inst = decode(&0xD004u16.to_le_bytes(), 0x100).unwrap();
        assert_eq!(inst.kind, InstructionKind::Call);
        assert_eq!(inst.target, Some(0x10A));
        // rjmp -1 word (self loop)
        let inst = decode(&0xCFFFu16.to_le_bytes(), 0x20).unwrap();
        assert_eq!(inst.target, Some(0x20));
    }

    #[test]
    fn test_decode_brne_backward() {
        // brne -3 words: 1111 01kk kkkk k001
        let k: u16 = (-3i16 as u16) & 0x7F;
        let op: u16 = 0xF401 | (k << 3);
        let inst = decode(&op.to_le_bytes(), 0x40).unwrap();
        assert_eq!(inst.kind, InstructionKind::ConditionalBranch);
        assert_eq!(inst.target, Some(0x3C));
    }

    #[test]
    fn test_decode_cpi_and_call() {
        // cpi r24, 10
        let inst = decode(&0x308Au16.to_le_bytes(), 0).unwrap();
        assert_eq!(inst.kind, InstructionKind::Compare);
        assert_eq!(inst.immediate(), Some(10));
        // call 0x200 (word 0x100)
        let inst = decode(&[0x0E, 0x94, 0x00, 0x01], 0).unwrap();
        assert_eq!(inst.length, 4);
        assert_eq!(inst.target, Some(0x200));
        assert!(decode(&[0x0E, 0x94], 0).is_err());
    }

    #[test]
    fn test_erased_flash_is_invalid() {
        assert!(decode(&[0xFF, 0xFF], 0).is_err());
    }
}
