//! x86-64 Instruction Decoder
//!
//! Variable-length decoder for the general-purpose integer subset of x86-64 plus the
//! SSE moves/xors and AES-NI forms that show up in cryptographic code. Legacy prefixes,
//! REX, ModRM, SIB, displacements and immediates are fully length-decoded so the
//! instruction stream stays in sync; opcodes outside the subset are reported as
//! `DecodeError::InvalidEncoding`.
//!
//! # Decoding Algorithm
//! 1. Consume legacy prefixes (operand size, REP, segment, LOCK) and an optional REX
//! 2. Dispatch on the one-byte opcode, or the `0F`/`0F 38`/`0F 3A` maps
//! 3. Resolve RIP-relative operands and relative targets against the end of the instruction

use super::{Instruction, InstructionDecoder, InstructionKind, Operand};
use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};
use smallvec::SmallVec;

const ALU: [&str; 8] = ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"];
const SHIFTS: [&str; 8] = ["rol", "ror", "rcl", "rcr", "shl", "shr", "sal", "sar"];
const MAX_LENGTH: usize = 15;

/// x86-64 decoder. Byte order is fixed little-endian; the `endianness` argument is ignored.
pub struct X86_64Decoder;

impl InstructionDecoder for X86_64Decoder {
    fn architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn alignment(&self) -> usize {
        1
    }

    fn decode(&self, bytes: &[u8], address: u64, _endianness: Endianness) -> Result<Instruction, DecodeError> {
        let window: &[u8] = &bytes[..bytes.len().min(MAX_LENGTH)];
        Decoder::new(window, address).decode()
    }
}

/// ModRM r/m operand before RIP resolution.
#[derive(Debug, Clone, Copy)]
enum Rm {
    Register(u8),
    Memory { base: u8, displacement: i64 },
    Absolute(u64),
    RipRelative(i64),
}

/// Operand before the instruction length is known.
#[derive(Debug, Clone, Copy)]
enum Arg {
    Reg(u8),
    Imm(i64),
    Rm(Rm),
    Relative(i64),
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    address: u64,
    operand_size_16: bool,
    rex: u8,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8], address: u64) -> Self {
        Self {
            bytes,
            pos: 0,
            address,
            operand_size_16: false,
            rex: 0,
        }
    }

    #[inline]
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated {
            address: self.address,
            available: self.bytes.len(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn imm(&mut self, size: usize) -> Result<i64, DecodeError> {
        let mut value: u64 = 0;
        for i in 0..size {
            value |= u64::from(self.u8()?) << (8 * i);
        }
        Ok(super::sign_extend(value, (size * 8) as u32))
    }

    /// Size of a `z`-sized immediate (16 with the 0x66 prefix, otherwise 32).
    #[inline]
    fn imm_z(&self) -> usize {
        if self.operand_size_16 {
            2
        } else {
            4
        }
    }

    #[inline]
    fn rex_w(&self) -> bool {
        self.rex & 0x8 != 0
    }

    #[inline]
    fn rex_bit(&self, bit: u8) -> u8 {
        (self.rex >> bit) & 1
    }

    fn invalid(&self) -> DecodeError {
        let mut raw: u64 = 0;
        for (i, b) in self.bytes.iter().take(self.pos.clamp(1, 8)).enumerate() {
            raw |= u64::from(*b) << (8 * i);
        }
        DecodeError::InvalidEncoding {
            address: self.address,
            raw,
        }
    }

    /// Parse ModRM (and SIB/displacement). Returns `(reg, rm)`.
    fn modrm(&mut self) -> Result<(u8, Rm), DecodeError> {
        let modrm: u8 = self.u8()?;
        let md: u8 = modrm >> 6;
        let reg: u8 = ((modrm >> 3) & 7) | (self.rex_bit(2) << 3);
        let rm_low: u8 = modrm & 7;

        if md == 3 {
            return Ok((reg, Rm::Register(rm_low | (self.rex_bit(0) << 3))));
        }

        let mut base: Option<u8> = Some(rm_low | (self.rex_bit(0) << 3));
        if rm_low == 4 {
            let sib: u8 = self.u8()?;
            let sib_base: u8 = sib & 7;
            base = if sib_base == 5 && md == 0 {
                None
            } else {
                Some(sib_base | (self.rex_bit(0) << 3))
            };
        } else if rm_low == 5 && md == 0 {
            let disp: i64 = self.imm(4)?;
            return Ok((reg, Rm::RipRelative(disp)));
        }

        let displacement: i64 = match md {
            1 => self.imm(1)?,
            2 => self.imm(4)?,
            _ if base.is_none() => self.imm(4)?,
            _ => 0,
        };

        Ok(match base {
            Some(base) => (reg, Rm::Memory { base, displacement }),
            None => (reg, Rm::Absolute(displacement as u64)),
        })
    }

    fn finish(&self, mnemonic: &'static str, kind: InstructionKind, args: &[Arg]) -> Instruction {
        let next: u64 = self.address.wrapping_add(self.pos as u64);
        let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
        let mut target: Option<u64> = None;
        for arg in args {
            operands.push(match *arg {
                Arg::Reg(r) => Operand::Register(r),
                Arg::Imm(v) => Operand::Immediate(v),
                Arg::Rm(Rm::Register(r)) => Operand::Register(r),
                Arg::Rm(Rm::Memory { base, displacement }) => Operand::Memory { base, displacement },
                Arg::Rm(Rm::Absolute(a)) => Operand::Address(a),
                Arg::Rm(Rm::RipRelative(d)) => Operand::Address(next.wrapping_add(d as u64)),
                Arg::Relative(rel) => {
                    let t: u64 = next.wrapping_add(rel as u64);
                    target = Some(t);
                    Operand::Address(t)
                }
            });
        }
        let mut inst = Instruction::new(self.address, self.pos as u8, mnemonic, kind);
        inst.operands = operands;
        inst.target = target;
        inst
    }

    fn decode(mut self) -> Result<Instruction, DecodeError> {
        // Legacy prefixes
        loop {
            match self.bytes.get(self.pos) {
                Some(0x66) => self.operand_size_16 = true,
                Some(0xF2 | 0xF3 | 0xF0 | 0x2E | 0x3E | 0x26 | 0x36 | 0x64 | 0x65) => {}
                _ => break,
            }
            self.pos += 1;
            if self.pos > 4 {
                return Err(self.invalid());
            }
        }
        if let Some(&b @ 0x40..=0x4F) = self.bytes.get(self.pos) {
            self.rex = b;
            self.pos += 1;
        }

        let opcode: u8 = self.u8()?;
        match opcode {
            0x0F => self.decode_0f(),
            0x00..=0x3F if opcode & 7 < 6 => self.decode_alu(opcode),
            0x50..=0x57 => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                Ok(self.finish("push", InstructionKind::Store, &[Arg::Reg(reg)]))
            }
            0x58..=0x5F => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                Ok(self.finish("pop", InstructionKind::Load, &[Arg::Reg(reg)]))
            }
            0x63 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("movsxd", InstructionKind::Move, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0x68 => {
                let v = self.imm(self.imm_z())?;
                Ok(self.finish("push", InstructionKind::Store, &[Arg::Imm(v)]))
            }
            0x6A => {
                let v = self.imm(1)?;
                Ok(self.finish("push", InstructionKind::Store, &[Arg::Imm(v)]))
            }
            0x69 | 0x6B => {
                let (reg, rm) = self.modrm()?;
                let size = if opcode == 0x6B { 1 } else { self.imm_z() };
                let v = self.imm(size)?;
                Ok(self.finish("imul", InstructionKind::Arithmetic, &[Arg::Reg(reg), Arg::Rm(rm), Arg::Imm(v)]))
            }
            0x70..=0x7F => {
                let rel = self.imm(1)?;
                Ok(self.finish("jcc", InstructionKind::ConditionalBranch, &[Arg::Relative(rel)]))
            }
            0x80 | 0x81 | 0x83 => {
                let (reg, rm) = self.modrm()?;
                let size = if opcode == 0x81 { self.imm_z() } else { 1 };
                let v = self.imm(size)?;
                let mnemonic = ALU[usize::from(reg & 7)];
                Ok(self.finish(mnemonic, alu_kind(mnemonic), &[Arg::Rm(rm), Arg::Imm(v)]))
            }
            0x84 | 0x85 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("test", InstructionKind::Compare, &[Arg::Rm(rm), Arg::Reg(reg)]))
            }
            0x86 | 0x87 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("xchg", InstructionKind::Move, &[Arg::Rm(rm), Arg::Reg(reg)]))
            }
            0x88..=0x8B => {
                let (reg, rm) = self.modrm()?;
                let to_register = opcode >= 0x8A;
                let kind = match (rm, to_register) {
                    (Rm::Register(_), _) => InstructionKind::Move,
                    (_, true) => InstructionKind::Load,
                    (_, false) => InstructionKind::Store,
                };
                let args = if to_register {
                    [Arg::Reg(reg), Arg::Rm(rm)]
                } else {
                    [Arg::Rm(rm), Arg::Reg(reg)]
                };
                Ok(self.finish("mov", kind, &args))
            }
            0x8D => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("lea", InstructionKind::Move, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0x8F => {
                let (_, rm) = self.modrm()?;
                Ok(self.finish("pop", InstructionKind::Load, &[Arg::Rm(rm)]))
            }
            0x90 if self.rex_bit(0) == 0 => Ok(self.finish("nop", InstructionKind::Nop, &[])),
            0x90..=0x97 => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                Ok(self.finish("xchg", InstructionKind::Move, &[Arg::Reg(reg)]))
            }
            0x98 | 0x99 => Ok(self.finish("cqo", InstructionKind::Move, &[])),
            0xA8 => {
                let v = self.imm(1)?;
                Ok(self.finish("test", InstructionKind::Compare, &[Arg::Reg(0), Arg::Imm(v)]))
            }
            0xA9 => {
                let v = self.imm(self.imm_z())?;
                Ok(self.finish("test", InstructionKind::Compare, &[Arg::Reg(0), Arg::Imm(v)]))
            }
            0xB0..=0xB7 => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                let v = self.imm(1)?;
                Ok(self.finish("mov", InstructionKind::Move, &[Arg::Reg(reg), Arg::Imm(v)]))
            }
            0xB8..=0xBF => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                let size = if self.rex_w() { 8 } else { self.imm_z() };
                let raw = self.imm(size)?;
                // mov r32, imm32 zero-extends
                let v = if size == 4 { raw & 0xFFFF_FFFF } else { raw };
                Ok(self.finish("mov", InstructionKind::Move, &[Arg::Reg(reg), Arg::Imm(v)]))
            }
            0xC0 | 0xC1 | 0xD0..=0xD3 => {
                let (reg, rm) = self.modrm()?;
                let amount = match opcode {
                    0xC0 | 0xC1 => Arg::Imm(self.imm(1)?),
                    0xD0 | 0xD1 => Arg::Imm(1),
                    _ => Arg::Reg(1),
                };
                let mnemonic = SHIFTS[usize::from(reg & 7)];
                let kind = if (reg & 7) < 4 {
                    InstructionKind::Rotate
                } else {
                    InstructionKind::Shift
                };
                Ok(self.finish(mnemonic, kind, &[Arg::Rm(rm), amount]))
            }
            0xC2 => {
                let v = self.imm(2)?;
                Ok(self.finish("ret", InstructionKind::Return, &[Arg::Imm(v)]))
            }
            0xC3 => Ok(self.finish("ret", InstructionKind::Return, &[])),
            0xC6 | 0xC7 => {
                let (reg, rm) = self.modrm()?;
                if reg & 7 != 0 {
                    return Err(self.invalid());
                }
                let size = if opcode == 0xC6 { 1 } else { self.imm_z() };
                let v = self.imm(size)?;
                let kind = if matches!(rm, Rm::Register(_)) {
                    InstructionKind::Move
                } else {
                    InstructionKind::Store
                };
                Ok(self.finish("mov", kind, &[Arg::Rm(rm), Arg::Imm(v)]))
            }
            0xC9 => Ok(self.finish("leave", InstructionKind::Move, &[])),
            0xCC => Ok(self.finish("int3", InstructionKind::System, &[])),
            0xCD => {
                let v = self.imm(1)?;
                Ok(self.finish("int", InstructionKind::System, &[Arg::Imm(v)]))
            }
            0xE8 => {
                let rel = self.imm(4)?;
                Ok(self.finish("call", InstructionKind::Call, &[Arg::Relative(rel)]))
            }
            0xE9 => {
                let rel = self.imm(4)?;
                Ok(self.finish("jmp", InstructionKind::Branch, &[Arg::Relative(rel)]))
            }
            0xEB => {
                let rel = self.imm(1)?;
                Ok(self.finish("jmp", InstructionKind::Branch, &[Arg::Relative(rel)]))
            }
            0xF4 => Ok(self.finish("hlt", InstructionKind::System, &[])),
            0xF6 | 0xF7 => {
                let (reg, rm) = self.modrm()?;
                match reg & 7 {
                    0 | 1 => {
                        let size = if opcode == 0xF6 { 1 } else { self.imm_z() };
                        let v = self.imm(size)?;
                        Ok(self.finish("test", InstructionKind::Compare, &[Arg::Rm(rm), Arg::Imm(v)]))
                    }
                    2 => Ok(self.finish("not", InstructionKind::Logic, &[Arg::Rm(rm)])),
                    3 => Ok(self.finish("neg", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                    _ => Ok(self.finish("mul", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                }
            }
            0xFE => {
                let (reg, rm) = self.modrm()?;
                match reg & 7 {
                    0 => Ok(self.finish("inc", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                    1 => Ok(self.finish("dec", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                    _ => Err(self.invalid()),
                }
            }
            0xFF => {
                let (reg, rm) = self.modrm()?;
                match reg & 7 {
                    0 => Ok(self.finish("inc", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                    1 => Ok(self.finish("dec", InstructionKind::Arithmetic, &[Arg::Rm(rm)])),
                    2 => Ok(self.finish("call", InstructionKind::IndirectCall, &[Arg::Rm(rm)])),
                    4 => Ok(self.finish("jmp", InstructionKind::IndirectJump, &[Arg::Rm(rm)])),
                    6 => Ok(self.finish("push", InstructionKind::Store, &[Arg::Rm(rm)])),
                    _ => Err(self.invalid()),
                }
            }
            _ => Err(self.invalid()),
        }
    }

    fn decode_alu(&mut self, opcode: u8) -> Result<Instruction, DecodeError> {
        // 0x26/0x2E/0x36/0x3E were consumed as prefixes; 0x06/0x07/0x0E/0x16/... are invalid in 64-bit mode
        let mnemonic: &'static str = ALU[usize::from(opcode >> 3)];
        let kind = alu_kind(mnemonic);
        match opcode & 7 {
            0 | 1 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish(mnemonic, kind, &[Arg::Rm(rm), Arg::Reg(reg)]))
            }
            2 | 3 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish(mnemonic, kind, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            4 => {
                let v = self.imm(1)?;
                Ok(self.finish(mnemonic, kind, &[Arg::Reg(0), Arg::Imm(v)]))
            }
            _ => {
                let v = self.imm(self.imm_z())?;
                Ok(self.finish(mnemonic, kind, &[Arg::Reg(0), Arg::Imm(v)]))
            }
        }
    }

    fn decode_0f(&mut self) -> Result<Instruction, DecodeError> {
        let opcode: u8 = self.u8()?;
        match opcode {
            0x05 => Ok(self.finish("syscall", InstructionKind::System, &[])),
            0x0B => Ok(self.finish("ud2", InstructionKind::System, &[])),
            0x1F => {
                let (_, _rm) = self.modrm()?;
                Ok(self.finish("nop", InstructionKind::Nop, &[]))
            }
            0x10 | 0x11 | 0x28 | 0x29 | 0x6F | 0x7F | 0x6E | 0x7E | 0xD6 => {
                let (reg, rm) = self.modrm()?;
                let kind = match (rm, opcode) {
                    (Rm::Register(_), _) => InstructionKind::Move,
                    (_, 0x11 | 0x29 | 0x7F | 0x7E | 0xD6) => InstructionKind::Store,
                    _ => InstructionKind::Load,
                };
                Ok(self.finish("movdqu", kind, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0xEF | 0x57 => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("pxor", InstructionKind::Logic, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0x31 => Ok(self.finish("rdtsc", InstructionKind::System, &[])),
            0xA2 => Ok(self.finish("cpuid", InstructionKind::System, &[])),
            0x38 => {
                let op3: u8 = self.u8()?;
                let (reg, rm) = self.modrm()?;
                let mnemonic: &'static str = match op3 {
                    0xDC => "aesenc",
                    0xDD => "aesenclast",
                    0xDE => "aesdec",
                    0xDF => "aesdeclast",
                    0xDB => "aesimc",
                    0x00 => "pshufb",
                    0xF0 | 0xF1 => "movbe",
                    _ => return Err(self.invalid()),
                };
                Ok(self.finish(mnemonic, InstructionKind::Logic, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0x3A => {
                let op3: u8 = self.u8()?;
                let (reg, rm) = self.modrm()?;
                let v = self.imm(1)?;
                let mnemonic: &'static str = match op3 {
                    0xDF => "aeskeygenassist",
                    0x44 => "pclmulqdq",
                    0x0F => "palignr",
                    _ => return Err(self.invalid()),
                };
                Ok(self.finish(mnemonic, InstructionKind::Logic, &[Arg::Reg(reg), Arg::Rm(rm), Arg::Imm(v)]))
            }
            0x40..=0x4F => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("cmov", InstructionKind::Move, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0x80..=0x8F => {
                let rel = self.imm(4)?;
                Ok(self.finish("jcc", InstructionKind::ConditionalBranch, &[Arg::Relative(rel)]))
            }
            0x90..=0x9F => {
                let (_, rm) = self.modrm()?;
                Ok(self.finish("setcc", InstructionKind::Move, &[Arg::Rm(rm)]))
            }
            0xA4 | 0xAC => {
                let (reg, rm) = self.modrm()?;
                let v = self.imm(1)?;
                Ok(self.finish("shld", InstructionKind::Shift, &[Arg::Rm(rm), Arg::Reg(reg), Arg::Imm(v)]))
            }
            0xA5 | 0xAD => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("shld", InstructionKind::Shift, &[Arg::Rm(rm), Arg::Reg(reg)]))
            }
            0xAF => {
                let (reg, rm) = self.modrm()?;
                Ok(self.finish("imul", InstructionKind::Arithmetic, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let (reg, rm) = self.modrm()?;
                let kind = if matches!(rm, Rm::Register(_)) {
                    InstructionKind::Move
                } else {
                    InstructionKind::Load
                };
                Ok(self.finish("movzx", kind, &[Arg::Reg(reg), Arg::Rm(rm)]))
            }
            0xC8..=0xCF => {
                let reg = (opcode & 7) | (self.rex_bit(0) << 3);
                Ok(self.finish("bswap", InstructionKind::Rotate, &[Arg::Reg(reg)]))
            }
            _ => Err(self.invalid()),
        }
    }
}

#[inline]
fn alu_kind(mnemonic: &str) -> InstructionKind {
    match mnemonic {
        "and" | "or" | "xor" => InstructionKind::Logic,
        "cmp" => InstructionKind::Compare,
        _ => InstructionKind::Arithmetic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], address: u64) -> Result<Instruction, DecodeError> {
        X86_64Decoder.decode(bytes, address, Endianness::Little)
    }

    #[test]
    fn test_decode_prologue() {
        let push = decode(&[0x55], 0x1000).unwrap();
        assert_eq!(push.mnemonic, "push");
        assert_eq!(push.length, 1);
        // mov rbp, rsp
        let mov = decode(&[0x48, 0x89, 0xE5], 0x1001).unwrap();
        assert_eq!(mov.mnemonic, "mov");
        assert_eq!(mov.length, 3);
    }

    #[test]
    fn test_decode_call_rel32() {
        // call +0x10 from 0x2000: next = 0x2005
        let inst = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00], 0x2000).unwrap();
        assert_eq!(inst.kind, InstructionKind::Call);
        assert_eq!(inst.target, Some(0x2015));
    }

    #[test]
    fn test_decode_rip_relative_lea() {
        // lea rsi, [rip + 0x100] at 0x3000, length 7 -> 0x3107
        let inst = decode(&[0x48, 0x8D, 0x35, 0x00, 0x01, 0x00, 0x00], 0x3000).unwrap();
        assert_eq!(inst.length, 7);
        assert_eq!(inst.operands[1], Operand::Address(0x3107));
    }

    #[test]
    fn test_decode_cmp_imm8_and_jcc() {
        // cmp ecx, 10 ; jne -8
        let cmp = decode(&[0x83, 0xF9, 0x0A], 0).unwrap();
        assert_eq!(cmp.kind, InstructionKind::Compare);
        assert_eq!(cmp.immediate(), Some(10));
        let jne = decode(&[0x75, 0xF8], 0x10).unwrap();
        assert_eq!(jne.target, Some(0x0A));
    }

    #[test]
    fn test_decode_aesenc() {
        // aesenc xmm0, xmm1
        let inst = decode(&[0x66, 0x0F, 0x38, 0xDC, 0xC1], 0).unwrap();
        assert_eq!(inst.mnemonic, "aesenc");
        assert_eq!(inst.length, 5);
    }

    #[test]
    fn test_invalid_and_truncated() {
        assert!(matches!(decode(&[0x06], 0), Err(DecodeError::InvalidEncoding { .. })));
        assert!(matches!(decode(&[0xE8, 0x00], 0), Err(DecodeError::Truncated { .. })));
    }
}
