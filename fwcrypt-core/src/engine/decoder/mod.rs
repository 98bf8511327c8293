//! Instruction Decoders
//!
//! Architecture-neutral instruction representation plus a registry that maps an
//! [`Architecture`] tag to a decoder implementing the [`InstructionDecoder`] contract.
//! Each decoder covers the integer subset of its ISA that matters for control flow and
//! cryptographic code recognition; anything outside that subset is a [`DecodeError`].
//!
//! # Memory Optimizations
//! - `InstructionKind` uses `#[repr(u8)]`
//! - `Operand` lists use `SmallVec<[Operand; 4]>` (almost every instruction has ≤4 operands)
//! - Mnemonics are `&'static str` from fixed tables, never allocated

pub mod arm;
pub mod avr;
pub mod mips;
pub mod riscv;
pub mod x86;

use crate::engine::error::DecodeError;
use crate::engine::image::{Architecture, Endianness};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Coarse instruction category used by CFG construction and structural matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionKind {
    /// add, sub, mul, adc, inc
    Arithmetic = 0,
    /// and, or, xor, not, bic
    Logic = 1,
    /// Logical/arithmetic shifts
    Shift = 2,
    /// Rotates (ror, rol)
    Rotate = 3,
    Load = 4,
    Store = 5,
    /// Compare or test setting flags (cmp, slti, cpi)
    Compare = 6,
    Move = 7,
    /// Unconditional direct or relative jump
    Branch = 8,
    ConditionalBranch = 9,
    Call = 10,
    /// Jump through a register or memory operand
    IndirectJump = 11,
    IndirectCall = 12,
    Return = 13,
    /// Traps, barriers, coprocessor and status register access
    System = 14,
    Nop = 15,
}

impl InstructionKind {
    /// Whether control never falls through to the next instruction.
    #[inline]
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            InstructionKind::Branch | InstructionKind::IndirectJump | InstructionKind::Return
        )
    }

    /// Whether the instruction terminates a basic block.
    #[inline]
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            InstructionKind::Branch
                | InstructionKind::ConditionalBranch
                | InstructionKind::IndirectJump
                | InstructionKind::Return
        )
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(self, InstructionKind::Call | InstructionKind::IndirectCall)
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// General-purpose register number in the ISA's own numbering
    Register(u8),
    /// Immediate value, sign-extended
    Immediate(i64),
    /// Absolute address computed by the decoder (branch targets, PC-relative references)
    Address(u64),
    /// Register-relative memory operand
    Memory { base: u8, displacement: i64 },
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub mnemonic: &'static str,
    pub operands: SmallVec<[Operand; 4]>,
    /// Encoded length in bytes
    pub length: u8,
    pub kind: InstructionKind,
    /// Direct control-flow target (branches and calls)
    pub target: Option<u64>,
    /// Next instruction executes before the transfer takes effect (MIPS)
    pub delay_slot: bool,
}

impl Instruction {
    #[inline]
    pub fn new(address: u64, length: u8, mnemonic: &'static str, kind: InstructionKind) -> Self {
        Self {
            address,
            mnemonic,
            operands: SmallVec::new(),
            length,
            kind,
            target: None,
            delay_slot: false,
        }
    }

    #[inline]
    pub fn with_operands(mut self, operands: &[Operand]) -> Self {
        self.operands = SmallVec::from_slice(operands);
        self
    }

    #[inline]
    pub fn with_target(mut self, target: u64) -> Self {
        self.target = Some(target);
        self
    }

    #[inline]
    pub fn with_delay_slot(mut self) -> Self {
        self.delay_slot = true;
        self
    }

    /// Address of the instruction immediately after this one.
    #[inline]
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(u64::from(self.length))
    }

    /// First immediate operand, if any.
    pub fn immediate(&self) -> Option<i64> {
        self.operands.iter().find_map(|op| match op {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        })
    }

    /// Destination register (first operand) if it is a register.
    pub fn destination(&self) -> Option<u8> {
        match self.operands.first() {
            Some(Operand::Register(r)) => Some(*r),
            _ => None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}: {}", self.address, self.mnemonic)?;
        for (idx, op) in self.operands.iter().enumerate() {
            let sep = if idx == 0 { " " } else { ", " };
            match op {
                Operand::Register(r) => write!(f, "{}r{}", sep, r)?,
                Operand::Immediate(v) => write!(f, "{}#{}", sep, v)?,
                Operand::Address(a) => write!(f, "{}{:#x}", sep, a)?,
                Operand::Memory { base, displacement } => {
                    write!(f, "{}[r{}{:+}]", sep, base, displacement)?
                }
            }
        }
        Ok(())
    }
}

/// Decode contract every architecture backend satisfies.
pub trait InstructionDecoder: Send + Sync {
    fn architecture(&self) -> Architecture;

    /// Instruction alignment in bytes; the linear pre-scan advances by this on failure.
    fn alignment(&self) -> usize;

    /// Decode one instruction from the start of `bytes`, located at `address`.
    fn decode(&self, bytes: &[u8], address: u64, endianness: Endianness) -> Result<Instruction, DecodeError>;
}

/// Capability-indexed decoder registry.
pub struct DecoderRegistry {
    decoders: HashMap<Architecture, Box<dyn InstructionDecoder>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderRegistry {
    /// Registry with every built-in decoder.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(arm::ArmDecoder));
        registry.register(Box::new(mips::MipsDecoder));
        registry.register(Box::new(x86::X86_64Decoder));
        registry.register(Box::new(riscv::RiscVDecoder));
        registry.register(Box::new(avr::AvrDecoder));
        registry
    }

    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder, replacing any existing one for the same architecture.
    pub fn register(&mut self, decoder: Box<dyn InstructionDecoder>) {
        self.decoders.insert(decoder.architecture(), decoder);
    }

    pub fn get(&self, architecture: Architecture) -> Option<&dyn InstructionDecoder> {
        self.decoders.get(&architecture).map(|d| d.as_ref())
    }

    pub fn supports(&self, architecture: Architecture) -> bool {
        self.decoders.contains_key(&architecture)
    }
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
pub(crate) fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift: u32 = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Read a 32-bit word or report truncation.
#[inline]
pub(crate) fn read_word(bytes: &[u8], address: u64, endianness: Endianness) -> Result<u32, DecodeError> {
    endianness.read_u32(bytes).ok_or(DecodeError::Truncated {
        address,
        available: bytes.len(),
    })
}

/// Read a 16-bit halfword or report truncation.
#[inline]
pub(crate) fn read_half(bytes: &[u8], address: u64, endianness: Endianness) -> Result<u16, DecodeError> {
    endianness.read_u16(bytes).ok_or(DecodeError::Truncated {
        address,
        available: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFFF, 12), -1);
        assert_eq!(sign_extend(0x7FF, 12), 0x7FF);
        assert_eq!(sign_extend(0x800000, 24), -0x800000);
    }

    #[test]
    fn test_registry_covers_all_detectable_architectures() {
        let registry = DecoderRegistry::new();
        for arch in Architecture::PREFERENCE {
            assert!(registry.supports(arch), "missing decoder for {}", arch);
            assert_eq!(registry.get(arch).map(|d| d.architecture()), Some(arch));
        }
        assert!(!registry.supports(Architecture::Unknown));
    }
}
