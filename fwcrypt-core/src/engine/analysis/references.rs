//! Data Reference Resolution
//!
//! Recovers the addresses of data a function touches, so constant-table matches can be
//! linked to the code that uses them.
//!
//! # Resolved Forms
//! - PC/RIP-relative operands and literal-pool loads (decoders already resolve these to
//!   `Operand::Address`); a pointer-sized literal that points into the image is
//!   dereferenced once
//! - High/low register pairs: MIPS `lui`+`addiu`/`ori`, RISC-V `lui`/`auipc`+`addi`/load,
//!   AVR `ldi r30/r31` (and the X/Y pairs)

use crate::engine::decoder::{Instruction, InstructionKind, Operand};
use crate::engine::image::{Architecture, FirmwareImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Instructions a register pair half stays live for.
const PAIR_WINDOW: usize = 8;

/// How a data reference was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferenceKind {
    /// Operand address computed by the decoder
    Direct = 0,
    /// Pointer read from a literal at a direct reference
    Literal = 1,
    /// High/low immediate register pair
    RegisterPair = 2,
}

/// Reference from an instruction to a data address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataReference {
    /// Address of the referencing instruction
    pub site: u64,
    /// Referenced address
    pub target: u64,
    pub kind: ReferenceKind,
}

/// Partially materialized register value.
#[derive(Debug, Clone, Copy)]
struct PendingValue {
    value: u64,
    /// Instruction index where the value was set
    index: usize,
}

pub struct ReferenceResolver;

impl ReferenceResolver {
    /// Resolve the data references of one function.
    ///
    /// # Arguments
    /// * `image` - Image the function belongs to (targets must fall inside a section)
    /// * `instructions` - Function instructions sorted by address
    ///
    /// # Returns
    /// `Vec<DataReference>` - sorted and deduplicated
    pub fn resolve(image: &FirmwareImage, instructions: &[Instruction]) -> Vec<DataReference> {
        let mut refs: Vec<DataReference> = Vec::new();
        let mut pending: HashMap<u8, PendingValue> = HashMap::new();
        let arch: Architecture = image.architecture;

        for (index, inst) in instructions.iter().enumerate() {
            if matches!(
                inst.kind,
                InstructionKind::Branch | InstructionKind::ConditionalBranch | InstructionKind::Call
            ) {
                continue;
            }

            for op in inst.operands.iter() {
                if let Operand::Address(target) = op {
                    Self::push_direct(image, inst, *target, &mut refs);
                }
            }
            if arch == Architecture::X86_64 && inst.kind == InstructionKind::Move {
                if let Some(value) = inst.immediate().filter(|v| *v >= 0x1000) {
                    if image.section_at(value as u64).is_some() {
                        refs.push(DataReference {
                            site: inst.address,
                            target: value as u64,
                            kind: ReferenceKind::Direct,
                        });
                    }
                }
            }

            pending.retain(|_, v| index - v.index <= PAIR_WINDOW);
            match arch {
                Architecture::Mips | Architecture::RiscV => {
                    Self::track_high_low(image, inst, index, &mut pending, &mut refs)
                }
                Architecture::Avr => Self::track_avr_pairs(image, inst, index, &mut pending, &mut refs),
                _ => {}
            }
        }

        refs.sort();
        refs.dedup();
        refs
    }

    fn push_direct(image: &FirmwareImage, inst: &Instruction, target: u64, refs: &mut Vec<DataReference>) {
        if image.section_at(target).is_none() {
            return;
        }
        refs.push(DataReference {
            site: inst.address,
            target,
            kind: ReferenceKind::Direct,
        });
        if inst.kind == InstructionKind::Load {
            if let Some(pointer) = image.read_pointer(target) {
                if pointer != target && image.section_at(pointer).is_some() {
                    refs.push(DataReference {
                        site: inst.address,
                        target: pointer,
                        kind: ReferenceKind::Literal,
                    });
                }
            }
        }
    }

    /// `lui`/`auipc` set a high part; a following add/or/load through the same register
    /// completes the address.
    fn track_high_low(
        image: &FirmwareImage,
        inst: &Instruction,
        index: usize,
        pending: &mut HashMap<u8, PendingValue>,
        refs: &mut Vec<DataReference>,
    ) {
        match (inst.mnemonic, inst.operands.as_slice()) {
            ("lui", [Operand::Register(rd), Operand::Immediate(high)]) => {
                pending.insert(*rd, PendingValue { value: *high as u64, index });
            }
            ("auipc", [Operand::Register(rd), Operand::Address(value)]) => {
                pending.insert(*rd, PendingValue { value: *value, index });
            }
            (
                "addiu" | "addi" | "ori",
                [Operand::Register(rd), Operand::Register(rs), Operand::Immediate(low)],
            ) => {
                if let Some(high) = pending.get(rs).copied() {
                    let target: u64 = if inst.mnemonic == "ori" {
                        high.value | (*low as u64 & 0xFFFF)
                    } else {
                        high.value.wrapping_add(*low as u64)
                    };
                    Self::push_pair(image, inst.address, target, refs);
                    pending.insert(*rd, PendingValue { value: target, index });
                }
            }
            (_, [_, Operand::Memory { base, displacement }])
                if matches!(inst.kind, InstructionKind::Load | InstructionKind::Store) =>
            {
                if let Some(high) = pending.get(base).copied() {
                    Self::push_pair(image, inst.address, high.value.wrapping_add(*displacement as u64), refs);
                }
            }
            _ => {
                if let Some(rd) = inst.destination() {
                    if inst.kind != InstructionKind::Store {
                        pending.remove(&rd);
                    }
                }
            }
        }
    }

    /// `ldi` into both halves of X (r26/27), Y (r28/29) or Z (r30/31).
    fn track_avr_pairs(
        image: &FirmwareImage,
        inst: &Instruction,
        index: usize,
        pending: &mut HashMap<u8, PendingValue>,
        refs: &mut Vec<DataReference>,
    ) {
        let (register, value) = match (inst.mnemonic, inst.operands.as_slice()) {
            ("ldi", [Operand::Register(r), Operand::Immediate(v)]) if *r >= 26 => (*r, *v as u64 & 0xFF),
            _ => return,
        };
        pending.insert(register, PendingValue { value, index });
        let low_reg: u8 = register & !1;
        if let (Some(low), Some(high)) = (pending.get(&low_reg), pending.get(&(low_reg + 1))) {
            let target: u64 = (high.value << 8) | low.value;
            Self::push_pair(image, inst.address, target, refs);
        }
    }

    fn push_pair(image: &FirmwareImage, site: u64, target: u64, refs: &mut Vec<DataReference>) {
        if image.section_at(target).is_some() {
            refs.push(DataReference {
                site,
                target,
                kind: ReferenceKind::RegisterPair,
            });
        }
    }
}
