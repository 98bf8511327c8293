//! Disassembler
//!
//! Recovers functions from the executable sections of a firmware image.
//!
//! # Function Recovery Algorithm
//! 1. **Collect entry points**: symbol hints, image entry, section start, and direct call
//!    targets found by a linear pre-scan of the section
//! 2. **Recursive traversal** from each entry, following fall-through and direct branches
//!    inside the section; traversal stops at other entries and at the instruction limit
//! 3. **Per-function facts**: CFG, natural loops with trip counts, call sites, data refs
//!
//! Functions are decoded in parallel with rayon. A decode error fails only the function
//! being decoded and is recorded as a diagnostic.

use crate::engine::analysis::control_flow::ControlFlowAnalyzer;
use crate::engine::analysis::references::ReferenceResolver;
use crate::engine::analysis::{CallSite, Function};
use crate::engine::decoder::{DecoderRegistry, Instruction, InstructionDecoder};
use crate::engine::error::{AnalysisError, Diagnostic};
use crate::engine::image::{FirmwareImage, Section};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Default cap on instructions decoded per function.
pub const DEFAULT_MAX_FUNCTION_INSTRUCTIONS: usize = 20_000;

/// Result of disassembling an image.
#[derive(Debug, Clone, Default)]
pub struct Disassembly {
    /// Successfully decoded functions, ascending entry address
    pub functions: Vec<Function>,
    /// One `DecodeError` diagnostic per failed function, ascending entry
    pub diagnostics: Vec<Diagnostic>,
}

impl Disassembly {
    /// Function containing the instruction at `address`.
    pub fn function_containing(&self, address: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.contains(address))
    }

    pub fn function_at(&self, entry: u64) -> Option<&Function> {
        self.functions
            .binary_search_by_key(&entry, |f| f.entry)
            .ok()
            .and_then(|idx| self.functions.get(idx))
    }
}

pub struct Disassembler<'a> {
    registry: &'a DecoderRegistry,
    max_instructions: usize,
}

impl<'a> Disassembler<'a> {
    pub fn new(registry: &'a DecoderRegistry, max_instructions: usize) -> Self {
        Self {
            registry,
            max_instructions: max_instructions.max(1),
        }
    }

    /// Disassemble every executable section of an image.
    ///
    /// # Arguments
    /// * `image` - Loaded image with a known architecture
    ///
    /// # Returns
    /// `Result<Disassembly, AnalysisError>` - functions and per-function diagnostics
    ///
    /// # Errors
    /// Returns `UnknownArchitecture` if no decoder is registered for the image's architecture
    pub fn disassemble(&self, image: &FirmwareImage) -> Result<Disassembly, AnalysisError> {
        let decoder: &dyn InstructionDecoder = self
            .registry
            .get(image.architecture)
            .ok_or(AnalysisError::UnknownArchitecture {
                confidence: image.arch_confidence,
            })?;

        let mut functions: Vec<Function> = Vec::new();
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        for section in image.executable_sections() {
            let entries: BTreeSet<u64> = self.collect_entries(image, section, decoder);
            log::debug!(
                "Section {} at 0x{:X}: {} candidate function entries",
                section.name,
                section.virtual_address,
                entries.len()
            );

            let results: Vec<Result<Function, Diagnostic>> = entries
                .par_iter()
                .map(|&entry| self.decode_function(image, section, decoder, &entries, entry))
                .collect();
            for result in results {
                match result {
                    Ok(function) => functions.push(function),
                    Err(diagnostic) => {
                        log::warn!("{}", diagnostic.message);
                        diagnostics.push(diagnostic);
                    }
                }
            }
        }

        functions.sort_by_key(|f| f.entry);
        functions.dedup_by_key(|f| f.entry);
        diagnostics.sort_by_key(|d| d.address);
        log::info!(
            "Disassembled {} functions ({} failed)",
            functions.len(),
            diagnostics.len()
        );
        Ok(Disassembly {
            functions,
            diagnostics,
        })
    }

    /// Entry points in a section: hints plus direct call targets from a linear sweep.
    fn collect_entries(&self, image: &FirmwareImage, section: &Section, decoder: &dyn InstructionDecoder) -> BTreeSet<u64> {
        let mut entries: BTreeSet<u64> = BTreeSet::new();
        entries.insert(section.virtual_address);
        for symbol in image.symbols.iter() {
            if section.contains_address(symbol.address) {
                entries.insert(symbol.address);
            }
        }
        if let Some(entry) = image.entry_point.filter(|e| section.contains_address(*e)) {
            entries.insert(entry);
        }

        let data: &[u8] = image.section_data(section);
        let alignment: usize = decoder.alignment().max(1);
        let mut offset: usize = 0;
        while offset < data.len() {
            let address: u64 = section.virtual_address + offset as u64;
            match decoder.decode(&data[offset..], address, image.endianness) {
                Ok(inst) => {
                    if inst.kind.is_call() {
                        if let Some(target) = inst.target.filter(|t| section.contains_address(*t)) {
                            entries.insert(target);
                        }
                    }
                    offset += usize::from(inst.length).max(alignment);
                }
                Err(_) => offset += alignment,
            }
        }

        let misaligned = |address: &u64| (address - section.virtual_address) % alignment as u64 != 0;
        entries.retain(|a| !misaligned(a));
        entries
    }

    /// Decode one function by recursive traversal from `entry`.
    fn decode_function(
        &self,
        image: &FirmwareImage,
        section: &Section,
        decoder: &dyn InstructionDecoder,
        entries: &BTreeSet<u64>,
        entry: u64,
    ) -> Result<Function, Diagnostic> {
        let data: &[u8] = image.section_data(section);
        let mut decoded: BTreeMap<u64, Instruction> = BTreeMap::new();
        let mut worklist: Vec<u64> = vec![entry];

        let decode_at = |address: u64| -> Result<Instruction, Diagnostic> {
            let offset: usize = section.offset_of(address).unwrap_or(data.len());
            decoder
                .decode(data.get(offset..).unwrap_or(&[]), address, image.endianness)
                .map_err(|err| Diagnostic::decode_failure(entry, &err))
        };
        let inside = |address: u64| -> bool {
            section.contains_address(address) && (address == entry || !entries.contains(&address))
        };

        while let Some(address) = worklist.pop() {
            if decoded.contains_key(&address) || !inside(address) {
                continue;
            }
            if decoded.len() >= self.max_instructions {
                log::debug!(
                    "Function 0x{:X} reached the {} instruction limit",
                    entry,
                    self.max_instructions
                );
                break;
            }

            let inst: Instruction = decode_at(address)?;
            let mut fall_through: u64 = inst.next_address();
            if inst.delay_slot && section.contains_address(fall_through) && !decoded.contains_key(&fall_through) {
                let slot: Instruction = decode_at(fall_through)?;
                fall_through = slot.next_address();
                decoded.insert(slot.address, slot);
            }

            if !inst.kind.ends_flow() {
                worklist.push(fall_through);
            }
            if !inst.kind.is_call() {
                if let Some(target) = inst.target {
                    worklist.push(target);
                }
            }
            decoded.insert(address, inst);
        }

        let instructions: Vec<Instruction> = decoded.into_values().collect();
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, entry);
        let mut loops = ControlFlowAnalyzer::detect_loops(&cfg);
        for loop_ in loops.iter_mut() {
            loop_.trip_count = ControlFlowAnalyzer::infer_trip_count(&cfg, &instructions, loop_);
        }
        let call_sites: Vec<CallSite> = instructions
            .iter()
            .filter(|inst| inst.kind.is_call())
            .map(|inst| CallSite {
                address: inst.address,
                target: inst.target,
            })
            .collect();
        let data_refs = ReferenceResolver::resolve(image, &instructions);
        let name: Option<String> = image
            .symbols
            .iter()
            .find(|s| s.address == entry)
            .map(|s| s.name.clone());

        log::debug!(
            "Function 0x{:X}: {} instructions, {} blocks, {} loops, {} calls, {} data refs",
            entry,
            instructions.len(),
            cfg.nodes.len(),
            loops.len(),
            call_sites.len(),
            data_refs.len()
        );
        Ok(Function {
            entry,
            name,
            section: section.name.clone(),
            instructions,
            cfg,
            loops,
            call_sites,
            data_refs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::image::{Architecture, ContainerFormat, Endianness, Permissions};
    use std::sync::Arc;

    fn arm_image(words: &[u32], base: u64) -> FirmwareImage {
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let len = data.len();
        FirmwareImage::new(
            Arc::from(data),
            ContainerFormat::Raw,
            Architecture::Arm,
            Endianness::Little,
            1.0,
            Some(base),
            vec![Section {
                name: ".raw".to_string(),
                virtual_address: base,
                range: 0..len,
                permissions: Permissions::RX,
            }],
            Vec::new(),
        )
    }

    #[test]
    fn test_call_targets_become_functions() {
        // 0x000: push {r4,lr} ; bl 0x00C ; pop {r4,pc}
        // 0x00C: mov r0,#1 ; bx lr
        let image = arm_image(&[0xE92D4010, 0xEB000000, 0xE8BD8010, 0xE3A00001, 0xE12FFF1E], 0);
        let registry = DecoderRegistry::new();
        let result = Disassembler::new(&registry, 100).disassemble(&image).unwrap();
        let entries: Vec<u64> = result.functions.iter().map(|f| f.entry).collect();
        assert_eq!(entries, vec![0x0, 0xC]);
        assert_eq!(result.functions[0].instructions.len(), 3);
        assert_eq!(
            result.functions[0].call_sites,
            vec![CallSite {
                address: 0x4,
                target: Some(0xC)
            }]
        );
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_decode_error_fails_only_that_function() {
        // 0x1000: bl 0x1008 ; bx lr
        // 0x1008: <undefined> ; bx lr
        let image = arm_image(&[0xEB000000, 0xE12FFF1E, 0xF0000000, 0xE12FFF1E], 0x1000);
        let registry = DecoderRegistry::new();
        let result = Disassembler::new(&registry, 100).disassemble(&image).unwrap();
        assert_eq!(result.functions.len(), 1);
        assert_eq!(result.functions[0].entry, 0x1000);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, "DecodeError");
        assert_eq!(result.diagnostics[0].address, Some(0x1008));
    }

    #[test]
    fn test_unknown_architecture_has_no_decoder() {
        let mut image = arm_image(&[0xE12FFF1E], 0);
        image.architecture = Architecture::Unknown;
        let registry = DecoderRegistry::new();
        let err = Disassembler::new(&registry, 100).disassemble(&image).unwrap_err();
        assert_eq!(err.code(), "UnknownArchitecture");
    }
}
