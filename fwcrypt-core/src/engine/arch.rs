//! Architecture Detection
//!
//! Statistical instruction-set detection for images whose container does not declare
//! a machine (raw dumps and Intel HEX).
//!
//! # Detection Algorithm
//! 1. Split the buffer into each architecture's natural instruction units
//!    (32-bit words for ARM/MIPS, parcels for RISC-V, halfwords for AVR, bytes for x86-64)
//! 2. Drop padding units (all-zero or all-`0xFF`)
//! 3. Count units matching the architecture's "typical instruction" predicate
//! 4. Normalize the density between the random-data baseline and the density seen in
//!    real code: `conf = clamp((density - baseline) / (expected - baseline), 0, 1)`
//! 5. Highest confidence wins; ties resolve in [`Architecture::PREFERENCE`] order
//!
//! ARM and MIPS are scored in both byte orders.

use crate::engine::image::{Architecture, Endianness};

/// Default minimum confidence for accepting a detected architecture.
pub const DEFAULT_ARCH_THRESHOLD: f64 = 0.5;

/// Score for one architecture/byte-order candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchitectureScore {
    pub architecture: Architecture,
    pub endianness: Endianness,
    pub confidence: f64,
}

/// Outcome of architecture detection.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureGuess {
    /// Winning architecture, or `Unknown` below the threshold
    pub architecture: Architecture,
    pub endianness: Endianness,
    /// Confidence of the best candidate, kept even when it is below the threshold
    pub confidence: f64,
    /// All candidate scores in preference order
    pub scores: Vec<ArchitectureScore>,
}

/// Density profile of one architecture.
struct Profile {
    /// Density of typical units in uniformly random data
    baseline: f64,
    /// Density of typical units in compiled code
    expected: f64,
}

const ARM_PROFILE: Profile = Profile {
    baseline: 1.0 / 16.0,
    expected: 0.85,
};
const MIPS_PROFILE: Profile = Profile {
    baseline: 8.0 / 64.0,
    expected: 0.7,
};
const X86_PROFILE: Profile = Profile {
    baseline: 24.0 / 256.0,
    expected: 0.45,
};
const RISCV_PROFILE: Profile = Profile {
    baseline: 0.36,
    expected: 0.85,
};
const AVR_PROFILE: Profile = Profile {
    baseline: 0.38,
    expected: 0.8,
};

/// Frequent x86-64 opcode and ModRM bytes.
const X86_TYPICAL: [u8; 24] = [
    0x48, 0x49, 0x4C, 0x41, 0x89, 0x8B, 0x8D, 0x83, 0x85, 0x0F, 0xE8, 0xE9, 0xEB, 0x74, 0x75, 0xC3,
    0x55, 0x5D, 0x53, 0x5B, 0x31, 0xC0, 0x24, 0x45,
];

/// Architecture detector with a configurable acceptance threshold.
pub struct ArchitectureDetector {
    threshold: f64,
}

impl Default for ArchitectureDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ARCH_THRESHOLD)
    }
}

impl ArchitectureDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Detect the instruction set of a headerless code buffer.
    ///
    /// # Arguments
    /// * `bytes` - Code bytes to inspect (usually the whole raw image)
    ///
    /// # Returns
    /// `ArchitectureGuess` - best candidate; `Architecture::Unknown` if its confidence is
    /// below the threshold. A buffer with no non-padding content scores 0 everywhere.
    ///
    /// # Examples
    /// ```rust
    /// use fwcrypt_core::engine::arch::ArchitectureDetector;
    /// use fwcrypt_core::engine::image::Architecture;
    ///
    /// let guess = ArchitectureDetector::default().detect(&[0u8; 64]);
    /// assert_eq!(guess.architecture, Architecture::Unknown);
    /// ```
    pub fn detect(&self, bytes: &[u8]) -> ArchitectureGuess {
        let scores: Vec<ArchitectureScore> = vec![
            Self::best_of(
                Architecture::Arm,
                Self::score_words(bytes, Endianness::Little, is_typical_arm, &ARM_PROFILE),
                Self::score_words(bytes, Endianness::Big, is_typical_arm, &ARM_PROFILE),
            ),
            Self::best_of(
                Architecture::Mips,
                Self::score_words(bytes, Endianness::Little, is_typical_mips, &MIPS_PROFILE),
                Self::score_words(bytes, Endianness::Big, is_typical_mips, &MIPS_PROFILE),
            ),
            ArchitectureScore {
                architecture: Architecture::X86_64,
                endianness: Endianness::Little,
                confidence: Self::score_x86(bytes),
            },
            ArchitectureScore {
                architecture: Architecture::RiscV,
                endianness: Endianness::Little,
                confidence: Self::score_riscv(bytes),
            },
            ArchitectureScore {
                architecture: Architecture::Avr,
                endianness: Endianness::Little,
                confidence: Self::score_avr(bytes),
            },
        ];

        // Strictly-greater comparison keeps the earlier (preferred) candidate on ties.
        let mut best: ArchitectureScore = scores[0];
        for candidate in scores.iter().skip(1) {
            if candidate.confidence > best.confidence {
                best = *candidate;
            }
        }

        log::debug!(
            "Architecture scores: {}",
            scores
                .iter()
                .map(|s| format!("{}={:.3}", s.architecture, s.confidence))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let architecture: Architecture = if best.confidence >= self.threshold && best.confidence > 0.0 {
            best.architecture
        } else {
            Architecture::Unknown
        };
        ArchitectureGuess {
            architecture,
            endianness: best.endianness,
            confidence: best.confidence,
            scores,
        }
    }

    fn best_of(architecture: Architecture, little: f64, big: f64) -> ArchitectureScore {
        let (endianness, confidence) = if big > little {
            (Endianness::Big, big)
        } else {
            (Endianness::Little, little)
        };
        ArchitectureScore {
            architecture,
            endianness,
            confidence,
        }
    }

    fn score_words(bytes: &[u8], endianness: Endianness, typical: fn(u32) -> bool, profile: &Profile) -> f64 {
        let mut units: usize = 0;
        let mut hits: usize = 0;
        for chunk in bytes.chunks_exact(4) {
            let word: u32 = match endianness.read_u32(chunk) {
                Some(w) => w,
                None => continue,
            };
            if word == 0 || word == u32::MAX {
                continue;
            }
            units += 1;
            if typical(word) {
                hits += 1;
            }
        }
        normalize(hits, units, profile)
    }

    fn score_x86(bytes: &[u8]) -> f64 {
        let mut units: usize = 0;
        let mut hits: usize = 0;
        for &b in bytes.iter().filter(|&&b| b != 0x00 && b != 0xFF) {
            units += 1;
            if X86_TYPICAL.contains(&b) {
                hits += 1;
            }
        }
        normalize(hits, units, &X86_PROFILE)
    }

    fn score_riscv(bytes: &[u8]) -> f64 {
        let mut units: usize = 0;
        let mut hits: usize = 0;
        let mut pos: usize = 0;
        while pos + 2 <= bytes.len() {
            let half: u16 = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            if half & 0x3 == 0x3 {
                let word: Option<u32> = Endianness::Little.read_u32(&bytes[pos..]);
                match word {
                    Some(w) if w != u32::MAX => {
                        units += 1;
                        if is_typical_riscv(w) {
                            hits += 1;
                        }
                    }
                    _ => {}
                }
                pos += 4;
            } else {
                if half != 0 {
                    units += 1;
                    if is_typical_riscv_compressed(half) {
                        hits += 1;
                    }
                }
                pos += 2;
            }
        }
        normalize(hits, units, &RISCV_PROFILE)
    }

    fn score_avr(bytes: &[u8]) -> f64 {
        let mut units: usize = 0;
        let mut hits: usize = 0;
        for chunk in bytes.chunks_exact(2) {
            let op: u16 = u16::from_le_bytes([chunk[0], chunk[1]]);
            if op == 0 || op == u16::MAX {
                continue;
            }
            units += 1;
            if is_typical_avr(op) {
                hits += 1;
            }
        }
        normalize(hits, units, &AVR_PROFILE)
    }
}

#[inline]
fn normalize(hits: usize, units: usize, profile: &Profile) -> f64 {
    if units == 0 {
        return 0.0;
    }
    let density: f64 = hits as f64 / units as f64;
    ((density - profile.baseline) / (profile.expected - profile.baseline)).clamp(0.0, 1.0)
}

/// Condition field AL.
#[inline]
fn is_typical_arm(word: u32) -> bool {
    word >> 28 == 0xE
}

/// addiu, lw, sw, lui, jal, beq, bne, ori, and well-formed SPECIAL register ops.
#[inline]
fn is_typical_mips(word: u32) -> bool {
    match word >> 26 {
        0x09 | 0x23 | 0x2B | 0x0F | 0x03 | 0x04 | 0x05 | 0x0D => true,
        0x00 => {
            let funct: u32 = word & 0x3F;
            let shamt: u32 = (word >> 6) & 0x1F;
            match funct {
                0x00 | 0x02 | 0x03 => true,
                0x08 | 0x09 | 0x10 | 0x12 | 0x18 | 0x19 | 0x21 | 0x23 | 0x24 | 0x25 | 0x26 | 0x27 | 0x2A
                | 0x2B => shamt == 0,
                _ => false,
            }
        }
        _ => false,
    }
}

/// op-imm, op, load, store, branch, jal, jalr, lui, auipc.
#[inline]
fn is_typical_riscv(word: u32) -> bool {
    matches!(word & 0x7F, 0x13 | 0x33 | 0x03 | 0x23 | 0x63 | 0x6F | 0x67 | 0x37 | 0x17)
}

#[inline]
fn is_typical_riscv_compressed(half: u16) -> bool {
    let funct3: u16 = half >> 13;
    match half & 0x3 {
        0 => matches!(funct3, 2 | 6),
        1 => matches!(funct3, 0 | 2 | 5 | 6 | 7),
        _ => matches!(funct3, 2 | 4 | 6),
    }
}

/// ldi, rjmp, rcall, cpi, in/out, branches, mov/eor and the ret/push/pop forms.
#[inline]
fn is_typical_avr(op: u16) -> bool {
    match op >> 12 {
        0xE | 0xC | 0xD | 0x3 | 0xB => true,
        0xF => op & 0x0800 == 0,
        0x2 => matches!((op >> 10) & 0x3, 1 | 3),
        0x9 => op == 0x9508 || (op & 0xFC0F) == 0x900F || (op & 0xFC0F) == 0x920F,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_le(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_zero_buffer_is_unknown() {
        let guess = ArchitectureDetector::default().detect(&[0u8; 64]);
        assert_eq!(guess.architecture, Architecture::Unknown);
        assert_eq!(guess.confidence, 0.0);
    }

    #[test]
    fn test_erased_flash_is_unknown() {
        let guess = ArchitectureDetector::default().detect(&[0xFFu8; 256]);
        assert_eq!(guess.architecture, Architecture::Unknown);
    }

    #[test]
    fn test_detects_arm_code() {
        let code = words_le(&[
            0xE92D4010, 0xE3A02000, 0xE7913002, 0xE0233000, 0xE2822001, 0xE352000A, 0x1AFFFFFA,
            0xE8BD8010, 0xE59F3008, 0xE12FFF1E,
        ]);
        let guess = ArchitectureDetector::default().detect(&code);
        assert_eq!(guess.architecture, Architecture::Arm);
        assert_eq!(guess.endianness, Endianness::Little);
        assert!(guess.confidence >= 0.5);
    }

    #[test]
    fn test_detects_big_endian_mips() {
        let words: [u32; 8] = [
            0x27BDFFE8, 0xAFBF0014, 0x3C040000, 0x24840010, 0x0C000100, 0x00000000, 0x8FBF0014, 0x03E00008,
        ];
        let code: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let guess = ArchitectureDetector::default().detect(&code);
        assert_eq!(guess.architecture, Architecture::Mips);
        assert_eq!(guess.endianness, Endianness::Big);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let code = words_le(&[0xE3A02000, 0xE12FFF1E]);
        let strict = ArchitectureDetector::new(1.1).detect(&code);
        assert_eq!(strict.architecture, Architecture::Unknown);
        assert!(strict.confidence > 0.5);
    }
}
