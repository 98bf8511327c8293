//! Primitive Signature Matcher
//!
//! Detects cryptographic primitives in a disassembled image by combining two
//! independent signals:
//! - **Constant signatures** ([`constants`]): byte and word tables, DER headers and
//!   immediates that implementations of a primitive carry
//! - **Structural signatures** ([`structural`]): loops whose trip count and shape match a
//!   primitive's round skeleton
//!
//! # Scoring Algorithm
//! 1. Every constant hit carries a signature score (similarity × specificity)
//! 2. Every structural hit carries a structural score (shape similarity × op-profile factor)
//! 3. A structural hit links to same-family constant hits: full weight when its function
//!    references the constant, half weight otherwise; its variant refines a generic kind
//! 4. `confidence = 0.6 × signature + 0.4 × structural`
//! 5. Unlinked AES and DES skeletons are reported on their own (`0.4 × structural`)
//! 6. Hits below [`MIN_CONFIDENCE`] are dropped; at one offset only the most confident
//!    detection survives
//!
//! Output is sorted by primary offset, then kind name.

pub mod constants;
pub mod structural;

use crate::engine::analysis::disassembler::Disassembly;
use crate::engine::analysis::Function;
use crate::engine::image::FirmwareImage;
use constants::{ConstantScanner, SignatureHit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use structural::{StructuralHit, StructuralMatcher};

/// Combined confidence below which a hit is never surfaced.
pub const MIN_CONFIDENCE: f64 = 0.2;
/// Weight of the constant signature score in the combined confidence.
pub const SIGNATURE_WEIGHT: f64 = 0.6;
/// Weight of the structural score in the combined confidence.
pub const STRUCTURAL_WEIGHT: f64 = 0.4;
/// Link factor for a structural hit whose function does not reference the constant.
const UNREFERENCED_LINK_FACTOR: f64 = 0.5;

/// Kind of detected primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrimitiveKind {
    #[serde(rename = "AES")]
    Aes = 0,
    #[serde(rename = "AES-128")]
    Aes128 = 1,
    #[serde(rename = "AES-192")]
    Aes192 = 2,
    #[serde(rename = "AES-256")]
    Aes256 = 3,
    #[serde(rename = "DES")]
    Des = 4,
    #[serde(rename = "ChaCha20")]
    ChaCha20 = 5,
    #[serde(rename = "RSA")]
    Rsa = 6,
    #[serde(rename = "ECC")]
    Ecc = 7,
    #[serde(rename = "SHA-1")]
    Sha1 = 8,
    #[serde(rename = "SHA-256")]
    Sha256 = 9,
    #[serde(rename = "SHA-512")]
    Sha512 = 10,
    #[serde(rename = "MD5")]
    Md5 = 11,
    #[serde(rename = "Poly1305")]
    Poly1305 = 12,
    #[serde(rename = "PRNG")]
    Prng = 13,
    #[serde(rename = "Proprietary")]
    Proprietary = 14,
}

impl PrimitiveKind {
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Aes => "AES",
            PrimitiveKind::Aes128 => "AES-128",
            PrimitiveKind::Aes192 => "AES-192",
            PrimitiveKind::Aes256 => "AES-256",
            PrimitiveKind::Des => "DES",
            PrimitiveKind::ChaCha20 => "ChaCha20",
            PrimitiveKind::Rsa => "RSA",
            PrimitiveKind::Ecc => "ECC",
            PrimitiveKind::Sha1 => "SHA-1",
            PrimitiveKind::Sha256 => "SHA-256",
            PrimitiveKind::Sha512 => "SHA-512",
            PrimitiveKind::Md5 => "MD5",
            PrimitiveKind::Poly1305 => "Poly1305",
            PrimitiveKind::Prng => "PRNG",
            PrimitiveKind::Proprietary => "Proprietary",
        }
    }

    /// Family used for linking and grouping; AES variants share one family.
    pub fn family(&self) -> PrimitiveKind {
        match self {
            PrimitiveKind::Aes128 | PrimitiveKind::Aes192 | PrimitiveKind::Aes256 => PrimitiveKind::Aes,
            other => *other,
        }
    }

    /// Whether a structural variant may refine this kind.
    #[inline]
    pub fn is_generic(&self) -> bool {
        matches!(self, PrimitiveKind::Aes)
    }
}

impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Free-form facts about a detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    /// Key or modulus length in bits (RSA modulus, ECC field size)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
    /// PRNG variant (`LCG`, `MT19937`) or structural variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Names of the heuristics that fired, in the order they were applied
    #[serde(default)]
    pub heuristics: Vec<String>,
}

/// A detected cryptographic primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub kind: PrimitiveKind,
    /// Combined confidence in [0,1]
    pub confidence: f64,
    /// Source addresses, primary first
    pub offsets: Vec<u64>,
    /// Section holding the primary offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Entry of the function that uses the primitive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<u64>,
    /// Address of the instruction that references the primitive's data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<u64>,
    pub signature_score: f64,
    pub structural_score: f64,
    pub metadata: DetectionMetadata,
}

impl Detection {
    #[inline]
    pub fn primary_offset(&self) -> u64 {
        self.offsets.first().copied().unwrap_or(0)
    }

    /// Name the compliance ruleset knows this primitive by.
    ///
    /// # Examples
    /// - RSA with a 1024-bit modulus → `RSA-1024`
    /// - ECC over P-256 → `ECC-256`
    /// - LCG generator → `PRNG-LCG`
    pub fn algorithm_name(&self) -> String {
        match self.kind {
            PrimitiveKind::Rsa | PrimitiveKind::Ecc => match self.metadata.key_bits {
                Some(bits) => format!("{}-{}", self.kind.name(), bits),
                None => self.kind.name().to_string(),
            },
            PrimitiveKind::Prng => match &self.metadata.variant {
                Some(variant) => format!("PRNG-{}", variant),
                None => "PRNG".to_string(),
            },
            kind => kind.name().to_string(),
        }
    }

    /// Key used to group detections in summaries: the family name.
    pub fn group(&self) -> &'static str {
        self.kind.family().name()
    }
}

/// Primitive matcher over a disassembled image.
pub struct PrimitiveMatcher;

impl PrimitiveMatcher {
    /// Run constant and structural matching and combine the results.
    ///
    /// # Arguments
    /// * `image` - Loaded image (all sections are scanned for constants)
    /// * `disassembly` - Functions recovered from the image
    ///
    /// # Returns
    /// `Vec<Detection>` - detections with confidence ≥ [`MIN_CONFIDENCE`], sorted by
    /// (primary offset, kind name)
    pub fn scan(image: &FirmwareImage, disassembly: &Disassembly) -> Vec<Detection> {
        let signature_hits: Vec<SignatureHit> = ConstantScanner::scan(image, &disassembly.functions);
        let structural_hits: Vec<StructuralHit> = StructuralMatcher::scan(&disassembly.functions);
        log::debug!(
            "Matcher: {} constant hits, {} structural hits",
            signature_hits.len(),
            structural_hits.len()
        );

        let detections: Vec<Detection> = Self::combine(&signature_hits, &structural_hits, &disassembly.functions);
        log::info!("Matched {} primitives", detections.len());
        detections
    }

    /// Combine constant and structural hits into surfaced detections.
    pub fn combine(
        signature_hits: &[SignatureHit],
        structural_hits: &[StructuralHit],
        functions: &[Function],
    ) -> Vec<Detection> {
        let mut candidates: Vec<Detection> = signature_hits.iter().map(|hit| hit.to_detection()).collect();

        for hit in structural_hits.iter() {
            let family: PrimitiveKind = hit.variant.family();
            let referencing: Option<&Function> = functions
                .binary_search_by_key(&hit.function, |f| f.entry)
                .ok()
                .and_then(|idx| functions.get(idx));
            let mut linked: bool = false;

            for (detection, signature) in candidates.iter_mut().zip(signature_hits.iter()) {
                if detection.kind.family() != family {
                    continue;
                }
                linked = true;
                let referenced: bool = signature.function == Some(hit.function)
                    || referencing.map_or(false, |f| signature.is_referenced_by(f));
                let factor: f64 = if referenced { 1.0 } else { UNREFERENCED_LINK_FACTOR };
                let structural: f64 = hit.score * factor;
                if structural <= detection.structural_score {
                    continue;
                }

                detection.structural_score = structural;
                if detection.kind.is_generic() && hit.variant != detection.kind {
                    detection.kind = hit.variant;
                    detection.metadata.variant = Some(hit.variant.name().to_string());
                }
                if referenced && detection.function.is_none() {
                    detection.function = Some(hit.function);
                    detection.site = Some(hit.header_address);
                }
                detection.offsets.truncate(1);
                detection.offsets.push(hit.header_address);
                detection.metadata.heuristics.retain(|h| !h.starts_with("structural:"));
                detection.metadata.heuristics.push(hit.heuristic());
                if !referenced {
                    detection.metadata.notes.push("loop linked by family only".to_string());
                }
            }

            if !linked && matches!(family, PrimitiveKind::Aes | PrimitiveKind::Des) {
                candidates.push(hit.to_detection(referencing.map(|f| f.section.clone())));
            }
        }

        for detection in candidates.iter_mut() {
            detection.confidence = (SIGNATURE_WEIGHT * detection.signature_score
                + STRUCTURAL_WEIGHT * detection.structural_score)
                .clamp(0.0, 1.0);
        }

        Self::finalize(candidates)
    }

    /// Apply the confidence cutoff, keep the best detection per offset and sort.
    fn finalize(candidates: Vec<Detection>) -> Vec<Detection> {
        let mut best: BTreeMap<u64, Detection> = BTreeMap::new();
        for detection in candidates {
            if detection.confidence < MIN_CONFIDENCE {
                log::debug!(
                    "Dropped {} at 0x{:X}: confidence {:.3}",
                    detection.kind,
                    detection.primary_offset(),
                    detection.confidence
                );
                continue;
            }
            let offset: u64 = detection.primary_offset();
            match best.get(&offset) {
                Some(existing) if !Self::outranks(&detection, existing) => {}
                _ => {
                    best.insert(offset, detection);
                }
            }
        }
        // one detection per offset, so offset order is (offset, kind name) order
        best.into_values().collect()
    }

    fn outranks(candidate: &Detection, existing: &Detection) -> bool {
        candidate.confidence > existing.confidence
            || (candidate.confidence == existing.confidence && candidate.kind.name() < existing.kind.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analysis::control_flow::ControlFlowGraph;
    use crate::engine::analysis::references::{DataReference, ReferenceKind};

    fn function(entry: u64, refs: &[u64]) -> Function {
        Function {
            entry,
            name: None,
            section: ".text".to_string(),
            instructions: Vec::new(),
            cfg: ControlFlowGraph::default(),
            loops: Vec::new(),
            call_sites: Vec::new(),
            data_refs: refs
                .iter()
                .map(|target| DataReference {
                    site: entry + 4,
                    target: *target,
                    kind: ReferenceKind::Direct,
                })
                .collect(),
        }
    }

    fn signature(kind: PrimitiveKind, address: u64, score: f64) -> SignatureHit {
        SignatureHit {
            id: "test",
            kind,
            score,
            address,
            length: 16,
            section: Some(".rodata".to_string()),
            function: None,
            site: None,
            metadata: DetectionMetadata::default(),
        }
    }

    fn structural(variant: PrimitiveKind, function: u64, score: f64) -> StructuralHit {
        StructuralHit {
            variant,
            score,
            function,
            header_address: function + 8,
            rounds: 10,
            shape: "rolled",
        }
    }

    #[test]
    fn test_referenced_loop_refines_and_adds_full_weight() {
        let functions = vec![function(0x100, &[0x14A0])];
        let detections = PrimitiveMatcher::combine(
            &[signature(PrimitiveKind::Aes, 0x14A0, 0.9)],
            &[structural(PrimitiveKind::Aes128, 0x100, 1.0)],
            &functions,
        );
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.kind, PrimitiveKind::Aes128);
        assert_eq!(d.primary_offset(), 0x14A0);
        assert!((d.confidence - 0.94).abs() < 1e-9);
        assert_eq!(d.function, Some(0x100));
    }

    #[test]
    fn test_unreferenced_loop_adds_half_weight() {
        let functions = vec![function(0x100, &[])];
        let detections = PrimitiveMatcher::combine(
            &[signature(PrimitiveKind::Aes, 0x2000, 1.0)],
            &[structural(PrimitiveKind::Aes128, 0x100, 1.0)],
            &functions,
        );
        assert!((detections[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_standalone_skeleton_and_cutoff() {
        let functions = vec![function(0x100, &[]), function(0x200, &[])];
        let detections = PrimitiveMatcher::combine(
            &[],
            &[
                structural(PrimitiveKind::Des, 0x100, 0.9),
                structural(PrimitiveKind::Aes256, 0x200, 0.4),
                structural(PrimitiveKind::Sha1, 0x200, 1.0),
            ],
            &functions,
        );
        // DES: 0.36 kept; AES-256: 0.16 below the cutoff; SHA-1 needs a constant
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].kind, PrimitiveKind::Des);
        assert_eq!(detections[0].primary_offset(), 0x100);
        assert!(detections.iter().all(|d| d.confidence >= MIN_CONFIDENCE));
    }

    #[test]
    fn test_same_offset_keeps_highest() {
        let detections = PrimitiveMatcher::combine(
            &[
                signature(PrimitiveKind::Md5, 0x400, 0.7),
                signature(PrimitiveKind::Sha1, 0x400, 1.0),
                signature(PrimitiveKind::Sha256, 0x300, 1.0),
            ],
            &[],
            &[],
        );
        let kinds: Vec<PrimitiveKind> = detections.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![PrimitiveKind::Sha256, PrimitiveKind::Sha1]);
    }

    #[test]
    fn test_algorithm_names() {
        let mut d = signature(PrimitiveKind::Rsa, 0, 1.0).to_detection();
        d.metadata.key_bits = Some(1024);
        assert_eq!(d.algorithm_name(), "RSA-1024");
        let mut p = signature(PrimitiveKind::Prng, 0, 1.0).to_detection();
        p.metadata.variant = Some("LCG".to_string());
        assert_eq!(p.algorithm_name(), "PRNG-LCG");
        assert_eq!(PrimitiveKind::Aes192.family(), PrimitiveKind::Aes);
        assert_eq!(serde_json::to_string(&PrimitiveKind::Aes128).unwrap(), "\"AES-128\"");
    }
}
