//! Structural Signatures
//!
//! Compares loops against the round skeletons of block ciphers, hash compression
//! functions and stream ciphers.
//!
//! # Matching Algorithm
//! 1. A loop qualifies for a skeleton when its inferred trip count is one of the
//!    skeleton's round counts (AES implementations often peel one round, so `N-1`
//!    counts as well)
//! 2. The loop region (body blocks and the edges between them) is compared with a small
//!    library of region shapes using a graph-edit-distance similarity:
//!    `1 - (|ΔV| + |ΔE| + ½·Σ|Δdeg|) / (V₁ + E₁ + V₂ + E₂)`
//! 3. The best shape similarity is scaled by an operation-profile factor: 1.0 when the
//!    loop body contains the operations the primitive needs, 0.6 otherwise

use crate::engine::analysis::control_flow::Loop;
use crate::engine::analysis::Function;
use crate::engine::decoder::InstructionKind;
use crate::engine::matcher::{Detection, DetectionMetadata, PrimitiveKind};
use smallvec::SmallVec;

/// Factor applied when the loop body lacks the primitive's characteristic operations.
const PROFILE_MISMATCH_FACTOR: f64 = 0.6;

/// Round skeleton of one primitive.
#[derive(Debug, Clone, Copy)]
pub struct Skeleton {
    pub variant: PrimitiveKind,
    pub rounds: &'static [u32],
}

pub const SKELETONS: &[Skeleton] = &[
    Skeleton {
        variant: PrimitiveKind::Aes128,
        rounds: &[10, 9],
    },
    Skeleton {
        variant: PrimitiveKind::Aes192,
        rounds: &[12, 11],
    },
    Skeleton {
        variant: PrimitiveKind::Aes256,
        rounds: &[14, 13],
    },
    Skeleton {
        variant: PrimitiveKind::Des,
        rounds: &[16],
    },
    Skeleton {
        variant: PrimitiveKind::Sha1,
        rounds: &[80],
    },
    Skeleton {
        variant: PrimitiveKind::Sha256,
        rounds: &[64],
    },
    Skeleton {
        variant: PrimitiveKind::ChaCha20,
        rounds: &[10, 20],
    },
];

/// Node/edge counts and degree sequence of a loop region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionShape {
    pub nodes: usize,
    pub edges: usize,
    /// In+out degree per node inside the region, descending
    pub degrees: SmallVec<[u32; 8]>,
}

impl RegionShape {
    fn template(nodes: usize, edges: usize, degrees: &[u32]) -> Self {
        let mut degrees: SmallVec<[u32; 8]> = SmallVec::from_slice(degrees);
        degrees.sort_unstable_by(|a, b| b.cmp(a));
        Self { nodes, edges, degrees }
    }

    /// Shape of a loop's body within its function's CFG.
    pub fn of_loop(function: &Function, loop_: &Loop) -> Self {
        let blocks: Vec<u32> = loop_.blocks().collect();
        let mut degrees: SmallVec<[u32; 8]> = SmallVec::from_elem(0, blocks.len());
        let mut edges: usize = 0;
        for edge in function.cfg.edges.iter() {
            if !(loop_.contains(edge.from) && loop_.contains(edge.to)) {
                continue;
            }
            edges += 1;
            if let Ok(from) = blocks.binary_search(&edge.from) {
                degrees[from] += 1;
            }
            if let Ok(to) = blocks.binary_search(&edge.to) {
                degrees[to] += 1;
            }
        }
        degrees.sort_unstable_by(|a, b| b.cmp(a));
        Self {
            nodes: blocks.len(),
            edges,
            degrees,
        }
    }

    /// Graph-edit-distance similarity in [0,1].
    pub fn similarity(&self, other: &RegionShape) -> f64 {
        let total: usize = self.nodes + self.edges + other.nodes + other.edges;
        if total == 0 {
            return 1.0;
        }
        let node_diff: f64 = self.nodes.abs_diff(other.nodes) as f64;
        let edge_diff: f64 = self.edges.abs_diff(other.edges) as f64;
        let len: usize = self.degrees.len().max(other.degrees.len());
        let degree_diff: f64 = (0..len)
            .map(|i| {
                let a: u32 = self.degrees.get(i).copied().unwrap_or(0);
                let b: u32 = other.degrees.get(i).copied().unwrap_or(0);
                a.abs_diff(b) as f64
            })
            .sum();
        (1.0 - (node_diff + edge_diff + 0.5 * degree_diff) / total as f64).clamp(0.0, 1.0)
    }
}

/// Region shapes round loops compile to.
fn shape_library() -> [(&'static str, RegionShape); 5] {
    [
        ("rolled", RegionShape::template(1, 1, &[2])),
        ("two-block", RegionShape::template(2, 2, &[2, 2])),
        ("compact", RegionShape::template(3, 3, &[2, 2, 2])),
        ("branching", RegionShape::template(4, 5, &[3, 2, 2, 3])),
        ("unrolled", RegionShape::template(5, 5, &[2, 2, 2, 2, 2])),
    ]
}

/// Operations present in a loop body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpProfile {
    pub xor: bool,
    pub load: bool,
    pub shift: bool,
    pub rotate: bool,
    pub arithmetic: bool,
    /// Dedicated AES round instructions
    pub aes_round: bool,
}

impl OpProfile {
    pub fn of_loop(function: &Function, loop_: &Loop) -> Self {
        let mut profile = OpProfile::default();
        for block in loop_.blocks() {
            for inst in function.block_instructions(block) {
                match inst.kind {
                    InstructionKind::Logic => {
                        profile.xor |= matches!(inst.mnemonic, "eor" | "xor" | "xori" | "c.xor" | "pxor")
                    }
                    InstructionKind::Load => profile.load = true,
                    InstructionKind::Shift => profile.shift = true,
                    InstructionKind::Rotate => profile.rotate = true,
                    InstructionKind::Arithmetic => profile.arithmetic = true,
                    _ => {}
                }
                profile.aes_round |= inst.mnemonic.starts_with("aes");
            }
        }
        profile
    }

    /// Factor for a primitive family: 1.0 when the profile fits, else 0.6.
    pub fn factor(&self, variant: PrimitiveKind) -> f64 {
        let fits: bool = match variant.family() {
            PrimitiveKind::Aes => self.aes_round || (self.xor && self.load),
            PrimitiveKind::Des => self.xor && (self.shift || self.rotate || self.load),
            PrimitiveKind::Sha1 | PrimitiveKind::Sha256 => (self.rotate || self.shift) && self.arithmetic,
            PrimitiveKind::ChaCha20 => self.arithmetic && self.xor && (self.rotate || self.shift),
            _ => false,
        };
        if fits {
            1.0
        } else {
            PROFILE_MISMATCH_FACTOR
        }
    }
}

/// A loop matching a round skeleton.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralHit {
    pub variant: PrimitiveKind,
    /// Shape similarity × op-profile factor
    pub score: f64,
    /// Entry of the function containing the loop
    pub function: u64,
    /// Address of the loop header block
    pub header_address: u64,
    pub rounds: u32,
    /// Name of the best-matching region shape
    pub shape: &'static str,
}

impl StructuralHit {
    pub fn heuristic(&self) -> String {
        format!(
            "structural:{} rounds={} shape={}",
            self.variant.name().to_ascii_lowercase(),
            self.rounds,
            self.shape
        )
    }

    /// Detection for a skeleton reported without a constant.
    pub fn to_detection(&self, section: Option<String>) -> Detection {
        Detection {
            kind: self.variant,
            confidence: 0.0,
            offsets: vec![self.function, self.header_address],
            section,
            function: Some(self.function),
            site: Some(self.header_address),
            signature_score: 0.0,
            structural_score: self.score,
            metadata: DetectionMetadata {
                variant: Some(self.variant.name().to_string()),
                notes: vec!["round structure without a matching constant".to_string()],
                heuristics: vec![self.heuristic()],
                ..DetectionMetadata::default()
            },
        }
    }
}

pub struct StructuralMatcher;

impl StructuralMatcher {
    /// Match every loop with a trip count against the skeleton library.
    ///
    /// # Returns
    /// `Vec<StructuralHit>` - in function, loop and skeleton order
    pub fn scan(functions: &[Function]) -> Vec<StructuralHit> {
        let library = shape_library();
        let mut hits: Vec<StructuralHit> = Vec::new();

        for function in functions.iter() {
            for loop_ in function.loops.iter() {
                let Some(trips) = loop_.trip_count else {
                    continue;
                };
                let skeletons: SmallVec<[&Skeleton; 2]> =
                    SKELETONS.iter().filter(|s| s.rounds.contains(&trips)).collect();
                if skeletons.is_empty() {
                    continue;
                }

                let shape: RegionShape = RegionShape::of_loop(function, loop_);
                let (shape_name, shape_score): (&'static str, f64) = library
                    .iter()
                    .map(|(name, template)| (*name, shape.similarity(template)))
                    .fold(("", 0.0), |best, next| if next.1 > best.1 { next } else { best });
                let profile: OpProfile = OpProfile::of_loop(function, loop_);
                let header_address: u64 = function
                    .cfg
                    .nodes
                    .get(loop_.header as usize)
                    .map(|b| b.start_address)
                    .unwrap_or(function.entry);

                for skeleton in skeletons {
                    let score: f64 = shape_score * profile.factor(skeleton.variant);
                    log::debug!(
                        "Loop at 0x{:X} ({} trips, {} shape {:.2}) matches {} with {:.3}",
                        header_address,
                        trips,
                        shape_name,
                        shape_score,
                        skeleton.variant,
                        score
                    );
                    if score <= 0.0 {
                        continue;
                    }
                    hits.push(StructuralHit {
                        variant: skeleton.variant,
                        score,
                        function: function.entry,
                        header_address,
                        rounds: trips,
                        shape: shape_name,
                    });
                }
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analysis::control_flow::ControlFlowAnalyzer;
    use crate::engine::decoder::arm;

    /// mov r2,#0 ; loop: ldr r3,[r1],#4 ; eor r0,r0,r3 ; add r2,r2,#1 ; cmp r2,#N ; bne loop ; bx lr
    fn round_function(rounds: u32) -> Function {
        let words: [u32; 7] = [
            0xE3A02000,
            0xE4913004,
            0xE0200003,
            0xE2822001,
            0xE3520000 | rounds,
            0x1AFFFFFA,
            0xE12FFF1E,
        ];
        let instructions: Vec<_> = words
            .iter()
            .enumerate()
            .map(|(i, w)| arm::decode_word(*w, 0x100 + 4 * i as u64).unwrap())
            .collect();
        let cfg = ControlFlowAnalyzer::build_cfg(&instructions, 0x100);
        let mut loops = ControlFlowAnalyzer::detect_loops(&cfg);
        for loop_ in loops.iter_mut() {
            loop_.trip_count = ControlFlowAnalyzer::infer_trip_count(&cfg, &instructions, loop_);
        }
        Function {
            entry: 0x100,
            name: None,
            section: ".text".to_string(),
            instructions,
            cfg,
            loops,
            call_sites: Vec::new(),
            data_refs: Vec::new(),
        }
    }

    #[test]
    fn test_shape_similarity() {
        let rolled = RegionShape::template(1, 1, &[2]);
        assert_eq!(rolled.similarity(&rolled), 1.0);
        let two = RegionShape::template(2, 2, &[2, 2]);
        // (1 + 1 + 0.5 * 2) / 6
        assert!((rolled.similarity(&two) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ten_round_loop_matches_aes128() {
        let function = round_function(10);
        assert_eq!(function.loops.len(), 1);
        assert_eq!(function.loops[0].trip_count, Some(10));

        let hits = StructuralMatcher::scan(&[function]);
        let aes = hits.iter().find(|h| h.variant == PrimitiveKind::Aes128).unwrap();
        assert_eq!(aes.score, 1.0);
        assert_eq!(aes.shape, "rolled");
        assert_eq!(aes.header_address, 0x104);
        // ten rounds also fit ChaCha20 double rounds, without the rotate it needs
        let chacha = hits.iter().find(|h| h.variant == PrimitiveKind::ChaCha20).unwrap();
        assert!((chacha.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unlisted_round_count() {
        let hits = StructuralMatcher::scan(&[round_function(7)]);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_des_profile() {
        let hits = StructuralMatcher::scan(&[round_function(16)]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].variant, PrimitiveKind::Des);
        assert_eq!(hits[0].score, 1.0);
    }
}
