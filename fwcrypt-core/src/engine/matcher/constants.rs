//! Constant Signatures
//!
//! Finds the constants cryptographic implementations cannot avoid carrying: substitution
//! boxes, round constants, initial hash values, curve parameters, DER key headers and
//! generator multipliers.
//!
//! # Matching Algorithm
//! - **Tables** are expanded into byte patterns (word tables in both byte orders, big
//!   numbers big-endian and reversed). Patterns shorter than 32 bytes must match exactly;
//!   longer ones match when at least 85% of bytes agree.
//! - Near matches are found through an anchor index of the patterns' disjoint 4-byte
//!   blocks: with at most 15% of bytes wrong, one block of a matching window is intact,
//!   so one pass over the image proposes every candidate start.
//! - **Scatter** signatures (constants spread across code) match the immediates and
//!   literal-pool values of a single function.
//! - **DER headers**: `rsaEncryption` OIDs, with the modulus length read from the
//!   following `INTEGER`.
//! - **Permutations**: a 256-byte window holding every byte value once that is not a known
//!   S-box is reported as a proprietary substitution table.
//!
//! # Memory Optimizations
//! - Patterns are built once per scan and indexed by their anchor words
//! - Candidate starts are deduplicated per pattern before comparison

use crate::engine::analysis::references::ReferenceKind;
use crate::engine::analysis::Function;
use crate::engine::decoder::{InstructionKind, Operand};
use crate::engine::image::FirmwareImage;
use crate::engine::matcher::{Detection, DetectionMetadata, PrimitiveKind};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Minimum byte similarity for a near match.
pub const NEAR_MATCH_THRESHOLD: f64 = 0.85;
/// Tables shorter than this must match exactly.
pub const EXACT_MATCH_LENGTH: usize = 32;

const ANCHOR: usize = 4;
/// Bytes after a DER OID searched for the modulus `INTEGER`.
const DER_MODULUS_WINDOW: usize = 48;
const PROPRIETARY_SPECIFICITY: f64 = 0.8;
const RSA_SPECIFICITY: f64 = 0.9;

pub const AES_SBOX: [u8; 256] = [
    0x63, 0x7C, 0x77, 0x7B, 0xF2, 0x6B, 0x6F, 0xC5, 0x30, 0x01, 0x67, 0x2B, 0xFE, 0xD7, 0xAB, 0x76,
    0xCA, 0x82, 0xC9, 0x7D, 0xFA, 0x59, 0x47, 0xF0, 0xAD, 0xD4, 0xA2, 0xAF, 0x9C, 0xA4, 0x72, 0xC0,
    0xB7, 0xFD, 0x93, 0x26, 0x36, 0x3F, 0xF7, 0xCC, 0x34, 0xA5, 0xE5, 0xF1, 0x71, 0xD8, 0x31, 0x15,
    0x04, 0xC7, 0x23, 0xC3, 0x18, 0x96, 0x05, 0x9A, 0x07, 0x12, 0x80, 0xE2, 0xEB, 0x27, 0xB2, 0x75,
    0x09, 0x83, 0x2C, 0x1A, 0x1B, 0x6E, 0x5A, 0xA0, 0x52, 0x3B, 0xD6, 0xB3, 0x29, 0xE3, 0x2F, 0x84,
    0x53, 0xD1, 0x00, 0xED, 0x20, 0xFC, 0xB1, 0x5B, 0x6A, 0xCB, 0xBE, 0x39, 0x4A, 0x4C, 0x58, 0xCF,
    0xD0, 0xEF, 0xAA, 0xFB, 0x43, 0x4D, 0x33, 0x85, 0x45, 0xF9, 0x02, 0x7F, 0x50, 0x3C, 0x9F, 0xA8,
    0x51, 0xA3, 0x40, 0x8F, 0x92, 0x9D, 0x38, 0xF5, 0xBC, 0xB6, 0xDA, 0x21, 0x10, 0xFF, 0xF3, 0xD2,
    0xCD, 0x0C, 0x13, 0xEC, 0x5F, 0x97, 0x44, 0x17, 0xC4, 0xA7, 0x7E, 0x3D, 0x64, 0x5D, 0x19, 0x73,
    0x60, 0x81, 0x4F, 0xDC, 0x22, 0x2A, 0x90, 0x88, 0x46, 0xEE, 0xB8, 0x14, 0xDE, 0x5E, 0x0B, 0xDB,
    0xE0, 0x32, 0x3A, 0x0A, 0x49, 0x06, 0x24, 0x5C, 0xC2, 0xD3, 0xAC, 0x62, 0x91, 0x95, 0xE4, 0x79,
    0xE7, 0xC8, 0x37, 0x6D, 0x8D, 0xD5, 0x4E, 0xA9, 0x6C, 0x56, 0xF4, 0xEA, 0x65, 0x7A, 0xAE, 0x08,
    0xBA, 0x78, 0x25, 0x2E, 0x1C, 0xA6, 0xB4, 0xC6, 0xE8, 0xDD, 0x74, 0x1F, 0x4B, 0xBD, 0x8B, 0x8A,
    0x70, 0x3E, 0xB5, 0x66, 0x48, 0x03, 0xF6, 0x0E, 0x61, 0x35, 0x57, 0xB9, 0x86, 0xC1, 0x1D, 0x9E,
    0xE1, 0xF8, 0x98, 0x11, 0x69, 0xD9, 0x8E, 0x94, 0x9B, 0x1E, 0x87, 0xE9, 0xCE, 0x55, 0x28, 0xDF,
    0x8C, 0xA1, 0x89, 0x0D, 0xBF, 0xE6, 0x42, 0x68, 0x41, 0x99, 0x2D, 0x0F, 0xB0, 0x54, 0xBB, 0x16,
];

pub const AES_INV_SBOX: [u8; 256] = invert(&AES_SBOX);

pub const AES_RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1B, 0x36];

/// First 16 entries of the T-table `Te0`.
const AES_TE0: [u32; 16] = [
    0xC66363A5, 0xF87C7C84, 0xEE777799, 0xF67B7B8D,
    0xFFF2F20D, 0xD66B6BBD, 0xDE6F6FB1, 0x91C5C554,
    0x60303050, 0x02010103, 0xCE6767A9, 0x562B2B7D,
    0xE7FEFE19, 0xB5D7D762, 0x4DABABE6, 0xEC76769A,
];

const DES_S1: [u8; 64] = [
    14, 4, 13, 1, 2, 15, 11, 8, 3, 10, 6, 12, 5, 9, 0, 7,
    0, 15, 7, 4, 14, 2, 13, 1, 10, 6, 12, 11, 9, 5, 3, 8,
    4, 1, 14, 8, 13, 6, 2, 11, 15, 12, 9, 7, 3, 10, 5, 0,
    15, 12, 8, 2, 4, 9, 1, 7, 5, 11, 3, 14, 10, 0, 6, 13,
];

const SHA1_IV: [u32; 5] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476, 0xC3D2E1F0];
const SHA1_K: [u64; 4] = [0x5A827999, 0x6ED9EBA1, 0x8F1BBCDC, 0xCA62C1D6];

const MD5_IV: [u32; 4] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476];
/// First 16 entries of the MD5 sine table.
const MD5_T: [u32; 16] = [
    0xD76AA478, 0xE8C7B756, 0x242070DB, 0xC1BDCEEE,
    0xF57C0FAF, 0x4787C62A, 0xA8304613, 0xFD469501,
    0x698098D8, 0x8B44F7AF, 0xFFFF5BB1, 0x895CD7BE,
    0x6B901122, 0xFD987193, 0xA679438E, 0x49B40821,
];
const MD5_T_IMMEDIATES: [u64; 4] = [0xD76AA478, 0xE8C7B756, 0x242070DB, 0xC1BDCEEE];

const SHA256_H: [u32; 8] = [
    0x6A09E667, 0xBB67AE85, 0x3C6EF372, 0xA54FF53A, 0x510E527F, 0x9B05688C, 0x1F83D9AB, 0x5BE0CD19,
];
/// First 16 SHA-256 round constants.
const SHA256_K: [u32; 16] = [
    0x428A2F98, 0x71374491, 0xB5C0FBCF, 0xE9B5DBA5,
    0x3956C25B, 0x59F111F1, 0x923F82A4, 0xAB1C5ED5,
    0xD807AA98, 0x12835B01, 0x243185BE, 0x550C7DC3,
    0x72BE5D74, 0x80DEB1FE, 0x9BDC06A7, 0xC19BF174,
];
/// First 8 SHA-512 round constants.
const SHA512_K: [u64; 8] = [
    0x428A2F98D728AE22, 0x7137449123EF65CD,
    0xB5C0FBCFEC4D3B2F, 0xE9B5DBA58189DBBC,
    0x3956C25BF348B538, 0x59F111F1B605D019,
    0x923F82A4AF194F9B, 0xAB1C5ED5DA6D8118,
];

const CHACHA_SIGMA: &[u8; 16] = b"expand 32-byte k";
const CHACHA_TAU: &[u8; 16] = b"expand 16-byte k";
const CHACHA_SIGMA_WORDS: [u64; 4] = [0x61707865, 0x3320646E, 0x79622D32, 0x6B206574];

/// Poly1305 `r` clamp mask, little-endian.
const POLY1305_CLAMP: [u8; 16] = [
    0xFF, 0xFF, 0xFF, 0x0F, 0xFC, 0xFF, 0xFF, 0x0F, 0xFC, 0xFF, 0xFF, 0x0F, 0xFC, 0xFF, 0xFF, 0x0F,
];
const POLY1305_MASKS: [u64; 2] = [0x0FFFFFFF, 0x0FFFFFFC];

const P256_PRIME: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];
const P256_B: [u8; 32] = [
    0x5A, 0xC6, 0x35, 0xD8, 0xAA, 0x3A, 0x93, 0xE7, 0xB3, 0xEB, 0xBD, 0x55, 0x76, 0x98, 0x86, 0xBC,
    0x65, 0x1D, 0x06, 0xB0, 0xCC, 0x53, 0xB0, 0xF6, 0x3B, 0xCE, 0x3C, 0x3E, 0x27, 0xD2, 0x60, 0x4B,
];
const P384_PRIME: [u8; 48] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
];
const SECP256K1_PRIME: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFC, 0x2F,
];

/// DER encoding of OID 1.2.840.113549.1.1.1 (`rsaEncryption`).
pub const RSA_ENCRYPTION_OID: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];

const LCG_ANSI: [u64; 2] = [0x41C64E6D, 0x3039];
const LCG_MSVC: [u64; 2] = [0x000343FD, 0x00269EC3];
const MT19937: [u64; 4] = [0x9908B0DF, 0x9D2C5680, 0xEFC60000, 0x6C078965];

const fn invert(table: &[u8; 256]) -> [u8; 256] {
    let mut out = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        out[table[i] as usize] = i as u8;
        i += 1;
    }
    out
}

/// How a table is laid out in memory.
#[derive(Debug, Clone, Copy)]
pub enum TableData {
    /// Byte table, matched as is
    Bytes(&'static [u8]),
    /// 32-bit words, matched little- and big-endian
    Words32(&'static [u32]),
    /// 64-bit words, matched little- and big-endian
    Words64(&'static [u64]),
    /// Big-endian number, matched as is and byte-reversed
    BigNumber(&'static [u8]),
}

impl TableData {
    /// Byte patterns with a label for the layout each represents.
    fn patterns(&self) -> Vec<(Vec<u8>, &'static str)> {
        match self {
            TableData::Bytes(bytes) => vec![(bytes.to_vec(), "bytes")],
            TableData::Words32(words) => vec![
                (words.iter().flat_map(|w| w.to_le_bytes()).collect(), "le"),
                (words.iter().flat_map(|w| w.to_be_bytes()).collect(), "be"),
            ],
            TableData::Words64(words) => vec![
                (words.iter().flat_map(|w| w.to_le_bytes()).collect(), "le"),
                (words.iter().flat_map(|w| w.to_be_bytes()).collect(), "be"),
            ],
            TableData::BigNumber(bytes) => vec![
                (bytes.to_vec(), "be"),
                (bytes.iter().rev().copied().collect(), "le"),
            ],
        }
    }
}

/// A contiguous constant table.
#[derive(Debug, Clone, Copy)]
pub struct TableSignature {
    pub id: &'static str,
    pub kind: PrimitiveKind,
    pub data: TableData,
    /// How strongly the table alone indicates the primitive, in [0,1]
    pub specificity: f64,
    /// Require an exact match regardless of length (low-entropy tables)
    pub exact_only: bool,
    pub key_bits: Option<u32>,
    pub curve: Option<&'static str>,
}

/// Constants spread across one function's code.
#[derive(Debug, Clone, Copy)]
pub struct ScatterSignature {
    pub id: &'static str,
    pub kind: PrimitiveKind,
    pub words: &'static [u64],
    /// Distinct words that must be present
    pub min_hits: usize,
    pub specificity: f64,
    pub variant: Option<&'static str>,
}

const fn table(id: &'static str, kind: PrimitiveKind, data: TableData, specificity: f64) -> TableSignature {
    TableSignature {
        id,
        kind,
        data,
        specificity,
        exact_only: false,
        key_bits: None,
        curve: None,
    }
}

const fn curve(id: &'static str, data: &'static [u8], exact_only: bool, bits: u32, name: &'static str) -> TableSignature {
    TableSignature {
        id,
        kind: PrimitiveKind::Ecc,
        data: TableData::BigNumber(data),
        specificity: 0.9,
        exact_only,
        key_bits: Some(bits),
        curve: Some(name),
    }
}

pub const TABLE_SIGNATURES: &[TableSignature] = &[
    table("aes_sbox", PrimitiveKind::Aes, TableData::Bytes(&AES_SBOX), 1.0),
    table("aes_inv_sbox", PrimitiveKind::Aes, TableData::Bytes(&AES_INV_SBOX), 1.0),
    table("aes_te0", PrimitiveKind::Aes, TableData::Words32(&AES_TE0), 1.0),
    table("aes_rcon", PrimitiveKind::Aes, TableData::Bytes(&AES_RCON), 0.9),
    table("des_s1", PrimitiveKind::Des, TableData::Bytes(&DES_S1), 0.9),
    table("sha1_iv", PrimitiveKind::Sha1, TableData::Words32(&SHA1_IV), 1.0),
    table("md5_iv", PrimitiveKind::Md5, TableData::Words32(&MD5_IV), 0.7),
    table("md5_t", PrimitiveKind::Md5, TableData::Words32(&MD5_T), 1.0),
    table("sha256_h", PrimitiveKind::Sha256, TableData::Words32(&SHA256_H), 1.0),
    table("sha256_k", PrimitiveKind::Sha256, TableData::Words32(&SHA256_K), 1.0),
    table("sha512_k", PrimitiveKind::Sha512, TableData::Words64(&SHA512_K), 1.0),
    table("chacha_sigma", PrimitiveKind::ChaCha20, TableData::Bytes(CHACHA_SIGMA), 1.0),
    table("chacha_tau", PrimitiveKind::ChaCha20, TableData::Bytes(CHACHA_TAU), 0.9),
    table("poly1305_clamp", PrimitiveKind::Poly1305, TableData::Bytes(&POLY1305_CLAMP), 0.8),
    curve("p256_prime", &P256_PRIME, true, 256, "P-256"),
    TableSignature {
        specificity: 1.0,
        ..curve("p256_b", &P256_B, false, 256, "P-256")
    },
    curve("p384_prime", &P384_PRIME, true, 384, "P-384"),
    curve("secp256k1_prime", &SECP256K1_PRIME, true, 256, "secp256k1"),
];

pub const SCATTER_SIGNATURES: &[ScatterSignature] = &[
    ScatterSignature {
        id: "sha1_k",
        kind: PrimitiveKind::Sha1,
        words: &SHA1_K,
        min_hits: 3,
        specificity: 1.0,
        variant: None,
    },
    ScatterSignature {
        id: "md5_t_immediates",
        kind: PrimitiveKind::Md5,
        words: &MD5_T_IMMEDIATES,
        min_hits: 3,
        specificity: 1.0,
        variant: None,
    },
    ScatterSignature {
        id: "chacha_sigma_words",
        kind: PrimitiveKind::ChaCha20,
        words: &CHACHA_SIGMA_WORDS,
        min_hits: 3,
        specificity: 1.0,
        variant: None,
    },
    ScatterSignature {
        id: "poly1305_masks",
        kind: PrimitiveKind::Poly1305,
        words: &POLY1305_MASKS,
        min_hits: 2,
        specificity: 0.6,
        variant: None,
    },
    ScatterSignature {
        id: "lcg_ansi",
        kind: PrimitiveKind::Prng,
        words: &LCG_ANSI,
        min_hits: 2,
        specificity: 0.9,
        variant: Some("LCG"),
    },
    ScatterSignature {
        id: "lcg_msvc",
        kind: PrimitiveKind::Prng,
        words: &LCG_MSVC,
        min_hits: 2,
        specificity: 0.9,
        variant: Some("LCG"),
    },
    ScatterSignature {
        id: "mt19937",
        kind: PrimitiveKind::Prng,
        words: &MT19937,
        min_hits: 2,
        specificity: 1.0,
        variant: Some("MT19937"),
    },
];

/// One constant signature found in the image.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureHit {
    /// Signature id (`aes_sbox`, `rsa_oid`, ...)
    pub id: &'static str,
    pub kind: PrimitiveKind,
    /// Similarity × specificity
    pub score: f64,
    /// Address of the table, or of the first matching instruction for scatter hits
    pub address: u64,
    /// Bytes covered at `address`
    pub length: usize,
    pub section: Option<String>,
    pub function: Option<u64>,
    pub site: Option<u64>,
    pub metadata: DetectionMetadata,
}

impl SignatureHit {
    /// Whether `function` loads or computes an address inside this hit.
    pub fn is_referenced_by(&self, function: &Function) -> bool {
        let end: u64 = self.address + self.length.max(1) as u64;
        function
            .data_refs
            .iter()
            .any(|r| r.target >= self.address && r.target < end)
    }

    /// Detection carrying only the signature score; confidence is set when combined.
    pub fn to_detection(&self) -> Detection {
        Detection {
            kind: self.kind,
            confidence: 0.0,
            offsets: vec![self.address],
            section: self.section.clone(),
            function: self.function,
            site: self.site,
            signature_score: self.score,
            structural_score: 0.0,
            metadata: self.metadata.clone(),
        }
    }
}

/// Byte pattern derived from one table signature.
struct Pattern {
    signature: usize,
    bytes: Vec<u8>,
    layout: &'static str,
    exact: bool,
}

/// Anchor word → (pattern, block offset).
struct PatternIndex {
    patterns: Vec<Pattern>,
    anchors: HashMap<[u8; ANCHOR], Vec<(u32, u32)>>,
}

impl PatternIndex {
    fn build(signatures: &[TableSignature]) -> Self {
        let mut patterns: Vec<Pattern> = Vec::new();
        for (idx, signature) in signatures.iter().enumerate() {
            for (bytes, layout) in signature.data.patterns() {
                let exact: bool = signature.exact_only || bytes.len() < EXACT_MATCH_LENGTH;
                patterns.push(Pattern {
                    signature: idx,
                    bytes,
                    layout,
                    exact,
                });
            }
        }

        let mut anchors: HashMap<[u8; ANCHOR], Vec<(u32, u32)>> = HashMap::new();
        for (p, pattern) in patterns.iter().enumerate() {
            for (block, chunk) in pattern.bytes.chunks_exact(ANCHOR).enumerate() {
                // fill words would propose a candidate at every byte of erased flash
                if chunk.iter().all(|b| *b == chunk[0]) {
                    continue;
                }
                let mut key = [0u8; ANCHOR];
                key.copy_from_slice(chunk);
                anchors
                    .entry(key)
                    .or_default()
                    .push((p as u32, (block * ANCHOR) as u32));
            }
        }
        Self { patterns, anchors }
    }
}

/// Byte-wise similarity of two equal-length slices.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let same: usize = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    same as f64 / a.len() as f64
}

pub struct ConstantScanner;

impl ConstantScanner {
    /// Scan every section and function for constant signatures.
    ///
    /// # Arguments
    /// * `image` - Loaded image
    /// * `functions` - Recovered functions, used for scatter signatures and for linking
    ///   tables to the code that references them
    ///
    /// # Returns
    /// `Vec<SignatureHit>` - sorted by (address, signature id)
    pub fn scan(image: &FirmwareImage, functions: &[Function]) -> Vec<SignatureHit> {
        let index: PatternIndex = PatternIndex::build(TABLE_SIGNATURES);
        let mut hits: Vec<SignatureHit> = Vec::new();

        for section in image.sections.iter() {
            let data: &[u8] = image.section_data(section);
            let base: u64 = section.virtual_address;
            for (offset, signature, score, layout) in Self::scan_tables(&index, data) {
                let sig: &TableSignature = &TABLE_SIGNATURES[signature];
                log::debug!(
                    "Table {} ({}) at 0x{:X}, score {:.3}",
                    sig.id,
                    layout,
                    base + offset as u64,
                    score
                );
                hits.push(SignatureHit {
                    id: sig.id,
                    kind: sig.kind,
                    score,
                    address: base + offset as u64,
                    length: Self::table_length(sig),
                    section: Some(section.name.clone()),
                    function: None,
                    site: None,
                    metadata: DetectionMetadata {
                        key_bits: sig.key_bits,
                        curve: sig.curve.map(str::to_string),
                        heuristics: vec![format!("constant:{}[{}]", sig.id, layout)],
                        ..DetectionMetadata::default()
                    },
                });
            }
            for (offset, bits) in Self::scan_der_headers(data) {
                let mut metadata = DetectionMetadata {
                    key_bits: bits,
                    heuristics: vec!["constant:rsa_oid".to_string()],
                    ..DetectionMetadata::default()
                };
                if bits.is_none() {
                    metadata.notes.push("modulus length not found".to_string());
                }
                hits.push(SignatureHit {
                    id: "rsa_oid",
                    kind: PrimitiveKind::Rsa,
                    score: RSA_SPECIFICITY,
                    address: base + offset as u64,
                    length: RSA_ENCRYPTION_OID.len(),
                    section: Some(section.name.clone()),
                    function: None,
                    site: None,
                    metadata,
                });
            }
            for offset in Self::scan_permutations(data) {
                hits.push(SignatureHit {
                    id: "permutation_table",
                    kind: PrimitiveKind::Proprietary,
                    score: PROPRIETARY_SPECIFICITY,
                    address: base + offset as u64,
                    length: 256,
                    section: Some(section.name.clone()),
                    function: None,
                    site: None,
                    metadata: DetectionMetadata {
                        notes: vec!["non-standard S-Box pattern".to_string()],
                        heuristics: vec!["constant:permutation_table".to_string()],
                        ..DetectionMetadata::default()
                    },
                });
            }
        }

        Self::link_to_functions(&mut hits, functions);
        for function in functions.iter() {
            hits.extend(Self::scan_scatter(image, function));
        }

        hits.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.id.cmp(b.id)));
        hits
    }

    fn table_length(signature: &TableSignature) -> usize {
        match signature.data {
            TableData::Bytes(bytes) | TableData::BigNumber(bytes) => bytes.len(),
            TableData::Words32(words) => words.len() * 4,
            TableData::Words64(words) => words.len() * 8,
        }
    }

    /// Table matches in one byte region: (offset, signature index, score, layout).
    fn scan_tables(index: &PatternIndex, data: &[u8]) -> Vec<(usize, usize, f64, &'static str)> {
        let mut best: BTreeMap<(usize, usize), (f64, &'static str)> = BTreeMap::new();
        let mut tried: HashSet<(u32, usize)> = HashSet::new();

        for pos in 0..data.len().saturating_sub(ANCHOR - 1) {
            let mut key = [0u8; ANCHOR];
            key.copy_from_slice(&data[pos..pos + ANCHOR]);
            let Some(candidates) = index.anchors.get(&key) else {
                continue;
            };
            for &(p, block) in candidates.iter() {
                let Some(start) = pos.checked_sub(block as usize) else {
                    continue;
                };
                if !tried.insert((p, start)) {
                    continue;
                }
                let pattern: &Pattern = &index.patterns[p as usize];
                let Some(window) = data.get(start..start + pattern.bytes.len()) else {
                    continue;
                };
                let sim: f64 = similarity(window, &pattern.bytes);
                let matched: bool = if pattern.exact {
                    sim == 1.0
                } else {
                    sim >= NEAR_MATCH_THRESHOLD
                };
                if !matched {
                    continue;
                }
                let score: f64 = sim * TABLE_SIGNATURES[pattern.signature].specificity;
                let entry = best.entry((start, pattern.signature)).or_insert((0.0, pattern.layout));
                if score > entry.0 {
                    *entry = (score, pattern.layout);
                }
            }
        }

        best.into_iter()
            .map(|((offset, signature), (score, layout))| (offset, signature, score, layout))
            .collect()
    }

    /// `rsaEncryption` OIDs with the bit length of the modulus that follows, if any.
    fn scan_der_headers(data: &[u8]) -> Vec<(usize, Option<u32>)> {
        data.windows(RSA_ENCRYPTION_OID.len())
            .enumerate()
            .filter(|(_, window)| *window == RSA_ENCRYPTION_OID)
            .map(|(offset, _)| (offset, Self::modulus_bits(data, offset + RSA_ENCRYPTION_OID.len())))
            .collect()
    }

    /// First DER `INTEGER` of at least 64 bytes after `from`, as a bit length.
    ///
    /// A leading zero byte (sign padding) is not counted.
    pub fn modulus_bits(data: &[u8], from: usize) -> Option<u32> {
        let end: usize = (from + DER_MODULUS_WINDOW).min(data.len());
        for i in from..end {
            if data[i] != 0x02 {
                continue;
            }
            let (length, start): (usize, usize) = match data.get(i + 1)? {
                0x82 => {
                    let hi = *data.get(i + 2)? as usize;
                    let lo = *data.get(i + 3)? as usize;
                    ((hi << 8) | lo, i + 4)
                }
                0x81 => (*data.get(i + 2)? as usize, i + 3),
                _ => continue,
            };
            if length < 64 {
                continue;
            }
            let padded: bool = data.get(start) == Some(&0);
            let bytes: usize = if padded { length - 1 } else { length };
            return Some((bytes * 8) as u32);
        }
        None
    }

    /// Offsets of 256-byte windows holding every byte value exactly once.
    ///
    /// Known S-boxes and arithmetic progressions (identity and similar lookup tables)
    /// are skipped.
    fn scan_permutations(data: &[u8]) -> Vec<usize> {
        let mut found: Vec<usize> = Vec::new();
        if data.len() < 256 {
            return found;
        }
        let mut counts = [0u16; 256];
        let mut distinct: usize = 0;
        for &byte in &data[..256] {
            if counts[byte as usize] == 0 {
                distinct += 1;
            }
            counts[byte as usize] += 1;
        }

        let mut start: usize = 0;
        let mut next_allowed: usize = 0;
        loop {
            if distinct == 256 && start >= next_allowed {
                let window: &[u8] = &data[start..start + 256];
                if window != AES_SBOX.as_slice()
                    && window != AES_INV_SBOX.as_slice()
                    && !Self::is_progression(window)
                {
                    found.push(start);
                    next_allowed = start + 256;
                }
            }
            if start + 256 >= data.len() {
                break;
            }
            let out: usize = data[start] as usize;
            counts[out] -= 1;
            if counts[out] == 0 {
                distinct -= 1;
            }
            let incoming: usize = data[start + 256] as usize;
            if counts[incoming] == 0 {
                distinct += 1;
            }
            counts[incoming] += 1;
            start += 1;
        }
        found
    }

    fn is_progression(window: &[u8]) -> bool {
        let step: u8 = window[1].wrapping_sub(window[0]);
        window.windows(2).all(|w| w[1].wrapping_sub(w[0]) == step)
    }

    /// Attach the lowest referencing function and site to each table hit.
    fn link_to_functions(hits: &mut [SignatureHit], functions: &[Function]) {
        let mut refs: Vec<(u64, u64, u64)> = functions
            .iter()
            .flat_map(|f| f.data_refs.iter().map(move |r| (r.target, r.site, f.entry)))
            .collect();
        refs.sort_unstable();

        for hit in hits.iter_mut() {
            let end: u64 = hit.address + hit.length as u64;
            let lo: usize = refs.partition_point(|(target, _, _)| *target < hit.address);
            let hi: usize = refs.partition_point(|(target, _, _)| *target < end);
            if let Some(&(_, site, entry)) = refs[lo..hi].iter().min_by_key(|(_, site, entry)| (*site, *entry)) {
                hit.function = Some(entry);
                hit.site = Some(site);
            }
        }
    }

    /// Scatter signatures matched against one function's constants.
    fn scan_scatter(image: &FirmwareImage, function: &Function) -> Vec<SignatureHit> {
        let constants: Vec<(u64, u64)> = Self::function_constants(image, function);
        if constants.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<SignatureHit> = Vec::new();
        for signature in SCATTER_SIGNATURES.iter() {
            let sites: Vec<u64> = signature
                .words
                .iter()
                .filter_map(|word| {
                    constants
                        .iter()
                        .filter(|(value, _)| value == word)
                        .map(|(_, site)| *site)
                        .min()
                })
                .collect();
            if sites.len() < signature.min_hits {
                continue;
            }
            let Some(first) = sites.iter().min().copied() else {
                continue;
            };
            let score: f64 = signature.specificity * sites.len() as f64 / signature.words.len() as f64;
            log::debug!(
                "Scatter {} in function 0x{:X}: {}/{} constants",
                signature.id,
                function.entry,
                sites.len(),
                signature.words.len()
            );
            hits.push(SignatureHit {
                id: signature.id,
                kind: signature.kind,
                score,
                address: first,
                length: 0,
                section: Some(function.section.clone()),
                function: Some(function.entry),
                site: Some(first),
                metadata: DetectionMetadata {
                    variant: signature.variant.map(str::to_string),
                    heuristics: vec![format!("scatter:{}", signature.id)],
                    ..DetectionMetadata::default()
                },
            });
        }
        hits
    }

    /// 32-bit constants a function materializes: (value, instruction address).
    ///
    /// Covers plain immediates, two-instruction pairs (`movw`/`movt`, `lui` + `ori`/
    /// `addiu`/`addi`) and words loaded from literal pools.
    pub fn function_constants(image: &FirmwareImage, function: &Function) -> Vec<(u64, u64)> {
        let mut constants: Vec<(u64, u64)> = Vec::new();
        let mut partial: HashMap<u8, u64> = HashMap::new();

        for inst in function.instructions.iter() {
            if let Some(value) = inst.immediate() {
                constants.push((value as u64 & 0xFFFF_FFFF, inst.address));
            }
            match (inst.mnemonic, inst.operands.as_slice()) {
                ("movw", [Operand::Register(rd), Operand::Immediate(low)]) => {
                    partial.insert(*rd, *low as u64 & 0xFFFF);
                }
                ("movt", [Operand::Register(rd), Operand::Immediate(high)]) => {
                    if let Some(low) = partial.remove(rd) {
                        constants.push(((*high as u64 & 0xFFFF_0000) | low, inst.address));
                    }
                }
                ("lui" | "c.lui", [Operand::Register(rd), Operand::Immediate(high)]) => {
                    partial.insert(*rd, *high as u64 & 0xFFFF_FFFF);
                }
                ("ori", [Operand::Register(_), Operand::Register(rs), Operand::Immediate(low)]) => {
                    if let Some(high) = partial.get(rs).copied() {
                        constants.push((high | (*low as u64 & 0xFFFF), inst.address));
                    }
                }
                ("addiu" | "addi", [Operand::Register(_), Operand::Register(rs), Operand::Immediate(low)]) => {
                    if let Some(high) = partial.get(rs).copied() {
                        constants.push((high.wrapping_add(*low as u64) & 0xFFFF_FFFF, inst.address));
                    }
                }
                _ => {}
            }
        }

        for reference in function.data_refs.iter() {
            if reference.kind != ReferenceKind::Direct {
                continue;
            }
            let is_load: bool = function
                .instructions
                .binary_search_by_key(&reference.site, |i| i.address)
                .ok()
                .map_or(false, |idx| function.instructions[idx].kind == InstructionKind::Load);
            if !is_load {
                continue;
            }
            if let Some(word) = image
                .read_at(reference.target, 4)
                .and_then(|bytes| image.endianness.read_u32(bytes))
            {
                constants.push((u64::from(word), reference.site));
            }
        }
        constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::analysis::control_flow::ControlFlowGraph;
    use crate::engine::decoder::arm;
    use crate::engine::image::{Architecture, ContainerFormat, Endianness, Permissions, Section};
    use std::sync::Arc;

    fn raw(data: Vec<u8>) -> FirmwareImage {
        let len = data.len();
        FirmwareImage::new(
            Arc::from(data),
            ContainerFormat::Raw,
            Architecture::Arm,
            Endianness::Little,
            1.0,
            None,
            vec![Section {
                name: ".raw".to_string(),
                virtual_address: 0,
                range: 0..len,
                permissions: Permissions::RX,
            }],
            Vec::new(),
        )
    }

    fn find<'a>(hits: &'a [SignatureHit], id: &str) -> Option<&'a SignatureHit> {
        hits.iter().find(|h| h.id == id)
    }

    #[test]
    fn test_inverse_sbox() {
        assert_eq!(AES_INV_SBOX[0x63], 0x00);
        assert_eq!(AES_INV_SBOX[0x7C], 0x01);
        assert_eq!(AES_INV_SBOX[0x16], 0xFF);
    }

    #[test]
    fn test_exact_rcon() {
        let mut data = vec![0u8; 0x2000];
        data[0x14A0..0x14AA].copy_from_slice(&AES_RCON);
        let hits = ConstantScanner::scan(&raw(data), &[]);
        let rcon = find(&hits, "aes_rcon").unwrap();
        assert_eq!(rcon.address, 0x14A0);
        assert_eq!(rcon.kind, PrimitiveKind::Aes);
        assert!((rcon.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_short_table_needs_exact_match() {
        let mut data = vec![0u8; 0x100];
        let mut rcon = AES_RCON;
        rcon[9] = 0x37;
        data[0x40..0x4A].copy_from_slice(&rcon);
        let hits = ConstantScanner::scan(&raw(data), &[]);
        assert!(find(&hits, "aes_rcon").is_none());
    }

    #[test]
    fn test_near_match_sbox() {
        let mut data = vec![0u8; 0x400];
        data[0x100..0x200].copy_from_slice(&AES_SBOX);
        // corrupt 20 of 256 bytes: similarity 0.92
        for i in 0..20 {
            data[0x100 + i * 12] ^= 0x5A;
        }
        let hits = ConstantScanner::scan(&raw(data), &[]);
        let sbox = find(&hits, "aes_sbox").unwrap();
        assert_eq!(sbox.address, 0x100);
        assert!((sbox.score - (236.0 / 256.0)).abs() < 1e-9);
    }

    #[test]
    fn test_word_tables_both_byte_orders() {
        let mut data = vec![0u8; 0x200];
        let be: Vec<u8> = SHA256_K.iter().flat_map(|w| w.to_be_bytes()).collect();
        data[0x80..0x80 + be.len()].copy_from_slice(&be);
        let hits = ConstantScanner::scan(&raw(data), &[]);
        let k = find(&hits, "sha256_k").unwrap();
        assert_eq!(k.address, 0x80);
        assert!(k.metadata.heuristics[0].ends_with("[be]"));
    }

    #[test]
    fn test_erased_flash_is_not_a_curve() {
        let hits = ConstantScanner::scan(&raw(vec![0xFFu8; 0x1000]), &[]);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_rsa_modulus_length() {
        let mut data = vec![0u8; 0x200];
        data[0x10..0x1B].copy_from_slice(&RSA_ENCRYPTION_OID);
        // NULL, BIT STRING, SEQUENCE, INTEGER (129 bytes, sign padded)
        data[0x1B..0x29].copy_from_slice(&[
            0x05, 0x00, 0x03, 0x81, 0x8D, 0x00, 0x30, 0x81, 0x89, 0x02, 0x81, 0x81, 0x00, 0xC3,
        ]);
        let hits = ConstantScanner::scan(&raw(data), &[]);
        let rsa = find(&hits, "rsa_oid").unwrap();
        assert_eq!(rsa.address, 0x10);
        assert_eq!(rsa.metadata.key_bits, Some(1024));
    }

    #[test]
    fn test_proprietary_permutation() {
        let mut data = vec![0u8; 0x300];
        let table: Vec<u8> = (0..=255u8).map(|x| x ^ 0x5A).collect();
        let identity: Vec<u8> = (0..=255u8).collect();
        data[0x20..0x120].copy_from_slice(&table);
        data[0x180..0x280].copy_from_slice(&identity);
        let hits = ConstantScanner::scan(&raw(data), &[]);
        let proprietary: Vec<&SignatureHit> = hits.iter().filter(|h| h.kind == PrimitiveKind::Proprietary).collect();
        assert_eq!(proprietary.len(), 1);
        assert_eq!(proprietary[0].address, 0x20);
        assert_eq!(proprietary[0].metadata.notes, vec!["non-standard S-Box pattern".to_string()]);
    }

    #[test]
    fn test_scatter_lcg_in_one_function() {
        let image = raw(vec![0u8; 0x100]);
        // movw r1,#0x4E6D ; movt r1,#0x41C6 ; movw r2,#0x3039
        let instructions = vec![
            arm::decode_word(0xE3041E6D, 0x10).unwrap(),
            arm::decode_word(0xE34411C6, 0x14).unwrap(),
            arm::decode_word(0xE3032039, 0x18).unwrap(),
        ];
        let function = Function {
            entry: 0x10,
            name: None,
            section: ".raw".to_string(),
            instructions,
            cfg: ControlFlowGraph::default(),
            loops: Vec::new(),
            call_sites: Vec::new(),
            data_refs: Vec::new(),
        };
        let hits = ConstantScanner::scan(&image, &[function]);
        let lcg = find(&hits, "lcg_ansi").unwrap();
        assert_eq!(lcg.kind, PrimitiveKind::Prng);
        assert_eq!(lcg.function, Some(0x10));
        assert_eq!(lcg.address, 0x14);
        assert_eq!(lcg.metadata.variant.as_deref(), Some("LCG"));
    }
}
