//! Analysis Report
//!
//! The durable output of one analysis run. A report is built once by the pipeline,
//! stored under the SHA-256 of the input bytes, and never mutated.

use crate::engine::compliance::ComplianceSummary;
use crate::engine::error::Diagnostic;
use crate::engine::image::{Architecture, ContainerFormat, Endianness, FirmwareImage, Permissions};
use crate::engine::matcher::Detection;
use crate::engine::protocol::ProtocolGraph;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Version stamped into every report.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lowercase hex SHA-256 of an input buffer.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Shannon entropy in bits per byte, in [0,8].
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts: [u64; 256] = [0; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let len: f64 = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p: f64 = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub name: String,
    pub virtual_address: u64,
    pub size: u64,
    pub permissions: Permissions,
    /// Shannon entropy of the section bytes, bits per byte
    pub entropy: f64,
}

/// Strongest detection of one primitive family, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub present: bool,
    pub confidence: f64,
    pub algorithm: String,
    pub offsets: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub content_hash: String,
    pub file_name: Option<String>,
    pub size: u64,
    pub format: ContainerFormat,
    pub architecture: Architecture,
    pub endianness: Endianness,
    pub arch_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<u64>,
    pub sections: Vec<SectionSummary>,
    pub function_count: usize,
    /// Ascending primary offset, ties by kind name
    pub detections: Vec<Detection>,
    pub protocols: Vec<ProtocolGraph>,
    pub compliance: ComplianceSummary,
    pub diagnostics: Vec<Diagnostic>,
    pub engine_version: String,
}

impl AnalysisReport {
    pub fn section_summaries(image: &FirmwareImage) -> Vec<SectionSummary> {
        image
            .sections
            .iter()
            .map(|section| SectionSummary {
                name: section.name.clone(),
                virtual_address: section.virtual_address,
                size: section.size(),
                permissions: section.permissions,
                entropy: shannon_entropy(image.section_data(section)),
            })
            .collect()
    }

    /// Best detection per primitive family, keyed by family name.
    pub fn summary(&self) -> BTreeMap<String, GroupSummary> {
        let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();
        for detection in self.detections.iter() {
            let replace: bool = groups
                .get(detection.group())
                .map_or(true, |current| detection.confidence > current.confidence);
            if !replace {
                continue;
            }
            groups.insert(
                detection.group().to_string(),
                GroupSummary {
                    present: true,
                    confidence: detection.confidence,
                    algorithm: detection.algorithm_name(),
                    offsets: detection.offsets.clone(),
                    variant: detection.metadata.variant.clone(),
                    key_bits: detection.metadata.key_bits,
                    curve: detection.metadata.curve.clone(),
                    notes: detection.metadata.notes.clone(),
                },
            );
        }
        groups
    }

    /// Display name: the uploaded file name, or the content hash.
    pub fn display_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or(&self.content_hash)
    }
}
