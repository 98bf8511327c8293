//! Risk & Compliance Scorer
//!
//! Maps detections against a versioned compliance ruleset, aggregates a composite risk
//! score and emits ranked remediation recommendations.
//!
//! # Scoring Algorithm
//! 1. Every detection contributes `weight(algorithm) × confidence`; algorithms unknown to
//!    the ruleset use `unknown_algorithm_weight`
//! 2. `base = 100 × Σ(weight × confidence) / max(Σ confidence, 1)`
//! 3. The ruleset's deprecated penalty is added once if any deprecated algorithm is in use
//! 4. `10 × mean anomaly` of the reconstructed protocols is added
//! 5. The sum is clamped to [0,100] and rounded; the band is Low below 40, High from 80
//!
//! # Ruleset Lifecycle
//! The default ruleset is embedded in the binary. A [`RulesetStore`] holds the active
//! ruleset behind an `Arc`; each job takes a snapshot, and a reload swaps the whole
//! ruleset so a running job never sees a mix of versions.

use crate::engine::matcher::Detection;
use crate::engine::protocol::ProtocolGraph;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Ruleset compiled into the binary.
pub const EMBEDDED_RULESET: &str = include_str!("../../rules/compliance.json");

/// Trigger matching every weak algorithm.
const WILDCARD_TRIGGER: &str = "*";
/// Points added per unit of mean protocol anomaly.
const ANOMALY_POINTS: f64 = 10.0;

/// Risk band of an algorithm or a whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum RiskLevel {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl RiskLevel {
    /// Band of a composite score.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=39 => RiskLevel::Low,
            40..=79 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority or impact of a remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

/// Ruleset entry for one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmRule {
    pub name: String,
    pub nist_approved: bool,
    pub fips140_3: bool,
    pub deprecated: bool,
    pub risk: RiskLevel,
    /// Risk contribution per unit of confidence, in [0,1]
    pub weight: f64,
}

impl AlgorithmRule {
    #[inline]
    pub fn is_weak(&self) -> bool {
        self.deprecated || self.risk != RiskLevel::Low
    }
}

/// Catalog entry of the remediation library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub id: String,
    pub title: String,
    pub priority: Severity,
    pub impact: Severity,
    pub description: String,
    /// Algorithm names that trigger this entry; `*` matches every weak algorithm
    pub triggers: Vec<String>,
}

fn default_unknown_weight() -> f64 {
    0.5
}

/// Versioned compliance ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub version: String,
    /// Points added once when any deprecated algorithm is in use
    pub deprecated_penalty: f64,
    #[serde(default = "default_unknown_weight")]
    pub unknown_algorithm_weight: f64,
    pub algorithms: Vec<AlgorithmRule>,
    pub remediations: Vec<Remediation>,
}

/// Ruleset loading and validation errors.
#[derive(Error, Debug)]
pub enum RulesetError {
    #[error("failed to read ruleset {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ruleset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid ruleset: {0}")]
    Invalid(String),
}

impl RulesetError {
    pub fn code(&self) -> &'static str {
        match self {
            RulesetError::Io { .. } => "RulesetUnreadable",
            RulesetError::Parse(_) => "RulesetMalformed",
            RulesetError::Invalid(_) => "RulesetInvalid",
        }
    }
}

impl Ruleset {
    /// Parse and validate a ruleset document.
    ///
    /// # Errors
    /// `Parse` for malformed JSON, `Invalid` for an empty version, a weight outside
    /// [0,1], a negative penalty or a duplicate algorithm name or remediation id
    pub fn from_json(json: &str) -> Result<Self, RulesetError> {
        let ruleset: Ruleset = serde_json::from_str(json)?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    /// The ruleset compiled into the binary.
    pub fn embedded() -> Result<Self, RulesetError> {
        Self::from_json(EMBEDDED_RULESET)
    }

    pub fn load(path: &Path) -> Result<Self, RulesetError> {
        let json: String = std::fs::read_to_string(path).map_err(|source| RulesetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), RulesetError> {
        if self.version.trim().is_empty() {
            return Err(RulesetError::Invalid("version is empty".to_string()));
        }
        if !(0.0..=100.0).contains(&self.deprecated_penalty) {
            return Err(RulesetError::Invalid(format!(
                "deprecated_penalty {} outside [0,100]",
                self.deprecated_penalty
            )));
        }
        if !(0.0..=1.0).contains(&self.unknown_algorithm_weight) {
            return Err(RulesetError::Invalid(format!(
                "unknown_algorithm_weight {} outside [0,1]",
                self.unknown_algorithm_weight
            )));
        }
        let mut names: HashSet<&str> = HashSet::new();
        for rule in self.algorithms.iter() {
            if !(0.0..=1.0).contains(&rule.weight) {
                return Err(RulesetError::Invalid(format!(
                    "weight {} of {} outside [0,1]",
                    rule.weight, rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(RulesetError::Invalid(format!("duplicate algorithm {}", rule.name)));
            }
        }
        let mut ids: HashSet<&str> = HashSet::new();
        for remediation in self.remediations.iter() {
            if !ids.insert(remediation.id.as_str()) {
                return Err(RulesetError::Invalid(format!("duplicate remediation {}", remediation.id)));
            }
        }
        Ok(())
    }

    pub fn rule(&self, algorithm: &str) -> Option<&AlgorithmRule> {
        self.algorithms.iter().find(|r| r.name == algorithm)
    }
}

/// Shared holder of the active ruleset.
#[derive(Debug)]
pub struct RulesetStore {
    current: RwLock<Arc<Ruleset>>,
}

impl RulesetStore {
    pub fn new(ruleset: Ruleset) -> Self {
        Self {
            current: RwLock::new(Arc::new(ruleset)),
        }
    }

    /// Ruleset for one job. Later reloads do not affect the snapshot.
    pub fn snapshot(&self) -> Arc<Ruleset> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a new ruleset, returning the previous one.
    pub fn replace(&self, ruleset: Ruleset) -> Arc<Ruleset> {
        let next: Arc<Ruleset> = Arc::new(ruleset);
        log::info!("Compliance ruleset now at version {}", next.version);
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Load a ruleset file and swap it in. The active ruleset is kept on error.
    pub fn reload(&self, path: &Path) -> Result<Arc<Ruleset>, RulesetError> {
        let ruleset: Ruleset = Ruleset::load(path)?;
        self.replace(ruleset);
        Ok(self.snapshot())
    }
}

/// Compliance status of one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub algorithm: String,
    pub nist_approved: bool,
    pub fips140_3: bool,
    pub deprecated: bool,
    pub in_use: bool,
    pub risk_level: RiskLevel,
    pub ruleset_version: String,
}

/// A triggered remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub priority: Severity,
    pub impact: Severity,
    pub description: String,
    /// Weak algorithms that triggered the entry, sorted by name
    pub triggered_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub ruleset_version: String,
    pub verdicts: Vec<ComplianceVerdict>,
    /// Composite risk score in [0,100]
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub recommendations: Vec<Recommendation>,
}

impl ComplianceSummary {
    /// In-use algorithms that are deprecated or above Low risk.
    pub fn weak_algorithms(&self) -> impl Iterator<Item = &str> {
        self.verdicts
            .iter()
            .filter(|v| v.in_use && (v.deprecated || v.risk_level != RiskLevel::Low))
            .map(|v| v.algorithm.as_str())
    }

    pub fn has_weak_algorithm(&self) -> bool {
        self.weak_algorithms().next().is_some()
    }
}

/// Detection-only part of a compliance summary.
///
/// Computed alongside protocol reconstruction; [`Assessment::finish`] folds in the
/// protocol anomaly once the graphs are known.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub ruleset_version: String,
    pub verdicts: Vec<ComplianceVerdict>,
    /// Weighted score plus deprecated penalty, unclamped
    pub base_score: f64,
    pub recommendations: Vec<Recommendation>,
}

impl Assessment {
    /// Add the protocol anomaly term, clamp, round and band.
    pub fn finish(self, graphs: &[ProtocolGraph]) -> ComplianceSummary {
        let risk_score: u32 = ComplianceScorer::with_anomaly(self.base_score, graphs);
        log::info!(
            "Risk score {} ({}), {} recommendations",
            risk_score,
            RiskLevel::from_score(risk_score),
            self.recommendations.len()
        );
        ComplianceSummary {
            ruleset_version: self.ruleset_version,
            verdicts: self.verdicts,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            recommendations: self.recommendations,
        }
    }
}

pub struct ComplianceScorer;

impl ComplianceScorer {
    /// Score detections and protocol graphs against a ruleset.
    ///
    /// # Arguments
    /// * `ruleset` - Ruleset snapshot for this job
    /// * `detections` - Matcher output
    /// * `graphs` - Reconstructed protocol graphs (may be empty)
    ///
    /// # Returns
    /// `ComplianceSummary` - verdicts in ruleset order followed by unknown algorithms by
    /// name, the composite score and band, and recommendations ranked by priority,
    /// impact and id
    pub fn score(ruleset: &Ruleset, detections: &[Detection], graphs: &[ProtocolGraph]) -> ComplianceSummary {
        Self::assess(ruleset, detections).finish(graphs)
    }

    /// Verdicts, weighted score and recommendations from detections alone.
    pub fn assess(ruleset: &Ruleset, detections: &[Detection]) -> Assessment {
        let in_use: BTreeSet<String> = detections.iter().map(|d| d.algorithm_name()).collect();

        let mut verdicts: Vec<ComplianceVerdict> = ruleset
            .algorithms
            .iter()
            .map(|rule| ComplianceVerdict {
                algorithm: rule.name.clone(),
                nist_approved: rule.nist_approved,
                fips140_3: rule.fips140_3,
                deprecated: rule.deprecated,
                in_use: in_use.contains(&rule.name),
                risk_level: rule.risk,
                ruleset_version: ruleset.version.clone(),
            })
            .collect();
        for algorithm in in_use.iter().filter(|a| ruleset.rule(a).is_none()) {
            log::debug!("Algorithm {} is not in ruleset {}", algorithm, ruleset.version);
            verdicts.push(ComplianceVerdict {
                algorithm: algorithm.clone(),
                nist_approved: false,
                fips140_3: false,
                deprecated: false,
                in_use: true,
                risk_level: RiskLevel::Medium,
                ruleset_version: ruleset.version.clone(),
            });
        }

        let weak: BTreeSet<&str> = verdicts
            .iter()
            .filter(|v| v.in_use && (v.deprecated || v.risk_level != RiskLevel::Low))
            .map(|v| v.algorithm.as_str())
            .collect();
        let recommendations: Vec<Recommendation> = Self::recommend(ruleset, &weak);
        log::info!(
            "Compliance against ruleset {}: {} algorithms in use, {} weak",
            ruleset.version,
            in_use.len(),
            weak.len()
        );

        Assessment {
            ruleset_version: ruleset.version.clone(),
            base_score: Self::base_score(ruleset, detections),
            verdicts,
            recommendations,
        }
    }

    /// Composite risk score in [0,100].
    pub fn risk_score(ruleset: &Ruleset, detections: &[Detection], graphs: &[ProtocolGraph]) -> u32 {
        Self::with_anomaly(Self::base_score(ruleset, detections), graphs)
    }

    /// `100 × Σ(weight × confidence) / max(Σ confidence, 1)` plus the deprecated penalty.
    fn base_score(ruleset: &Ruleset, detections: &[Detection]) -> f64 {
        let mut weighted: f64 = 0.0;
        let mut total_confidence: f64 = 0.0;
        let mut deprecated_in_use: bool = false;
        for detection in detections.iter() {
            let rule: Option<&AlgorithmRule> = ruleset.rule(&detection.algorithm_name());
            let weight: f64 = rule.map(|r| r.weight).unwrap_or(ruleset.unknown_algorithm_weight);
            deprecated_in_use |= rule.is_some_and(|r| r.deprecated);
            weighted += weight * detection.confidence;
            total_confidence += detection.confidence;
        }

        let score: f64 = 100.0 * weighted / total_confidence.max(1.0);
        if deprecated_in_use {
            score + ruleset.deprecated_penalty
        } else {
            score
        }
    }

    fn with_anomaly(base_score: f64, graphs: &[ProtocolGraph]) -> u32 {
        let mut score: f64 = base_score;
        if !graphs.is_empty() {
            let mean_anomaly: f64 = graphs.iter().map(|g| g.anomaly_score).sum::<f64>() / graphs.len() as f64;
            score += ANOMALY_POINTS * mean_anomaly;
        }
        score.clamp(0.0, 100.0).round() as u32
    }

    fn recommend(ruleset: &Ruleset, weak: &BTreeSet<&str>) -> Vec<Recommendation> {
        if weak.is_empty() {
            return Vec::new();
        }
        let mut ranked: BTreeMap<(std::cmp::Reverse<Severity>, std::cmp::Reverse<Severity>, String), Recommendation> =
            BTreeMap::new();
        for remediation in ruleset.remediations.iter() {
            let triggered_by: Vec<String> = if remediation.triggers.iter().any(|t| t == WILDCARD_TRIGGER) {
                weak.iter().map(|a| a.to_string()).collect()
            } else {
                weak.iter()
                    .filter(|a| remediation.triggers.iter().any(|t| t.as_str() == **a))
                    .map(|a| a.to_string())
                    .collect()
            };
            if triggered_by.is_empty() {
                continue;
            }
            let key = (
                std::cmp::Reverse(remediation.priority),
                std::cmp::Reverse(remediation.impact),
                remediation.id.clone(),
            );
            ranked.insert(
                key,
                Recommendation {
                    id: remediation.id.clone(),
                    title: remediation.title.clone(),
                    priority: remediation.priority,
                    impact: remediation.impact,
                    description: remediation.description.clone(),
                    triggered_by,
                },
            );
        }
        ranked.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::matcher::{DetectionMetadata, PrimitiveKind};

    fn detection(kind: PrimitiveKind, confidence: f64, offset: u64) -> Detection {
        Detection {
            kind,
            confidence,
            offsets: vec![offset],
            section: None,
            function: None,
            site: None,
            signature_score: confidence,
            structural_score: 0.0,
            metadata: DetectionMetadata::default(),
        }
    }

    fn graph(anomaly_score: f64) -> ProtocolGraph {
        ProtocolGraph {
            instance: 0,
            nodes: Vec::new(),
            edges: Vec::new(),
            anomaly_score,
            template: None,
        }
    }

    #[test]
    fn test_embedded_ruleset_is_valid() {
        let ruleset = Ruleset::embedded().unwrap();
        assert_eq!(ruleset.deprecated_penalty, 20.0);
        assert!(ruleset.rule("MD5").unwrap().deprecated);
        assert!(!ruleset.rule("AES-128").unwrap().is_weak());
        assert!(ruleset.rule("PRNG-LCG").unwrap().is_weak());
    }

    #[test]
    fn test_md5_penalty_and_ranking() {
        let ruleset = Ruleset::embedded().unwrap();
        let summary = ComplianceScorer::score(&ruleset, &[detection(PrimitiveKind::Md5, 0.6, 0x800)], &[]);

        // 100 * 0.8 * 0.6 / 1 + 20
        assert_eq!(summary.risk_score, 68);
        assert_eq!(summary.risk_level, RiskLevel::Medium);
        let md5 = summary.verdicts.iter().find(|v| v.algorithm == "MD5").unwrap();
        assert!(md5.in_use && md5.deprecated && !md5.nist_approved);

        let titles: Vec<&str> = summary.recommendations.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Replace MD5 with SHA-256", "Implement proper key management"]
        );
        assert_eq!(summary.recommendations[0].triggered_by, vec!["MD5".to_string()]);
    }

    #[test]
    fn test_equal_priority_ranked_by_id() {
        let ruleset = Ruleset::embedded().unwrap();
        let detections = [
            detection(PrimitiveKind::Md5, 0.6, 0x800),
            detection(PrimitiveKind::Sha1, 0.6, 0x900),
        ];
        let summary = ComplianceScorer::score(&ruleset, &detections, &[]);
        assert_eq!(summary.risk_score, 100);
        assert_eq!(summary.risk_level, RiskLevel::High);
        let ids: Vec<&str> = summary.recommendations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R001", "R006", "R005"]);
    }

    #[test]
    fn test_approved_only_has_no_recommendations() {
        let ruleset = Ruleset::embedded().unwrap();
        let summary = ComplianceScorer::score(&ruleset, &[detection(PrimitiveKind::Aes128, 0.94, 0x14A0)], &[]);
        // 100 * 0.05 * 0.94
        assert_eq!(summary.risk_score, 5);
        assert_eq!(summary.risk_level, RiskLevel::Low);
        assert!(summary.recommendations.is_empty());
        assert!(!summary.has_weak_algorithm());
        assert_eq!(summary.verdicts.len(), ruleset.algorithms.len());
    }

    #[test]
    fn test_unknown_algorithm_verdict() {
        let ruleset = Ruleset::embedded().unwrap();
        let summary = ComplianceScorer::score(&ruleset, &[detection(PrimitiveKind::Rsa, 0.5, 0x40)], &[]);
        let last = summary.verdicts.last().unwrap();
        assert_eq!(last.algorithm, "RSA");
        assert!(last.in_use && !last.nist_approved);
        assert_eq!(last.risk_level, RiskLevel::Medium);
        // 100 * 0.5 * 0.5
        assert_eq!(summary.risk_score, 25);
        assert_eq!(summary.recommendations.len(), 1);
        assert_eq!(summary.recommendations[0].id, "R005");
    }

    #[test]
    fn test_anomaly_adds_points() {
        let ruleset = Ruleset::embedded().unwrap();
        let detections = [detection(PrimitiveKind::Aes128, 1.0, 0x100)];
        let score = ComplianceScorer::risk_score(&ruleset, &detections, &[graph(1.0), graph(0.0)]);
        // 5 + 10 * 0.5
        assert_eq!(score, 10);
    }

    #[test]
    fn test_bands() {
        assert_eq!(RiskLevel::from_score(39), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::High);
    }

    #[test]
    fn test_invalid_ruleset_rejected() {
        let json = r#"{"version":"x","deprecated_penalty":20,"algorithms":[
            {"name":"MD5","nist_approved":false,"fips140_3":false,"deprecated":true,"risk":"High","weight":1.5}
        ],"remediations":[]}"#;
        let err = Ruleset::from_json(json).unwrap_err();
        assert_eq!(err.code(), "RulesetInvalid");
        assert_eq!(Ruleset::from_json("{").unwrap_err().code(), "RulesetMalformed");
    }

    #[test]
    fn test_store_snapshot_survives_reload() {
        let store = RulesetStore::new(Ruleset::embedded().unwrap());
        let before = store.snapshot();
        let mut next = Ruleset::embedded().unwrap();
        next.version = "2099.1".to_string();
        store.replace(next);
        assert_eq!(before.version, "2025.1");
        assert_eq!(store.snapshot().version, "2099.1");
    }
}
