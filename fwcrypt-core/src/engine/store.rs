//! Report Store
//!
//! Completed reports keyed by content hash, with a secondary index by file name.
//!
//! Reports are write-once: inserting a hash that is already present keeps the stored
//! report. With a report directory configured, each report is also written as
//! `<hash>.json.zst` and all such files are loaded back when the store is opened.

use crate::engine::report::AnalysisReport;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const REPORT_EXTENSION: &str = ".json.zst";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Default)]
struct Index {
    by_hash: HashMap<String, Arc<AnalysisReport>>,
    /// File name → hash of the most recently stored report with that name
    by_name: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ReportStore {
    index: RwLock<Index>,
    dir: Option<PathBuf>,
}

impl ReportStore {
    /// Store without persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a persistent store, loading every report already in `dir`.
    ///
    /// Unreadable report files are skipped with a warning.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let store = Self {
            index: RwLock::new(Index::default()),
            dir: Some(dir.to_path_buf()),
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list report directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.to_string_lossy().ends_with(REPORT_EXTENSION))
            .collect();
        paths.sort();
        for path in paths {
            match read_report(&path) {
                Ok(report) => store.index_report(Arc::new(report)),
                Err(err) => log::warn!("Skipping report {}: {:#}", path.display(), err),
            }
        }
        log::info!("Opened report store at {} ({} reports)", dir.display(), store.len());
        Ok(store)
    }

    /// Open the configured directory, or an in-memory store.
    pub fn from_dir(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::open(dir),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn get(&self, hash: &str) -> Option<Arc<AnalysisReport>> {
        self.index.read().by_hash.get(hash).cloned()
    }

    /// Find a report by content hash, falling back to file name.
    pub fn lookup(&self, key: &str) -> Option<Arc<AnalysisReport>> {
        let index = self.index.read();
        if let Some(report) = index.by_hash.get(key) {
            return Some(Arc::clone(report));
        }
        index
            .by_name
            .get(key)
            .and_then(|hash| index.by_hash.get(hash))
            .cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.index.read().by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.index.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a report. Returns the stored report, which is the earlier one if the hash
    /// was already present.
    ///
    /// A persistence failure is logged; the report stays available in memory.
    pub fn insert(&self, report: AnalysisReport) -> Arc<AnalysisReport> {
        if let Some(existing) = self.get(&report.content_hash) {
            log::debug!("Report {} already stored", report.content_hash);
            return existing;
        }
        let report: Arc<AnalysisReport> = Arc::new(report);
        if let Some(dir) = &self.dir {
            if let Err(err) = write_report(dir, &report) {
                log::warn!("Failed to persist report {}: {:#}", report.content_hash, err);
            }
        }
        self.index_report(Arc::clone(&report));
        report
    }

    /// Make the report stored under `hash` findable by another file name.
    ///
    /// Returns `false` if no report with that hash is stored. Aliases live in memory
    /// only; a reopened store indexes each report under the name it was analyzed with.
    pub fn alias(&self, name: &str, hash: &str) -> bool {
        let mut index = self.index.write();
        if !index.by_hash.contains_key(hash) {
            return false;
        }
        index.by_name.insert(name.to_string(), hash.to_string());
        true
    }

    fn index_report(&self, report: Arc<AnalysisReport>) {
        let mut index = self.index.write();
        if let Some(name) = &report.file_name {
            index.by_name.insert(name.clone(), report.content_hash.clone());
        }
        index.by_hash.entry(report.content_hash.clone()).or_insert(report);
    }
}

fn report_path(dir: &Path, hash: &str) -> PathBuf {
    dir.join(format!("{}{}", hash, REPORT_EXTENSION))
}

fn write_report(dir: &Path, report: &AnalysisReport) -> Result<()> {
    let path: PathBuf = report_path(dir, &report.content_hash);
    if path.exists() {
        return Ok(());
    }
    let json: Vec<u8> = serde_json::to_vec(report)?;
    let compressed: Vec<u8> = zstd::encode_all(&json[..], ZSTD_LEVEL)?;
    let partial: PathBuf = path.with_extension("zst.partial");
    std::fs::write(&partial, compressed).with_context(|| format!("Failed to write {}", partial.display()))?;
    std::fs::rename(&partial, &path).with_context(|| format!("Failed to finalize {}", path.display()))?;
    log::debug!("Persisted report to {}", path.display());
    Ok(())
}

fn read_report(path: &Path) -> Result<AnalysisReport> {
    let compressed: Vec<u8> = std::fs::read(path)?;
    let json: Vec<u8> = zstd::decode_all(&compressed[..])?;
    let report: AnalysisReport = serde_json::from_slice(&json)?;
    Ok(report)
}
