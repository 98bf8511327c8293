// CLI command handlers
use anyhow::{Context, Result};
use fwcrypt_core::config::EngineConfig;
use fwcrypt_core::engine::arch::ArchitectureDetector;
use fwcrypt_core::engine::compliance::Ruleset;
use fwcrypt_core::engine::image::{ContainerFormat, FirmwareImage};
use fwcrypt_core::engine::loader::Loader;
use fwcrypt_core::engine::pipeline::{Pipeline, Uncancellable};
use fwcrypt_core::engine::report::content_hash;
use fwcrypt_core::engine::store::ReportStore;
use fwcrypt_core::AnalysisReport;
use fwcrypt_web::security::{hash_token, ApiKeyConfig, Scope};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn read_input(path: &Path) -> Result<(Arc<[u8]>, Option<String>)> {
    let data: Vec<u8> = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name: Option<String> = path.file_name().map(|n| n.to_string_lossy().into_owned());
    Ok((Arc::from(data), name))
}

/// Analyze a local file, reusing a stored report when the configured store has one.
pub fn analyze_file(path: &Path, config: &EngineConfig) -> Result<Arc<AnalysisReport>> {
    let (data, name) = read_input(path)?;
    let store: ReportStore = ReportStore::from_dir(config.report_dir.as_deref())?;
    if let Some(report) = store.get(&content_hash(&data)) {
        log::info!("Using stored report for {}", path.display());
        return Ok(report);
    }

    let ruleset: Ruleset = config.ruleset()?;
    let pipeline = Pipeline::new(config.pipeline_options());
    let report: AnalysisReport = pipeline
        .run(data, name.as_deref(), &ruleset, &Uncancellable)
        .with_context(|| format!("Analysis of {} failed", path.display()))?;
    Ok(store.insert(report))
}

pub fn print_report(report: &AnalysisReport) {
    println!("File:         {}", report.display_name());
    println!("SHA-256:      {}", report.content_hash);
    println!("Size:         {} bytes", report.size);
    println!("Format:       {:?}", report.format);
    println!(
        "Architecture: {} ({:?}, confidence {:.2})",
        report.architecture.name(),
        report.endianness,
        report.arch_confidence
    );
    if let Some(entry) = report.entry_point {
        println!("Entry point:  0x{:08X}", entry);
    }
    println!("Functions:    {}", report.function_count);

    println!("\nDetections: {}", report.detections.len());
    for detection in &report.detections {
        println!(
            "  0x{:08X}  {:<12} {:.2}  [{}]",
            detection.primary_offset(),
            detection.algorithm_name(),
            detection.confidence,
            detection.metadata.heuristics.join(", ")
        );
    }

    if !report.protocols.is_empty() {
        println!("\nProtocols:");
        for graph in &report.protocols {
            let chain: Vec<String> = graph
                .nodes
                .iter()
                .map(|n| format!("{} ({})", n.label, n.primitive))
                .collect();
            println!(
                "  #{} {}  anomaly {:.2}, template {}",
                graph.instance,
                chain.join(" -> "),
                graph.anomaly_score,
                graph.template.as_deref().unwrap_or("custom")
            );
        }
    }

    let compliance = &report.compliance;
    println!(
        "\nCompliance (ruleset {}): risk score {} ({})",
        compliance.ruleset_version, compliance.risk_score, compliance.risk_level
    );
    for verdict in compliance.verdicts.iter().filter(|v| v.in_use) {
        println!(
            "  {:<12} approved={} fips140-3={} deprecated={} risk={}",
            verdict.algorithm, verdict.nist_approved, verdict.fips140_3, verdict.deprecated, verdict.risk_level
        );
    }
    for recommendation in &compliance.recommendations {
        println!(
            "  [{:?}] {}: {} ({})",
            recommendation.priority,
            recommendation.id,
            recommendation.title,
            recommendation.triggered_by.join(", ")
        );
    }

    if !report.diagnostics.is_empty() {
        println!("\nDiagnostics:");
        for diagnostic in &report.diagnostics {
            match diagnostic.address {
                Some(address) => println!("  {} at 0x{:08X}: {}", diagnostic.code, address, diagnostic.message),
                None => println!("  {}: {}", diagnostic.code, diagnostic.message),
            }
        }
    }
}

pub fn write_report(report: &AnalysisReport, output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    fs::write(output, json).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Report written to {}", output.display());
    Ok(())
}

/// Load a file and print what the loader and architecture detector see.
pub fn probe_architecture(path: &Path, config: &EngineConfig) -> Result<()> {
    let (data, name) = read_input(path)?;
    let options = config.pipeline_options().loader;
    let image: FirmwareImage = Loader::new(options)
        .load(Arc::clone(&data), name.as_deref())
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("Format:       {:?}", image.format);
    println!(
        "Architecture: {} ({:?}, confidence {:.2})",
        image.architecture.name(),
        image.endianness,
        image.arch_confidence
    );
    if let Some(entry) = image.entry_point {
        println!("Entry point:  0x{:08X}", entry);
    }
    println!("Sections:");
    for section in &image.sections {
        println!(
            "  {:<16} 0x{:08X}  {:>8} bytes  {}",
            section.name,
            section.virtual_address,
            section.size(),
            section.permissions
        );
    }
    if !image.symbols.is_empty() {
        println!("Symbols:      {}", image.symbols.len());
    }

    if image.format == ContainerFormat::Raw {
        println!("Candidates:");
        let guess = ArchitectureDetector::new(options.arch_threshold).detect(image.bytes());
        for score in guess.scores.iter().take(6) {
            println!(
                "  {:<8} {:?}  {:.3}",
                score.architecture.name(),
                score.endianness,
                score.confidence
            );
        }
    }
    Ok(())
}

/// Validate a ruleset and print it; optionally export it as a starting point.
pub fn show_ruleset(path: Option<&Path>, export: Option<&Path>) -> Result<()> {
    let ruleset: Ruleset = match path {
        Some(path) => Ruleset::load(path)?,
        None => Ruleset::embedded().context("Embedded ruleset is invalid")?,
    };
    println!(
        "Ruleset {} ({} algorithms, {} remediations, deprecated penalty {})",
        ruleset.version,
        ruleset.algorithms.len(),
        ruleset.remediations.len(),
        ruleset.deprecated_penalty
    );
    for rule in &ruleset.algorithms {
        println!(
            "  {:<12} approved={:<5} fips140-3={:<5} deprecated={:<5} risk={:<6} weight={}",
            rule.name, rule.nist_approved, rule.fips140_3, rule.deprecated, rule.risk, rule.weight
        );
    }
    for remediation in &ruleset.remediations {
        println!(
            "  {} [{:?}/{:?}] {} <- {}",
            remediation.id,
            remediation.priority,
            remediation.impact,
            remediation.title,
            remediation.triggers.join(", ")
        );
    }

    if let Some(export) = export {
        let json = serde_json::to_string_pretty(&ruleset)?;
        fs::write(export, json).with_context(|| format!("Failed to write {}", export.display()))?;
        println!("Ruleset written to {}", export.display());
    }
    Ok(())
}

/// Print a configuration entry for a bearer token.
pub fn api_key_entry(token: &str, id: &str, name: &str, scopes: Vec<Scope>) -> Result<String> {
    let entry = ApiKeyConfig {
        id: id.to_string(),
        name: name.to_string(),
        token_sha256: hash_token(token),
        scopes,
        revoked: false,
    };
    Ok(serde_json::to_string_pretty(&entry)?)
}
