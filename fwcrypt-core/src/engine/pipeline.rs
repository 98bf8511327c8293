//! Analysis Pipeline
//!
//! Runs one image through every stage and assembles the report.
//!
//! # Stages
//! 1. **Load**: container parsing and architecture detection; an unknown architecture
//!    stops the run here with `UnknownArchitecture`
//! 2. **Disassemble**: function recovery, CFGs and loops
//! 3. **Match**: primitive detection
//! 4. **Reconstruct**: protocol reconstruction and compliance assessment, run
//!    concurrently with `rayon::join`
//!
//! A [`Checkpoint`] is consulted before each stage so callers can cancel between
//! stages. Either every stage completes and a report is returned, or nothing is.

use crate::engine::analysis::call_graph::CallGraph;
use crate::engine::analysis::disassembler::{Disassembler, Disassembly, DEFAULT_MAX_FUNCTION_INSTRUCTIONS};
use crate::engine::compliance::{Assessment, ComplianceScorer, ComplianceSummary, Ruleset};
use crate::engine::decoder::DecoderRegistry;
use crate::engine::error::{AnalysisError, Diagnostic};
use crate::engine::image::{Architecture, FirmwareImage};
use crate::engine::loader::{Loader, LoaderOptions};
use crate::engine::matcher::{Detection, PrimitiveMatcher};
use crate::engine::protocol::{ProtocolAnalysis, ProtocolReconstructor, DEFAULT_HOP_BOUND};
use crate::engine::report::{content_hash, AnalysisReport, ENGINE_VERSION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pipeline stage, as reported in job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stage {
    Load = 0,
    Disassemble = 1,
    Match = 2,
    Reconstruct = 3,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Disassemble => "disassemble",
            Stage::Match => "match",
            Stage::Reconstruct => "reconstruct",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-boundary hook. Returning an error aborts the run.
pub trait Checkpoint: Sync {
    fn enter(&self, stage: Stage) -> Result<(), AnalysisError>;
}

/// Checkpoint for runs that cannot be cancelled.
pub struct Uncancellable;

impl Checkpoint for Uncancellable {
    fn enter(&self, stage: Stage) -> Result<(), AnalysisError> {
        log::debug!("Entering {} stage", stage);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub loader: LoaderOptions,
    pub max_function_instructions: usize,
    pub hop_bound: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            loader: LoaderOptions::default(),
            max_function_instructions: DEFAULT_MAX_FUNCTION_INSTRUCTIONS,
            hop_bound: DEFAULT_HOP_BOUND,
        }
    }
}

pub struct Pipeline {
    loader: Loader,
    registry: DecoderRegistry,
    reconstructor: ProtocolReconstructor,
    max_function_instructions: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineOptions::default())
    }
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            loader: Loader::new(options.loader),
            registry: DecoderRegistry::new(),
            reconstructor: ProtocolReconstructor::new(options.hop_bound),
            max_function_instructions: options.max_function_instructions,
        }
    }

    /// Load an image and reject it if its architecture is unknown.
    pub fn load(&self, data: Arc<[u8]>, file_name: Option<&str>) -> Result<FirmwareImage, AnalysisError> {
        let image: FirmwareImage = self.loader.load(data, file_name)?;
        if image.architecture == Architecture::Unknown {
            log::info!(
                "Architecture undetermined (confidence {:.2}); skipping disassembly",
                image.arch_confidence
            );
            return Err(AnalysisError::UnknownArchitecture {
                confidence: image.arch_confidence,
            });
        }
        log::info!(
            "Loaded {:?} image: {} ({:?}), confidence {:.2}, {} sections",
            image.format,
            image.architecture.name(),
            image.endianness,
            image.arch_confidence,
            image.sections.len()
        );
        Ok(image)
    }

    /// Analyze one image.
    ///
    /// # Arguments
    /// * `data` - Complete input file
    /// * `file_name` - Optional name hint, kept in the report
    /// * `ruleset` - Ruleset snapshot for this run
    /// * `checkpoint` - Consulted before each stage
    ///
    /// # Returns
    /// `Result<AnalysisReport, AnalysisError>` - the complete report
    ///
    /// # Errors
    /// Input errors from the loader, `UnknownArchitecture`, or whatever the checkpoint
    /// returns (`Cancelled`, `AnalysisTimeout`)
    pub fn run(
        &self,
        data: Arc<[u8]>,
        file_name: Option<&str>,
        ruleset: &Ruleset,
        checkpoint: &dyn Checkpoint,
    ) -> Result<AnalysisReport, AnalysisError> {
        let hash: String = content_hash(&data);
        let size: u64 = data.len() as u64;
        log::info!("Analyzing {} ({} bytes, sha256 {})", file_name.unwrap_or("<unnamed>"), size, hash);

        checkpoint.enter(Stage::Load)?;
        let image: FirmwareImage = self.load(data, file_name)?;

        checkpoint.enter(Stage::Disassemble)?;
        let disassembly: Disassembly =
            Disassembler::new(&self.registry, self.max_function_instructions).disassemble(&image)?;

        checkpoint.enter(Stage::Match)?;
        let detections: Vec<Detection> = PrimitiveMatcher::scan(&image, &disassembly);
        log::info!("Matched {} primitives", detections.len());

        checkpoint.enter(Stage::Reconstruct)?;
        let call_graph: CallGraph = CallGraph::build(&disassembly.functions);
        let (protocols, assessment): (ProtocolAnalysis, Assessment) = rayon::join(
            || self.reconstructor.reconstruct(&detections, &call_graph),
            || ComplianceScorer::assess(ruleset, &detections),
        );
        log::info!(
            "Reconstructed {} protocol instances ({} rejected)",
            protocols.graphs.len(),
            protocols.diagnostics.len()
        );
        let compliance: ComplianceSummary = assessment.finish(&protocols.graphs);

        let mut diagnostics: Vec<Diagnostic> = disassembly.diagnostics;
        diagnostics.extend(protocols.diagnostics);

        Ok(AnalysisReport {
            content_hash: hash,
            file_name: file_name.map(str::to_string),
            size,
            format: image.format,
            architecture: image.architecture,
            endianness: image.endianness,
            arch_confidence: image.arch_confidence,
            entry_point: image.entry_point,
            sections: AnalysisReport::section_summaries(&image),
            function_count: disassembly.functions.len(),
            detections,
            protocols: protocols.graphs,
            compliance,
            diagnostics,
            engine_version: ENGINE_VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CancelAt(Stage, AtomicUsize);

    impl Checkpoint for CancelAt {
        fn enter(&self, stage: Stage) -> Result<(), AnalysisError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            if stage == self.0 {
                Err(AnalysisError::Cancelled)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_zero_image_stops_before_disassembly() {
        let ruleset = Ruleset::embedded().unwrap();
        let checkpoint = CancelAt(Stage::Disassemble, AtomicUsize::new(0));
        let err = Pipeline::default()
            .run(Arc::from(vec![0u8; 64]), None, &ruleset, &checkpoint)
            .unwrap_err();
        assert_eq!(err.code(), "UnknownArchitecture");
        // only the load checkpoint was reached
        assert_eq!(checkpoint.1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_load() {
        let ruleset = Ruleset::embedded().unwrap();
        let checkpoint = CancelAt(Stage::Load, AtomicUsize::new(0));
        let err = Pipeline::default()
            .run(Arc::from(vec![0xE1u8; 64]), None, &ruleset, &checkpoint)
            .unwrap_err();
        assert_eq!(err, AnalysisError::Cancelled);
    }

    #[test]
    fn test_empty_input() {
        let ruleset = Ruleset::embedded().unwrap();
        let err = Pipeline::default()
            .run(Arc::from(Vec::new()), None, &ruleset, &Uncancellable)
            .unwrap_err();
        assert_eq!(err.code(), "EmptyInput");
    }
}
