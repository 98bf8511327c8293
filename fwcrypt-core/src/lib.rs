//! Static cryptographic analysis of firmware images.
//!
//! [`engine`] holds the analysis stages (loader, decoders, matcher, protocol
//! reconstruction, compliance scoring), the report store and the job pool.
//! [`config`] holds the engine configuration shared by the binaries.

pub mod config;
pub mod engine;

pub use engine::error::{AnalysisError, ErrorCategory};
pub use engine::report::AnalysisReport;
