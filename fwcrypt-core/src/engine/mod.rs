pub mod error;
pub mod image;
pub mod arch;
pub mod loader;
pub mod decoder;
pub mod analysis;
pub mod matcher;
pub mod protocol;
pub mod compliance;
pub mod report;
pub mod pipeline;
pub mod store;
pub mod jobs;
