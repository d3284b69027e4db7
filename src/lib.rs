pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod storage;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::Config;
pub use error::{ErrorKind, PipelineError, Result, StorageError};
pub use pipeline::{BatchSummary, ImportOrchestrator, ImportRequest};
