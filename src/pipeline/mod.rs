// Import pipeline: ingestion, per-record processing, photos, and the orchestrator

pub mod ingestion;
pub mod orchestrator;
pub mod photos;
pub mod processing;

// Re-export key types from each stage
pub use ingestion::{parse_feed, EnrichmentIndex, EnrichmentRecord, FeedRecord};
pub use orchestrator::{BatchSummary, ImportOrchestrator, ImportRequest, RecordOutcome};
pub use processing::{fingerprint, normalize, NormalizedPayload};
