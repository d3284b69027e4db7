use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a `Storage` backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Feed is malformed: {0}")]
    FeedMalformed(String),

    #[error("Enrichment export could not be read: {0}")]
    EnrichmentUnreadable(String),

    #[error("Enrichment row {row} is malformed: {reason}")]
    EnrichmentRowMalformed { row: usize, reason: String },

    #[error("Duplicate lookup failed: {0}")]
    DeduplicationLookupFailed(#[source] StorageError),

    #[error("Failed to persist owner: {0}")]
    OwnerPersistFailed(#[source] StorageError),

    #[error("Failed to persist property: {0}")]
    PropertyPersistFailed(#[source] StorageError),

    #[error("Failed to persist listing: {0}")]
    ListingPersistFailed(#[source] StorageError),

    #[error("Failed to assign canonical listing for property {property_id}: {source}")]
    CanonicalAssignmentFailed {
        property_id: Uuid,
        #[source]
        source: StorageError,
    },

    #[error("Photo download failed for {url}: {reason}")]
    PhotoDownloadFailed { url: String, reason: String },

    #[error("Photo decode failed for {url}: {reason}")]
    PhotoDecodeFailed { url: String, reason: String },

    #[error("Photo upload failed for {key}: {reason}")]
    PhotoUploadFailed { key: String, reason: String },

    #[error("Import cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted classification of a failure, stored on `ImportErrorRecord`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FeedMalformed,
    EnrichmentUnreadable,
    EnrichmentRowMalformed,
    DeduplicationLookupFailed,
    OwnerPersistFailed,
    PropertyPersistFailed,
    ListingPersistFailed,
    CanonicalAssignmentFailed,
    PhotoDownloadFailed,
    PhotoDecodeFailed,
    PhotoUploadFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FeedMalformed => "feed_malformed",
            ErrorKind::EnrichmentUnreadable => "enrichment_unreadable",
            ErrorKind::EnrichmentRowMalformed => "enrichment_row_malformed",
            ErrorKind::DeduplicationLookupFailed => "deduplication_lookup_failed",
            ErrorKind::OwnerPersistFailed => "owner_persist_failed",
            ErrorKind::PropertyPersistFailed => "property_persist_failed",
            ErrorKind::ListingPersistFailed => "listing_persist_failed",
            ErrorKind::CanonicalAssignmentFailed => "canonical_assignment_failed",
            ErrorKind::PhotoDownloadFailed => "photo_download_failed",
            ErrorKind::PhotoDecodeFailed => "photo_decode_failed",
            ErrorKind::PhotoUploadFailed => "photo_upload_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::FeedMalformed(_) => ErrorKind::FeedMalformed,
            PipelineError::EnrichmentUnreadable(_) => ErrorKind::EnrichmentUnreadable,
            PipelineError::EnrichmentRowMalformed { .. } => ErrorKind::EnrichmentRowMalformed,
            PipelineError::DeduplicationLookupFailed(_) => ErrorKind::DeduplicationLookupFailed,
            PipelineError::OwnerPersistFailed(_) => ErrorKind::OwnerPersistFailed,
            PipelineError::PropertyPersistFailed(_) => ErrorKind::PropertyPersistFailed,
            PipelineError::ListingPersistFailed(_) => ErrorKind::ListingPersistFailed,
            PipelineError::CanonicalAssignmentFailed { .. } => ErrorKind::CanonicalAssignmentFailed,
            PipelineError::PhotoDownloadFailed { .. } => ErrorKind::PhotoDownloadFailed,
            PipelineError::PhotoDecodeFailed { .. } => ErrorKind::PhotoDecodeFailed,
            PipelineError::PhotoUploadFailed { .. } => ErrorKind::PhotoUploadFailed,
            PipelineError::Cancelled
            | PipelineError::Storage(_)
            | PipelineError::Config(_)
            | PipelineError::Toml(_)
            | PipelineError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Batch-fatal errors abort the batch and seal it as `failed`.
    /// Everything else stays local to a record, a row or a photo.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::FeedMalformed(_)
                | PipelineError::EnrichmentUnreadable(_)
                | PipelineError::DeduplicationLookupFailed(_)
                | PipelineError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
