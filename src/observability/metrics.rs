//! Metrics for the import pipeline
//!
//! Every metric name lives in [`MetricName`] so recording sites never carry
//! magic strings. Recording goes through the `metrics` facade; without an
//! installed recorder every call is a no-op, which is what tests rely on.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::config::MetricsConfig;
use crate::error::{PipelineError, Result};

/// Enum representing all metric names used by the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Feed metrics
    FeedParseSuccess,
    FeedParseError,
    FeedRecordsExtracted,
    FeedParseDuration,

    // Enrichment metrics
    EnrichmentRowsLoaded,
    EnrichmentRowsSkipped,
    EnrichmentMatches,

    // Import metrics
    ImportRecordsProcessed,
    ImportRecordErrors,
    ImportRecordDuration,
    ImportBatchesSealed,
    ImportBatchDuration,

    // Photo metrics
    PhotosRendered,
    PhotosFailed,
    PhotoJobDuration,
    PhotoBytesDownloaded,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::FeedParseSuccess => "realty_feed_parse_success_total",
            MetricName::FeedParseError => "realty_feed_parse_error_total",
            MetricName::FeedRecordsExtracted => "realty_feed_records_extracted_total",
            MetricName::FeedParseDuration => "realty_feed_parse_duration_seconds",

            MetricName::EnrichmentRowsLoaded => "realty_enrichment_rows_loaded_total",
            MetricName::EnrichmentRowsSkipped => "realty_enrichment_rows_skipped_total",
            MetricName::EnrichmentMatches => "realty_enrichment_matches_total",

            MetricName::ImportRecordsProcessed => "realty_import_records_processed_total",
            MetricName::ImportRecordErrors => "realty_import_record_errors_total",
            MetricName::ImportRecordDuration => "realty_import_record_duration_seconds",
            MetricName::ImportBatchesSealed => "realty_import_batches_sealed_total",
            MetricName::ImportBatchDuration => "realty_import_batch_duration_seconds",

            MetricName::PhotosRendered => "realty_photos_rendered_total",
            MetricName::PhotosFailed => "realty_photos_failed_total",
            MetricName::PhotoJobDuration => "realty_photo_job_duration_seconds",
            MetricName::PhotoBytesDownloaded => "realty_photo_bytes_downloaded",
        }
    }

    /// Get all metric names (used to pre-register them with the recorder)
    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            FeedParseSuccess,
            FeedParseError,
            FeedRecordsExtracted,
            FeedParseDuration,
            EnrichmentRowsLoaded,
            EnrichmentRowsSkipped,
            EnrichmentMatches,
            ImportRecordsProcessed,
            ImportRecordErrors,
            ImportRecordDuration,
            ImportBatchesSealed,
            ImportBatchDuration,
            PhotosRendered,
            PhotosFailed,
            PhotoJobDuration,
            PhotoBytesDownloaded,
        ]
        .into_iter()
    }

    pub fn is_histogram(&self) -> bool {
        matches!(
            self,
            MetricName::FeedParseDuration
                | MetricName::ImportRecordDuration
                | MetricName::ImportBatchDuration
                | MetricName::PhotoJobDuration
                | MetricName::PhotoBytesDownloaded
        )
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Idempotent; a second call is a no-op.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled || HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipelineError::Config(format!("failed to install Prometheus recorder: {}", e)))?;

    if HANDLE.set(handle).is_err() {
        warn!("METRICS: recorder handle already stored");
    }

    for name in MetricName::all_metrics() {
        if name.is_histogram() {
            let _ = ::metrics::histogram!(name.as_str());
        } else {
            let _ = ::metrics::counter!(name.as_str());
        }
    }

    info!("Prometheus recorder installed");
    Ok(())
}

/// Render the current snapshot in Prometheus text format
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Write the current snapshot to `path`, when a recorder is installed
pub fn write_snapshot(path: &Path) -> Result<()> {
    let Some(text) = render() else {
        warn!("METRICS: no recorder installed, snapshot not written");
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, text)?;
    info!("📈 Metrics snapshot written to {}", path.display());
    Ok(())
}

// ============================================================================
// Feed Metrics
// ============================================================================

pub mod feed {
    use super::MetricName;

    /// Record a successfully parsed feed
    pub fn parse_success(records: usize, duration_secs: f64) {
        ::metrics::counter!(MetricName::FeedParseSuccess.as_str()).increment(1);
        ::metrics::counter!(MetricName::FeedRecordsExtracted.as_str()).increment(records as u64);
        ::metrics::histogram!(MetricName::FeedParseDuration.as_str()).record(duration_secs);
    }

    /// Record a rejected feed
    pub fn parse_error() {
        ::metrics::counter!(MetricName::FeedParseError.as_str()).increment(1);
    }
}

// ============================================================================
// Enrichment Metrics
// ============================================================================

pub mod enrichment {
    use super::MetricName;

    pub fn rows_loaded(count: usize) {
        ::metrics::counter!(MetricName::EnrichmentRowsLoaded.as_str()).increment(count as u64);
    }

    pub fn row_skipped() {
        ::metrics::counter!(MetricName::EnrichmentRowsSkipped.as_str()).increment(1);
    }

    /// Record which key matched a feed record to an enrichment row
    pub fn matched(key: &'static str) {
        ::metrics::counter!(MetricName::EnrichmentMatches.as_str(), "key" => key).increment(1);
    }
}

// ============================================================================
// Import Metrics
// ============================================================================

pub mod import {
    use super::MetricName;

    /// Record the outcome of one feed record (created, matched, failed)
    pub fn record_processed(outcome: &'static str, duration_secs: f64) {
        ::metrics::counter!(MetricName::ImportRecordsProcessed.as_str(), "outcome" => outcome).increment(1);
        ::metrics::histogram!(MetricName::ImportRecordDuration.as_str()).record(duration_secs);
    }

    pub fn record_error(kind: &'static str) {
        ::metrics::counter!(MetricName::ImportRecordErrors.as_str(), "kind" => kind).increment(1);
    }

    pub fn batch_sealed(status: &'static str, duration_secs: f64) {
        ::metrics::counter!(MetricName::ImportBatchesSealed.as_str(), "status" => status).increment(1);
        ::metrics::histogram!(MetricName::ImportBatchDuration.as_str()).record(duration_secs);
    }
}

// ============================================================================
// Photo Metrics
// ============================================================================

pub mod photos {
    use super::MetricName;

    pub fn rendered() {
        ::metrics::counter!(MetricName::PhotosRendered.as_str()).increment(1);
    }

    pub fn failed(kind: &'static str) {
        ::metrics::counter!(MetricName::PhotosFailed.as_str(), "kind" => kind).increment(1);
    }

    pub fn bytes_downloaded(bytes: usize) {
        ::metrics::histogram!(MetricName::PhotoBytesDownloaded.as_str()).record(bytes as f64);
    }

    pub fn job_duration(secs: f64) {
        ::metrics::histogram!(MetricName::PhotoJobDuration.as_str()).record(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique_and_prefixed() {
        let names: Vec<&str> = MetricName::all_metrics().map(|m| m.as_str()).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        assert!(names.iter().all(|n| n.starts_with("realty_")));
    }

    #[test]
    fn test_counters_end_with_total() {
        for name in MetricName::all_metrics().filter(|m| !m.is_histogram()) {
            assert!(name.as_str().ends_with("_total"), "{} should end with _total", name);
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        feed::parse_success(3, 0.1);
        import::record_error("owner_persist_failed");
        photos::rendered();
        enrichment::matched("reference");
    }
}
