use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::*;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::observability::{metrics, ActivityEvent, ActivityLog};
use crate::pipeline::ingestion::{parse_feed, EnrichmentIndex};
use crate::pipeline::photos::{BlobStore, PhotoFetcher, PhotoJob, PhotoJobReport, PhotoRenderer, PhotoWorkerPool};
use crate::pipeline::processing::{normalize, DedupEngine, NormalizedPayload, OwnerResolver};
use crate::storage::Storage;

/// Everything one import run needs
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub tenant_id: Uuid,
    pub source: String,
    pub created_by: Option<Uuid>,
    pub feed: Vec<u8>,
    pub enrichment: Option<Vec<u8>>,
}

/// How a single record ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created {
        property_id: Uuid,
        owner_id: Uuid,
        listing_id: Uuid,
        possible_duplicate: bool,
    },
    MatchedExisting {
        property_id: Option<Uuid>,
    },
}

/// Aggregate result of a batch, the only thing callers see
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub tenant_id: Uuid,
    pub source: String,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Photo jobs still running when the batch was sealed
    pub photo_jobs_pending: usize,
    pub errors: Vec<ImportErrorRecord>,
}

/// Drives a batch: parse, match, normalize, dedup, persist, hand photos off.
///
/// Records are imported strictly one after another, in feed order. Photo work
/// runs on the worker pool and, unless configured otherwise, is drained before
/// the batch is sealed.
pub struct ImportOrchestrator {
    storage: Arc<dyn Storage>,
    activity: Arc<dyn ActivityLog>,
    dedup: DedupEngine,
    owners: OwnerResolver,
    photos: Option<PhotoWorkerPool>,
    await_photos: bool,
    cancel: CancellationToken,
}

impl ImportOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, activity: Arc<dyn ActivityLog>) -> Self {
        Self {
            dedup: DedupEngine::new(storage.clone()),
            owners: OwnerResolver::new(storage.clone()),
            storage,
            activity,
            photos: None,
            await_photos: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the orchestrator and its photo pool from configuration
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn Storage>,
        blobs: Arc<dyn BlobStore>,
        activity: Arc<dyn ActivityLog>,
    ) -> Result<Self> {
        let orchestrator = Self::new(storage.clone(), activity);
        if !config.photos.enabled {
            return Ok(orchestrator);
        }

        let renderer = PhotoRenderer::new(
            PhotoFetcher::new(&config.photos)?,
            blobs,
            config.photos.max_parallel_photos,
            config.photos.jpeg_quality,
        );
        let pool = PhotoWorkerPool::new(
            Arc::new(renderer),
            storage,
            config.photos.max_concurrent_jobs,
            orchestrator.cancellation_token(),
        );
        Ok(orchestrator.with_photos(pool, config.photos.await_before_complete))
    }

    pub fn with_photos(mut self, pool: PhotoWorkerPool, await_before_complete: bool) -> Self {
        self.photos = Some(pool);
        self.await_photos = await_before_complete;
        self
    }

    /// Token shared with the photo pool. Cancelling it stops the record loop
    /// before the next record and aborts queued photo jobs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a whole import and return its summary. Batch-fatal problems seal
    /// the batch as failed; they are not returned as errors.
    #[instrument(skip(self, request), fields(tenant = %request.tenant_id, source = %request.source))]
    pub async fn run(&self, request: &ImportRequest) -> Result<BatchSummary> {
        let mut batch = self
            .create_batch(request.tenant_id, &request.source, request.created_by)
            .await?;

        match self.import_all(&mut batch, request).await {
            Ok(()) => self.complete_batch(&mut batch).await?,
            Err(e) => {
                error!("❌ Batch {} aborted: {}", batch.id, e);
                self.fail_batch(&mut batch, &e).await?;
            }
        }

        self.summary(&batch).await
    }

    async fn import_all(&self, batch: &mut ImportBatch, request: &ImportRequest) -> Result<()> {
        let records = parse_feed(&request.feed)?;

        let enrichment = match &request.enrichment {
            Some(bytes) => {
                let index = EnrichmentIndex::parse(bytes)?;
                batch.counters.enrichment_rows_skipped += index.skipped_rows() as u64;
                Some(index)
            }
            None => None,
        };

        info!("🔧 Importing {} records into batch {}", records.len(), batch.id);
        for (position, record) in records.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let matched = enrichment.as_ref().and_then(|index| index.find_for(record));
            if let Some((_, key)) = matched {
                metrics::enrichment::matched(key.as_str());
            }
            let payload = normalize(record, matched.map(|(row, _)| row), batch.tenant_id, &batch.source);
            let raw = payload.raw.clone();

            let started = Instant::now();
            match self.import_record(batch, payload).await {
                Ok(RecordOutcome::Created { .. }) => {
                    metrics::import::record_processed("created", started.elapsed().as_secs_f64());
                }
                Ok(RecordOutcome::MatchedExisting { .. }) => {
                    metrics::import::record_processed("matched", started.elapsed().as_secs_f64());
                }
                Err(e) if e.is_batch_fatal() => return Err(e),
                Err(e) => {
                    warn!("Record {} ({}) failed: {}", position, record.reference, e);
                    metrics::import::record_processed("failed", started.elapsed().as_secs_f64());
                    self.log_error(batch, e.kind(), e.to_string(), raw).await;
                }
            }

            if (position + 1) % 100 == 0 {
                debug!("Imported {}/{} records", position + 1, records.len());
            }
        }
        Ok(())
    }

    /// Open a new batch in `processing` state
    pub async fn create_batch(&self, tenant_id: Uuid, source: &str, created_by: Option<Uuid>) -> Result<ImportBatch> {
        let batch = ImportBatch::new(tenant_id, source, created_by);
        self.storage.create_batch(&batch).await?;

        info!("🚀 Starting import batch {} for tenant {} from {}", batch.id, tenant_id, source);
        self.activity.record(ActivityEvent::BatchStarted {
            batch_id: batch.id,
            tenant_id,
            source: source.to_string(),
        });
        Ok(batch)
    }

    /// Import one normalized record into the batch.
    ///
    /// A confirmed duplicate writes nothing. A failed duplicate lookup is
    /// batch-fatal; owner, property and listing failures are record-local and
    /// left for the caller to log. Canonical and role assignment are
    /// best-effort and never fail the record.
    pub async fn import_record(&self, batch: &mut ImportBatch, payload: NormalizedPayload) -> Result<RecordOutcome> {
        let NormalizedPayload {
            mut property,
            owner,
            photo_urls,
            listing_status,
            ..
        } = payload;
        batch.counters.total_records += 1;

        // 1. duplicate check
        let outcome = self.dedup.check(batch.tenant_id, &property).await?;
        if outcome.is_duplicate {
            batch.counters.matched_existing += 1;
            let existing_id = outcome.existing.as_ref().and_then(|p| p.id);
            debug!("Record {} matches existing property {:?}", property.external_id, existing_id);
            self.activity.record(ActivityEvent::MatchedExisting {
                batch_id: batch.id,
                property_id: existing_id,
                external_id: property.external_id.clone(),
            });
            return Ok(RecordOutcome::MatchedExisting { property_id: existing_id });
        }

        // 2. a possible duplicate is still created, only flagged
        let possible_match = if outcome.possible_duplicate {
            property.possible_duplicate = true;
            outcome.existing.as_ref().and_then(|p| p.id)
        } else {
            None
        };

        // 3. owner
        let resolved = self.owners.resolve(batch.tenant_id, &owner).await?;
        if resolved.enriched {
            batch.counters.owners_from_enrichment += 1;
        } else {
            batch.counters.owners_placeholder += 1;
        }

        // 4. property
        property.owner_id = Some(resolved.owner_id);
        self.storage
            .create_property(&mut property)
            .await
            .map_err(PipelineError::PropertyPersistFailed)?;
        let property_id = property.id.ok_or_else(|| missing_id(PipelineError::PropertyPersistFailed))?;
        batch.counters.properties_created += 1;

        if property.possible_duplicate {
            batch.counters.possible_duplicates += 1;
            info!(
                "⚠️ Property {} may duplicate {:?} (fingerprint {})",
                property_id, possible_match, property.fingerprint
            );
            self.activity.record(ActivityEvent::PossibleDuplicate {
                batch_id: batch.id,
                property_id: Some(property_id),
                existing_property_id: possible_match,
                fingerprint: property.fingerprint.clone(),
            });
        }

        // 5. listing with placeholder photos
        let now = Utc::now();
        let mut listing = Listing {
            id: None,
            tenant_id: batch.tenant_id,
            property_id,
            owner_id: Some(resolved.owner_id),
            import_batch_id: Some(batch.id),
            status: listing_status,
            purpose: property.purpose,
            title: property.title.clone(),
            description: property.description.clone(),
            sale_price: property.pricing.sale_price,
            rental_price: property.pricing.rental_price,
            photos: photo_urls
                .iter()
                .enumerate()
                .map(|(order, url)| Photo::degenerate(url, order as u32))
                .collect(),
            is_canonical: false,
            created_at: now,
            updated_at: now,
        };
        self.storage
            .create_listing(&mut listing)
            .await
            .map_err(PipelineError::ListingPersistFailed)?;
        let listing_id = listing.id.ok_or_else(|| missing_id(PipelineError::ListingPersistFailed))?;
        batch.counters.listings_created += 1;

        // 6. canonical listing, best-effort
        if let Err(source) = self.storage.set_canonical_listing(property_id, listing_id).await {
            let err = PipelineError::CanonicalAssignmentFailed { property_id, source };
            warn!("{}", err);
            self.activity.record(ActivityEvent::CanonicalAssignmentFailed {
                batch_id: batch.id,
                property_id,
                listing_id,
                reason: err.to_string(),
            });
        }

        // 7. originating broker role, best-effort
        if let Some(user_id) = batch.human_actor() {
            if let Err(e) = self
                .storage
                .add_property_role(property_id, user_id, PropertyRole::OriginatingBroker)
                .await
            {
                warn!("Failed to record originating broker {} on {}: {}", user_id, property_id, e);
                self.activity.record(ActivityEvent::RoleAssignmentFailed {
                    batch_id: batch.id,
                    property_id,
                    user_id,
                    reason: e.to_string(),
                });
            }
        }

        // 8. photos, off the critical path
        if let Some(pool) = &self.photos {
            if !photo_urls.is_empty() {
                pool.submit(PhotoJob {
                    batch_id: batch.id,
                    tenant_id: batch.tenant_id,
                    property_id,
                    listing_id,
                    urls: photo_urls,
                });
            }
        }

        self.activity.record(ActivityEvent::PropertyImported {
            batch_id: batch.id,
            property_id,
            owner_id: resolved.owner_id,
            listing_id,
            owner_status: resolved.owner_status.as_str().to_string(),
        });

        Ok(RecordOutcome::Created {
            property_id,
            owner_id: resolved.owner_id,
            listing_id,
            possible_duplicate: property.possible_duplicate,
        })
    }

    /// Append an entry to the batch's error audit and count it. Never fails:
    /// a broken audit write is itself only logged.
    pub async fn log_error(
        &self,
        batch: &mut ImportBatch,
        kind: ErrorKind,
        message: impl Into<String>,
        raw_data: serde_json::Value,
    ) {
        batch.counters.errors += 1;
        self.audit_error(batch, kind, message.into(), raw_data).await;
    }

    async fn audit_error(&self, batch: &ImportBatch, kind: ErrorKind, message: String, raw_data: serde_json::Value) {
        let record = ImportErrorRecord::new(batch.id, kind, message, raw_data);
        metrics::import::record_error(kind.as_str());

        if let Err(e) = self.storage.append_import_error(&record).await {
            error!("Failed to write import error for batch {}: {}", batch.id, e);
        }
        self.activity.record(ActivityEvent::RecordFailed {
            batch_id: batch.id,
            kind,
            message: record.message,
        });
    }

    /// Seal the batch as completed, after draining photo work when configured
    #[instrument(skip(self, batch), fields(batch_id = %batch.id))]
    pub async fn complete_batch(&self, batch: &mut ImportBatch) -> Result<()> {
        self.settle_photos(batch).await;
        if !batch.mark_completed() {
            warn!("Batch {} already sealed as {:?}", batch.id, batch.status);
            return Ok(());
        }
        self.seal(batch).await
    }

    /// Seal the batch as failed. The triggering error is audited but is not
    /// a record failure, so `counters.errors` is left alone.
    #[instrument(skip(self, batch, cause), fields(batch_id = %batch.id))]
    pub async fn fail_batch(&self, batch: &mut ImportBatch, cause: &PipelineError) -> Result<()> {
        self.audit_error(
            batch,
            cause.kind(),
            cause.to_string(),
            serde_json::json!({ "scope": "batch" }),
        )
        .await;
        self.settle_photos(batch).await;
        if !batch.mark_failed(cause.to_string()) {
            warn!("Batch {} already sealed as {:?}", batch.id, batch.status);
            return Ok(());
        }
        self.seal(batch).await
    }

    async fn settle_photos(&self, batch: &mut ImportBatch) {
        let Some(pool) = &self.photos else {
            return;
        };
        if !self.await_photos {
            if pool.pending() > 0 {
                info!(
                    "Sealing batch {} with {} photo jobs still running",
                    batch.id,
                    pool.pending()
                );
            }
            return;
        }

        info!("⏳ Waiting for {} photo jobs of batch {}", pool.pending(), batch.id);
        let reports = pool.drain().await;
        self.fold_photo_reports(batch, &reports);
    }

    fn fold_photo_reports(&self, batch: &mut ImportBatch, reports: &[PhotoJobReport]) {
        for report in reports.iter().filter(|r| r.batch_id == batch.id) {
            batch.counters.photos_rendered += report.rendered as u64;
            batch.counters.photos_failed += report.failed as u64;
            self.activity.record(ActivityEvent::PhotosProcessed {
                batch_id: batch.id,
                listing_id: report.listing_id,
                rendered: report.rendered,
                failed: report.failed,
            });
        }
    }

    async fn seal(&self, batch: &ImportBatch) -> Result<()> {
        self.storage.update_batch(batch).await?;

        let status = match batch.status {
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Processing => "processing",
        };
        let elapsed = (batch.completed_at.unwrap_or_else(Utc::now) - batch.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        metrics::import::batch_sealed(status, elapsed);

        let c = &batch.counters;
        info!(
            "✅ Batch {} {}: {} records, {} created, {} matched, {} possible duplicates, {} errors",
            batch.id, status, c.total_records, c.properties_created, c.matched_existing, c.possible_duplicates, c.errors
        );
        self.activity.record(ActivityEvent::BatchSealed {
            batch_id: batch.id,
            status: batch.status,
            counters: batch.counters.clone(),
            error_message: batch.error_message.clone(),
        });
        Ok(())
    }

    async fn summary(&self, batch: &ImportBatch) -> Result<BatchSummary> {
        let errors = self.storage.import_errors_for_batch(batch.id).await?;
        Ok(BatchSummary {
            batch_id: batch.id,
            tenant_id: batch.tenant_id,
            source: batch.source.clone(),
            status: batch.status,
            counters: batch.counters.clone(),
            error_message: batch.error_message.clone(),
            started_at: batch.started_at,
            completed_at: batch.completed_at,
            photo_jobs_pending: self.photos.as_ref().map(|p| p.pending()).unwrap_or(0),
            errors,
        })
    }
}

fn missing_id(wrap: fn(crate::error::StorageError) -> PipelineError) -> PipelineError {
    wrap(crate::error::StorageError::Backend {
        message: "storage did not assign an id".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::observability::MemoryActivityLog;
    use crate::storage::InMemoryStorage;

    fn orchestrator() -> (ImportOrchestrator, Arc<InMemoryStorage>, MemoryActivityLog) {
        let storage = Arc::new(InMemoryStorage::new());
        let activity = MemoryActivityLog::new();
        let orch = ImportOrchestrator::new(storage.clone(), Arc::new(activity.clone()));
        (orch, storage, activity)
    }

    fn payload(tenant: Uuid, external_id: &str) -> NormalizedPayload {
        let reference = format!("AP{}", external_id);
        normalize(&fixtures::feed_record(external_id, &reference), None, tenant, "vista")
    }

    #[tokio::test]
    async fn test_import_record_creates_owner_property_listing() {
        let (orch, storage, activity) = orchestrator();
        let tenant = Uuid::new_v4();
        let broker = Uuid::new_v4();
        let mut batch = orch.create_batch(tenant, "vista", Some(broker)).await.unwrap();

        let outcome = orch.import_record(&mut batch, payload(tenant, "1")).await.unwrap();
        let RecordOutcome::Created { property_id, listing_id, owner_id, possible_duplicate } = outcome else {
            panic!("expected a created record, got {:?}", outcome);
        };
        assert!(!possible_duplicate);

        let property = storage.get_property(property_id).await.unwrap().unwrap();
        assert_eq!(property.owner_id, Some(owner_id));
        let listing = storage.get_listing(listing_id).await.unwrap().unwrap();
        assert!(listing.is_canonical);
        assert_eq!(listing.import_batch_id, Some(batch.id));
        assert_eq!(
            storage.roles_for_property(property_id),
            vec![(broker, PropertyRole::OriginatingBroker)]
        );

        assert_eq!(batch.counters.total_records, 1);
        assert_eq!(batch.counters.properties_created, 1);
        assert_eq!(batch.counters.listings_created, 1);
        assert_eq!(batch.counters.owners_placeholder, 1);
        assert_eq!(activity.named("property_imported").len(), 1);
    }

    #[tokio::test]
    async fn test_system_actor_gets_no_role() {
        let (orch, storage, _) = orchestrator();
        let tenant = Uuid::new_v4();
        let mut batch = orch.create_batch(tenant, "vista", Some(Uuid::nil())).await.unwrap();

        let outcome = orch.import_record(&mut batch, payload(tenant, "1")).await.unwrap();
        if let RecordOutcome::Created { property_id, .. } = outcome {
            assert!(storage.roles_for_property(property_id).is_empty());
        } else {
            panic!("expected a created record");
        }
    }

    #[tokio::test]
    async fn test_duplicate_writes_nothing() {
        let (orch, storage, activity) = orchestrator();
        let tenant = Uuid::new_v4();
        let mut batch = orch.create_batch(tenant, "vista", None).await.unwrap();

        orch.import_record(&mut batch, payload(tenant, "1")).await.unwrap();
        let again = orch.import_record(&mut batch, payload(tenant, "1")).await.unwrap();

        assert!(matches!(again, RecordOutcome::MatchedExisting { property_id: Some(_) }));
        assert_eq!(batch.counters.matched_existing, 1);
        assert_eq!(storage.count_properties(tenant).await.unwrap(), 1);
        assert_eq!(storage.count_owners(tenant).await.unwrap(), 1);
        assert_eq!(activity.named("matched_existing").len(), 1);
    }

    #[tokio::test]
    async fn test_log_error_counts_and_persists() {
        let (orch, storage, activity) = orchestrator();
        let mut batch = orch.create_batch(Uuid::new_v4(), "vista", None).await.unwrap();

        orch.log_error(
            &mut batch,
            ErrorKind::PropertyPersistFailed,
            "constraint",
            serde_json::json!({"external_id": "1"}),
        )
        .await;

        assert_eq!(batch.counters.errors, 1);
        let errors = storage.import_errors_for_batch(batch.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].raw_data["external_id"], "1");
        assert_eq!(activity.named("record_failed").len(), 1);
    }

    #[tokio::test]
    async fn test_batch_seals_once() {
        let (orch, storage, activity) = orchestrator();
        let mut batch = orch.create_batch(Uuid::new_v4(), "vista", None).await.unwrap();

        orch.complete_batch(&mut batch).await.unwrap();
        orch.fail_batch(&mut batch, &PipelineError::Cancelled).await.unwrap();

        let stored = storage.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(activity.named("batch_sealed").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_fails_batch() {
        let (orch, storage, _) = orchestrator();
        let request = ImportRequest {
            tenant_id: Uuid::new_v4(),
            source: "vista".to_string(),
            created_by: None,
            feed: b"<Carga><Imovel><CodigoImovel>1</CodigoImovel>".to_vec(),
            enrichment: None,
        };

        let summary = orch.run(&request).await.unwrap();
        assert_eq!(summary.status, BatchStatus::Failed);
        assert!(summary.error_message.unwrap().contains("malformed"));
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::FeedMalformed);
        assert_eq!(summary.errors[0].raw_data["scope"], "batch");
        // the batch failure is audited, not counted as a failed record
        assert_eq!(summary.counters.errors, 0);
        assert_eq!(storage.count_properties(request.tenant_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_batch() {
        let (orch, _, _) = orchestrator();
        orch.cancellation_token().cancel();
        let request = ImportRequest {
            tenant_id: Uuid::new_v4(),
            source: "vista".to_string(),
            created_by: None,
            feed: b"<Carga><Imovel><CodigoImovel>1</CodigoImovel></Imovel></Carga>".to_vec(),
            enrichment: None,
        };

        let summary = orch.run(&request).await.unwrap();
        assert_eq!(summary.status, BatchStatus::Failed);
        assert_eq!(summary.counters.total_records, 0);
    }
}
