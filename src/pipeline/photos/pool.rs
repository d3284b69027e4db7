use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::renderer::{PhotoFailure, PhotoRenderer};
use crate::domain::{ImportErrorRecord, ListingPatch, Photo};
use crate::error::ErrorKind;
use crate::observability::metrics;
use crate::storage::Storage;

/// Photo work for one listing
#[derive(Debug, Clone)]
pub struct PhotoJob {
    pub batch_id: Uuid,
    pub tenant_id: Uuid,
    pub property_id: Uuid,
    pub listing_id: Uuid,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoError {
    pub url: String,
    pub order: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PhotoFailure> for PhotoError {
    fn from(failure: &PhotoFailure) -> Self {
        Self {
            url: failure.url.clone(),
            order: failure.order,
            kind: failure.error.kind(),
            message: failure.error.to_string(),
        }
    }
}

/// What happened to one job, sent back to whoever drains the pool
#[derive(Debug, Clone, Serialize)]
pub struct PhotoJobReport {
    pub batch_id: Uuid,
    pub property_id: Uuid,
    pub listing_id: Uuid,
    pub rendered: usize,
    pub failed: usize,
    pub errors: Vec<PhotoError>,
    pub listing_updated: bool,
    pub cancelled: bool,
}

/// Supervised queue for photo jobs.
///
/// Jobs run detached from the import loop but are tracked: `drain` waits for
/// every submitted job and hands back their reports, so a batch can fold photo
/// outcomes into its counters before it is sealed.
pub struct PhotoWorkerPool {
    renderer: Arc<PhotoRenderer>,
    storage: Arc<dyn Storage>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PhotoJobReport>,
    rx: Mutex<mpsc::UnboundedReceiver<PhotoJobReport>>,
}

impl PhotoWorkerPool {
    pub fn new(
        renderer: Arc<PhotoRenderer>,
        storage: Arc<dyn Storage>,
        max_concurrent_jobs: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            renderer,
            storage,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            cancel,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue a job. Returns immediately; the job waits for a free slot.
    pub fn submit(&self, job: PhotoJob) {
        let renderer = self.renderer.clone();
        let storage = self.storage.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();

        debug!("Queued {} photos for listing {}", job.urls.len(), job.listing_id);
        self.tracker.spawn(async move {
            let report = tokio::select! {
                _ = cancel.cancelled() => cancelled_report(&job),
                permit = permits.acquire_owned() => match permit {
                    Ok(_permit) => tokio::select! {
                        _ = cancel.cancelled() => cancelled_report(&job),
                        report = run_job(&renderer, storage.as_ref(), &job) => report,
                    },
                    Err(_) => cancelled_report(&job),
                },
            };
            if tx.send(report).is_err() {
                warn!("Photo report for listing {} dropped: pool is gone", job.listing_id);
            }
        });
    }

    /// Jobs submitted and not finished yet
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every submitted job and return the reports collected since
    /// the last drain. The pool accepts new jobs afterwards.
    pub async fn drain(&self) -> Vec<PhotoJobReport> {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let mut reports = Vec::new();
        if let Ok(mut rx) = self.rx.lock() {
            while let Ok(report) = rx.try_recv() {
                reports.push(report);
            }
        }
        reports
    }
}

fn cancelled_report(job: &PhotoJob) -> PhotoJobReport {
    PhotoJobReport {
        batch_id: job.batch_id,
        property_id: job.property_id,
        listing_id: job.listing_id,
        rendered: 0,
        failed: 0,
        errors: Vec::new(),
        listing_updated: false,
        cancelled: true,
    }
}

async fn run_job(renderer: &PhotoRenderer, storage: &dyn Storage, job: &PhotoJob) -> PhotoJobReport {
    let started = Instant::now();
    let (renditions, failures) = renderer.render(job.tenant_id, job.property_id, &job.urls).await;

    // Failed photos keep their placeholder entry at the original position
    let mut photos: Vec<Photo> = job
        .urls
        .iter()
        .enumerate()
        .map(|(order, url)| Photo::degenerate(url, order as u32))
        .collect();
    for rendered in &renditions {
        if let Some(slot) = photos.get_mut(rendered.order as usize) {
            *slot = rendered.clone();
        }
    }

    let listing_updated = if renditions.is_empty() {
        false
    } else {
        match storage
            .update_listing(job.listing_id, ListingPatch::new().photos(photos))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to store rendered photos on listing {}: {}", job.listing_id, e);
                false
            }
        }
    };

    let errors: Vec<PhotoError> = failures.iter().map(PhotoError::from).collect();
    for error in &errors {
        let record = ImportErrorRecord::new(
            job.batch_id,
            error.kind,
            error.message.clone(),
            serde_json::json!({
                "url": error.url,
                "order": error.order,
                "listing_id": job.listing_id,
                "property_id": job.property_id,
            }),
        );
        if let Err(e) = storage.append_import_error(&record).await {
            warn!("Failed to record photo error for listing {}: {}", job.listing_id, e);
        }
    }

    metrics::photos::job_duration(started.elapsed().as_secs_f64());
    info!(
        "🖼️ Listing {}: {} photos rendered, {} failed",
        job.listing_id,
        renditions.len(),
        errors.len()
    );

    PhotoJobReport {
        batch_id: job.batch_id,
        property_id: job.property_id,
        listing_id: job.listing_id,
        rendered: renditions.len(),
        failed: errors.len(),
        errors,
        listing_updated,
        cancelled: false,
    }
}
