use futures::stream::{self, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::blob::{rendition_key, BlobStore};
use super::fetcher::PhotoFetcher;
use crate::domain::Photo;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionSize {
    Thumb,
    Medium,
    Large,
}

impl RenditionSize {
    pub const ALL: [RenditionSize; 3] = [RenditionSize::Thumb, RenditionSize::Medium, RenditionSize::Large];

    /// Bounding box the rendition must fit in
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            RenditionSize::Thumb => (320, 240),
            RenditionSize::Medium => (800, 600),
            RenditionSize::Large => (1600, 1200),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionSize::Thumb => "thumb",
            RenditionSize::Medium => "medium",
            RenditionSize::Large => "large",
        }
    }
}

/// One photo that could not be rendered
#[derive(Debug)]
pub struct PhotoFailure {
    pub url: String,
    pub order: u32,
    pub error: PipelineError,
}

/// Downloads, resizes and uploads the photos of one property
pub struct PhotoRenderer {
    fetcher: PhotoFetcher,
    blobs: Arc<dyn BlobStore>,
    max_parallel_photos: usize,
    jpeg_quality: u8,
}

impl PhotoRenderer {
    pub fn new(fetcher: PhotoFetcher, blobs: Arc<dyn BlobStore>, max_parallel_photos: usize, jpeg_quality: u8) -> Self {
        Self {
            fetcher,
            blobs,
            max_parallel_photos: max_parallel_photos.max(1),
            jpeg_quality,
        }
    }

    /// Render every URL independently. Successful photos come back sorted by
    /// their feed order; a failure affects only its own photo.
    pub async fn render(
        &self,
        tenant_id: Uuid,
        property_id: Uuid,
        urls: &[String],
    ) -> (Vec<Photo>, Vec<PhotoFailure>) {
        // Owned URLs keep the stream future Send for the worker pool
        let results: Vec<(u32, String, Result<Photo>)> = stream::iter(urls.to_vec().into_iter().enumerate())
            .map(|(order, url)| async move {
                let order = order as u32;
                let result = self.render_one(tenant_id, property_id, order, &url).await;
                (order, url, result)
            })
            .buffer_unordered(self.max_parallel_photos)
            .boxed()
            .collect()
            .await;

        let mut renditions = Vec::new();
        let mut failures = Vec::new();
        for (order, url, result) in results {
            match result {
                Ok(photo) => {
                    metrics::photos::rendered();
                    renditions.push(photo);
                }
                Err(error) => {
                    warn!("Photo {} of property {} failed: {}", order, property_id, error);
                    metrics::photos::failed(error.kind().as_str());
                    failures.push(PhotoFailure {
                        url,
                        order,
                        error,
                    });
                }
            }
        }
        renditions.sort_by_key(|p| p.order);
        failures.sort_by_key(|f| f.order);
        (renditions, failures)
    }

    async fn render_one(&self, tenant_id: Uuid, property_id: Uuid, order: u32, url: &str) -> Result<Photo> {
        let bytes = self.fetcher.fetch(url).await?;

        let quality = self.jpeg_quality;
        let source = url.to_string();
        let encoded = tokio::task::spawn_blocking(move || encode_renditions(&bytes, quality))
            .await
            .map_err(|e| PipelineError::PhotoDecodeFailed {
                url: source.clone(),
                reason: format!("render task failed: {}", e),
            })?
            .map_err(|reason| PipelineError::PhotoDecodeFailed { url: source, reason })?;

        let mut urls = Vec::with_capacity(encoded.len());
        for (size, jpeg) in encoded {
            let key = rendition_key(&tenant_id, &property_id, order, size.as_str());
            let stored = self
                .blobs
                .put(&key, jpeg, "image/jpeg")
                .await
                .map_err(|e| PipelineError::PhotoUploadFailed {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            urls.push(stored);
        }

        let [thumb_url, medium_url, large_url]: [String; 3] = urls.try_into().map_err(|_| {
            PipelineError::PhotoUploadFailed {
                key: rendition_key(&tenant_id, &property_id, order, "*"),
                reason: "missing rendition".to_string(),
            }
        })?;

        debug!("Rendered photo {} of property {}", order, property_id);
        Ok(Photo {
            original_url: url.to_string(),
            thumb_url,
            medium_url,
            large_url,
            order,
            is_cover: order == 0,
        })
    }
}

/// Decode once and produce a JPEG for every rendition size
pub fn encode_renditions(bytes: &[u8], quality: u8) -> std::result::Result<Vec<(RenditionSize, Vec<u8>)>, String> {
    let image = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    RenditionSize::ALL
        .iter()
        .map(|size| {
            let resized = fit_within(&image, size.bounds());
            encode_jpeg(&resized, quality).map(|jpeg| (*size, jpeg))
        })
        .collect()
}

/// Shrink to fit the bounds keeping the aspect ratio. Never upscales.
fn fit_within(image: &DynamicImage, (max_w, max_h): (u32, u32)) -> DynamicImage {
    if image.width() <= max_w && image.height() <= max_h {
        image.clone()
    } else {
        image.resize(max_w, max_h, FilterType::Lanczos3)
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> std::result::Result<Vec<u8>, String> {
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| e.to_string())?;
    Ok(out)
}
