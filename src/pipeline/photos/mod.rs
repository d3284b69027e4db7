// Photo renditions: download, resize, upload, and the supervised job queue

pub mod blob;
pub mod fetcher;
pub mod pool;
pub mod renderer;

pub use blob::{rendition_key, BlobStore, FsBlobStore, InMemoryBlobStore};
pub use fetcher::PhotoFetcher;
pub use pool::{PhotoError, PhotoJob, PhotoJobReport, PhotoWorkerPool};
pub use renderer::{PhotoFailure, PhotoRenderer, RenditionSize};
