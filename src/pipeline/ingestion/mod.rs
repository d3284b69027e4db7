// Ingestion: decoding the feed and the enrichment export

pub mod enrichment;
pub mod feed;

pub use enrichment::{normalize_header, ColumnIndex, EnrichmentIndex, EnrichmentRecord, MatchKey};
pub use feed::{parse_feed, FeedRecord};
