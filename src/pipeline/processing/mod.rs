// Processing: per-record normalization, duplicate detection and owner resolution

pub mod dedup;
pub mod normalizer;
pub mod owner;

pub use dedup::{DedupEngine, DedupOutcome, MatchType};
pub use normalizer::{fingerprint, normalize, NormalizedPayload, OwnerPayload};
pub use owner::{OwnerResolver, ResolvedOwner};
