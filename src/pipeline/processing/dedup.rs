use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::Property;
use crate::error::{PipelineError, Result};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    ExternalId,
    Fingerprint,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExternalId => "external_id",
            MatchType::Fingerprint => "fingerprint",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Same external key already stored: the record must not be written again
    pub is_duplicate: bool,
    /// Address/type/area coincidence: stored, but flagged for review
    pub possible_duplicate: bool,
    pub match_type: Option<MatchType>,
    pub existing: Option<Property>,
}

impl DedupOutcome {
    pub fn is_novel(&self) -> bool {
        self.match_type.is_none()
    }
}

/// Decides whether a normalized property is already known to the tenant
pub struct DedupEngine {
    storage: Arc<dyn Storage>,
}

impl DedupEngine {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// External key first, fingerprint second. Lookup failures are reported
    /// as `DeduplicationLookupFailed`, which aborts the batch.
    pub async fn check(&self, tenant_id: Uuid, property: &Property) -> Result<DedupOutcome> {
        if let Some((source, external_id)) = property.external_key() {
            let hit = self
                .storage
                .find_property_by_external_key(tenant_id, source, external_id)
                .await
                .map_err(PipelineError::DeduplicationLookupFailed)?;
            if let Some(existing) = hit {
                debug!("External key {}:{} already imported", source, external_id);
                return Ok(DedupOutcome {
                    is_duplicate: true,
                    possible_duplicate: false,
                    match_type: Some(MatchType::ExternalId),
                    existing: Some(existing),
                });
            }
        }

        let hit = self
            .storage
            .find_property_by_fingerprint(tenant_id, &property.fingerprint)
            .await
            .map_err(PipelineError::DeduplicationLookupFailed)?;
        if let Some(existing) = hit {
            debug!("Fingerprint {} matches property {:?}", property.fingerprint, existing.id);
            return Ok(DedupOutcome {
                is_duplicate: false,
                possible_duplicate: true,
                match_type: Some(MatchType::Fingerprint),
                existing: Some(existing),
            });
        }

        Ok(DedupOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_novel_property() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DedupEngine::new(storage);
        let tenant = Uuid::new_v4();

        let outcome = engine.check(tenant, &fixtures::property(tenant, "1")).await.unwrap();
        assert!(outcome.is_novel());
        assert!(!outcome.is_duplicate);
        assert!(!outcome.possible_duplicate);
    }

    #[tokio::test]
    async fn test_external_key_wins_over_fingerprint() {
        let storage = Arc::new(InMemoryStorage::new());
        let tenant = Uuid::new_v4();
        let mut stored = fixtures::property(tenant, "1");
        storage.create_property(&mut stored).await.unwrap();

        let engine = DedupEngine::new(storage);
        let outcome = engine.check(tenant, &fixtures::property(tenant, "1")).await.unwrap();
        assert!(outcome.is_duplicate);
        assert!(!outcome.possible_duplicate);
        assert_eq!(outcome.match_type, Some(MatchType::ExternalId));
        assert_eq!(outcome.existing.and_then(|p| p.id), stored.id);
    }

    #[tokio::test]
    async fn test_fingerprint_match_is_only_possible_duplicate() {
        let storage = Arc::new(InMemoryStorage::new());
        let tenant = Uuid::new_v4();
        let mut stored = fixtures::property(tenant, "1");
        storage.create_property(&mut stored).await.unwrap();

        let engine = DedupEngine::new(storage);
        let outcome = engine.check(tenant, &fixtures::property(tenant, "2")).await.unwrap();
        assert!(!outcome.is_duplicate);
        assert!(outcome.possible_duplicate);
        assert_eq!(outcome.match_type, Some(MatchType::Fingerprint));
    }

    #[tokio::test]
    async fn test_lookups_are_tenant_scoped() {
        let storage = Arc::new(InMemoryStorage::new());
        let tenant = Uuid::new_v4();
        let mut stored = fixtures::property(tenant, "1");
        storage.create_property(&mut stored).await.unwrap();

        let other = Uuid::new_v4();
        let engine = DedupEngine::new(storage);
        let outcome = engine.check(other, &fixtures::property(other, "1")).await.unwrap();
        assert!(outcome.is_novel());
    }

    #[tokio::test]
    async fn test_missing_external_id_falls_back_to_fingerprint() {
        let storage = Arc::new(InMemoryStorage::new());
        let tenant = Uuid::new_v4();
        let mut stored = fixtures::property(tenant, "1");
        storage.create_property(&mut stored).await.unwrap();

        let engine = DedupEngine::new(storage);
        let outcome = engine.check(tenant, &fixtures::property(tenant, "")).await.unwrap();
        assert_eq!(outcome.match_type, Some(MatchType::Fingerprint));
    }
}
