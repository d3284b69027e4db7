use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::normalizer::OwnerPayload;
use crate::domain::{Owner, OwnerStatus};
use crate::error::{PipelineError, Result};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOwner {
    pub owner_id: Uuid,
    pub enriched: bool,
    pub owner_status: OwnerStatus,
}

/// Persists owners for imported properties.
///
/// Every call to [`OwnerResolver::resolve`] creates a new owner row, even when
/// the same person shows up on several records. Merging owners is left to a
/// manual review step.
pub struct OwnerResolver {
    storage: Arc<dyn Storage>,
}

impl OwnerResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn resolve(&self, tenant_id: Uuid, payload: &OwnerPayload) -> Result<ResolvedOwner> {
        let mut owner = payload.clone().into_owner(tenant_id);
        self.storage
            .create_owner(&mut owner)
            .await
            .map_err(PipelineError::OwnerPersistFailed)?;

        let owner_id = owner.id.ok_or_else(|| {
            PipelineError::OwnerPersistFailed(crate::error::StorageError::Backend {
                message: "storage returned an owner without id".to_string(),
            })
        })?;

        debug!(
            "Resolved owner {} ({}) for {}",
            owner_id,
            payload.owner_status.as_str(),
            payload.source_reference
        );
        Ok(ResolvedOwner {
            owner_id,
            enriched: payload.enriched_from_xls,
            owner_status: payload.owner_status,
        })
    }

    /// Re-enrich an existing owner. Contact data only fills in or replaces
    /// with non-empty values and the status tier never goes down.
    pub async fn improve(&self, owner_id: Uuid, payload: &OwnerPayload) -> Result<Owner> {
        self.storage
            .update_owner(owner_id, payload.to_patch())
            .await
            .map_err(PipelineError::OwnerPersistFailed)
    }
}
