use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::traits::{Storage, StorageResult};
use crate::domain::*;
use crate::error::StorageError;

/// In-memory storage implementation for dry runs and tests
pub struct InMemoryStorage {
    properties: Arc<Mutex<HashMap<Uuid, Property>>>,
    owners: Arc<Mutex<HashMap<Uuid, Owner>>>,
    listings: Arc<Mutex<HashMap<Uuid, Listing>>>,
    roles: Arc<Mutex<Vec<(Uuid, Uuid, PropertyRole)>>>,
    batches: Arc<Mutex<HashMap<Uuid, ImportBatch>>>,
    import_errors: Arc<Mutex<Vec<ImportErrorRecord>>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            properties: Arc::new(Mutex::new(HashMap::new())),
            owners: Arc::new(Mutex::new(HashMap::new())),
            listings: Arc::new(Mutex::new(HashMap::new())),
            roles: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(HashMap::new())),
            import_errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Roles recorded against a property
    pub fn roles_for_property(&self, property_id: Uuid) -> Vec<(Uuid, PropertyRole)> {
        lock(&self.roles)
            .map(|roles| {
                roles
                    .iter()
                    .filter(|(p, _, _)| *p == property_id)
                    .map(|(_, user, role)| (*user, *role))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_properties(&self, tenant_id: Uuid) -> Vec<Property> {
        let mut out: Vec<Property> = lock(&self.properties)
            .map(|m| m.values().filter(|p| p.tenant_id == tenant_id).cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|p| p.created_at);
        out
    }

    pub fn all_owners(&self, tenant_id: Uuid) -> Vec<Owner> {
        let mut out: Vec<Owner> = lock(&self.owners)
            .map(|m| m.values().filter(|o| o.tenant_id == tenant_id).cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|o| o.created_at);
        out
    }
}

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock().map_err(|e| StorageError::Backend {
        message: format!("in-memory store lock poisoned: {}", e),
    })
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_property(&self, property: &mut Property) -> StorageResult<()> {
        let mut properties = lock(&self.properties)?;

        if let Some((source, external_id)) = property.external_key() {
            let taken = properties.values().any(|p| {
                p.tenant_id == property.tenant_id
                    && p.external_source == source
                    && p.external_id == external_id
            });
            if taken {
                return Err(StorageError::Conflict(format!(
                    "property {}:{} already exists for tenant {}",
                    source, external_id, property.tenant_id
                )));
            }
        }

        let id = Uuid::new_v4();
        property.id = Some(id);
        properties.insert(id, property.clone());

        debug!("Created property: {} with id {}", property.reference, id);
        Ok(())
    }

    async fn get_property(&self, property_id: Uuid) -> StorageResult<Option<Property>> {
        Ok(lock(&self.properties)?.get(&property_id).cloned())
    }

    async fn update_property(&self, property_id: Uuid, patch: PropertyPatch) -> StorageResult<Property> {
        let mut properties = lock(&self.properties)?;
        let property = properties
            .get_mut(&property_id)
            .ok_or_else(|| StorageError::NotFound(format!("property {}", property_id)))?;
        patch.apply(property);
        Ok(property.clone())
    }

    async fn find_property_by_external_key(
        &self,
        tenant_id: Uuid,
        external_source: &str,
        external_id: &str,
    ) -> StorageResult<Option<Property>> {
        let properties = lock(&self.properties)?;
        Ok(properties
            .values()
            .find(|p| {
                p.tenant_id == tenant_id
                    && p.external_source == external_source
                    && p.external_id == external_id
            })
            .cloned())
    }

    async fn find_property_by_fingerprint(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
    ) -> StorageResult<Option<Property>> {
        let properties = lock(&self.properties)?;
        // Oldest match first, like the SQL backend
        Ok(properties
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.fingerprint == fingerprint)
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn count_properties(&self, tenant_id: Uuid) -> StorageResult<usize> {
        Ok(lock(&self.properties)?.values().filter(|p| p.tenant_id == tenant_id).count())
    }

    async fn create_owner(&self, owner: &mut Owner) -> StorageResult<()> {
        let id = Uuid::new_v4();
        owner.id = Some(id);
        lock(&self.owners)?.insert(id, owner.clone());

        debug!("Created owner: {} with id {}", owner.name, id);
        Ok(())
    }

    async fn get_owner(&self, owner_id: Uuid) -> StorageResult<Option<Owner>> {
        Ok(lock(&self.owners)?.get(&owner_id).cloned())
    }

    async fn update_owner(&self, owner_id: Uuid, patch: OwnerPatch) -> StorageResult<Owner> {
        let mut owners = lock(&self.owners)?;
        let owner = owners
            .get_mut(&owner_id)
            .ok_or_else(|| StorageError::NotFound(format!("owner {}", owner_id)))?;
        patch.apply(owner);
        Ok(owner.clone())
    }

    async fn count_owners(&self, tenant_id: Uuid) -> StorageResult<usize> {
        Ok(lock(&self.owners)?.values().filter(|o| o.tenant_id == tenant_id).count())
    }

    async fn create_listing(&self, listing: &mut Listing) -> StorageResult<()> {
        let id = Uuid::new_v4();
        listing.id = Some(id);
        lock(&self.listings)?.insert(id, listing.clone());

        debug!("Created listing {} for property {}", id, listing.property_id);
        Ok(())
    }

    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>> {
        Ok(lock(&self.listings)?.get(&listing_id).cloned())
    }

    async fn listings_for_property(&self, property_id: Uuid) -> StorageResult<Vec<Listing>> {
        let mut out: Vec<Listing> = lock(&self.listings)?
            .values()
            .filter(|l| l.property_id == property_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }

    async fn update_listing(&self, listing_id: Uuid, patch: ListingPatch) -> StorageResult<Listing> {
        let mut listings = lock(&self.listings)?;
        let listing = listings
            .get_mut(&listing_id)
            .ok_or_else(|| StorageError::NotFound(format!("listing {}", listing_id)))?;
        patch.apply(listing);
        Ok(listing.clone())
    }

    async fn set_canonical_listing(&self, property_id: Uuid, listing_id: Uuid) -> StorageResult<()> {
        let mut listings = lock(&self.listings)?;
        if !listings.get(&listing_id).map(|l| l.property_id == property_id).unwrap_or(false) {
            return Err(StorageError::NotFound(format!(
                "listing {} for property {}",
                listing_id, property_id
            )));
        }
        for listing in listings.values_mut().filter(|l| l.property_id == property_id) {
            listing.is_canonical = listing.id == Some(listing_id);
        }
        Ok(())
    }

    async fn add_property_role(&self, property_id: Uuid, user_id: Uuid, role: PropertyRole) -> StorageResult<()> {
        let mut roles = lock(&self.roles)?;
        if !roles.contains(&(property_id, user_id, role)) {
            roles.push((property_id, user_id, role));
        }
        Ok(())
    }

    async fn create_batch(&self, batch: &ImportBatch) -> StorageResult<()> {
        lock(&self.batches)?.insert(batch.id, batch.clone());
        debug!("Created import batch {}", batch.id);
        Ok(())
    }

    async fn update_batch(&self, batch: &ImportBatch) -> StorageResult<()> {
        let mut batches = lock(&self.batches)?;
        if !batches.contains_key(&batch.id) {
            return Err(StorageError::NotFound(format!("batch {}", batch.id)));
        }
        batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StorageResult<Option<ImportBatch>> {
        Ok(lock(&self.batches)?.get(&batch_id).cloned())
    }

    async fn append_import_error(&self, error: &ImportErrorRecord) -> StorageResult<()> {
        lock(&self.import_errors)?.push(error.clone());
        Ok(())
    }

    async fn import_errors_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportErrorRecord>> {
        Ok(lock(&self.import_errors)?
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect())
    }
}
