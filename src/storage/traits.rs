use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::*;
use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage trait for persisting imported data (properties, owners, listings,
/// import batches and their error audit). Every lookup is tenant-scoped.
#[async_trait]
pub trait Storage: Send + Sync {
    // Property operations
    async fn create_property(&self, property: &mut Property) -> StorageResult<()>;
    async fn get_property(&self, property_id: Uuid) -> StorageResult<Option<Property>>;
    async fn update_property(&self, property_id: Uuid, patch: PropertyPatch) -> StorageResult<Property>;
    async fn find_property_by_external_key(
        &self,
        tenant_id: Uuid,
        external_source: &str,
        external_id: &str,
    ) -> StorageResult<Option<Property>>;
    async fn find_property_by_fingerprint(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
    ) -> StorageResult<Option<Property>>;
    async fn count_properties(&self, tenant_id: Uuid) -> StorageResult<usize>;

    // Owner operations
    async fn create_owner(&self, owner: &mut Owner) -> StorageResult<()>;
    async fn get_owner(&self, owner_id: Uuid) -> StorageResult<Option<Owner>>;
    async fn update_owner(&self, owner_id: Uuid, patch: OwnerPatch) -> StorageResult<Owner>;
    async fn count_owners(&self, tenant_id: Uuid) -> StorageResult<usize>;

    // Listing operations
    async fn create_listing(&self, listing: &mut Listing) -> StorageResult<()>;
    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>>;
    async fn listings_for_property(&self, property_id: Uuid) -> StorageResult<Vec<Listing>>;
    async fn update_listing(&self, listing_id: Uuid, patch: ListingPatch) -> StorageResult<Listing>;
    /// Make `listing_id` the only canonical listing of `property_id`
    async fn set_canonical_listing(&self, property_id: Uuid, listing_id: Uuid) -> StorageResult<()>;

    async fn add_property_role(&self, property_id: Uuid, user_id: Uuid, role: PropertyRole) -> StorageResult<()>;

    // Batch operations
    async fn create_batch(&self, batch: &ImportBatch) -> StorageResult<()>;
    async fn update_batch(&self, batch: &ImportBatch) -> StorageResult<()>;
    async fn get_batch(&self, batch_id: Uuid) -> StorageResult<Option<ImportBatch>>;

    async fn append_import_error(&self, error: &ImportErrorRecord) -> StorageResult<()>;
    async fn import_errors_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportErrorRecord>>;
}
