use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{Storage, StorageResult};
use crate::domain::*;
use crate::error::StorageError;

/// SQLite-backed storage. Each entity is kept as a JSON document next to the
/// columns that other components query by.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS properties (
        id              TEXT PRIMARY KEY,
        tenant_id       TEXT NOT NULL,
        external_source TEXT NOT NULL,
        external_id     TEXT NOT NULL,
        fingerprint     TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        data            TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_properties_external_key
        ON properties (tenant_id, external_source, external_id)
        WHERE external_source <> '' AND external_id <> '';
    CREATE INDEX IF NOT EXISTS idx_properties_fingerprint
        ON properties (tenant_id, fingerprint);

    CREATE TABLE IF NOT EXISTS owners (
        id          TEXT PRIMARY KEY,
        tenant_id   TEXT NOT NULL,
        data        TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS listings (
        id           TEXT PRIMARY KEY,
        tenant_id    TEXT NOT NULL,
        property_id  TEXT NOT NULL,
        is_canonical INTEGER NOT NULL DEFAULT 0,
        created_at   TEXT NOT NULL,
        data         TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_listings_property ON listings (property_id);

    CREATE TABLE IF NOT EXISTS property_roles (
        property_id TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        role        TEXT NOT NULL,
        PRIMARY KEY (property_id, user_id, role)
    );

    CREATE TABLE IF NOT EXISTS import_batches (
        id        TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        status    TEXT NOT NULL,
        data      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS import_errors (
        id         TEXT PRIMARY KEY,
        batch_id   TEXT NOT NULL,
        kind       TEXT NOT NULL,
        created_at TEXT NOT NULL,
        data       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_import_errors_batch ON import_errors (batch_id);
"#;

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend {
                message: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!("Opened SQLite storage at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| StorageError::Backend {
            message: format!("sqlite connection lock poisoned: {}", e),
        })
    }

    fn query_one<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Option<T>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        if let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&data)?))
        } else {
            Ok(None)
        }
    }

    fn query_all<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }

    fn count(conn: &Connection, sql: &str, tenant_id: Uuid) -> StorageResult<usize> {
        let n: i64 = conn.query_row(sql, params![tenant_id.to_string()], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn write_listing(conn: &Connection, listing: &Listing) -> StorageResult<()> {
        let id = listing.id.ok_or_else(|| StorageError::Backend {
            message: "cannot write listing without ID".to_string(),
        })?;
        conn.execute(
            "UPDATE listings SET is_canonical = ?2, data = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                listing.is_canonical as i64,
                serde_json::to_string(listing)?
            ],
        )?;
        Ok(())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_property(&self, property: &mut Property) -> StorageResult<()> {
        let id = Uuid::new_v4();
        property.id = Some(id);
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO properties (id, tenant_id, external_source, external_id, fingerprint, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                property.tenant_id.to_string(),
                property.external_source,
                property.external_id,
                property.fingerprint,
                property.created_at.to_rfc3339(),
                serde_json::to_string(property)?
            ],
        );
        match result {
            Ok(_) => {
                debug!("Created property: {} with id {}", property.reference, id);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                property.id = None;
                Err(StorageError::Conflict(format!(
                    "property {}:{} already exists for tenant {}",
                    property.external_source, property.external_id, property.tenant_id
                )))
            }
            Err(e) => {
                property.id = None;
                Err(e.into())
            }
        }
    }

    async fn get_property(&self, property_id: Uuid) -> StorageResult<Option<Property>> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT data FROM properties WHERE id = ?1", params![property_id.to_string()])
    }

    async fn update_property(&self, property_id: Uuid, patch: PropertyPatch) -> StorageResult<Property> {
        let conn = self.conn()?;
        let mut property: Property =
            Self::query_one(&conn, "SELECT data FROM properties WHERE id = ?1", params![property_id.to_string()])?
                .ok_or_else(|| StorageError::NotFound(format!("property {}", property_id)))?;
        patch.apply(&mut property);
        conn.execute(
            "UPDATE properties SET data = ?2 WHERE id = ?1",
            params![property_id.to_string(), serde_json::to_string(&property)?],
        )?;
        Ok(property)
    }

    async fn find_property_by_external_key(
        &self,
        tenant_id: Uuid,
        external_source: &str,
        external_id: &str,
    ) -> StorageResult<Option<Property>> {
        let conn = self.conn()?;
        Self::query_one(
            &conn,
            "SELECT data FROM properties WHERE tenant_id = ?1 AND external_source = ?2 AND external_id = ?3",
            params![tenant_id.to_string(), external_source, external_id],
        )
    }

    async fn find_property_by_fingerprint(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
    ) -> StorageResult<Option<Property>> {
        let conn = self.conn()?;
        Self::query_one(
            &conn,
            "SELECT data FROM properties WHERE tenant_id = ?1 AND fingerprint = ?2 ORDER BY created_at LIMIT 1",
            params![tenant_id.to_string(), fingerprint],
        )
    }

    async fn count_properties(&self, tenant_id: Uuid) -> StorageResult<usize> {
        let conn = self.conn()?;
        Self::count(&conn, "SELECT COUNT(*) FROM properties WHERE tenant_id = ?1", tenant_id)
    }

    async fn create_owner(&self, owner: &mut Owner) -> StorageResult<()> {
        let id = Uuid::new_v4();
        owner.id = Some(id);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO owners (id, tenant_id, data) VALUES (?1, ?2, ?3)",
            params![id.to_string(), owner.tenant_id.to_string(), serde_json::to_string(owner)?],
        )?;
        debug!("Created owner: {} with id {}", owner.name, id);
        Ok(())
    }

    async fn get_owner(&self, owner_id: Uuid) -> StorageResult<Option<Owner>> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT data FROM owners WHERE id = ?1", params![owner_id.to_string()])
    }

    async fn update_owner(&self, owner_id: Uuid, patch: OwnerPatch) -> StorageResult<Owner> {
        let conn = self.conn()?;
        let mut owner: Owner = Self::query_one(&conn, "SELECT data FROM owners WHERE id = ?1", params![owner_id.to_string()])?
            .ok_or_else(|| StorageError::NotFound(format!("owner {}", owner_id)))?;
        patch.apply(&mut owner);
        conn.execute(
            "UPDATE owners SET data = ?2 WHERE id = ?1",
            params![owner_id.to_string(), serde_json::to_string(&owner)?],
        )?;
        Ok(owner)
    }

    async fn count_owners(&self, tenant_id: Uuid) -> StorageResult<usize> {
        let conn = self.conn()?;
        Self::count(&conn, "SELECT COUNT(*) FROM owners WHERE tenant_id = ?1", tenant_id)
    }

    async fn create_listing(&self, listing: &mut Listing) -> StorageResult<()> {
        let id = Uuid::new_v4();
        listing.id = Some(id);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO listings (id, tenant_id, property_id, is_canonical, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                listing.tenant_id.to_string(),
                listing.property_id.to_string(),
                listing.is_canonical as i64,
                listing.created_at.to_rfc3339(),
                serde_json::to_string(listing)?
            ],
        )?;
        debug!("Created listing {} for property {}", id, listing.property_id);
        Ok(())
    }

    async fn get_listing(&self, listing_id: Uuid) -> StorageResult<Option<Listing>> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT data FROM listings WHERE id = ?1", params![listing_id.to_string()])
    }

    async fn listings_for_property(&self, property_id: Uuid) -> StorageResult<Vec<Listing>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT data FROM listings WHERE property_id = ?1 ORDER BY created_at",
            params![property_id.to_string()],
        )
    }

    async fn update_listing(&self, listing_id: Uuid, patch: ListingPatch) -> StorageResult<Listing> {
        let conn = self.conn()?;
        let mut listing: Listing =
            Self::query_one(&conn, "SELECT data FROM listings WHERE id = ?1", params![listing_id.to_string()])?
                .ok_or_else(|| StorageError::NotFound(format!("listing {}", listing_id)))?;
        patch.apply(&mut listing);
        Self::write_listing(&conn, &listing)?;
        Ok(listing)
    }

    async fn set_canonical_listing(&self, property_id: Uuid, listing_id: Uuid) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut listings: Vec<Listing> = Self::query_all(
            &tx,
            "SELECT data FROM listings WHERE property_id = ?1",
            params![property_id.to_string()],
        )?;
        if !listings.iter().any(|l| l.id == Some(listing_id)) {
            return Err(StorageError::NotFound(format!(
                "listing {} for property {}",
                listing_id, property_id
            )));
        }
        for listing in listings.iter_mut() {
            listing.is_canonical = listing.id == Some(listing_id);
            Self::write_listing(&tx, listing)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn add_property_role(&self, property_id: Uuid, user_id: Uuid, role: PropertyRole) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO property_roles (property_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![property_id.to_string(), user_id.to_string(), role.as_str()],
        )?;
        Ok(())
    }

    async fn create_batch(&self, batch: &ImportBatch) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO import_batches (id, tenant_id, status, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                batch.id.to_string(),
                batch.tenant_id.to_string(),
                serde_json::to_string(&batch.status)?,
                serde_json::to_string(batch)?
            ],
        )?;
        debug!("Created import batch {}", batch.id);
        Ok(())
    }

    async fn update_batch(&self, batch: &ImportBatch) -> StorageResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE import_batches SET status = ?2, data = ?3 WHERE id = ?1",
            params![
                batch.id.to_string(),
                serde_json::to_string(&batch.status)?,
                serde_json::to_string(batch)?
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("batch {}", batch.id)));
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StorageResult<Option<ImportBatch>> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT data FROM import_batches WHERE id = ?1", params![batch_id.to_string()])
    }

    async fn append_import_error(&self, error: &ImportErrorRecord) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO import_errors (id, batch_id, kind, created_at, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                error.id.to_string(),
                error.batch_id.to_string(),
                error.kind.as_str(),
                error.created_at.to_rfc3339(),
                serde_json::to_string(error)?
            ],
        )?;
        Ok(())
    }

    async fn import_errors_for_batch(&self, batch_id: Uuid) -> StorageResult<Vec<ImportErrorRecord>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT data FROM import_errors WHERE batch_id = ?1 ORDER BY created_at",
            params![batch_id.to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_external_key_is_unique_per_tenant() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();

        let mut first = fixtures::property(tenant, "77749175");
        storage.create_property(&mut first).await.unwrap();

        let mut again = fixtures::property(tenant, "77749175");
        let err = storage.create_property(&mut again).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(again.id.is_none());

        // Same key in another tenant is fine
        let mut other_tenant = fixtures::property(Uuid::new_v4(), "77749175");
        storage.create_property(&mut other_tenant).await.unwrap();

        // Empty external ids never collide
        let mut blank_a = fixtures::property(tenant, "");
        let mut blank_b = fixtures::property(tenant, "");
        storage.create_property(&mut blank_a).await.unwrap();
        storage.create_property(&mut blank_b).await.unwrap();
        assert_eq!(storage.count_properties(tenant).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lookup_by_fingerprint_and_key() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let mut property = fixtures::property(tenant, "123");
        storage.create_property(&mut property).await.unwrap();

        let by_key = storage
            .find_property_by_external_key(tenant, "vista", "123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, property.id);

        let by_fp = storage
            .find_property_by_fingerprint(tenant, &property.fingerprint)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_fp.id, property.id);

        assert!(storage
            .find_property_by_fingerprint(Uuid::new_v4(), &property.fingerprint)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_canonical_listing_is_exclusive() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("import.db")).unwrap();
        let tenant = Uuid::new_v4();
        let mut property = fixtures::property(tenant, "9");
        storage.create_property(&mut property).await.unwrap();
        let property_id = property.id.unwrap();

        let mut a = fixtures::listing(tenant, property_id);
        let mut b = fixtures::listing(tenant, property_id);
        storage.create_listing(&mut a).await.unwrap();
        storage.create_listing(&mut b).await.unwrap();

        storage.set_canonical_listing(property_id, a.id.unwrap()).await.unwrap();
        storage.set_canonical_listing(property_id, b.id.unwrap()).await.unwrap();

        let listings = storage.listings_for_property(property_id).await.unwrap();
        let canonical: Vec<_> = listings.iter().filter(|l| l.is_canonical).collect();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, b.id);

        let missing = storage.set_canonical_listing(property_id, Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_and_errors_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut batch = ImportBatch::new(Uuid::new_v4(), "vista", None);
        storage.create_batch(&batch).await.unwrap();

        batch.counters.properties_created = 4;
        batch.mark_completed();
        storage.update_batch(&batch).await.unwrap();

        let error = ImportErrorRecord::new(
            batch.id,
            crate::error::ErrorKind::OwnerPersistFailed,
            "disk full",
            serde_json::json!({"reference": "AP1"}),
        );
        storage.append_import_error(&error).await.unwrap();

        let loaded = storage.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Completed);
        assert_eq!(loaded.counters.properties_created, 4);

        let errors = storage.import_errors_for_batch(batch.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].raw_data["reference"], "AP1");
    }
}
