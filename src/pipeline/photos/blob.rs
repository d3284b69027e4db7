use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Where rendered photos are uploaded. Returns the public URL of the object.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<String>;
}

/// Object key for one rendition of one photo
pub fn rendition_key(tenant_id: &uuid::Uuid, property_id: &uuid::Uuid, order: u32, size: &str) -> String {
    format!(
        "tenants/{}/properties/{}/photos/{}/{}.jpg",
        tenant_id, property_id, order, size
    )
}

/// Writes objects below a root directory and serves them from a base URL
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("invalid blob key '{}'", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> anyhow::Result<String> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!("Stored blob {} ({} bytes)", key, bytes.len());
        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

/// Keeps objects in memory, for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).map(|(bytes, _)| bytes.clone()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<String> {
        self.objects
            .lock()
            .map_err(|e| anyhow::anyhow!("blob store lock poisoned: {}", e))?
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", key))
    }
}
