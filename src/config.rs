use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};

pub const CONFIG_ENV_VAR: &str = "REALTY_IMPORT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub blob: BlobConfig,
    pub photos: PhotoConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("data/realty_import.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Directory renditions are written under
    pub root: PathBuf,
    /// Public URL prefix the stored keys are served from
    pub public_base_url: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/blobs"),
            public_base_url: "http://localhost:8080/media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhotoConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub max_bytes: usize,
    /// Photos of one property rendered at the same time
    pub max_parallel_photos: usize,
    /// Property jobs running at the same time
    pub max_concurrent_jobs: usize,
    pub jpeg_quality: u8,
    /// Drain outstanding photo jobs before sealing a batch as completed
    pub await_before_complete: bool,
    pub user_agent: String,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30,
            max_bytes: 20 * 1024 * 1024,
            max_parallel_photos: 4,
            max_concurrent_jobs: 4,
            jpeg_quality: 85,
            await_before_complete: true,
            user_agent: format!("realty-import/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub default_filter: String,
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "realty-import.log".to_string(),
            default_filter: "realty_import=info".to_string(),
            file_output: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, `REALTY_IMPORT_CONFIG`, or
    /// `config.toml`, in that order. Only a missing default file falls back
    /// to built-in defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_ENV_VAR) {
                Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
                _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        if !required && !path.exists() {
            info!("No {} found, using default configuration", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.photos.max_parallel_photos == 0 || self.photos.max_concurrent_jobs == 0 {
            return Err(PipelineError::Config(
                "photos.max_parallel_photos and photos.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.photos.jpeg_quality) {
            return Err(PipelineError::Config(format!(
                "photos.jpeg_quality must be within 1..=100, got {}",
                self.photos.jpeg_quality
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.photos.timeout_seconds, 30);
        assert_eq!(config.photos.jpeg_quality, 85);
        assert!(config.photos.await_before_complete);
        assert_eq!(config.logging.default_filter, "realty_import=info");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [storage]
            backend = "memory"

            [photos]
            max_parallel_photos = 8
            await_before_complete = false
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.photos.max_parallel_photos, 8);
        assert!(!config.photos.await_before_complete);
        assert_eq!(config.photos.max_concurrent_jobs, 4);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_toml("[photos]\nmax_parallel_photos = 0"),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[storage]\nbackend = \"postgres\""),
            Err(PipelineError::Toml(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(Config::load(Some(&missing)), Err(PipelineError::Config(_))));
    }
}
