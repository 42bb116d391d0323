use super::{ConfigError, ServiceConfig};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Loads `ServiceConfig` from disk and the environment
pub struct ConfigLoader {
    path: Option<PathBuf>,
    use_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            use_env: true,
        }
    }

    /// Read settings from this file (TOML, or YAML by extension)
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Skip `CELLMATRIX_*` overrides
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    pub async fn load(&self) -> Result<ServiceConfig, ConfigError> {
        let mut config = match &self.path {
            Some(path) => Self::read_file(path).await?,
            None => ServiceConfig::default(),
        };

        if self.use_env {
            config.merge_env_vars();
        }

        config.validate()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    async fn read_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");

        let parsed = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        } else {
            toml::from_str(&content).map_err(|e| e.to_string())
        };

        info!("Read configuration from {}", path.display());
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectBackend;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cellmatrix.toml");
        fs::write(
            &path,
            "[orchestrator]\nworker_chunk_rows = 500\nrequest_timeout = \"1h\"\n\n[backend.objects]\ntype = \"memory\"\n",
        )
        .await
        .unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .without_env()
            .load()
            .await
            .unwrap();

        assert_eq!(config.orchestrator.worker_chunk_rows, 500);
        assert_eq!(config.orchestrator.request_timeout, Duration::from_secs(3600));
        assert_eq!(config.backend.objects, ObjectBackend::Memory);
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cellmatrix.yaml");
        fs::write(&path, "array:\n  rows_per_chunk: 64\n")
            .await
            .unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .without_env()
            .load()
            .await
            .unwrap();
        assert_eq!(config.array.rows_per_chunk, 64);
    }

    #[tokio::test]
    async fn test_invalid_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[array\nrows_per_chunk = ").await.unwrap();

        let err = ConfigLoader::new()
            .with_file(&path)
            .without_env()
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/cellmatrix.toml")
            .without_env()
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
