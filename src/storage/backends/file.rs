//! Filesystem object store for local runs
//!
//! Object keys map to relative paths under a base directory. Writes go to a
//! temporary sibling first and are renamed into place, so readers never see
//! a torn blob from this backend.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::storage::{
    error::{StorageError, StorageResult},
    traits::ObjectStore,
};

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    base_dir: PathBuf,
}

impl FileObjectStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub async fn new(base_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key to a path, rejecting keys that escape the base directory
    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::configuration(format!(
                "Invalid object key: {:?}",
                key
            )));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        debug!("Wrote object {} ({} bytes)", key, body.len());
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base_dir = self.base_dir.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&base_dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base_dir) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) && !key.contains(".tmp-") {
                    keys.push(key);
                }
            }
            keys.sort();
            keys
        })
        .await
        .map_err(|e| StorageError::Other(anyhow::anyhow!("List task failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(temp_dir.path()).await.unwrap();

        assert!(store.get("arr/expression/0").await.unwrap().is_none());
        store.put("arr/expression/0", vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            store.get("arr/expression/0").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(store.exists("arr/expression/0").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_uses_slash_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(temp_dir.path()).await.unwrap();

        store.put("a.zarr/expression/0", vec![0]).await.unwrap();
        store.put("a.zarr/expression/1", vec![0]).await.unwrap();
        store.put("b.zarr/expression/0", vec![0]).await.unwrap();

        let keys = store.list("a.zarr/").await.unwrap();
        assert_eq!(keys, vec!["a.zarr/expression/0", "a.zarr/expression/1"]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(temp_dir.path()).await.unwrap();

        assert!(store.put("../outside", vec![1]).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(temp_dir.path()).await.unwrap();
        store.delete("nothing/here").await.unwrap();
    }
}
