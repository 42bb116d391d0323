//! S3 object store

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::S3Config;
use crate::storage::{
    error::{StorageError, StorageResult},
    traits::ObjectStore,
};

/// S3-backed object store
pub struct S3ObjectStore {
    client: Arc<Client>,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create new S3 object store
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        info!("Initializing S3 object store for bucket {}", config.bucket);

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        // Test connection
        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .map_err(|e| StorageError::connection(format!("Failed to access S3 bucket: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            config: config.clone(),
        })
    }

    /// Make an S3 key
    fn make_key(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), key)
        }
    }

    fn strip_key<'a>(&self, full: &'a str) -> &'a str {
        if self.config.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(self.config.prefix.trim_end_matches('/'))
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full)
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let s3_key = self.make_key(key);
        debug!("Fetching object {}", s3_key);

        match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(result) => {
                let bytes = result
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::unavailable(format!("Failed to read {}: {}", s3_key, e)))?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(StorageError::unavailable(format!(
                        "Failed to get {}: {}",
                        s3_key, e
                    )))
                }
            }
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        let s3_key = self.make_key(key);
        debug!("Writing object {} ({} bytes)", s3_key, body.len());

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&s3_key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("Failed to put {}: {}", s3_key, e)))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let s3_key = self.make_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(StorageError::unavailable(format!(
                        "Failed to head {}: {}",
                        s3_key, e
                    )))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let s3_prefix = self.make_key(prefix);
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(&s3_prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                StorageError::unavailable(format!("Failed to list {}: {}", s3_prefix, e))
            })?;
            for object in page.contents() {
                if let Some(full) = object.key() {
                    keys.push(self.strip_key(full).to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let s3_key = self.make_key(key);

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("Failed to delete {}: {}", s3_key, e)))?;

        Ok(())
    }
}
