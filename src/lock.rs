//! Lease-based distributed lock over the key-value store
//!
//! A lock is a record in the `locks` table holding the current holder id and
//! an expiry. Acquiring polls until the record is absent, expired, or already
//! ours. Stealing an expired lease is a conditional update on the expired
//! holder, so two racers can never both take over the same stale record.
//! There is no fairness guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::retry::RetryPolicy;
use crate::storage::{
    record, Condition, KeyValueStore, Record, RecordExt, StorageError, Table, TableField,
};

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// The lease was lost before release: the critical section outlived its TTL
    #[error("Lock {key} is no longer held by {holder} (current holder: {current:?})")]
    HolderMismatch {
        key: String,
        holder: String,
        current: Option<String>,
    },

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fields of the `locks` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockField {
    Holder,
    AcquiredAt,
    ExpiresAt,
    Hostname,
}

impl TableField for LockField {
    const TABLE: Table = Table::Locks;

    fn name(self) -> &'static str {
        match self {
            LockField::Holder => "holder",
            LockField::AcquiredAt => "acquired_at_ms",
            LockField::ExpiresAt => "expires_at_ms",
            LockField::Hostname => "hostname",
        }
    }
}

/// Stored lock state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hostname: Option<String>,
}

impl LockRecord {
    fn from_record(key: &str, stored: &Record) -> Self {
        let millis = |field| {
            stored
                .i64_field(field)
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or_default()
        };
        Self {
            key: key.to_string(),
            holder: stored
                .str_field(LockField::Holder)
                .unwrap_or_default()
                .to_string(),
            acquired_at: millis(LockField::AcquiredAt),
            expires_at: millis(LockField::ExpiresAt),
            hostname: stored.str_field(LockField::Hostname).map(str::to_string),
        }
    }

    fn to_record(&self) -> Record {
        record([
            (LockField::Holder, json!(self.holder)),
            (
                LockField::AcquiredAt,
                json!(self.acquired_at.timestamp_millis()),
            ),
            (LockField::ExpiresAt, json!(self.expires_at.timestamp_millis())),
            (LockField::Hostname, json!(self.hostname)),
        ])
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Proof of holding a lock, returned by `acquire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left on the lease, if any
    pub fn remaining(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }
}

/// Lease-based mutual exclusion over a `KeyValueStore`
#[derive(Clone)]
pub struct DistributedLock {
    kv: Arc<dyn KeyValueStore>,
    config: LockConfig,
    retry: RetryPolicy,
    hostname: Option<String>,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
        Self {
            kv,
            config,
            retry: RetryPolicy::default(),
            hostname,
        }
    }

    /// Retry policy used when releasing against a flaky backend
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `key` under a fresh holder id, polling until granted
    pub async fn acquire(&self, key: &str, ttl: Option<Duration>) -> Result<LockLease, LockError> {
        let holder = Uuid::new_v4().to_string();
        self.acquire_as(key, &holder, ttl).await
    }

    /// Acquire `key` for a specific holder id. Re-entrant for the same holder.
    pub async fn acquire_as(
        &self,
        key: &str,
        holder: &str,
        ttl: Option<Duration>,
    ) -> Result<LockLease, LockError> {
        let started = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            match self.try_acquire_as(key, holder, ttl).await {
                Ok(Some(lease)) => {
                    debug!("Acquired lock {} as {} after {} attempt(s)", key, holder, attempts);
                    return Ok(lease);
                }
                Ok(None) => {}
                Err(LockError::Storage(e)) if e.is_retryable() => {
                    warn!("Transient error acquiring lock {}: {}", key, e);
                }
                Err(e) => return Err(e),
            }

            let waited = started.elapsed();
            if let Some(max_wait) = self.config.max_wait {
                if waited + self.config.poll_interval > max_wait {
                    return Err(LockError::Timeout {
                        key: key.to_string(),
                        waited,
                    });
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Single acquisition attempt under a fresh holder id
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockLease>, LockError> {
        let holder = Uuid::new_v4().to_string();
        self.try_acquire_as(key, &holder, ttl).await
    }

    async fn try_acquire_as(
        &self,
        key: &str,
        holder: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<LockLease>, LockError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        // Stored timestamps carry millisecond precision
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
            .unwrap_or_else(Utc::now);
        let candidate = LockRecord {
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
            hostname: self.hostname.clone(),
        };
        // Keep expired records around for a while so a steal goes through the
        // holder-conditioned update rather than a blind create.
        let store_ttl = Some(ttl + self.config.record_retention);

        let outcome = match self.inspect(key).await? {
            None => {
                self.kv
                    .put_if_absent(Table::Locks, key, candidate.to_record(), store_ttl)
                    .await
            }
            Some(existing) if existing.holder == holder => {
                return Ok(Some(LockLease {
                    key: key.to_string(),
                    holder: existing.holder,
                    expires_at: existing.expires_at,
                }));
            }
            Some(existing) if existing.is_expired() => {
                debug!(
                    "Lock {} held by {} expired at {}, attempting takeover",
                    key, existing.holder, existing.expires_at
                );
                self.kv
                    .update_if(
                        Table::Locks,
                        key,
                        candidate.to_record(),
                        Condition::field_equals(LockField::Holder, existing.holder),
                        store_ttl,
                    )
                    .await
                    .map(|_| ())
            }
            Some(_) => return Ok(None),
        };

        match outcome {
            Ok(()) => Ok(Some(LockLease {
                key: key.to_string(),
                holder: holder.to_string(),
                expires_at: candidate.expires_at,
            })),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a lease. Fails with `HolderMismatch` if someone else now holds
    /// the lock or the record is gone.
    pub async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let result = self
            .retry
            .retry(
                "lock release",
                || {
                    self.kv.delete(
                        Table::Locks,
                        &lease.key,
                        Some(Condition::field_equals(
                            LockField::Holder,
                            lease.holder.clone(),
                        )),
                    )
                },
                StorageError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                debug!("Released lock {} held by {}", lease.key, lease.holder);
                Ok(())
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                let current = self
                    .inspect(&lease.key)
                    .await
                    .ok()
                    .flatten()
                    .map(|r| r.holder);
                error!(
                    "Lock {} was lost by {} before release (now held by {:?})",
                    lease.key, lease.holder, current
                );
                Err(LockError::HolderMismatch {
                    key: lease.key.clone(),
                    holder: lease.holder.clone(),
                    current,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` while holding `key`. Release is always attempted; a release
    /// failure after a successful body is surfaced as the error.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let lease = self.acquire(key, ttl).await?;
        let result = f().await;
        let released = self.release(&lease).await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("Failed to release lock {} after error: {}", key, release_err);
                Err(e)
            }
        }
    }

    /// Current lock record, if any
    pub async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(self
            .kv
            .get(Table::Locks, key)
            .await?
            .map(|stored| LockRecord::from_record(key, &stored)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backends::MemoryKeyValueStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(5),
            default_ttl: Duration::from_secs(30),
            max_wait: Some(Duration::from_secs(10)),
            record_retention: Duration::from_secs(60),
        }
    }

    fn lock_with(config: LockConfig) -> DistributedLock {
        DistributedLock::new(Arc::new(MemoryKeyValueStore::new()), config)
            .with_retry(RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = lock_with(fast_config());

        let lease = lock.acquire("chunk-0", None).await.unwrap();
        let stored = lock.inspect("chunk-0").await.unwrap().unwrap();
        assert_eq!(stored.holder, lease.holder);
        assert!(!lease.is_expired());

        lock.release(&lease).await.unwrap();
        assert!(lock.inspect("chunk-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_is_not_granted_twice() {
        let lock = lock_with(fast_config());

        let lease = lock.acquire("chunk-0", None).await.unwrap();
        assert!(lock.try_acquire("chunk-0", None).await.unwrap().is_none());

        lock.release(&lease).await.unwrap();
        assert!(lock.try_acquire("chunk-0", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reentrant_for_same_holder() {
        let lock = lock_with(fast_config());

        let first = lock.acquire_as("k", "holder-a", None).await.unwrap();
        let again = lock.acquire_as("k", "holder-a", None).await.unwrap();
        assert_eq!(first.holder, again.holder);
        assert_eq!(first.expires_at, again.expires_at);
    }

    #[tokio::test]
    async fn test_expired_lock_is_stolen_and_old_release_fails() {
        let lock = lock_with(fast_config());

        let a = lock
            .acquire("k", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.is_expired());

        let b = lock.acquire("k", None).await.unwrap();
        assert_ne!(a.holder, b.holder);

        let err = lock.release(&a).await.unwrap_err();
        match err {
            LockError::HolderMismatch { current, .. } => {
                assert_eq!(current.as_deref(), Some(b.holder.as_str()))
            }
            other => panic!("expected holder mismatch, got {:?}", other),
        }

        lock.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_record_vanished_is_mismatch() {
        let lock = lock_with(fast_config());
        let lease = lock.acquire("k", None).await.unwrap();
        lock.release(&lease).await.unwrap();

        assert!(matches!(
            lock.release(&lease).await,
            Err(LockError::HolderMismatch { current: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let lock = lock_with(LockConfig {
            max_wait: Some(Duration::from_millis(50)),
            ..fast_config()
        });

        let _held = lock.acquire("k", None).await.unwrap();
        let err = lock.acquire("k", None).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let lock = lock_with(fast_config());

        let result: Result<(), LockError> = lock
            .with_lock("k", None, || async {
                Err(LockError::Storage(StorageError::unavailable("boom")))
            })
            .await;
        assert!(result.is_err());
        assert!(lock.inspect("k").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers_are_mutually_exclusive() {
        let lock = lock_with(LockConfig {
            poll_interval: Duration::from_millis(1),
            ..fast_config()
        });
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("shared", None, || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, LockError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
