//! In-memory store clients for tests and single-process runs

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::storage::{
    error::{StorageError, StorageResult},
    traits::{Invoker, KeyValueStore, MessageQueue, ObjectStore},
    types::{merge_changes, Condition, QueueMessage, Record, Table},
};

#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn new(record: Record, ttl: Option<Duration>) -> Self {
        Self {
            record,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory key-value store with record expiry
#[derive(Default, Clone)]
pub struct MemoryKeyValueStore {
    records: Arc<RwLock<HashMap<(Table, String), StoredRecord>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records in a table
    pub async fn len(&self, table: Table) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|((t, _), stored)| *t == table && stored.is_live())
            .count()
    }

    fn live<'a>(
        records: &'a HashMap<(Table, String), StoredRecord>,
        table: Table,
        key: &str,
    ) -> Option<&'a StoredRecord> {
        records
            .get(&(table, key.to_string()))
            .filter(|stored| stored.is_live())
    }

    /// Drop expired records so abandoned leases do not accumulate
    fn evict_expired(records: &mut HashMap<(Table, String), StoredRecord>) {
        records.retain(|_, stored| stored.is_live());
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, table: Table, key: &str) -> StorageResult<Option<Record>> {
        let records = self.records.read().await;
        Ok(Self::live(&records, table, key).map(|stored| stored.record.clone()))
    }

    async fn put(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        Self::evict_expired(&mut records);
        records.insert((table, key.to_string()), StoredRecord::new(record, ttl));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        Self::evict_expired(&mut records);
        if records.contains_key(&(table, key.to_string())) {
            return Err(StorageError::conflict(format!(
                "Record already exists: {}/{}",
                table, key
            )));
        }
        records.insert((table, key.to_string()), StoredRecord::new(record, ttl));
        Ok(())
    }

    async fn update_if(
        &self,
        table: Table,
        key: &str,
        changes: Record,
        condition: Condition,
        ttl: Option<Duration>,
    ) -> StorageResult<Record> {
        let mut records = self.records.write().await;
        let current = Self::live(&records, table, key)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| StorageError::not_found(format!("{}/{}", table, key)))?;

        if !condition.evaluate(Some(&current)) {
            return Err(StorageError::conflict(format!(
                "Condition failed for {}/{}",
                table, key
            )));
        }

        let mut updated = current;
        merge_changes(&mut updated, &changes);

        let entry = records
            .entry((table, key.to_string()))
            .or_insert_with(|| StoredRecord::new(Record::new(), None));
        entry.record = updated.clone();
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }

        Ok(updated)
    }

    async fn delete(
        &self,
        table: Table,
        key: &str,
        condition: Option<Condition>,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        let current = Self::live(&records, table, key)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| StorageError::not_found(format!("{}/{}", table, key)))?;

        if let Some(condition) = condition {
            if !condition.evaluate(Some(&current)) {
                return Err(StorageError::conflict(format!(
                    "Condition failed for {}/{}",
                    table, key
                )));
            }
        }

        records.remove(&(table, key.to_string()));
        Ok(())
    }

    async fn scan_keys(&self, table: Table) -> StorageResult<Vec<String>> {
        let mut records = self.records.write().await;
        Self::evict_expired(&mut records);
        let mut keys: Vec<String> = records
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|((_, key), _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory object store
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PendingMessage {
    id: String,
    body: String,
    receive_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<PendingMessage>,
    in_flight: HashMap<String, (PendingMessage, Instant)>,
}

impl QueueState {
    /// Return messages whose visibility timeout lapsed to the ready queue
    fn requeue_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((message, _)) = self.in_flight.remove(&receipt) {
                self.ready.push_back(message);
            }
        }
    }
}

/// In-memory at-least-once queue with a visibility timeout
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Messages waiting to be received
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages received but not yet deleted
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, body: String) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.ready.push_back(PendingMessage {
            id: id.clone(),
            body,
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> StorageResult<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = self.state.lock().await;
                state.requeue_expired();

                let mut received = Vec::new();
                while received.len() < max_messages {
                    let Some(mut message) = state.ready.pop_front() else {
                        break;
                    };
                    message.receive_count += 1;
                    let receipt = format!("{}#{}", message.id, message.receive_count);
                    received.push(QueueMessage {
                        receipt: receipt.clone(),
                        body: message.body.clone(),
                        receive_count: message.receive_count,
                    });
                    state.in_flight.insert(
                        receipt,
                        (message, Instant::now() + self.visibility_timeout),
                    );
                }

                if !received.is_empty() {
                    return Ok(received);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn delete(&self, receipt: &str) -> StorageResult<()> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(format!("Receipt not in flight: {}", receipt)))
    }
}

/// Invoker that only records what it was asked to start
#[derive(Default, Clone)]
pub struct RecordingInvoker {
    invocations: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every invocation so far
    pub async fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().await.clone()
    }

    /// Drain recorded invocations
    pub async fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.invocations.lock().await)
    }
}

#[async_trait]
impl Invoker for RecordingInvoker {
    async fn invoke(&self, function: &str, payload: Value) -> StorageResult<()> {
        self.invocations
            .lock()
            .await
            .push((function.to_string(), payload));
        Ok(())
    }
}
