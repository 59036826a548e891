//! In-memory [`ObjectStore`] mock for tests.
//!
//! Supports deterministic failure scripts, random failure rates, gated
//! (held) puts for backpressure scenarios, and a call history for
//! assertions, without a real S3 endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::watch;

use silt_core::error::{StorageError, StorageResult};

use super::ObjectStore;

/// Scripted outcome for one mock operation.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Operation fails with a transient backend error.
    Transient(&'static str),
    /// Operation succeeds.
    Ok,
}

struct State {
    objects: HashMap<String, Bytes>,
    script: VecDeque<MockFailure>,
    failure_rate: f64,
    history: Vec<(String, String)>, // (operation, key)
}

/// In-memory object store with failure injection.
#[derive(Clone)]
pub struct MockObjectStore {
    state: Arc<RwLock<State>>,
    gate_tx: Arc<watch::Sender<bool>>,
    gate_rx: watch::Receiver<bool>,
}

impl MockObjectStore {
    /// Store that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(State {
                objects: HashMap::new(),
                script: VecDeque::new(),
                failure_rate: 0.0,
                history: Vec::new(),
            })),
            gate_tx: Arc::new(gate_tx),
            gate_rx,
        }
    }

    /// Store that plays back `script` one entry per operation, then
    /// succeeds.
    #[must_use]
    pub fn with_failures(script: Vec<MockFailure>) -> Self {
        let store = Self::new();
        store.state.write().script = script.into();
        store
    }

    /// Store where each operation fails with probability `rate`.
    #[must_use]
    pub fn with_failure_rate(rate: f64) -> Self {
        let store = Self::new();
        store.state.write().failure_rate = rate;
        store
    }

    /// Holds all puts until [`Self::release_puts`]; the put futures stay
    /// pending, simulating a blocked upload path.
    pub fn hold_puts(&self) {
        let _ = self.gate_tx.send(true);
    }

    /// Releases held puts.
    pub fn release_puts(&self) {
        let _ = self.gate_tx.send(false);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Keys touched so far, as `(operation, key)` pairs in call order.
    #[must_use]
    pub fn call_history(&self) -> Vec<(String, String)> {
        self.state.read().history.clone()
    }

    fn record(&self, operation: &str, key: &str) {
        self.state
            .write()
            .history
            .push((operation.to_string(), key.to_string()));
    }

    fn next_failure(&self) -> Option<StorageError> {
        let mut state = self.state.write();
        if let Some(entry) = state.script.pop_front() {
            return match entry {
                MockFailure::Transient(msg) => {
                    Some(StorageError::storage(format!("transient: {}", msg)))
                }
                MockFailure::Ok => None,
            };
        }
        if state.failure_rate > 0.0 && rand::thread_rng().gen_bool(state.failure_rate) {
            return Some(StorageError::storage("transient: injected failure"));
        }
        None
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.wait_for_gate().await;
        self.record("put", key);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.state.write().objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.record("get", key);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.state
            .read()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let data = self.get(key).await?;
        let len = data.len() as u64;
        if start > end || end > len {
            return Err(StorageError::storage(format!(
                "range [{}, {}) not satisfiable for object `{}` of {} bytes",
                start, end, key, len
            )));
        }
        Ok(data.slice(start as usize..end as usize))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.state.read().objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.record("delete", key);
        self.state.write().objects.remove(key);
        Ok(())
    }
}
