//! Idempotency ledger for exactly-once activity effects.
//!
//! Every remote activity invocation executes under a deterministic key.
//! Before running the activity body the ledger is consulted; a recorded
//! result is replayed without re-executing, so a crash after the side
//! effect but before the entity write cannot double-apply it on re-drive.
//! Only successful results are recorded. Failures leave no entry and the
//! next attempt under the same key runs the body again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;

use crate::core::{EntityId, Stage};
use crate::errors::{ActivityError, LedgerError};

/// Derives the idempotency key for one activity invocation.
///
/// The key is a function of entity, stage, activity name and attempt class
/// only. Re-driving an unresolved dispatch reproduces the same keys; a new
/// attempt class produces fresh ones.
#[must_use]
pub fn derive_key(entity_id: EntityId, stage: Stage, activity: &str, attempt: u32) -> String {
    let combined = format!("{entity_id}:{}:{activity}:{attempt}", stage.as_str());
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let digest = hasher.finalize();
    format!("idem:{}", hex::encode(&digest[..16]))
}

/// A recorded activity result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The successful activity payload.
    pub payload: serde_json::Value,

    /// When the result was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates an entry recorded now.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage backend for the ledger.
///
/// Backends are fallible: an unreachable backend surfaces as
/// [`LedgerError::Unavailable`], which aborts the surrounding stage
/// dispatch instead of being misread as an activity failure.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Reads a recorded result.
    async fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Records a result. Overwrites are harmless; the same key only ever
    /// maps to the same logical result.
    async fn put(&self, key: &str, entry: LedgerEntry) -> Result<(), LedgerError>;

    /// Removes a recorded result.
    async fn delete(&self, key: &str) -> Result<(), LedgerError>;

    /// Removes everything.
    async fn clear(&self) -> Result<(), LedgerError>;
}

/// In-memory ledger store.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    entries: DashMap<String, LedgerEntry>,
}

impl InMemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if a result is recorded under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn put(&self, key: &str, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        self.entries.clear();
        Ok(())
    }
}

/// How an [`IdempotencyLedger::execute`] call resolved.
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// The operation ran and its result was recorded.
    Fresh(serde_json::Value),

    /// A previously recorded result was replayed; the operation did not run.
    Replayed(serde_json::Value),

    /// The operation ran and failed. Nothing was recorded.
    OpFailed(ActivityError),
}

impl ExecuteOutcome {
    /// The payload, for fresh and replayed outcomes.
    #[must_use]
    pub const fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Fresh(payload) | Self::Replayed(payload) => Some(payload),
            Self::OpFailed(_) => None,
        }
    }

    /// Returns true for a ledger replay.
    #[must_use]
    pub const fn is_replayed(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// The idempotency ledger: lookup-or-execute with per-key serialization.
///
/// Concurrent calls under the same key do not race the side effect. The
/// first caller holds the key lock while running the operation; duplicates
/// wait on the lock and then replay the recorded result.
pub struct IdempotencyLedger {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for IdempotencyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyLedger")
            .field("key_locks", &self.locks.len())
            .finish()
    }
}

impl IdempotencyLedger {
    /// Creates a ledger over a storage backend.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Creates a ledger over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLedgerStore::new()))
    }

    /// The storage backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Runs `op` at most once for `key`.
    ///
    /// A recorded result short-circuits to [`ExecuteOutcome::Replayed`].
    /// Otherwise `op` runs; success records the payload and yields
    /// [`ExecuteOutcome::Fresh`], failure records nothing and yields
    /// [`ExecuteOutcome::OpFailed`]. Backend failures abort with
    /// [`LedgerError`] before any side effect.
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> Result<ExecuteOutcome, LedgerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ActivityError>>,
    {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.store.get(key).await? {
            return Ok(ExecuteOutcome::Replayed(entry.payload));
        }

        match op().await {
            Ok(payload) => {
                self.store.put(key, LedgerEntry::new(payload.clone())).await?;
                Ok(ExecuteOutcome::Fresh(payload))
            }
            Err(err) => Ok(ExecuteOutcome::OpFailed(err)),
        }
    }

    /// Reads a recorded payload without executing anything.
    pub async fn peek(&self, key: &str) -> Result<Option<serde_json::Value>, LedgerError> {
        Ok(self.store.get(key).await?.map(|entry| entry.payload))
    }
}
