//! In-memory implementation of LedgerStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;

/// Internal ledger state
struct LedgerState {
    version: LedgerVersion,
    started_at: DateTime<Utc>,
    steps: Vec<StepStatus>,
}

/// In-memory implementation of LedgerStore
///
/// This is primarily for testing and embedding. It stores all data in memory
/// and provides the same semantics as the PostgreSQL implementation: each
/// operation runs under a single lock, so ledger replacement and
/// compare-and-set updates are atomic.
///
/// # Example
///
/// ```
/// use flowgate::InMemoryLedgerStore;
///
/// let store = InMemoryLedgerStore::new();
/// assert_eq!(store.ledger_count(), 0);
/// ```
pub struct InMemoryLedgerStore {
    ledgers: RwLock<HashMap<(String, String), LedgerState>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryLedgerStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Get the number of live ledgers
    pub fn ledger_count(&self) -> usize {
        self.ledgers.read().len()
    }

    /// Number of successful `ensure_flow`/`delete_flow`/`update_steps` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every operation fail with `StoreError::Unavailable` (for testing)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.ledgers.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn key(flow_id: &str, object_key: &str) -> (String, String) {
        (flow_id.to_string(), object_key.to_string())
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn ensure_flow(
        &self,
        flow_id: &str,
        object_key: &str,
        step_ids: &[String],
    ) -> Result<LedgerVersion, StoreError> {
        self.check_available()?;

        let version = LedgerVersion::initial();
        let mut ledgers = self.ledgers.write();
        ledgers.insert(
            Self::key(flow_id, object_key),
            LedgerState {
                version,
                started_at: Utc::now(),
                steps: step_ids.iter().map(StepStatus::pending).collect(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn delete_flow(&self, flow_id: &str, object_key: &str) -> Result<(), StoreError> {
        self.check_available()?;

        let mut ledgers = self.ledgers.write();
        ledgers
            .remove(&Self::key(flow_id, object_key))
            .ok_or_else(|| StoreError::not_found(flow_id, object_key))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_steps(&self, flow_id: &str, object_key: &str) -> Result<Ledger, StoreError> {
        self.check_available()?;

        let ledgers = self.ledgers.read();
        let state = ledgers
            .get(&Self::key(flow_id, object_key))
            .ok_or_else(|| StoreError::not_found(flow_id, object_key))?;

        Ok(Ledger {
            flow_id: flow_id.to_string(),
            object_key: object_key.to_string(),
            version: state.version,
            started_at: state.started_at,
            steps: state.steps.clone(),
        })
    }

    async fn update_steps(
        &self,
        flow_id: &str,
        object_key: &str,
        expected: LedgerVersion,
        updates: Vec<StepStatus>,
    ) -> Result<LedgerVersion, StoreError> {
        self.check_available()?;

        let mut ledgers = self.ledgers.write();
        let state = ledgers
            .get_mut(&Self::key(flow_id, object_key))
            .ok_or_else(|| StoreError::not_found(flow_id, object_key))?;

        if state.version != expected {
            return Err(StoreError::Conflict {
                flow_id: flow_id.to_string(),
                object_key: object_key.to_string(),
                expected,
                actual: state.version,
            });
        }

        for update in updates {
            match state.steps.iter_mut().find(|s| s.step_id == update.step_id) {
                Some(existing) => *existing = update,
                None => state.steps.push(update),
            }
        }
        state.version = state.version.next();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(state.version)
    }

    async fn list_objects(&self, flow_id: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;

        let ledgers = self.ledgers.read();
        let mut started: Vec<_> = ledgers
            .iter()
            .filter(|((flow, _), _)| flow == flow_id)
            .map(|((_, object_key), state)| (state.started_at, object_key.clone()))
            .collect();
        started.sort();

        Ok(started.into_iter().map(|(_, key)| key).collect())
    }
}
