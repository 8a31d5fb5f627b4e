//! LedgerStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No ledger exists for the flow instance
    #[error("ledger not found: flow {flow_id}, object {object_key}")]
    NotFound { flow_id: String, object_key: String },

    /// Concurrency conflict (compare-and-set failed)
    #[error("concurrency conflict on flow {flow_id}, object {object_key}: expected version {expected}, got {actual}")]
    Conflict {
        flow_id: String,
        object_key: String,
        expected: LedgerVersion,
        actual: LedgerVersion,
    },

    /// Backend unreachable or the operation failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn not_found(flow_id: &str, object_key: &str) -> Self {
        Self::NotFound {
            flow_id: flow_id.to_string(),
            object_key: object_key.to_string(),
        }
    }
}

/// Resolution outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Awaiting a decision
    Pending,

    /// Approved; the only outcome that counts as done
    Approved,

    /// Rejected; awaiting a new decision once its stage is reached again
    Rejected,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(StoreError::Serialization(format!(
                "unknown step outcome: {other}"
            ))),
        }
    }
}

/// Marker left on a step while a resolution attempt runs its handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepClaim {
    /// Approver that owns the attempt
    pub claimed_by: String,

    /// When the claim was written
    pub claimed_at: DateTime<Utc>,
}

/// One ledger row: the persisted status of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_id: String,
    pub outcome: StepOutcome,

    /// Free text supplied by the approver
    pub rationale: Option<String>,

    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// In-flight resolution, if any
    pub claim: Option<StepClaim>,
}

impl StepStatus {
    /// A fresh, unresolved row
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            outcome: StepOutcome::Pending,
            rationale: None,
            resolved_by: None,
            resolved_at: None,
            claim: None,
        }
    }

    /// Record a decision, dropping any claim
    pub fn resolved(
        step_id: impl Into<String>,
        outcome: StepOutcome,
        resolved_by: impl Into<String>,
        rationale: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            outcome,
            rationale: Some(rationale.into()),
            resolved_by: Some(resolved_by.into()),
            resolved_at: Some(at),
            claim: None,
        }
    }

    /// Whether the step is resolved for progression purposes
    pub fn is_done(&self) -> bool {
        self.outcome == StepOutcome::Approved
    }
}

/// Concurrency token of a ledger
///
/// `generation` changes whenever the ledger is (re)created, `revision`
/// increments on every update. Both must match for a write to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerVersion {
    pub generation: Uuid,
    pub revision: i64,
}

impl LedgerVersion {
    /// Version of a freshly created ledger
    pub fn initial() -> Self {
        Self {
            generation: Uuid::now_v7(),
            revision: 0,
        }
    }

    /// Version after one more update
    pub fn next(self) -> Self {
        Self {
            generation: self.generation,
            revision: self.revision + 1,
        }
    }
}

impl std::fmt::Display for LedgerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.generation, self.revision)
    }
}

/// Consistent snapshot of a flow instance's ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub flow_id: String,
    pub object_key: String,
    pub version: LedgerVersion,
    pub started_at: DateTime<Utc>,

    /// Rows in the order they were created
    pub steps: Vec<StepStatus>,
}

impl Ledger {
    /// Look up a row by step id
    pub fn step(&self, step_id: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Apply updates the way `update_steps` does: named rows are replaced,
    /// unknown ones appended, the rest left untouched.
    pub fn apply(&mut self, updates: &[StepStatus]) {
        for update in updates {
            match self.steps.iter_mut().find(|s| s.step_id == update.step_id) {
                Some(existing) => *existing = update.clone(),
                None => self.steps.push(update.clone()),
            }
        }
    }
}

/// Store for per-instance step ledgers
///
/// This trait is the only persistence boundary of the engine. Implementations
/// must be thread-safe, and mutations of a single `(flow_id, object_key)`
/// ledger must be linearizable: `update_steps` is a compare-and-set on the
/// ledger version, never last-writer-wins.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Create the ledger with every step pending, atomically replacing any
    /// prior ledger for the same instance
    async fn ensure_flow(
        &self,
        flow_id: &str,
        object_key: &str,
        step_ids: &[String],
    ) -> Result<LedgerVersion, StoreError>;

    /// Remove the ledger
    ///
    /// Returns `StoreError::NotFound` when there is nothing to delete.
    async fn delete_flow(&self, flow_id: &str, object_key: &str) -> Result<(), StoreError>;

    /// Load a consistent snapshot of the ledger
    async fn get_steps(&self, flow_id: &str, object_key: &str) -> Result<Ledger, StoreError>;

    /// Upsert the named rows if the ledger is still at `expected`
    ///
    /// Rows not named in `updates` are left untouched. Returns the new
    /// version.
    async fn update_steps(
        &self,
        flow_id: &str,
        object_key: &str,
        expected: LedgerVersion,
        updates: Vec<StepStatus>,
    ) -> Result<LedgerVersion, StoreError>;

    /// Keys of every started instance of a flow, oldest first
    async fn list_objects(&self, flow_id: &str) -> Result<Vec<String>, StoreError>;
}
