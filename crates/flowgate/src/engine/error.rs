//! Engine error type

use thiserror::Error;

use crate::persistence::StoreError;

/// Errors surfaced by flow registration and instance operations
///
/// Every variant carries enough context (flow id, object key, step id) to
/// retry or report the failure.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Bad flow definition at registration
    #[error("invalid flow definition {flow_id:?}: {reason}")]
    InvalidDefinition { flow_id: String, reason: String },

    /// Approve/reject on an instance without a ledger
    #[error("flow {flow_id} has not been started for object {object_key}")]
    NotStarted { flow_id: String, object_key: String },

    #[error("flow {flow_id} has no step {step_id} (object {object_key})")]
    UnknownStep {
        flow_id: String,
        object_key: String,
        step_id: String,
    },

    /// The step is outside the current stage or already approved
    #[error("step {step_id} of flow {flow_id} is not actionable for object {object_key}")]
    StepNotActionable {
        flow_id: String,
        object_key: String,
        step_id: String,
    },

    #[error("{approver} may not handle step {step_id} of flow {flow_id} for object {object_key}")]
    Forbidden {
        flow_id: String,
        object_key: String,
        step_id: String,
        approver: String,
    },

    /// A concurrent resolution won the race
    #[error("conflict on step {step_id} of flow {flow_id} for object {object_key}: {detail}")]
    Conflict {
        flow_id: String,
        object_key: String,
        step_id: String,
        detail: String,
    },

    /// The step handler returned an error; nothing was recorded
    #[error("handler for step {step_id} of flow {flow_id} failed for object {object_key}: {source}")]
    CallbackFailed {
        flow_id: String,
        object_key: String,
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl FlowError {
    /// Map a store error raised while resolving a step
    ///
    /// `NotFound` means the instance was cleared underneath us, `Conflict`
    /// means another writer got there first.
    pub(crate) fn from_resolution(
        err: StoreError,
        flow_id: &str,
        object_key: &str,
        step_id: &str,
    ) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotStarted {
                flow_id: flow_id.to_string(),
                object_key: object_key.to_string(),
            },
            StoreError::Conflict { expected, actual, .. } => Self::Conflict {
                flow_id: flow_id.to_string(),
                object_key: object_key.to_string(),
                step_id: step_id.to_string(),
                detail: format!("ledger moved from {expected} to {actual}"),
            },
            other => Self::Store(other),
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Store(StoreError::Unavailable(_))
        )
    }
}
