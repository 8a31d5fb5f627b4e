//! State derivation from a ledger snapshot
//!
//! Nothing here touches the store. Instance state is always recomputed from
//! the step rows against the current definition's stage layout:
//! - the current stage is the earliest stage with a step that is not approved
//! - actionable steps are the unapproved steps of that stage
//! - rows for undeclared steps are orphans and never count
//! - declared steps without a row count as pending

use serde::{Deserialize, Serialize};

use crate::config::RejectPolicy;
use crate::persistence::{Ledger, StepOutcome, StepStatus};

/// Derived state of a flow instance
///
/// A cleared instance has no ledger and reports `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlowState {
    NotStarted,
    InProgress { stage: usize },
    Completed,
}

impl FlowState {
    /// Blocking and unresolved
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Stage currently awaiting decisions
    pub fn stage(&self) -> Option<usize> {
        match self {
            Self::InProgress { stage } => Some(*stage),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress { stage } => write!(f, "in_progress(stage {stage})"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Step ids of a definition grouped by stage, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    stages: Vec<Vec<String>>,
}

impl StageLayout {
    pub fn new(stages: Vec<Vec<String>>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Vec<String>] {
        &self.stages
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Every step id in stage order
    pub fn step_ids(&self) -> Vec<String> {
        self.stages.iter().flatten().cloned().collect()
    }

    pub fn stage_of(&self, step_id: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|id| id == step_id))
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.stage_of(step_id).is_some()
    }

    /// Outcome of a declared step; a missing row is pending
    pub fn outcome(&self, ledger: &Ledger, step_id: &str) -> StepOutcome {
        ledger
            .step(step_id)
            .map(|s| s.outcome)
            .unwrap_or(StepOutcome::Pending)
    }

    fn is_done(&self, ledger: &Ledger, step_id: &str) -> bool {
        self.outcome(ledger, step_id) == StepOutcome::Approved
    }

    /// Earliest stage holding an unapproved step, `None` once all are approved
    ///
    /// Stages without steps are vacuously resolved.
    pub fn current_stage(&self, ledger: &Ledger) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|id| !self.is_done(ledger, id)))
    }

    pub fn state(&self, ledger: Option<&Ledger>) -> FlowState {
        match ledger {
            None => FlowState::NotStarted,
            Some(ledger) => match self.current_stage(ledger) {
                Some(stage) => FlowState::InProgress { stage },
                None => FlowState::Completed,
            },
        }
    }

    /// Unapproved steps of the current stage, in declaration order
    pub fn actionable<'a>(&'a self, ledger: &Ledger) -> Vec<&'a str> {
        match self.current_stage(ledger) {
            Some(stage) => self.stages[stage]
                .iter()
                .filter(|id| !self.is_done(ledger, id))
                .map(String::as_str)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ledger rows whose step is no longer declared
    pub fn orphans<'l>(&self, ledger: &'l Ledger) -> Vec<&'l str> {
        ledger
            .steps
            .iter()
            .filter(|s| !self.contains(&s.step_id))
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// Rows to write when `rejected` is recorded under `policy`
    ///
    /// The rejected row always comes first. Steps that are reset go back to a
    /// fresh pending row; steps already fresh are not rewritten.
    pub fn reject_updates(
        &self,
        ledger: &Ledger,
        rejected: StepStatus,
        policy: RejectPolicy,
    ) -> Vec<StepStatus> {
        let reset: Vec<&String> = match policy {
            RejectPolicy::FlagOnly => Vec::new(),
            RejectPolicy::RestartFlow => self
                .stages
                .iter()
                .flatten()
                .filter(|id| **id != rejected.step_id)
                .collect(),
            RejectPolicy::ReopenPreviousStage => {
                let stage = self.stage_of(&rejected.step_id).unwrap_or(0);
                // Nearest earlier stage that declares steps
                self.stages[..stage]
                    .iter()
                    .rev()
                    .find(|s| !s.is_empty())
                    .map(|s| s.iter().collect())
                    .unwrap_or_default()
            }
        };

        let mut updates = vec![rejected];
        for id in reset {
            let fresh = StepStatus::pending(id.as_str());
            if ledger.step(id) != Some(&fresh) {
                updates.push(fresh);
            }
        }
        updates
    }
}
