//! Serializable views of flow instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::FlowState;
use crate::flow::FlowDefinition;
use crate::persistence::{Ledger, StepOutcome};

/// One declared step as seen by approvers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    pub step_id: String,
    pub stage: usize,
    pub message: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Snapshot of a flow instance: derived state plus every declared step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub flow_id: String,
    pub object_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub state: FlowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Steps currently awaiting a decision
    pub next_steps: Vec<String>,

    /// Every declared step in stage order; empty when not started
    pub steps: Vec<StepView>,
}

impl FlowStatus {
    pub(crate) fn describe<O>(
        definition: &FlowDefinition<O>,
        object_key: &str,
        display_name: Option<String>,
        ledger: Option<&Ledger>,
    ) -> Self {
        let layout = definition.layout();
        let state = layout.state(ledger);

        let (next_steps, steps, started_at) = match ledger {
            None => (Vec::new(), Vec::new(), None),
            Some(ledger) => {
                let next_steps = layout
                    .actionable(ledger)
                    .into_iter()
                    .map(str::to_string)
                    .collect();

                let steps = definition
                    .stages()
                    .iter()
                    .enumerate()
                    .flat_map(|(stage, steps)| steps.iter().map(move |step| (stage, step)))
                    .map(|(stage, step)| {
                        let row = ledger.step(step.id());
                        StepView {
                            step_id: step.id().to_string(),
                            stage,
                            message: step.message().to_string(),
                            outcome: row.map(|r| r.outcome).unwrap_or(StepOutcome::Pending),
                            rationale: row.and_then(|r| r.rationale.clone()),
                            resolved_by: row.and_then(|r| r.resolved_by.clone()),
                            resolved_at: row.and_then(|r| r.resolved_at),
                        }
                    })
                    .collect();

                (next_steps, steps, Some(ledger.started_at))
            }
        };

        Self {
            flow_id: definition.id().to_string(),
            object_key: object_key.to_string(),
            display_name,
            state,
            started_at,
            next_steps,
            steps,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state.is_in_progress()
    }
}
