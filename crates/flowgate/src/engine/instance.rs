//! Flow instances: a definition bound to one object
//!
//! A [`Flow`] holds no state of its own. Every query reloads the ledger and
//! derives the answer from it, and every mutation is a compare-and-set
//! against the version it was derived from.
//!
//! Resolving a step with a handler takes two writes:
//!
//! ```text
//! load ──▶ authorize ──▶ CAS claim ──▶ handler ──▶ CAS outcome
//!                             │            │
//!                          Conflict     error ──▶ CAS release ──▶ CallbackFailed
//! ```
//!
//! The claim write keeps a handler from running twice for the same
//! resolution: of two racing approvers only one can change the step's row.
//! Writes to other steps of the ledger only move its version; a write that
//! loses the CAS to one of those reloads and re-applies as long as its own
//! row is untouched, so a claimed resolution always lands or releases.

use std::fmt;

use chrono::{SubsecRound, Utc};
use tracing::{debug, info, instrument, warn};

use super::{FlowError, FlowState, FlowStatus};
use crate::flow::{Approver, FlowDefinition, FlowObject, Step};
use crate::persistence::{Ledger, StepClaim, StepOutcome, StepStatus, StoreError};

/// A flow definition bound to a concrete object
pub struct Flow<O> {
    definition: FlowDefinition<O>,
    object: O,
    object_key: String,
}

impl<O: FlowObject> Flow<O> {
    pub(crate) fn new(definition: FlowDefinition<O>, object: O) -> Self {
        let object_key = object.flow_key();
        Self {
            definition,
            object,
            object_key,
        }
    }

    pub fn flow_id(&self) -> &str {
        self.definition.id()
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn object(&self) -> &O {
        &self.object
    }

    pub fn definition(&self) -> &FlowDefinition<O> {
        &self.definition
    }

    /// (Re)initialize the ledger with every step pending
    ///
    /// Any prior history for this object is discarded, whatever state it was
    /// in.
    #[instrument(skip(self), fields(flow_id = %self.flow_id(), object_key = %self.object_key))]
    pub async fn start(&self) -> Result<(), FlowError> {
        let step_ids = self.definition.step_ids();
        self.definition
            .store()
            .ensure_flow(self.flow_id(), &self.object_key, &step_ids)
            .await?;

        info!(steps = step_ids.len(), "Flow started");
        Ok(())
    }

    /// Remove the ledger; a no-op when there is none
    #[instrument(skip(self), fields(flow_id = %self.flow_id(), object_key = %self.object_key))]
    pub async fn clear(&self) -> Result<(), FlowError> {
        match self
            .definition
            .store()
            .delete_flow(self.flow_id(), &self.object_key)
            .await
        {
            Ok(()) => {
                info!("Flow cleared");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(FlowError::Store(e)),
        }
    }

    pub async fn state(&self) -> Result<FlowState, FlowError> {
        let ledger = self.definition.load(&self.object_key).await?;
        Ok(self.definition.layout().state(ledger.as_ref()))
    }

    /// Started and not yet fully approved
    pub async fn in_progress(&self) -> Result<bool, FlowError> {
        Ok(self.state().await?.is_in_progress())
    }

    /// Unapproved steps of the earliest unresolved stage
    ///
    /// Empty when the flow is not started, cleared or completed.
    pub async fn next_steps(&self) -> Result<Vec<FlowStep<'_, O>>, FlowError> {
        let Some(ledger) = self.definition.load(&self.object_key).await? else {
            return Ok(Vec::new());
        };

        Ok(self
            .definition
            .layout()
            .actionable(&ledger)
            .into_iter()
            .filter_map(|id| self.definition.step(id))
            .map(|step| FlowStep { flow: self, step })
            .collect())
    }

    pub async fn status(&self) -> Result<FlowStatus, FlowError> {
        let ledger = self.definition.load(&self.object_key).await?;
        Ok(FlowStatus::describe(
            &self.definition,
            &self.object_key,
            Some(self.object.display_name()),
            ledger.as_ref(),
        ))
    }

    /// Approve `step_id` on behalf of `approver`
    ///
    /// Returns the state derived from the committed ledger.
    pub async fn approve(
        &self,
        step_id: &str,
        approver: &dyn Approver,
        rationale: impl Into<String>,
    ) -> Result<FlowState, FlowError> {
        self.resolve(step_id, approver, rationale.into(), true).await
    }

    /// Reject `step_id` on behalf of `approver`
    ///
    /// What happens to other steps depends on the configured
    /// [`RejectPolicy`](crate::RejectPolicy).
    pub async fn reject(
        &self,
        step_id: &str,
        approver: &dyn Approver,
        rationale: impl Into<String>,
    ) -> Result<FlowState, FlowError> {
        self.resolve(step_id, approver, rationale.into(), false).await
    }

    #[instrument(
        skip(self, approver, rationale),
        fields(
            flow_id = %self.flow_id(),
            object_key = %self.object_key,
            approver = %approver.id(),
        )
    )]
    async fn resolve(
        &self,
        step_id: &str,
        approver: &dyn Approver,
        rationale: String,
        approved: bool,
    ) -> Result<FlowState, FlowError> {
        let flow_id = self.flow_id();
        let key = self.object_key.as_str();
        let layout = self.definition.layout();
        let config = self.definition.config();

        let ledger = self
            .definition
            .load(key)
            .await?
            .ok_or_else(|| FlowError::NotStarted {
                flow_id: flow_id.to_string(),
                object_key: key.to_string(),
            })?;

        let step = self
            .definition
            .step(step_id)
            .ok_or_else(|| FlowError::UnknownStep {
                flow_id: flow_id.to_string(),
                object_key: key.to_string(),
                step_id: step_id.to_string(),
            })?;

        if !layout.actionable(&ledger).contains(&step_id) {
            return Err(FlowError::StepNotActionable {
                flow_id: flow_id.to_string(),
                object_key: key.to_string(),
                step_id: step_id.to_string(),
            });
        }

        if !approver.can_handle_flow_step(flow_id, step_id, key) {
            warn!(%step_id, "Approver not authorized for step");
            return Err(FlowError::Forbidden {
                flow_id: flow_id.to_string(),
                object_key: key.to_string(),
                step_id: step_id.to_string(),
                approver: approver.id().to_string(),
            });
        }

        let previous = ledger
            .step(step_id)
            .cloned()
            .unwrap_or_else(|| StepStatus::pending(step_id));

        // Stores keep microseconds; the claim must read back equal
        let now = Utc::now().trunc_subsecs(6);
        if let Some(claim) = &previous.claim {
            let age = (now - claim.claimed_at).to_std().unwrap_or_default();
            if age < config.claim_ttl {
                return Err(FlowError::Conflict {
                    flow_id: flow_id.to_string(),
                    object_key: key.to_string(),
                    step_id: step_id.to_string(),
                    detail: format!("step is being resolved by {}", claim.claimed_by),
                });
            }
            warn!(
                %step_id,
                stale_owner = %claim.claimed_by,
                age_secs = age.as_secs(),
                "Taking over stale step claim"
            );
        }

        let mut ledger = ledger;
        let mut expected = previous.clone();
        let mut require_actionable = true;
        if let Some(handler) = step.handler() {
            let claimed = StepStatus {
                claim: Some(StepClaim {
                    claimed_by: approver.id().to_string(),
                    claimed_at: now,
                }),
                ..previous.clone()
            };
            (ledger, _) = self
                .write_step(step_id, ledger, &previous, true, |_| vec![claimed.clone()])
                .await?;

            // From here on the resolution belongs to this claim
            expected = claimed;
            require_actionable = false;

            if let Err(source) = handler(&self.object, approved) {
                let restored = StepStatus {
                    claim: None,
                    ..previous
                };
                if let Err(e) = self
                    .write_step(step_id, ledger, &expected, false, |_| vec![restored.clone()])
                    .await
                {
                    warn!(%step_id, error = %e, "Failed to release step claim");
                }
                warn!(%step_id, approved, error = %source, "Step handler failed");
                return Err(FlowError::CallbackFailed {
                    flow_id: flow_id.to_string(),
                    object_key: key.to_string(),
                    step_id: step_id.to_string(),
                    source,
                });
            }
        }

        let outcome = if approved {
            StepOutcome::Approved
        } else {
            StepOutcome::Rejected
        };
        let resolved = StepStatus::resolved(step_id, outcome, approver.id(), rationale, Utc::now());
        let (committed, updates) = self
            .write_step(step_id, ledger, &expected, require_actionable, |current| {
                if approved {
                    vec![resolved.clone()]
                } else {
                    layout.reject_updates(current, resolved.clone(), config.reject_policy)
                }
            })
            .await?;
        let state = layout.state(Some(&committed));

        if approved {
            info!(%step_id, %state, "Step approved");
        } else {
            info!(
                %step_id,
                %state,
                reject_policy = %config.reject_policy,
                reset = updates.len() - 1,
                "Step rejected"
            );
        }
        Ok(state)
    }

    /// CAS-write the rows `build` derives for `step_id`
    ///
    /// Writes to other steps move the ledger version without touching this
    /// step. On a version conflict the ledger is reloaded and, as long as the
    /// step's row still equals `expected` in the same generation, `build` is
    /// re-applied to the fresh ledger. Any other change to the row means a
    /// concurrent resolution won and yields `Conflict`.
    ///
    /// Returns the ledger with the written rows applied, and those rows.
    async fn write_step<F>(
        &self,
        step_id: &str,
        mut ledger: Ledger,
        expected: &StepStatus,
        require_actionable: bool,
        build: F,
    ) -> Result<(Ledger, Vec<StepStatus>), FlowError>
    where
        F: Fn(&Ledger) -> Vec<StepStatus> + Send + Sync,
    {
        let flow_id = self.flow_id();
        let key = self.object_key.as_str();
        let conflict = |detail: &str| FlowError::Conflict {
            flow_id: flow_id.to_string(),
            object_key: key.to_string(),
            step_id: step_id.to_string(),
            detail: detail.to_string(),
        };

        loop {
            let updates = build(&ledger);
            let result = self
                .definition
                .store()
                .update_steps(flow_id, key, ledger.version, updates.clone())
                .await;

            match result {
                Ok(version) => {
                    ledger.apply(&updates);
                    ledger.version = version;
                    return Ok((ledger, updates));
                }
                Err(StoreError::Conflict { .. }) => {
                    let fresh = self
                        .definition
                        .load(key)
                        .await?
                        .ok_or_else(|| FlowError::NotStarted {
                            flow_id: flow_id.to_string(),
                            object_key: key.to_string(),
                        })?;

                    if fresh.version.generation != ledger.version.generation {
                        return Err(conflict("flow was restarted"));
                    }
                    let row = fresh
                        .step(step_id)
                        .cloned()
                        .unwrap_or_else(|| StepStatus::pending(step_id));
                    if row != *expected {
                        return Err(conflict("step was resolved concurrently"));
                    }
                    if require_actionable
                        && !self.definition.layout().actionable(&fresh).contains(&step_id)
                    {
                        return Err(FlowError::StepNotActionable {
                            flow_id: flow_id.to_string(),
                            object_key: key.to_string(),
                            step_id: step_id.to_string(),
                        });
                    }

                    debug!(
                        %step_id,
                        revision = fresh.version.revision,
                        "Ledger moved under resolution, re-applying"
                    );
                    ledger = fresh;
                }
                Err(e) => return Err(FlowError::from_resolution(e, flow_id, key, step_id)),
            }
        }
    }
}

impl<O> fmt::Debug for Flow<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("flow_id", &self.definition.id())
            .field("object_key", &self.object_key)
            .finish()
    }
}

/// An actionable step of a bound flow, as returned by [`Flow::next_steps`]
pub struct FlowStep<'a, O> {
    flow: &'a Flow<O>,
    step: &'a Step<O>,
}

impl<'a, O: FlowObject> FlowStep<'a, O> {
    pub fn id(&self) -> &'a str {
        self.step.id()
    }

    pub fn message(&self) -> &'a str {
        self.step.message()
    }

    pub async fn approve(
        &self,
        approver: &dyn Approver,
        rationale: impl Into<String>,
    ) -> Result<FlowState, FlowError> {
        self.flow.approve(self.step.id(), approver, rationale).await
    }

    pub async fn reject(
        &self,
        approver: &dyn Approver,
        rationale: impl Into<String>,
    ) -> Result<FlowState, FlowError> {
        self.flow.reject(self.step.id(), approver, rationale).await
    }
}

impl<O> fmt::Debug for FlowStep<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStep")
            .field("step_id", &self.step.id())
            .field("message", &self.step.message())
            .finish()
    }
}

