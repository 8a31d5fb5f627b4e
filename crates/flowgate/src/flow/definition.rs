//! Flow definitions and registration

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::FlowObject;
use crate::config::EngineConfig;
use crate::engine::{Flow, FlowError, FlowStatus, StageLayout};
use crate::persistence::{Ledger, LedgerStore, StoreError};

/// Business callback invoked when a step is resolved
///
/// Receives the bound object and whether the step was approved. An error
/// aborts the resolution and leaves the ledger as it was.
pub type StepHandler<O> = Arc<dyn Fn(&O, bool) -> anyhow::Result<()> + Send + Sync>;

/// One unit of approval work inside a stage
pub struct Step<O> {
    id: String,
    message: String,
    handler: Option<StepHandler<O>>,
}

impl<O> Step<O> {
    /// Create a step without a handler
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            handler: None,
        }
    }

    /// Attach the callback run on approve and reject
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&O, bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Description shown to approvers
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn handler(&self) -> Option<&StepHandler<O>> {
        self.handler.as_ref()
    }
}

impl<O> Clone for Step<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            message: self.message.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<O> fmt::Debug for Step<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("message", &self.message)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

struct DefinitionInner<O> {
    flow_id: String,
    stages: Vec<Vec<Step<O>>>,
    layout: StageLayout,
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
}

/// An immutable, named template of ordered stages of approval steps
///
/// Cheap to clone; every clone shares the same stages, store and config.
/// Bind it to an object with [`FlowDefinition::bind`] to get a [`Flow`].
pub struct FlowDefinition<O> {
    inner: Arc<DefinitionInner<O>>,
}

impl<O> Clone for FlowDefinition<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> fmt::Debug for FlowDefinition<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("flow_id", &self.inner.flow_id)
            .field("stages", &self.inner.layout)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Validate and build a flow definition with the default [`EngineConfig`]
///
/// Registration never touches the store. It fails when `flow_id` is empty or
/// a step id is empty or declared twice.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use flowgate::{register, InMemoryLedgerStore, Step};
///
/// let cr = register::<String>(
///     "CR",
///     Arc::new(InMemoryLedgerStore::new()),
///     vec![
///         vec![Step::new("step-1", "Engineering")],
///         vec![Step::new("step-2", "Finance"), Step::new("step-3", "Legal")],
///     ],
/// )
/// .unwrap();
///
/// assert_eq!(cr.id(), "CR");
/// assert_eq!(cr.step_ids(), vec!["step-1", "step-2", "step-3"]);
/// ```
pub fn register<O: FlowObject>(
    flow_id: impl Into<String>,
    store: Arc<dyn LedgerStore>,
    stages: Vec<Vec<Step<O>>>,
) -> Result<FlowDefinition<O>, FlowError> {
    register_with_config(flow_id, store, stages, EngineConfig::default())
}

/// Like [`register`], with explicit engine configuration
pub fn register_with_config<O: FlowObject>(
    flow_id: impl Into<String>,
    store: Arc<dyn LedgerStore>,
    stages: Vec<Vec<Step<O>>>,
    config: EngineConfig,
) -> Result<FlowDefinition<O>, FlowError> {
    let flow_id = flow_id.into();
    let invalid = |reason: String| FlowError::InvalidDefinition {
        flow_id: flow_id.clone(),
        reason,
    };

    if flow_id.trim().is_empty() {
        return Err(invalid("flow id must not be empty".into()));
    }

    let mut seen = HashSet::new();
    for step in stages.iter().flatten() {
        if step.id.trim().is_empty() {
            return Err(invalid("step id must not be empty".into()));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id {:?}", step.id)));
        }
    }

    let layout = StageLayout::new(
        stages
            .iter()
            .map(|stage| stage.iter().map(|s| s.id.clone()).collect())
            .collect(),
    );

    info!(
        %flow_id,
        stages = layout.stage_count(),
        steps = seen.len(),
        reject_policy = %config.reject_policy,
        "Registered flow definition"
    );

    Ok(FlowDefinition {
        inner: Arc::new(DefinitionInner {
            flow_id,
            stages,
            layout,
            store,
            config,
        }),
    })
}

impl<O> FlowDefinition<O> {
    pub fn id(&self) -> &str {
        &self.inner.flow_id
    }

    pub fn stages(&self) -> &[Vec<Step<O>>] {
        &self.inner.stages
    }

    /// Look up a declared step
    pub fn step(&self, step_id: &str) -> Option<&Step<O>> {
        self.inner.stages.iter().flatten().find(|s| s.id == step_id)
    }

    /// Every step id in stage order
    pub fn step_ids(&self) -> Vec<String> {
        self.inner.layout.step_ids()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.inner.store
    }

    pub(crate) fn layout(&self) -> &StageLayout {
        &self.inner.layout
    }

    /// Load the ledger of an instance, `None` when it was never started or
    /// has been cleared
    pub(crate) async fn load(&self, object_key: &str) -> Result<Option<Ledger>, FlowError> {
        match self.inner.store.get_steps(&self.inner.flow_id, object_key).await {
            Ok(ledger) => {
                let orphans = self.inner.layout.orphans(&ledger);
                if !orphans.is_empty() {
                    warn!(
                        flow_id = %self.inner.flow_id,
                        %object_key,
                        ?orphans,
                        "Ledger has rows for steps no longer in the definition"
                    );
                }
                Ok(Some(ledger))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(FlowError::Store(e)),
        }
    }

    /// Status of an instance without needing the object itself
    pub async fn status(&self, object_key: &str) -> Result<FlowStatus, FlowError> {
        let ledger = self.load(object_key).await?;
        Ok(FlowStatus::describe(self, object_key, None, ledger.as_ref()))
    }

    /// Keys of every started instance, oldest first
    pub async fn started_keys(&self) -> Result<Vec<String>, FlowError> {
        self.inner
            .store
            .list_objects(&self.inner.flow_id)
            .await
            .map_err(FlowError::Store)
    }

    /// Status of every started instance, oldest first
    ///
    /// Instances cleared while the listing runs are skipped.
    pub async fn started(&self) -> Result<Vec<FlowStatus>, FlowError> {
        let mut statuses = Vec::new();
        for key in self.started_keys().await? {
            if let Some(ledger) = self.load(&key).await? {
                statuses.push(FlowStatus::describe(self, &key, None, Some(&ledger)));
            }
        }
        Ok(statuses)
    }
}

impl<O: FlowObject> FlowDefinition<O> {
    /// Bind the definition to a concrete object
    pub fn bind(&self, object: O) -> Flow<O> {
        Flow::new(self.clone(), object)
    }
}
