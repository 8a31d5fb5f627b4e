//! Flow registry for type-erased flow lookup
//!
//! The registry holds every flow definition of a process, whatever object
//! type it is bound to. It is built once at startup and shared immutably
//! afterwards (`Arc<FlowRegistry>`).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::FlowError;
use crate::flow::{FlowDefinition, FlowObject};

/// Stage/step layout of a flow for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub stages: Vec<Vec<StepSummary>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub message: String,
    pub has_handler: bool,
}

/// Type-erased flow definition interface
///
/// This trait allows the registry to hold definitions over different object
/// types side by side.
trait AnyFlowDefinition: Send + Sync {
    fn flow_id(&self) -> &str;

    fn summary(&self) -> FlowSummary;

    fn as_any(&self) -> &dyn Any;
}

impl<O: FlowObject> AnyFlowDefinition for FlowDefinition<O> {
    fn flow_id(&self) -> &str {
        self.id()
    }

    fn summary(&self) -> FlowSummary {
        FlowSummary {
            flow_id: self.id().to_string(),
            stages: self
                .stages()
                .iter()
                .map(|stage| {
                    stage
                        .iter()
                        .map(|step| StepSummary {
                            step_id: step.id().to_string(),
                            message: step.message().to_string(),
                            has_handler: step.handler().is_some(),
                        })
                        .collect()
                })
                .collect(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry of flow definitions keyed by flow id
///
/// # Example
///
/// ```ignore
/// let mut registry = FlowRegistry::new();
/// registry.register(register::<Order>("CR", store.clone(), stages)?)?;
/// let registry = Arc::new(registry);
///
/// let cr = registry.get::<Order>("CR").expect("registered at startup");
/// cr.bind(order).start().await?;
/// ```
pub struct FlowRegistry {
    flows: Vec<Box<dyn AnyFlowDefinition>>,
    index: HashMap<String, usize>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            flows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a definition; flow ids must be unique across the registry
    pub fn register<O: FlowObject>(&mut self, definition: FlowDefinition<O>) -> Result<(), FlowError> {
        let flow_id = definition.id().to_string();
        if self.index.contains_key(&flow_id) {
            return Err(FlowError::InvalidDefinition {
                flow_id,
                reason: "flow id already registered".into(),
            });
        }

        self.index.insert(flow_id, self.flows.len());
        self.flows.push(Box::new(definition));
        Ok(())
    }

    /// Check if a flow id is registered
    pub fn contains(&self, flow_id: &str) -> bool {
        self.index.contains_key(flow_id)
    }

    /// Typed lookup; `None` when the id is unknown or bound to another
    /// object type
    pub fn get<O: FlowObject>(&self, flow_id: &str) -> Option<FlowDefinition<O>> {
        let position = *self.index.get(flow_id)?;
        self.flows[position]
            .as_any()
            .downcast_ref::<FlowDefinition<O>>()
            .cloned()
    }

    /// Get the number of registered flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Registered flow ids in registration order
    pub fn flow_ids(&self) -> impl Iterator<Item = &str> {
        self.flows.iter().map(|f| f.flow_id())
    }

    /// Layout of every registered flow
    pub fn summaries(&self) -> Vec<FlowSummary> {
        self.flows.iter().map(|f| f.summary()).collect()
    }

    /// `(flow_id, object_key)` of every started instance of every flow over
    /// object type `O`
    pub async fn started<O: FlowObject>(&self) -> Result<Vec<(String, String)>, FlowError> {
        let mut started = Vec::new();
        for flow in &self.flows {
            let Some(definition) = flow.as_any().downcast_ref::<FlowDefinition<O>>() else {
                continue;
            };
            for key in definition.started_keys().await? {
                started.push((definition.id().to_string(), key));
            }
        }
        Ok(started)
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_ids", &self.flow_ids().collect::<Vec<_>>())
            .finish()
    }
}
