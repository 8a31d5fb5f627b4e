//! Flow engine: state derivation, instances and the registry
//!
//! This module provides:
//! - [`Flow`], a definition bound to one object, with start/clear/approve/reject
//! - [`FlowState`] derived from the step ledger on every query
//! - [`FlowRegistry`] holding every definition of a process
//! - [`FlowError`] returned by all engine operations

mod error;
mod instance;
mod registry;
mod state;
mod status;

pub use error::FlowError;
pub use instance::{Flow, FlowStep};
pub use registry::{FlowRegistry, FlowSummary, StepSummary};
pub use state::{FlowState, StageLayout};
pub use status::{FlowStatus, StepView};
