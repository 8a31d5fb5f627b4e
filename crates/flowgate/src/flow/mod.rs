//! Flow definitions and the collaborators they talk to
//!
//! This module contains the host-facing primitives:
//! - [`FlowObject`] for anything a flow can be attached to
//! - [`Step`] and [`FlowDefinition`] describing ordered stages of approvals
//! - [`register`] to validate and build a definition
//! - [`Approver`], the authorization gate consulted on every resolution

mod approver;
mod definition;
mod object;

pub use approver::Approver;
pub use definition::{register, register_with_config, FlowDefinition, Step, StepHandler};
pub use object::FlowObject;
