//! # Approval Flow Engine
//!
//! An embeddable engine that attaches a multi-stage, multi-approver sign-off
//! process to any identifiable business object and gates further actions on
//! its outcome.
//!
//! ## Features
//!
//! - **Staged flows**: ordered stages of steps; every step of a stage must be
//!   approved before the next stage becomes actionable
//! - **Derived state**: instance state is recomputed from the step ledger on
//!   every query, there is no stored "current stage"
//! - **Safe concurrent approvals**: compare-and-set ledger writes plus claim
//!   markers so a step handler never runs twice for the same resolution
//! - **Pluggable persistence**: in-memory and PostgreSQL ledger stores
//! - **HTTP adapter**: an axum router exposing start/clear/approve/reject
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FlowRegistry                            │
//! │  (flow id -> FlowDefinition, built once at startup)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ bind(object)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Flow                                 │
//! │  (start / clear / next_steps / approve / reject)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LedgerStore                             │
//! │  (PostgreSQL: approval_ledgers, approval_steps)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowgate::prelude::*;
//!
//! let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
//! let cr = register::<Order>("CR", store, vec![
//!     vec![Step::new("step-1", "Engineering sign-off")
//!         .with_handler(|order: &Order, approved| order.mark_reviewed(approved))],
//!     vec![Step::new("step-2", "Finance"), Step::new("step-3", "Legal")],
//! ])?;
//!
//! let flow = cr.bind(order);
//! flow.start().await?;
//! for step in flow.next_steps().await? {
//!     println!("{}: {}", step.id(), step.message());
//! }
//! flow.approve("step-1", &user, "looks good").await?;
//! ```

pub mod config;
pub mod engine;
pub mod flow;
pub mod http;
pub mod persistence;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{EngineConfig, RejectPolicy, StoreConfig};
    pub use crate::engine::{Flow, FlowError, FlowRegistry, FlowState, FlowStatus, FlowStep};
    pub use crate::flow::{
        register, register_with_config, Approver, FlowDefinition, FlowObject, Step,
    };
    pub use crate::persistence::{
        InMemoryLedgerStore, Ledger, LedgerStore, PostgresLedgerStore, StepOutcome, StepStatus,
        StoreError,
    };
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig, RejectPolicy, StoreConfig};
pub use engine::{
    Flow, FlowError, FlowRegistry, FlowState, FlowStatus, FlowStep, FlowSummary, StepSummary,
    StepView,
};
pub use flow::{
    register, register_with_config, Approver, FlowDefinition, FlowObject, Step, StepHandler,
};
pub use persistence::{
    connect_store, InMemoryLedgerStore, Ledger, LedgerStore, LedgerVersion,
    PostgresLedgerStore, StepClaim, StepOutcome, StepStatus, StoreError,
};
