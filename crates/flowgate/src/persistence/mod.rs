//! Persistence layer for approval ledgers
//!
//! This module provides:
//! - [`LedgerStore`] trait, the only persistence boundary of the engine
//! - [`InMemoryLedgerStore`] for testing and embedding
//! - [`PostgresLedgerStore`] for production
//! - [`connect_store`] to pick one from [`StoreConfig`](crate::config::StoreConfig)

mod factory;
mod memory;
mod postgres;
mod store;

pub use factory::connect_store;
pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{
    Ledger, LedgerStore, LedgerVersion, StepClaim, StepOutcome, StepStatus, StoreError,
};
