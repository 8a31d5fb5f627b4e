//! Store selection from configuration

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use super::memory::InMemoryLedgerStore;
use super::postgres::PostgresLedgerStore;
use super::store::{LedgerStore, StoreError};
use crate::config::StoreConfig;

/// Build the ledger store described by `config`
///
/// With a `database_url` this opens a Postgres pool and applies the ledger
/// migrations; without one it falls back to an [`InMemoryLedgerStore`].
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn LedgerStore>, StoreError> {
    let Some(url) = config.database_url.as_deref() else {
        info!("No DATABASE_URL configured, using in-memory ledger store");
        return Ok(Arc::new(InMemoryLedgerStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .map_err(|e| {
            error!("Failed to connect to ledger database: {}", e);
            StoreError::Unavailable(e.to_string())
        })?;

    let store = PostgresLedgerStore::new(pool);
    store.migrate().await?;

    info!(
        max_connections = config.max_connections,
        "Connected PostgreSQL ledger store"
    );
    Ok(Arc::new(store))
}
