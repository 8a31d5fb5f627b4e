//! PostgreSQL implementation of LedgerStore
//!
//! Production persistence using PostgreSQL with:
//! - Whole-ledger replacement in one transaction
//! - Compare-and-set updates under a row lock on the ledger header
//! - Single-statement snapshot reads

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// PostgreSQL implementation of LedgerStore
///
/// Uses a connection pool for efficient database access. Schema lives in
/// `crates/flowgate/migrations` and is applied by [`PostgresLedgerStore::migrate`].
///
/// # Example
///
/// ```ignore
/// use flowgate::PostgresLedgerStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresLedgerStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the ledger schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run ledger migrations: {}", e);
                StoreError::Unavailable(e.to_string())
            })
    }
}

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, step_ids))]
    async fn ensure_flow(
        &self,
        flow_id: &str,
        object_key: &str,
        step_ids: &[String],
    ) -> Result<LedgerVersion, StoreError> {
        let version = LedgerVersion::initial();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Upsert locks the header row; concurrent starts on one key queue here
        sqlx::query(
            r#"
            INSERT INTO approval_ledgers (flow_id, object_key, generation, revision)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (flow_id, object_key) DO UPDATE
            SET generation = EXCLUDED.generation,
                revision = EXCLUDED.revision,
                started_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .bind(version.generation)
        .bind(version.revision)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create ledger", e))?;

        sqlx::query(
            r#"
            DELETE FROM approval_steps WHERE flow_id = $1 AND object_key = $2
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to delete prior ledger steps", e))?;

        for (position, step_id) in step_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO approval_steps (flow_id, object_key, step_id, position, outcome)
                VALUES ($1, $2, $3, $4, 'pending')
                "#,
            )
            .bind(flow_id)
            .bind(object_key)
            .bind(step_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert ledger step", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit ledger", e))?;

        debug!(%flow_id, %object_key, steps = step_ids.len(), "ensured ledger");
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn delete_flow(&self, flow_id: &str, object_key: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM approval_ledgers WHERE flow_id = $1 AND object_key = $2
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete ledger", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(flow_id, object_key));
        }

        debug!(%flow_id, %object_key, "deleted ledger");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_steps(&self, flow_id: &str, object_key: &str) -> Result<Ledger, StoreError> {
        // One statement, one snapshot
        let rows = sqlx::query(
            r#"
            SELECT l.generation, l.revision, l.started_at,
                   s.step_id, s.outcome, s.rationale, s.resolved_by, s.resolved_at,
                   s.claimed_by, s.claimed_at
            FROM approval_ledgers l
            LEFT JOIN approval_steps s
                   ON s.flow_id = l.flow_id AND s.object_key = l.object_key
            WHERE l.flow_id = $1 AND l.object_key = $2
            ORDER BY s.position
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load ledger", e))?;

        let first = rows
            .first()
            .ok_or_else(|| StoreError::not_found(flow_id, object_key))?;

        let version = LedgerVersion {
            generation: first.get::<Uuid, _>("generation"),
            revision: first.get::<i64, _>("revision"),
        };
        let started_at: DateTime<Utc> = first.get("started_at");

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(step_id) = row.get::<Option<String>, _>("step_id") else {
                continue;
            };
            let outcome: String = row.get("outcome");
            let claim = match (
                row.get::<Option<String>, _>("claimed_by"),
                row.get::<Option<DateTime<Utc>>, _>("claimed_at"),
            ) {
                (Some(claimed_by), Some(claimed_at)) => Some(StepClaim {
                    claimed_by,
                    claimed_at,
                }),
                _ => None,
            };

            steps.push(StepStatus {
                step_id,
                outcome: outcome.parse()?,
                rationale: row.get("rationale"),
                resolved_by: row.get("resolved_by"),
                resolved_at: row.get("resolved_at"),
                claim,
            });
        }

        Ok(Ledger {
            flow_id: flow_id.to_string(),
            object_key: object_key.to_string(),
            version,
            started_at,
            steps,
        })
    }

    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    async fn update_steps(
        &self,
        flow_id: &str,
        object_key: &str,
        expected: LedgerVersion,
        updates: Vec<StepStatus>,
    ) -> Result<LedgerVersion, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Check current version with lock
        let row = sqlx::query(
            r#"
            SELECT generation, revision
            FROM approval_ledgers
            WHERE flow_id = $1 AND object_key = $2
            FOR UPDATE
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock ledger", e))?
        .ok_or_else(|| StoreError::not_found(flow_id, object_key))?;

        let actual = LedgerVersion {
            generation: row.get::<Uuid, _>("generation"),
            revision: row.get::<i64, _>("revision"),
        };

        if actual != expected {
            return Err(StoreError::Conflict {
                flow_id: flow_id.to_string(),
                object_key: object_key.to_string(),
                expected,
                actual,
            });
        }

        for update in &updates {
            let (claimed_by, claimed_at) = match &update.claim {
                Some(claim) => (Some(claim.claimed_by.as_str()), Some(claim.claimed_at)),
                None => (None, None),
            };

            sqlx::query(
                r#"
                INSERT INTO approval_steps (
                    flow_id, object_key, step_id, position, outcome,
                    rationale, resolved_by, resolved_at, claimed_by, claimed_at
                )
                VALUES (
                    $1, $2, $3,
                    (SELECT COALESCE(MAX(position) + 1, 0) FROM approval_steps
                     WHERE flow_id = $1 AND object_key = $2),
                    $4, $5, $6, $7, $8, $9
                )
                ON CONFLICT (flow_id, object_key, step_id) DO UPDATE SET
                    outcome = EXCLUDED.outcome,
                    rationale = EXCLUDED.rationale,
                    resolved_by = EXCLUDED.resolved_by,
                    resolved_at = EXCLUDED.resolved_at,
                    claimed_by = EXCLUDED.claimed_by,
                    claimed_at = EXCLUDED.claimed_at
                "#,
            )
            .bind(flow_id)
            .bind(object_key)
            .bind(&update.step_id)
            .bind(update.outcome.as_str())
            .bind(&update.rationale)
            .bind(&update.resolved_by)
            .bind(update.resolved_at)
            .bind(claimed_by)
            .bind(claimed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to upsert ledger step", e))?;
        }

        let next = actual.next();
        sqlx::query(
            r#"
            UPDATE approval_ledgers
            SET revision = $3, updated_at = NOW()
            WHERE flow_id = $1 AND object_key = $2
            "#,
        )
        .bind(flow_id)
        .bind(object_key)
        .bind(next.revision)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to bump ledger revision", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit ledger update", e))?;

        debug!(%flow_id, %object_key, revision = next.revision, "updated ledger");
        Ok(next)
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, flow_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT object_key
            FROM approval_ledgers
            WHERE flow_id = $1
            ORDER BY started_at, object_key
            "#,
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list ledgers", e))?;

        Ok(rows.iter().map(|row| row.get("object_key")).collect())
    }
}
