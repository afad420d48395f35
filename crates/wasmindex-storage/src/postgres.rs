//! PostgreSQL storage backend.
//!
//! Persists events, contracts, transformations, computations, state, and
//! the pending webhook queue. Uses `sqlx` with connection pooling; every
//! write is an `ON CONFLICT` upsert or a monotonic `GREATEST()` update, so
//! no in-process locks are needed.
//!
//! # Schema
//! Tables are created automatically on first connect:
//! - `wasmindex_contracts` — one row per contract address
//! - `wasmindex_events` — state writes keyed `(block_height, contract, key)`
//! - `wasmindex_transformations` — derived rows keyed `(block, contract, name)`
//! - `wasmindex_computations` + `wasmindex_computation_dependencies`
//! - `wasmindex_state` — singleton checkpoint row
//! - `wasmindex_pending_webhooks` — delivery queue

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use wasmindex_core::dependency::{Change, Dependency};
use wasmindex_core::error::StoreError;
use wasmindex_core::store::{
    ComputationStore, ComputationWithDeps, EventStore, StateStore, TransformationStore,
    WebhookQueue,
};
use wasmindex_core::types::{
    Computation, Contract, Endpoint, NewComputation, NewPendingWebhook, PendingWebhook, State,
    StoredWasmEvent, Transformation, WasmEvent,
};

/// Contract upsert retry budget for conflict/deadlock-class failures.
const CONTRACT_UPSERT_ATTEMPTS: u32 = 3;

// ─── Connection options ───────────────────────────────────────────────────────

/// Connection options for the Postgres storage backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── PostgresStorage ──────────────────────────────────────────────────────────

/// PostgreSQL-backed implementation of the full storage surface.
///
/// Thread-safe and cheaply cloneable — wraps a connection pool internally.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to a PostgreSQL database and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    /// Connect with custom pool options.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Fatal(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!("PostgresStorage connected and schema initialized");
        Ok(storage)
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they don't already exist.
    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS wasmindex_contracts (
                address                     TEXT   PRIMARY KEY,
                code_id                     BIGINT NOT NULL,
                instantiated_at_height      BIGINT NOT NULL,
                instantiated_at_time_ms     BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS wasmindex_events (
                block_height     BIGINT  NOT NULL,
                contract_address TEXT    NOT NULL,
                key              TEXT    NOT NULL,
                code_id          BIGINT  NOT NULL,
                value            TEXT,
                value_json       JSONB,
                deleted          BOOLEAN NOT NULL DEFAULT FALSE,
                block_time_ms    BIGINT  NOT NULL,
                PRIMARY KEY (block_height, contract_address, key)
            )",
            "CREATE INDEX IF NOT EXISTS idx_wasmindex_events_contract_key
             ON wasmindex_events(contract_address, key, block_height DESC)",
            "CREATE TABLE IF NOT EXISTS wasmindex_transformations (
                block_height     BIGINT NOT NULL,
                contract_address TEXT   NOT NULL,
                name             TEXT   NOT NULL,
                value            JSONB,
                PRIMARY KEY (block_height, contract_address, name)
            )",
            "CREATE TABLE IF NOT EXISTS wasmindex_computations (
                id                  BIGSERIAL PRIMARY KEY,
                formula             TEXT   NOT NULL,
                target_contract     TEXT   NOT NULL,
                args                TEXT   NOT NULL,
                block_height_valid  BIGINT NOT NULL,
                block_height_latest BIGINT NOT NULL,
                output              JSONB,
                UNIQUE (formula, target_contract, args, block_height_valid)
            )",
            "CREATE TABLE IF NOT EXISTS wasmindex_computation_dependencies (
                computation_id   BIGINT NOT NULL
                    REFERENCES wasmindex_computations(id) ON DELETE CASCADE,
                contract_address TEXT    NOT NULL,
                key_or_prefix    TEXT    NOT NULL,
                is_prefix        BOOLEAN NOT NULL DEFAULT FALSE
            )",
            "CREATE INDEX IF NOT EXISTS idx_wasmindex_comp_deps_contract
             ON wasmindex_computation_dependencies(contract_address, key_or_prefix)",
            "CREATE TABLE IF NOT EXISTS wasmindex_state (
                id                              BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
                last_wasm_block_height_exported BIGINT NOT NULL DEFAULT 0,
                latest_block_height             BIGINT NOT NULL DEFAULT 0,
                latest_block_time_ms            BIGINT NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS wasmindex_pending_webhooks (
                id               BIGSERIAL PRIMARY KEY,
                block_height     BIGINT  NOT NULL,
                contract_address TEXT    NOT NULL,
                key              TEXT    NOT NULL,
                endpoint         JSONB   NOT NULL,
                value            JSONB   NOT NULL,
                failures         INTEGER NOT NULL DEFAULT 0
            )",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
        }

        debug!("PostgresStorage schema initialized");
        Ok(())
    }

    async fn contracts_by_address(&self, addresses: &[String]) -> Result<Vec<Contract>, StoreError> {
        let rows = sqlx::query(
            "SELECT address, code_id, instantiated_at_height, instantiated_at_time_ms
             FROM wasmindex_contracts
             WHERE address = ANY($1)",
        )
        .bind(addresses)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(contract_from_row).collect()
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        // 40001 = serialization_failure, 40P01 = deadlock_detected
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return StoreError::Transient(e.to_string());
        }
    }
    StoreError::Fatal(e.to_string())
}

fn contract_from_row(row: &sqlx::postgres::PgRow) -> Result<Contract, StoreError> {
    Ok(Contract {
        address: row.try_get::<String, _>("address").map_err(db_err)?,
        code_id: row.try_get::<i64, _>("code_id").map_err(db_err)? as u64,
        instantiated_at_height: row
            .try_get::<i64, _>("instantiated_at_height")
            .map_err(db_err)? as u64,
        instantiated_at_time_unix_ms: row
            .try_get::<i64, _>("instantiated_at_time_ms")
            .map_err(db_err)? as u64,
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<WasmEvent, StoreError> {
    Ok(WasmEvent {
        block_height: row.try_get::<i64, _>("block_height").map_err(db_err)? as u64,
        block_time_unix_ms: row.try_get::<i64, _>("block_time_ms").map_err(db_err)? as u64,
        contract_address: row.try_get::<String, _>("contract_address").map_err(db_err)?,
        code_id: row.try_get::<i64, _>("code_id").map_err(db_err)? as u64,
        key: row.try_get::<String, _>("key").map_err(db_err)?,
        value: row.try_get::<Option<String>, _>("value").map_err(db_err)?,
        value_json: row
            .try_get::<Option<serde_json::Value>, _>("value_json")
            .map_err(db_err)?,
        deleted: row.try_get::<bool, _>("deleted").map_err(db_err)?,
    })
}

fn computation_from_row(row: &sqlx::postgres::PgRow) -> Result<Computation, StoreError> {
    Ok(Computation {
        id: row.try_get::<i64, _>("id").map_err(db_err)?,
        formula: row.try_get::<String, _>("formula").map_err(db_err)?,
        target_contract: row.try_get::<String, _>("target_contract").map_err(db_err)?,
        args: row.try_get::<String, _>("args").map_err(db_err)?,
        block_height_valid: row.try_get::<i64, _>("block_height_valid").map_err(db_err)? as u64,
        block_height_latest: row
            .try_get::<i64, _>("block_height_latest")
            .map_err(db_err)? as u64,
        output: row
            .try_get::<Option<serde_json::Value>, _>("output")
            .map_err(db_err)?
            .unwrap_or(serde_json::Value::Null),
    })
}

/// SQL LIKE pattern for "key under prefix". Canonical keys contain only
/// digits and commas, so no LIKE metacharacter escaping is needed.
fn prefix_like(prefix: &str) -> String {
    if prefix.is_empty() {
        "%".to_string()
    } else {
        format!("{prefix},%")
    }
}

#[async_trait]
impl EventStore for PostgresStorage {
    async fn upsert_contracts(&self, batch: &[WasmEvent]) -> Result<Vec<Contract>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        // Per address: earliest event wins the instantiation columns, the
        // last event in the batch wins code_id.
        let mut addresses: Vec<String> = Vec::new();
        let mut per_address: std::collections::HashMap<&str, (u64, u64, u64)> =
            std::collections::HashMap::new();
        for event in batch {
            per_address
                .entry(event.contract_address.as_str())
                .and_modify(|(height, time_ms, code_id)| {
                    if event.block_height < *height {
                        *height = event.block_height;
                        *time_ms = event.block_time_unix_ms;
                    }
                    *code_id = event.code_id;
                })
                .or_insert_with(|| {
                    addresses.push(event.contract_address.clone());
                    (event.block_height, event.block_time_unix_ms, event.code_id)
                });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = async {
                let mut tx = self.pool.begin().await.map_err(db_err)?;
                for (address, (height, time_ms, code_id)) in &per_address {
                    sqlx::query(
                        "INSERT INTO wasmindex_contracts
                            (address, code_id, instantiated_at_height, instantiated_at_time_ms)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (address) DO UPDATE SET code_id = EXCLUDED.code_id",
                    )
                    .bind(*address)
                    .bind(*code_id as i64)
                    .bind(*height as i64)
                    .bind(*time_ms as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
                tx.commit().await.map_err(db_err)
            }
            .await;

            match result {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < CONTRACT_UPSERT_ATTEMPTS => {
                    warn!(attempt, error = %e, "contract upsert conflict, retrying");
                }
                Err(e) if e.is_transient() => {
                    return Err(StoreError::Fatal(format!(
                        "contract upsert failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        self.contracts_by_address(&addresses).await
    }

    async fn upsert_events(
        &self,
        batch: &[WasmEvent],
    ) -> Result<Vec<StoredWasmEvent>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for event in batch {
            sqlx::query(
                "INSERT INTO wasmindex_events
                    (block_height, contract_address, key, code_id, value, value_json,
                     deleted, block_time_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (block_height, contract_address, key)
                 DO UPDATE SET value      = EXCLUDED.value,
                               value_json = EXCLUDED.value_json,
                               deleted    = EXCLUDED.deleted",
            )
            .bind(event.block_height as i64)
            .bind(&event.contract_address)
            .bind(&event.key)
            .bind(event.code_id as i64)
            .bind(&event.value)
            .bind(&event.value_json)
            .bind(event.deleted)
            .bind(event.block_time_unix_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        let addresses: Vec<String> = {
            let mut seen = Vec::new();
            for event in batch {
                if !seen.contains(&event.contract_address) {
                    seen.push(event.contract_address.clone());
                }
            }
            seen
        };
        let contracts = self.contracts_by_address(&addresses).await?;

        batch
            .iter()
            .map(|event| {
                let contract = contracts
                    .iter()
                    .find(|c| c.address == event.contract_address)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("contract {}", event.contract_address))
                    })?;
                Ok(StoredWasmEvent {
                    event: event.clone(),
                    contract,
                })
            })
            .collect()
    }

    async fn latest_event_at(
        &self,
        contract: &str,
        key: &str,
        at: u64,
    ) -> Result<Option<WasmEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_events
             WHERE contract_address = $1 AND key = $2 AND block_height <= $3
             ORDER BY block_height DESC
             LIMIT 1",
        )
        .bind(contract)
        .bind(key)
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn map_at(
        &self,
        contract: &str,
        prefix: &str,
        at: u64,
    ) -> Result<Vec<WasmEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT DISTINCT ON (key) *
                 FROM wasmindex_events
                 WHERE contract_address = $1
                   AND (key = $2 OR key LIKE $3)
                   AND block_height <= $4
                 ORDER BY key, block_height DESC
             ) latest
             WHERE NOT deleted
             ORDER BY key",
        )
        .bind(contract)
        .bind(prefix)
        .bind(prefix_like(prefix))
        .bind(at as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn first_set(
        &self,
        contract: &str,
        key: &str,
    ) -> Result<Option<WasmEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_events
             WHERE contract_address = $1 AND key = $2 AND NOT deleted
             ORDER BY block_height ASC
             LIMIT 1",
        )
        .bind(contract)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn previous_event(
        &self,
        contract: &str,
        key: &str,
        before: u64,
    ) -> Result<Option<WasmEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_events
             WHERE contract_address = $1 AND key = $2 AND block_height < $3
             ORDER BY block_height DESC
             LIMIT 1",
        )
        .bind(contract)
        .bind(key)
        .bind(before as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn event_heights_matching(
        &self,
        deps: &[Dependency],
        from: u64,
        to: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let mut heights: Vec<u64> = Vec::new();
        for dep in deps {
            let rows = match dep {
                Dependency::Point { contract, key } => {
                    sqlx::query(
                        "SELECT DISTINCT block_height FROM wasmindex_events
                         WHERE contract_address = $1 AND key = $2
                           AND block_height BETWEEN $3 AND $4",
                    )
                    .bind(contract)
                    .bind(key)
                    .bind(from as i64)
                    .bind(to as i64)
                    .fetch_all(&self.pool)
                    .await
                }
                Dependency::Prefix { contract, prefix } => {
                    sqlx::query(
                        "SELECT DISTINCT block_height FROM wasmindex_events
                         WHERE contract_address = $1 AND (key = $2 OR key LIKE $3)
                           AND block_height BETWEEN $4 AND $5",
                    )
                    .bind(contract)
                    .bind(prefix)
                    .bind(prefix_like(prefix))
                    .bind(from as i64)
                    .bind(to as i64)
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .map_err(db_err)?;

            for row in rows {
                heights.push(row.try_get::<i64, _>("block_height").map_err(db_err)? as u64);
            }
        }
        heights.sort_unstable();
        heights.dedup();
        Ok(heights)
    }

    async fn latest_block_time_at(&self, at: u64) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(
            "SELECT block_time_ms FROM wasmindex_events
             WHERE block_height <= $1
             ORDER BY block_height DESC
             LIMIT 1",
        )
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| Ok(r.try_get::<i64, _>("block_time_ms").map_err(db_err)? as u64))
            .transpose()
    }

    async fn contract(&self, address: &str) -> Result<Option<Contract>, StoreError> {
        let row = sqlx::query(
            "SELECT address, code_id, instantiated_at_height, instantiated_at_time_ms
             FROM wasmindex_contracts WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(contract_from_row).transpose()
    }

    async fn contract_has_events(&self, address: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM wasmindex_events WHERE contract_address = $1
             ) AS present",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get::<bool, _>("present").map_err(db_err)
    }
}

#[async_trait]
impl TransformationStore for PostgresStorage {
    async fn upsert_transformations(
        &self,
        rows: &[Transformation],
    ) -> Result<Vec<Transformation>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO wasmindex_transformations
                    (block_height, contract_address, name, value)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (block_height, contract_address, name)
                 DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(row.block_height as i64)
            .bind(&row.contract_address)
            .bind(&row.name)
            .bind(&row.value)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.to_vec())
    }

    async fn latest_transformation_at(
        &self,
        contract: &str,
        name: &str,
        at: u64,
    ) -> Result<Option<Transformation>, StoreError> {
        let row = sqlx::query(
            "SELECT block_height, contract_address, name, value
             FROM wasmindex_transformations
             WHERE contract_address = $1 AND name = $2 AND block_height <= $3
             ORDER BY block_height DESC
             LIMIT 1",
        )
        .bind(contract)
        .bind(name)
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| {
            Ok(Transformation {
                block_height: r.try_get::<i64, _>("block_height").map_err(db_err)? as u64,
                contract_address: r.try_get::<String, _>("contract_address").map_err(db_err)?,
                name: r.try_get::<String, _>("name").map_err(db_err)?,
                value: r
                    .try_get::<Option<serde_json::Value>, _>("value")
                    .map_err(db_err)?
                    .unwrap_or(serde_json::Value::Null),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ComputationStore for PostgresStorage {
    async fn find_valid_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        at: u64,
    ) -> Result<Option<Computation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_computations
             WHERE formula = $1 AND target_contract = $2 AND args = $3
               AND block_height_valid <= $4 AND block_height_latest >= $4
             LIMIT 1",
        )
        .bind(formula)
        .bind(contract)
        .bind(args)
        .bind(at as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(computation_from_row).transpose()
    }

    async fn ending_at(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_computations
             WHERE formula = $1 AND target_contract = $2 AND args = $3
               AND block_height_latest = $4
             LIMIT 1",
        )
        .bind(formula)
        .bind(contract)
        .bind(args)
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(computation_from_row).transpose()
    }

    async fn latest_computation_before(
        &self,
        formula: &str,
        contract: &str,
        args: &str,
        height: u64,
    ) -> Result<Option<Computation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM wasmindex_computations
             WHERE formula = $1 AND target_contract = $2 AND args = $3
               AND block_height_latest < $4
             ORDER BY block_height_latest DESC
             LIMIT 1",
        )
        .bind(formula)
        .bind(contract)
        .bind(args)
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(computation_from_row).transpose()
    }

    async fn insert_computation(
        &self,
        computation: NewComputation,
        deps: &[Dependency],
    ) -> Result<Computation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "INSERT INTO wasmindex_computations
                (formula, target_contract, args, block_height_valid,
                 block_height_latest, output)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (formula, target_contract, args, block_height_valid)
             DO UPDATE SET block_height_latest = EXCLUDED.block_height_latest,
                           output              = EXCLUDED.output
             RETURNING *",
        )
        .bind(&computation.formula)
        .bind(&computation.target_contract)
        .bind(&computation.args)
        .bind(computation.block_height_valid as i64)
        .bind(computation.block_height_latest as i64)
        .bind(&computation.output)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let inserted = computation_from_row(&row)?;

        // Replace the dependency rows atomically with the new set.
        sqlx::query("DELETE FROM wasmindex_computation_dependencies WHERE computation_id = $1")
            .bind(inserted.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for dep in deps {
            sqlx::query(
                "INSERT INTO wasmindex_computation_dependencies
                    (computation_id, contract_address, key_or_prefix, is_prefix)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(inserted.id)
            .bind(dep.contract())
            .bind(dep.key_or_prefix())
            .bind(dep.is_prefix())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn extend_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE wasmindex_computations SET block_height_latest = $2 WHERE id = $1")
            .bind(id)
            .bind(new_latest as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn replace_dependencies(&self, id: i64, deps: &[Dependency]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM wasmindex_computation_dependencies WHERE computation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for dep in deps {
            sqlx::query(
                "INSERT INTO wasmindex_computation_dependencies
                    (computation_id, contract_address, key_or_prefix, is_prefix)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(dep.contract())
            .bind(dep.key_or_prefix())
            .bind(dep.is_prefix())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn truncate_latest(&self, id: i64, new_latest: u64) -> Result<(), StoreError> {
        self.extend_latest(id, new_latest).await
    }

    async fn destroy_computation(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wasmindex_computations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn dependents_of(
        &self,
        changes: &[Change],
    ) -> Result<Vec<ComputationWithDeps>, StoreError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let contracts: Vec<String> = {
            let mut seen = Vec::new();
            for change in changes {
                if !seen.contains(&change.contract_address) {
                    seen.push(change.contract_address.clone());
                }
            }
            seen
        };

        // Candidate dependency rows by contract; the byte-exact prefix test
        // happens in Rust because LIKE can't express the boundary comma.
        let dep_rows = sqlx::query(
            "SELECT computation_id, contract_address, key_or_prefix, is_prefix
             FROM wasmindex_computation_dependencies
             WHERE contract_address = ANY($1)",
        )
        .bind(&contracts)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut matched_ids: Vec<i64> = Vec::new();
        for row in &dep_rows {
            let id = row.try_get::<i64, _>("computation_id").map_err(db_err)?;
            if matched_ids.contains(&id) {
                continue;
            }
            let dep = dependency_from_row(row)?;
            if changes
                .iter()
                .any(|ch| dep.matches(&ch.contract_address, &ch.key))
            {
                matched_ids.push(id);
            }
        }
        if matched_ids.is_empty() {
            return Ok(Vec::new());
        }

        let comp_rows = sqlx::query("SELECT * FROM wasmindex_computations WHERE id = ANY($1)")
            .bind(&matched_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let all_dep_rows = sqlx::query(
            "SELECT computation_id, contract_address, key_or_prefix, is_prefix
             FROM wasmindex_computation_dependencies
             WHERE computation_id = ANY($1)",
        )
        .bind(&matched_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(comp_rows.len());
        for row in &comp_rows {
            let computation = computation_from_row(row)?;
            let mut dependencies = Vec::new();
            for dep_row in &all_dep_rows {
                let id = dep_row
                    .try_get::<i64, _>("computation_id")
                    .map_err(db_err)?;
                if id == computation.id {
                    dependencies.push(dependency_from_row(dep_row)?);
                }
            }
            out.push(ComputationWithDeps {
                computation,
                dependencies,
            });
        }
        Ok(out)
    }
}

fn dependency_from_row(row: &sqlx::postgres::PgRow) -> Result<Dependency, StoreError> {
    let contract = row.try_get::<String, _>("contract_address").map_err(db_err)?;
    let key_or_prefix = row.try_get::<String, _>("key_or_prefix").map_err(db_err)?;
    let is_prefix = row.try_get::<bool, _>("is_prefix").map_err(db_err)?;
    Ok(if is_prefix {
        Dependency::prefix(contract, key_or_prefix)
    } else {
        Dependency::point(contract, key_or_prefix)
    })
}

#[async_trait]
impl StateStore for PostgresStorage {
    async fn state(&self) -> Result<State, StoreError> {
        let row = sqlx::query(
            "SELECT last_wasm_block_height_exported, latest_block_height, latest_block_time_ms
             FROM wasmindex_state WHERE id = TRUE",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            Some(r) => State {
                last_wasm_block_height_exported: r
                    .try_get::<i64, _>("last_wasm_block_height_exported")
                    .map_err(db_err)? as u64,
                latest_block_height: r.try_get::<i64, _>("latest_block_height").map_err(db_err)?
                    as u64,
                latest_block_time_unix_ms: r
                    .try_get::<i64, _>("latest_block_time_ms")
                    .map_err(db_err)? as u64,
            },
            None => State::default(),
        })
    }

    async fn advance_state(
        &self,
        last_exported: Option<u64>,
        latest: Option<(u64, u64)>,
    ) -> Result<State, StoreError> {
        let (latest_height, latest_time) = latest.unwrap_or((0, 0));
        let row = sqlx::query(
            "INSERT INTO wasmindex_state
                (id, last_wasm_block_height_exported, latest_block_height, latest_block_time_ms)
             VALUES (TRUE, $1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET
                last_wasm_block_height_exported =
                    GREATEST(wasmindex_state.last_wasm_block_height_exported,
                             EXCLUDED.last_wasm_block_height_exported),
                latest_block_height =
                    GREATEST(wasmindex_state.latest_block_height,
                             EXCLUDED.latest_block_height),
                latest_block_time_ms =
                    GREATEST(wasmindex_state.latest_block_time_ms,
                             EXCLUDED.latest_block_time_ms)
             RETURNING last_wasm_block_height_exported, latest_block_height,
                       latest_block_time_ms",
        )
        .bind(last_exported.unwrap_or(0) as i64)
        .bind(latest_height as i64)
        .bind(latest_time as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(State {
            last_wasm_block_height_exported: row
                .try_get::<i64, _>("last_wasm_block_height_exported")
                .map_err(db_err)? as u64,
            latest_block_height: row.try_get::<i64, _>("latest_block_height").map_err(db_err)?
                as u64,
            latest_block_time_unix_ms: row
                .try_get::<i64, _>("latest_block_time_ms")
                .map_err(db_err)? as u64,
        })
    }
}

#[async_trait]
impl WebhookQueue for PostgresStorage {
    async fn enqueue_webhooks(&self, rows: &[NewPendingWebhook]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO wasmindex_pending_webhooks
                    (block_height, contract_address, key, endpoint, value, failures)
                 VALUES ($1, $2, $3, $4, $5, 0)",
            )
            .bind(row.block_height as i64)
            .bind(&row.contract_address)
            .bind(&row.key)
            .bind(serde_json::to_value(&row.endpoint)?)
            .bind(&row.value)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn pending_webhooks(&self, limit: i64) -> Result<Vec<PendingWebhook>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM wasmindex_pending_webhooks ORDER BY id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let endpoint: Endpoint =
                    serde_json::from_value(row.try_get::<serde_json::Value, _>("endpoint")
                        .map_err(db_err)?)?;
                Ok(PendingWebhook {
                    id: row.try_get::<i64, _>("id").map_err(db_err)?,
                    block_height: row.try_get::<i64, _>("block_height").map_err(db_err)? as u64,
                    contract_address: row
                        .try_get::<String, _>("contract_address")
                        .map_err(db_err)?,
                    key: row.try_get::<String, _>("key").map_err(db_err)?,
                    endpoint,
                    value: row.try_get::<serde_json::Value, _>("value").map_err(db_err)?,
                    failures: row.try_get::<i32, _>("failures").map_err(db_err)? as u32,
                })
            })
            .collect()
    }

    async fn delete_webhook(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wasmindex_pending_webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_webhook_failure(&self, id: i64) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE wasmindex_pending_webhooks
             SET failures = failures + 1
             WHERE id = $1
             RETURNING failures",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("pending webhook {id}")))?;

        Ok(row.try_get::<i32, _>("failures").map_err(db_err)? as u32)
    }
}
