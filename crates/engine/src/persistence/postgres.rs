//! PostgreSQL implementation of InstanceStore
//!
//! Production persistence using PostgreSQL with:
//! - Batch claiming of due instances with `FOR UPDATE SKIP LOCKED`
//! - Optimistic write-back checked against the claim's version
//! - Executor leases evaluated against the database clock

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::store::*;

/// PostgreSQL implementation of InstanceStore
///
/// Uses a connection pool shared by all workers of one executor process.
/// Tables are created by the migrations embedded with this crate.
///
/// # Example
///
/// ```ignore
/// use stateflow_engine::PostgresInstanceStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/stateflow").await?;
/// stateflow_engine::MIGRATOR.run(&pool).await?;
/// let store = PostgresInstanceStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
    max_variable_length: usize,
}

impl PostgresInstanceStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_variable_length: DEFAULT_MAX_VARIABLE_LENGTH,
        }
    }

    /// Set the maximum state variable length
    pub fn with_max_variable_length(mut self, length: usize) -> Self {
        self.max_variable_length = length;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    // =========================================================================
    // Instances
    // =========================================================================

    #[instrument(skip(self, instance), fields(workflow_type = %instance.workflow_type))]
    async fn insert_instance(&self, instance: NewInstance) -> Result<Uuid, StoreError> {
        instance.validate(self.max_variable_length)?;

        let id = Uuid::now_v7();
        let external_id = instance.external_id.unwrap_or_else(|| id.to_string());
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| database_error("begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO stateflow_instances
                (id, workflow_type, executor_group, business_key, external_id,
                 state, state_text, status, next_activation, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&instance.workflow_type)
        .bind(&instance.executor_group)
        .bind(&instance.business_key)
        .bind(&external_id)
        .bind(&instance.state)
        .bind(&instance.state_text)
        .bind(instance.status.as_str())
        .bind(instance.next_activation)
        .bind(instance.priority)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::ValidationError(format!(
                    "duplicate external id {} for workflow type {}",
                    external_id, instance.workflow_type
                ))
            } else {
                database_error("insert instance", e)
            }
        })?;

        upsert_variables(&mut tx, id, &instance.variables).await?;

        tx.commit()
            .await
            .map_err(|e| database_error("commit insert", e))?;

        debug!(instance_id = %id, state = %instance.state, "inserted workflow instance");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query("SELECT * FROM stateflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error("get instance", e))?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let mut instances = vec![instance_from_row(&row)?];
        self.attach_variables(&mut instances).await?;
        Ok(instances.remove(0))
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        filter: InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM stateflow_instances
            WHERE ($1::text IS NULL OR workflow_type = $1)
              AND ($2::text IS NULL OR state = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::text IS NULL OR business_key = $4)
              AND ($5::text IS NULL OR external_id = $5)
              AND ($6::text IS NULL OR executor_group = $6)
            ORDER BY id DESC
            LIMIT $7
            "#,
        )
        .bind(&filter.workflow_type)
        .bind(&filter.state)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.business_key)
        .bind(&filter.external_id)
        .bind(&filter.executor_group)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("list instances", e))?;

        let mut instances = rows
            .iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.attach_variables(&mut instances).await?;
        Ok(instances)
    }

    #[instrument(skip(self))]
    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionRecord>, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM stateflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error("check instance", e))?;
        if exists.is_none() {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, action_type, state, state_text, retry_no,
                   executor_id, execution_start, execution_end, updated_variables
            FROM stateflow_actions
            WHERE instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("list actions", e))?;

        rows.iter().map(action_from_row).collect()
    }

    #[instrument(skip(self, update), fields(state = %update.state, status = %update.status))]
    async fn update_manual(
        &self,
        instance_id: Uuid,
        update: ManualUpdate,
    ) -> Result<WorkflowInstance, StoreError> {
        update.validate(self.max_variable_length)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| database_error("begin transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT i.state, i.retries,
                   (i.status = 'executing' AND EXISTS (
                        SELECT 1 FROM stateflow_executors e
                        WHERE e.id = i.executor_id
                          AND e.stopped IS NULL
                          AND e.expires > NOW()
                   )) AS claimed
            FROM stateflow_instances i
            WHERE i.id = $1
            FOR UPDATE
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| database_error("lock instance", e))?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if row.get::<bool, _>("claimed") {
            return Err(StoreError::ConcurrentModification(instance_id));
        }
        let previous_state: String = row.get("state");
        let previous_retries: i32 = row.get("retries");

        sqlx::query(
            r#"
            UPDATE stateflow_instances
            SET state = $2,
                status = $3,
                next_activation = $4,
                state_text = $5,
                retries = CASE WHEN state = $2 THEN retries ELSE 0 END,
                executor_id = NULL,
                version = version + 1,
                modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(&update.state)
        .bind(update.status.as_str())
        .bind(update.next_activation)
        .bind(&update.reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| database_error("update instance", e))?;

        upsert_variables(&mut tx, instance_id, &update.variables).await?;

        let now = Utc::now();
        insert_action(
            &mut tx,
            instance_id,
            None,
            NewAction {
                action_type: ActionType::ExternalChange,
                state: previous_state,
                state_text: Some(update.reason),
                retry_no: previous_retries as u32,
                execution_start: now,
                execution_end: now,
            },
            &update.variables,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| database_error("commit manual update", e))?;

        info!(%instance_id, "applied manual update");
        self.get_instance(instance_id).await
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    #[instrument(skip(self))]
    async fn claim_due_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let live = sqlx::query(
            r#"
            SELECT 1 FROM stateflow_executors
            WHERE id = $1 AND stopped IS NULL AND expires > NOW()
            "#,
        )
        .bind(executor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| database_error("check executor lease", e))?;
        if live.is_none() {
            return Err(StoreError::ExecutorNotFound(executor_id));
        }

        // Rows locked by a concurrent claim are skipped rather than waited
        // on, so overlapping claims from many executors never block.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT i.id
                FROM stateflow_instances i
                WHERE i.executor_group = $2
                  AND i.status IN ('created', 'in_progress', 'executing')
                  AND i.next_activation <= NOW()
                  AND (
                      i.executor_id IS NULL
                      OR NOT EXISTS (
                          SELECT 1 FROM stateflow_executors e
                          WHERE e.id = i.executor_id
                            AND e.stopped IS NULL
                            AND e.expires > NOW()
                      )
                  )
                ORDER BY i.next_activation, i.priority DESC
                LIMIT $3
                FOR UPDATE OF i SKIP LOCKED
            )
            UPDATE stateflow_instances i
            SET status = 'executing',
                executor_id = $1,
                version = i.version + 1,
                modified = NOW(),
                started = COALESCE(i.started, NOW())
            FROM claimable c
            WHERE i.id = c.id
            RETURNING i.*
            "#,
        )
        .bind(executor_id)
        .bind(executor_group)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("claim instances", e))?;

        let mut claimed = rows
            .iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|i| (i.next_activation, Reverse(i.priority)));
        self.attach_variables(&mut claimed).await?;

        if !claimed.is_empty() {
            debug!(%executor_id, count = claimed.len(), "claimed instances");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, claim, outcome), fields(instance_id = %claim.instance_id, state = %outcome.state))]
    async fn update_after_execution(
        &self,
        claim: &ClaimToken,
        outcome: ExecutionOutcome,
    ) -> Result<(), StoreError> {
        validate_variables(&outcome.updated_variables, self.max_variable_length)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| database_error("begin transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE stateflow_instances
            SET state = $5,
                state_text = $6,
                status = $7,
                next_activation = $8,
                retries = $9,
                executor_id = NULL,
                version = version + 1,
                modified = NOW()
            WHERE id = $1
              AND executor_id = $2
              AND version = $3
              AND state = $4
              AND status = 'executing'
            "#,
        )
        .bind(claim.instance_id)
        .bind(claim.executor_id)
        .bind(claim.version)
        .bind(&claim.state)
        .bind(&outcome.state)
        .bind(&outcome.state_text)
        .bind(outcome.status.as_str())
        .bind(outcome.next_activation)
        .bind(outcome.retries as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| database_error("update instance", e))?;

        if result.rows_affected() == 0 {
            return Err(missing_or_conflict(&mut tx, claim.instance_id).await);
        }

        upsert_variables(&mut tx, claim.instance_id, &outcome.updated_variables).await?;
        insert_action(
            &mut tx,
            claim.instance_id,
            Some(claim.executor_id),
            outcome.action,
            &outcome.updated_variables,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| database_error("commit execution", e))?;

        debug!(
            instance_id = %claim.instance_id,
            status = %outcome.status,
            retries = outcome.retries,
            "stored execution outcome"
        );
        Ok(())
    }

    #[instrument(skip(self, claim), fields(instance_id = %claim.instance_id))]
    async fn release_claim(
        &self,
        claim: &ClaimToken,
        next_activation: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| database_error("acquire connection", e))?;

        let result = sqlx::query(
            r#"
            UPDATE stateflow_instances
            SET executor_id = NULL,
                next_activation = $5,
                version = version + 1,
                modified = NOW()
            WHERE id = $1
              AND executor_id = $2
              AND version = $3
              AND state = $4
              AND status = 'executing'
            "#,
        )
        .bind(claim.instance_id)
        .bind(claim.executor_id)
        .bind(claim.version)
        .bind(&claim.state)
        .bind(next_activation)
        .execute(&mut *conn)
        .await
        .map_err(|e| database_error("release claim", e))?;

        if result.rows_affected() == 0 {
            return Err(missing_or_conflict(&mut conn, claim.instance_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_orphaned_instances(
        &self,
        executor_id: Uuid,
        executor_group: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH orphaned AS (
                SELECT i.id, i.executor_id AS previous_executor
                FROM stateflow_instances i
                WHERE i.status = 'executing'
                  AND i.executor_group = $2
                  AND i.executor_id IS NOT NULL
                  AND NOT EXISTS (
                      SELECT 1 FROM stateflow_executors e
                      WHERE e.id = i.executor_id
                        AND e.stopped IS NULL
                        AND e.expires > NOW()
                  )
                FOR UPDATE OF i SKIP LOCKED
            ),
            recovered AS (
                UPDATE stateflow_instances i
                SET status = 'in_progress',
                    executor_id = NULL,
                    next_activation = NOW(),
                    version = i.version + 1,
                    modified = NOW()
                FROM orphaned o
                WHERE i.id = o.id
                RETURNING i.id, i.state, i.retries, o.previous_executor
            )
            INSERT INTO stateflow_actions
                (instance_id, action_type, state, state_text, retry_no,
                 executor_id, execution_start, execution_end)
            SELECT id, 'recovery', state,
                   'recovered from expired executor ' || previous_executor::text,
                   retries, $1, NOW(), NOW()
            FROM recovered
            RETURNING instance_id
            "#,
        )
        .bind(executor_id)
        .bind(executor_group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("recover orphaned instances", e))?;

        let recovered: Vec<Uuid> = rows.iter().map(|r| r.get("instance_id")).collect();
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered instances of expired executors");
        }
        Ok(recovered)
    }

    // =========================================================================
    // Executors
    // =========================================================================

    #[instrument(skip(self, executor), fields(host = %executor.host, pid = executor.pid))]
    async fn register_executor(
        &self,
        executor: NewExecutor,
        lease: Duration,
    ) -> Result<ExecutorInfo, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stateflow_executors (id, host, pid, executor_group, expires)
            VALUES ($1, $2, $3, $4, NOW() + make_interval(secs => $5))
            RETURNING id, host, pid, executor_group, started, active, expires, stopped
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&executor.host)
        .bind(executor.pid as i32)
        .bind(&executor.executor_group)
        .bind(lease.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| database_error("register executor", e))?;

        let info = executor_from_row(&row);
        info!(executor_id = %info.id, group = %info.executor_group, "registered executor");
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn heartbeat_executor(
        &self,
        executor_id: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stateflow_executors
            SET active = NOW(),
                expires = NOW() + make_interval(secs => $2)
            WHERE id = $1 AND stopped IS NULL AND expires > NOW()
            "#,
        )
        .bind(executor_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| database_error("heartbeat executor", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutorNotFound(executor_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_executor(&self, executor_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| database_error("begin transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE stateflow_executors
            SET stopped = NOW(), expires = NOW()
            WHERE id = $1
            "#,
        )
        .bind(executor_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| database_error("deregister executor", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutorNotFound(executor_id));
        }

        let released = sqlx::query(
            r#"
            UPDATE stateflow_instances
            SET executor_id = NULL,
                version = version + 1,
                modified = NOW()
            WHERE executor_id = $1 AND status = 'executing'
            "#,
        )
        .bind(executor_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| database_error("release executor claims", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| database_error("commit deregistration", e))?;

        info!(%executor_id, released, "deregistered executor");
        Ok(released)
    }

    #[instrument(skip(self))]
    async fn list_executors(
        &self,
        executor_group: &str,
    ) -> Result<Vec<ExecutorInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, host, pid, executor_group, started, active, expires, stopped
            FROM stateflow_executors
            WHERE executor_group = $1
            ORDER BY id
            "#,
        )
        .bind(executor_group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("list executors", e))?;

        Ok(rows.iter().map(executor_from_row).collect())
    }
}

impl PostgresInstanceStore {
    /// Load state variables for a batch of instances in one query
    async fn attach_variables(&self, instances: &mut [WorkflowInstance]) -> Result<(), StoreError> {
        if instances.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = instances.iter().map(|i| i.id).collect();
        let rows = sqlx::query(
            r#"
            SELECT instance_id, name, value
            FROM stateflow_state_variables
            WHERE instance_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error("load state variables", e))?;

        let mut by_instance: HashMap<Uuid, BTreeMap<String, String>> = HashMap::new();
        for row in rows {
            by_instance
                .entry(row.get("instance_id"))
                .or_default()
                .insert(row.get("name"), row.get("value"));
        }
        for instance in instances {
            if let Some(variables) = by_instance.remove(&instance.id) {
                instance.variables = variables;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Helper functions
// =============================================================================

async fn upsert_variables(
    conn: &mut PgConnection,
    instance_id: Uuid,
    variables: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    if variables.is_empty() {
        return Ok(());
    }

    let (names, values): (Vec<&str>, Vec<&str>) = variables
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .unzip();

    sqlx::query(
        r#"
        INSERT INTO stateflow_state_variables (instance_id, name, value)
        SELECT $1, v.name, v.value
        FROM UNNEST($2::text[], $3::text[]) AS v(name, value)
        ON CONFLICT (instance_id, name) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(instance_id)
    .bind(&names)
    .bind(&values)
    .execute(conn)
    .await
    .map_err(|e| database_error("upsert state variables", e))?;
    Ok(())
}

async fn insert_action(
    conn: &mut PgConnection,
    instance_id: Uuid,
    executor_id: Option<Uuid>,
    action: NewAction,
    updated_variables: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    let updated = serde_json::to_value(updated_variables)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO stateflow_actions
            (instance_id, action_type, state, state_text, retry_no,
             executor_id, execution_start, execution_end, updated_variables)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(instance_id)
    .bind(action.action_type.as_str())
    .bind(&action.state)
    .bind(&action.state_text)
    .bind(action.retry_no as i32)
    .bind(executor_id)
    .bind(action.execution_start)
    .bind(action.execution_end)
    .bind(&updated)
    .execute(conn)
    .await
    .map_err(|e| database_error("insert action", e))?;
    Ok(())
}

/// Distinguish a vanished instance from a lost claim after a guarded update
async fn missing_or_conflict(conn: &mut PgConnection, instance_id: Uuid) -> StoreError {
    let exists = sqlx::query("SELECT 1 FROM stateflow_instances WHERE id = $1")
        .bind(instance_id)
        .fetch_optional(conn)
        .await;

    match exists {
        Ok(None) => StoreError::InstanceNotFound(instance_id),
        Ok(Some(_)) => StoreError::ConcurrentModification(instance_id),
        Err(e) => database_error("check instance", e),
    }
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        executor_group: row.get("executor_group"),
        business_key: row.get("business_key"),
        external_id: row.get("external_id"),
        state: row.get("state"),
        state_text: row.get("state_text"),
        status: status.parse()?,
        next_activation: row.get("next_activation"),
        retries: row.get::<i32, _>("retries") as u32,
        priority: row.get("priority"),
        executor_id: row.get("executor_id"),
        version: row.get("version"),
        variables: BTreeMap::new(),
        created: row.get("created"),
        modified: row.get("modified"),
        started: row.get("started"),
    })
}

fn action_from_row(row: &PgRow) -> Result<ActionRecord, StoreError> {
    let action_type: String = row.get("action_type");
    let updated: serde_json::Value = row.get("updated_variables");
    Ok(ActionRecord {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        action_type: action_type.parse()?,
        state: row.get("state"),
        state_text: row.get("state_text"),
        retry_no: row.get::<i32, _>("retry_no") as u32,
        executor_id: row.get("executor_id"),
        execution_start: row.get("execution_start"),
        execution_end: row.get("execution_end"),
        updated_variables: serde_json::from_value(updated)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn executor_from_row(row: &PgRow) -> ExecutorInfo {
    ExecutorInfo {
        id: row.get("id"),
        host: row.get("host"),
        pid: row.get::<i32, _>("pid") as u32,
        executor_group: row.get("executor_group"),
        started: row.get("started"),
        active: row.get("active"),
        expires: row.get("expires"),
        stopped: row.get("stopped"),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

fn database_error(operation: &'static str, error: sqlx::Error) -> StoreError {
    error!(operation, error = %error, "database operation failed");
    StoreError::Database(error.to_string())
}
