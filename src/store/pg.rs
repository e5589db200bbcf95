//! PostgreSQL persistence backend.
//!
//! Creates its tables with `CREATE TABLE IF NOT EXISTS` on startup, so a
//! fresh database needs no out-of-band migration step. Status and mode
//! columns are stored as TEXT and parsed on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::models::{ExecStatus, Execution, Mode, Step, StepExecution, StepStatus, Workflow};
use crate::types::{StepCreate, StepUpdate, WorkflowCreate, WorkflowUpdate};

use super::{Store, StoreError, StoreResult, validate_step, validate_workflow_name};

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run the create-if-missing migration.
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they don't exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discovery_workflows (
                id             UUID PRIMARY KEY,
                name           TEXT NOT NULL,
                mode           TEXT NOT NULL DEFAULT 'automatic',
                created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS discovery_steps (
                id             UUID PRIMARY KEY,
                workflow_id    UUID NOT NULL REFERENCES discovery_workflows(id) ON DELETE CASCADE,
                name           TEXT NOT NULL,
                "order"        INTEGER NOT NULL,
                max_visits     INTEGER NOT NULL DEFAULT 1,
                is_terminal    BOOLEAN NOT NULL DEFAULT FALSE,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS discovery_workflow_executions (
                id              UUID PRIMARY KEY,
                workflow_id     UUID NOT NULL REFERENCES discovery_workflows(id) ON DELETE CASCADE,
                status          TEXT NOT NULL DEFAULT 'running',
                mode            TEXT NOT NULL,
                current_step_id UUID REFERENCES discovery_steps(id) ON DELETE SET NULL,
                context         JSONB NOT NULL DEFAULT '{}',
                additional_data JSONB,
                custom_status   TEXT,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS discovery_step_executions (
                id             UUID PRIMARY KEY,
                step_id        UUID NOT NULL REFERENCES discovery_steps(id) ON DELETE CASCADE,
                workflow_id    UUID NOT NULL REFERENCES discovery_workflows(id) ON DELETE CASCADE,
                execution_id   UUID NOT NULL REFERENCES discovery_workflow_executions(id) ON DELETE CASCADE,
                status         TEXT NOT NULL DEFAULT 'pending',
                attempt        INTEGER NOT NULL DEFAULT 0,
                input_payload  JSONB,
                output_payload JSONB,
                started_at     TIMESTAMPTZ,
                finished_at    TIMESTAMPTZ
            );

            CREATE INDEX IF NOT EXISTS idx_discovery_steps_workflow
                ON discovery_steps(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_discovery_executions_workflow
                ON discovery_workflow_executions(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_discovery_step_executions_execution
                ON discovery_step_executions(execution_id);
            CREATE INDEX IF NOT EXISTS idx_discovery_step_executions_step
                ON discovery_step_executions(execution_id, step_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const STEP_COLUMNS: &str =
    r#"id, workflow_id, name, "order", max_visits, is_terminal, created_at, updated_at"#;

const EXECUTION_COLUMNS: &str = r#"id, workflow_id, status, mode, current_step_id, context,
       additional_data, custom_status, created_at, updated_at"#;

const STEP_EXECUTION_COLUMNS: &str = r#"id, step_id, workflow_id, execution_id, status, attempt,
       input_payload, output_payload, started_at, finished_at"#;

#[async_trait]
impl Store for PgStore {
    async fn create_workflow(&self, def: &WorkflowCreate) -> StoreResult<Workflow> {
        validate_workflow_name(&def.name)?;
        for step in &def.steps {
            validate_step(&step.name, step.max_visits)?;
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO discovery_workflows (id, name, mode)
            VALUES ($1, $2, $3)
            RETURNING id, name, mode, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&def.name)
        .bind(def.mode.to_string())
        .fetch_one(&mut *tx)
        .await?;

        for step in &def.steps {
            sqlx::query(
                r#"
                INSERT INTO discovery_steps (id, workflow_id, name, "order", max_visits, is_terminal)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(row.id)
            .bind(&step.name)
            .bind(step.order)
            .bind(step.max_visits)
            .bind(step.is_terminal)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, mode, created_at, updated_at
            FROM discovery_workflows
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, mode, created_at, updated_at
            FROM discovery_workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        patch: &WorkflowUpdate,
    ) -> StoreResult<Option<Workflow>> {
        if let Some(name) = &patch.name {
            validate_workflow_name(name)?;
        }
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE discovery_workflows
            SET name = COALESCE($2, name),
                mode = COALESCE($3, mode),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, mode, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(patch.name.as_deref())
        .bind(patch.mode.map(|m| m.to_string()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool> {
        let active: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM discovery_workflow_executions
            WHERE workflow_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if active > 0 {
            return Err(StoreError::Conflict(
                "workflow has non-terminal executions".to_string(),
            ));
        }

        let result = sqlx::query("DELETE FROM discovery_workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_step(&self, workflow_id: Uuid, def: &StepCreate) -> StoreResult<Step> {
        validate_step(&def.name, def.max_visits)?;
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO discovery_steps (id, workflow_id, name, "order", max_visits, is_terminal)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {STEP_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(workflow_id)
        .bind(&def.name)
        .bind(def.order)
        .bind(def.max_visits)
        .bind(def.is_terminal)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM discovery_steps
            WHERE workflow_id = $1
            ORDER BY "order" ASC, id ASC
            "#,
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_step(&self, id: Uuid) -> StoreResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM discovery_steps WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update_step(&self, id: Uuid, patch: &StepUpdate) -> StoreResult<Option<Step>> {
        if let Some(max_visits) = patch.max_visits {
            if max_visits < 1 {
                return Err(StoreError::InvalidData(
                    "max_visits must be at least 1".to_string(),
                ));
            }
        }
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            UPDATE discovery_steps
            SET name = COALESCE($2, name),
                "order" = COALESCE($3, "order"),
                max_visits = COALESCE($4, max_visits),
                is_terminal = COALESCE($5, is_terminal),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {STEP_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(patch.name.as_deref())
        .bind(patch.order)
        .bind(patch.max_visits)
        .bind(patch.is_terminal)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete_step(&self, id: Uuid) -> StoreResult<bool> {
        let referenced: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM discovery_workflow_executions
            WHERE current_step_id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if referenced > 0 {
            return Err(StoreError::Conflict(
                "step is the current step of a running execution".to_string(),
            ));
        }

        let result = sqlx::query("DELETE FROM discovery_steps WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn first_step(&self, workflow_id: Uuid) -> StoreResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM discovery_steps
            WHERE workflow_id = $1
            ORDER BY "order" ASC, id ASC
            LIMIT 1
            "#,
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn step_after(&self, workflow_id: Uuid, order: i32) -> StoreResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM discovery_steps
            WHERE workflow_id = $1 AND "order" > $2
            ORDER BY "order" ASC, id ASC
            LIMIT 1
            "#,
        ))
        .bind(workflow_id)
        .bind(order)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn step_by_name(&self, workflow_id: Uuid, name: &str) -> StoreResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM discovery_steps
            WHERE workflow_id = $1 AND name = $2
            ORDER BY "order" ASC, id ASC
            LIMIT 1
            "#,
        ))
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn max_step_order(&self, workflow_id: Uuid) -> StoreResult<Option<i32>> {
        let max: Option<i32> = sqlx::query_scalar(
            r#"SELECT MAX("order") FROM discovery_steps WHERE workflow_id = $1"#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discovery_workflow_executions
                (id, workflow_id, status, mode, current_step_id, context,
                 additional_data, custom_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.status.to_string())
        .bind(execution.mode.to_string())
        .bind(execution.current_step_id)
        .bind(&execution.context)
        .bind(&execution.additional_data)
        .bind(&execution.custom_status)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM discovery_workflow_executions WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update_execution(&self, execution: &Execution) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE discovery_workflow_executions
            SET status = $2, mode = $3, current_step_id = $4, context = $5,
                additional_data = $6, custom_status = $7, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.to_string())
        .bind(execution.mode.to_string())
        .bind(execution.current_step_id)
        .bind(&execution.context)
        .bind(&execution.additional_data)
        .bind(&execution.custom_status)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM discovery_workflow_executions
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(workflow_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_executions(&self, workflow_id: Uuid) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discovery_workflow_executions WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn begin_step_execution(
        &self,
        execution: &Execution,
        step: &Step,
        input_payload: &Value,
    ) -> StoreResult<StepExecution> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent claims for the same execution.
        let locked: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM discovery_workflow_executions WHERE id = $1 FOR UPDATE",
        )
        .bind(execution.id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound);
        }

        let visits: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM discovery_step_executions
            WHERE execution_id = $1 AND step_id = $2
            "#,
        )
        .bind(execution.id)
        .bind(step.id)
        .fetch_one(&mut *tx)
        .await?;

        if visits >= i64::from(step.max_visits) {
            return Err(StoreError::MaxVisitsExceeded {
                step: step.name.clone(),
            });
        }

        let step_execution = StepExecution {
            id: Uuid::new_v4(),
            step_id: step.id,
            workflow_id: step.workflow_id,
            execution_id: execution.id,
            status: StepStatus::Running,
            attempt: (visits + 1) as i32,
            input_payload: Some(input_payload.clone()),
            output_payload: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO discovery_step_executions
                (id, step_id, workflow_id, execution_id, status, attempt,
                 input_payload, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(step_execution.id)
        .bind(step_execution.step_id)
        .bind(step_execution.workflow_id)
        .bind(step_execution.execution_id)
        .bind(step_execution.status.to_string())
        .bind(step_execution.attempt)
        .bind(&step_execution.input_payload)
        .bind(step_execution.started_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE discovery_workflow_executions
            SET current_step_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(step.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(step_execution)
    }

    async fn update_step_execution(&self, step_execution: &StepExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE discovery_step_executions
            SET status = $2, output_payload = $3, finished_at = $4
            WHERE id = $1
            "#,
        )
        .bind(step_execution.id)
        .bind(step_execution.status.to_string())
        .bind(&step_execution.output_payload)
        .bind(step_execution.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        let rows = sqlx::query_as::<_, StepExecutionRow>(&format!(
            r#"
            SELECT {STEP_EXECUTION_COLUMNS}
            FROM discovery_step_executions
            WHERE execution_id = $1
            ORDER BY started_at ASC
            "#,
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn latest_running_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> StoreResult<Option<StepExecution>> {
        let rows = sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT se.id, se.step_id, se.workflow_id, se.execution_id, se.status, se.attempt,
                   se.input_payload, se.output_payload, se.started_at, se.finished_at
            FROM discovery_step_executions se
            JOIN discovery_steps s ON s.id = se.step_id
            WHERE se.execution_id = $1 AND s.name = $2 AND se.status = 'running'
            ORDER BY se.started_at DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rows.map(Into::into))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row types for sqlx query_as
// ═══════════════════════════════════════════════════════════════════════════

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    mode: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            mode: parse_mode(&row.mode),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    workflow_id: Uuid,
    name: String,
    order: i32,
    max_visits: i32,
    is_terminal: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            name: row.name,
            order: row.order,
            max_visits: row.max_visits,
            is_terminal: row.is_terminal,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    mode: String,
    current_step_id: Option<Uuid>,
    context: Value,
    additional_data: Option<Value>,
    custom_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            status: parse_exec_status(&row.status),
            mode: parse_mode(&row.mode),
            current_step_id: row.current_step_id,
            context: row.context,
            additional_data: row.additional_data,
            custom_status: row.custom_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepExecutionRow {
    id: Uuid,
    step_id: Uuid,
    workflow_id: Uuid,
    execution_id: Uuid,
    status: String,
    attempt: i32,
    input_payload: Option<Value>,
    output_payload: Option<Value>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<StepExecutionRow> for StepExecution {
    fn from(row: StepExecutionRow) -> Self {
        Self {
            id: row.id,
            step_id: row.step_id,
            workflow_id: row.workflow_id,
            execution_id: row.execution_id,
            status: parse_step_status(&row.status),
            attempt: row.attempt,
            input_payload: row.input_payload,
            output_payload: row.output_payload,
            started_at: row.started_at,
            finished_at: row.finished_at,
        }
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "manual" => Mode::Manual,
        _ => Mode::Automatic,
    }
}

fn parse_exec_status(s: &str) -> ExecStatus {
    match s {
        "completed" => ExecStatus::Completed,
        "failed" => ExecStatus::Failed,
        "paused" => ExecStatus::Paused,
        _ => ExecStatus::Running,
    }
}

fn parse_step_status(s: &str) -> StepStatus {
    match s {
        "running" => StepStatus::Running,
        "success" => StepStatus::Success,
        "failed" => StepStatus::Failed,
        "skipped" => StepStatus::Skipped,
        _ => StepStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_strings() {
        assert_eq!(parse_mode("manual"), Mode::Manual);
        assert_eq!(parse_mode("automatic"), Mode::Automatic);
        assert_eq!(parse_exec_status("completed"), ExecStatus::Completed);
        assert_eq!(parse_exec_status("unknown"), ExecStatus::Running);
        assert_eq!(parse_step_status("success"), StepStatus::Success);
        assert_eq!(parse_step_status(""), StepStatus::Pending);
    }
}
