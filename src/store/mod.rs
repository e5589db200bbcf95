//! Persistence gateway: typed reads and writes for workflows, steps,
//! executions and step executions.
//!
//! The [`Store`] trait is the seam between the engine / HTTP surface and
//! storage. [`pg::PgStore`] is the production Postgres backend;
//! [`memory::MemStore`] keeps everything in one process for tests and for
//! running without `DATABASE_URL`.

pub mod memory;
pub mod pg;

pub use memory::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Execution, Step, StepExecution, Workflow};
use crate::types::{StepCreate, StepUpdate, WorkflowCreate, WorkflowUpdate};

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Addressed entity absent.
    #[error("entity not found")]
    NotFound,

    /// The visit cap for (execution, step) is already reached.
    #[error("max_visits exceeded for step '{step}'")]
    MaxVisitsExceeded { step: String },

    /// Write rejected because it would break an invariant held elsewhere.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Body-level validation failure.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store unavailable or a query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed persistence operations. All workflow-scoped step lookups order by
/// `("order", id)` so equal orders stay deterministic.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Workflows ──────────────────────────────────────────────────────

    /// Create a workflow together with its steps.
    async fn create_workflow(&self, def: &WorkflowCreate) -> StoreResult<Workflow>;
    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>>;
    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>>;
    async fn update_workflow(
        &self,
        id: Uuid,
        patch: &WorkflowUpdate,
    ) -> StoreResult<Option<Workflow>>;
    /// Delete a workflow and its steps. Rejected with [`StoreError::Conflict`]
    /// while any execution of it is non-terminal.
    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool>;

    // ── Steps ──────────────────────────────────────────────────────────

    async fn create_step(&self, workflow_id: Uuid, def: &StepCreate) -> StoreResult<Step>;
    async fn list_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<Step>>;
    async fn get_step(&self, id: Uuid) -> StoreResult<Option<Step>>;
    async fn update_step(&self, id: Uuid, patch: &StepUpdate) -> StoreResult<Option<Step>>;
    /// Delete a step. Rejected while a running execution points at it.
    async fn delete_step(&self, id: Uuid) -> StoreResult<bool>;

    /// Step with the smallest order in the workflow.
    async fn first_step(&self, workflow_id: Uuid) -> StoreResult<Option<Step>>;
    /// Step with the least order strictly greater than `order`.
    async fn step_after(&self, workflow_id: Uuid, order: i32) -> StoreResult<Option<Step>>;
    async fn step_by_name(&self, workflow_id: Uuid, name: &str) -> StoreResult<Option<Step>>;
    async fn max_step_order(&self, workflow_id: Uuid) -> StoreResult<Option<i32>>;

    // ── Executions ─────────────────────────────────────────────────────

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()>;
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;
    /// Persist the full execution row, context column included. Always a
    /// whole-column JSON write, so nested context mutations are never lost.
    async fn update_execution(&self, execution: &Execution) -> StoreResult<()>;
    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Execution>>;
    async fn count_executions(&self, workflow_id: Uuid) -> StoreResult<i64>;

    // ── Step executions ────────────────────────────────────────────────

    /// Claim the next attempt of `step` for `execution` under the visit cap.
    ///
    /// One transaction: lock the execution row, count existing attempts,
    /// fail with [`StoreError::MaxVisitsExceeded`] without inserting when
    /// the cap is reached, otherwise insert a running attempt
    /// (`attempt = count + 1`, scrubbed input snapshot) and point
    /// `current_step_id` at the step. Concurrent claims for the same
    /// execution serialize on the row lock, so the cap holds.
    async fn begin_step_execution(
        &self,
        execution: &Execution,
        step: &Step,
        input_payload: &Value,
    ) -> StoreResult<StepExecution>;

    /// Persist status, output snapshot and finish time of an attempt.
    async fn update_step_execution(&self, step_execution: &StepExecution) -> StoreResult<()>;

    /// All attempts of one execution in start order.
    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>>;

    /// Most recent running attempt of the named step within one execution.
    async fn latest_running_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> StoreResult<Option<StepExecution>>;
}

pub(crate) fn validate_workflow_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidData(
            "workflow name must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_step(name: &str, max_visits: i32) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidData(
            "step name must not be empty".to_string(),
        ));
    }
    if max_visits < 1 {
        return Err(StoreError::InvalidData(
            "max_visits must be at least 1".to_string(),
        ));
    }
    Ok(())
}
