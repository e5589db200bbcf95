//! Domain entities: workflows, steps, executions and step executions.
//!
//! These are the rows the persistence gateway reads and writes; the JSON
//! shapes they serialize to are the ones the HTTP surface returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Status enums
// ═══════════════════════════════════════════════════════════════════════════

/// Execution mode of a workflow or a single execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Manual,
    Automatic,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Automatic
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Manual => write!(f, "manual"),
            Mode::Automatic => write!(f, "automatic"),
        }
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl ExecStatus {
    /// Terminal statuses are sinks: no further step records or context
    /// mutations are allowed once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecStatus::Completed | ExecStatus::Failed)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStatus::Running => write!(f, "running"),
            ExecStatus::Completed => write!(f, "completed"),
            ExecStatus::Failed => write!(f, "failed"),
            ExecStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Status of one attempt of one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════

/// A named ordered collection of steps plus a default execution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single action in a workflow.
///
/// `order` drives default sequencing (ties broken by id); `max_visits`
/// caps how many times the step may be entered within one execution;
/// `is_terminal` marks steps whose success completes the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub order: i32,
    pub max_visits: i32,
    pub is_terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One run of one workflow.
///
/// `context` is an opaque JSON tree with three well-known keys
/// (`execution_id`, `dynamic_properties`, `next_step_name`); everything
/// else in it is step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecStatus,
    pub mode: Mode,
    pub current_step_id: Option<Uuid>,
    pub context: Value,
    pub additional_data: Option<Value>,
    pub custom_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt of one step within one execution.
///
/// Input and output snapshots are stored base64-scrubbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub status: StepStatus,
    pub attempt: i32,
    pub input_payload: Option<Value>,
    pub output_payload: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
