//! Request and response types for the HTTP control surface.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::Mode;

// ═══════════════════════════════════════════════════════════════════════════
// Workflow / Step bodies
// ═══════════════════════════════════════════════════════════════════════════

/// Body for POST /workflows.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowCreate {
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub steps: Vec<StepCreate>,
}

/// One step in a workflow-create body, or the body of POST /workflows/{id}/steps.
#[derive(Debug, Clone, Deserialize)]
pub struct StepCreate {
    pub name: String,
    pub order: i32,
    #[serde(default = "default_max_visits")]
    pub max_visits: i32,
    #[serde(default)]
    pub is_terminal: bool,
}

fn default_max_visits() -> i32 {
    1
}

/// Partial update for PATCH /workflows/{id}. An empty body is a no-op.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub mode: Option<Mode>,
}

/// Partial update for PATCH /steps/{id}.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepUpdate {
    pub name: Option<String>,
    pub order: Option<i32>,
    pub max_visits: Option<i32>,
    pub is_terminal: Option<bool>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution launch
// ═══════════════════════════════════════════════════════════════════════════

/// Body for the legacy POST /execute/ and /execute-async/ endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionLaunch {
    pub workflow_id: Uuid,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

/// Response of POST /workflows/{id}/execute-async.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncLaunchResponse {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: String,
    pub tracking_url: String,
    pub websocket_url: String,
    pub created_at: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution history
// ═══════════════════════════════════════════════════════════════════════════

/// Query parameters for GET /workflows/{id}/executions.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub include_context: bool,
}

fn default_limit() -> i64 {
    20
}

impl HistoryQuery {
    /// Clamp `limit` to [1, 100] and `offset` to ≥ 0.
    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 100), self.offset.max(0))
    }
}
