//! Progress events published on the per-execution channel.
//!
//! Every message on the socket is a single JSON object tagged with an
//! `event` discriminator. Context-bearing payloads carry only the
//! websocket-safe projection.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::document_name;

/// Envelope of every message on the progress channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
    },
    StepStarted {
        step: String,
    },
    StepProgress {
        step_name: String,
        progress: Value,
        execution_id: String,
    },
    StepFinished {
        step: String,
        context: Value,
        step_summary: Value,
    },
    StepCompleted {
        step_name: String,
        result: Value,
        execution_id: String,
        completed_at: String,
    },
    StepError {
        step: String,
        error: String,
    },
    MaxVisitsExceeded {
        step: String,
    },
    WorkflowCompleted {
        execution_id: String,
        final_context: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        completion_reason: Option<String>,
        summary: Value,
    },
    WorkflowFailed {
        execution_id: String,
        final_context: Value,
        error_summary: Value,
    },
    WorkflowError {
        execution_id: String,
        error: String,
        final_context: Value,
        error_details: Value,
    },
}

impl ProgressEvent {
    /// Discriminator value this event serializes under.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::WorkflowStarted { .. } => "workflow_started",
            ProgressEvent::StepStarted { .. } => "step_started",
            ProgressEvent::StepProgress { .. } => "step_progress",
            ProgressEvent::StepFinished { .. } => "step_finished",
            ProgressEvent::StepCompleted { .. } => "step_completed",
            ProgressEvent::StepError { .. } => "step_error",
            ProgressEvent::MaxVisitsExceeded { .. } => "max_visits_exceeded",
            ProgressEvent::WorkflowCompleted { .. } => "workflow_completed",
            ProgressEvent::WorkflowFailed { .. } => "workflow_failed",
            ProgressEvent::WorkflowError { .. } => "workflow_error",
        }
    }
}

/// Summary block attached to `workflow_completed` events.
pub fn completion_summary(safe_context: &Value) -> Value {
    let steps_executed = safe_context
        .pointer("/dynamic_properties")
        .and_then(Value::as_object)
        .map(|d| d.keys().filter(|k| k.contains("step_")).count())
        .unwrap_or(0);
    let has_pdf = safe_context
        .pointer("/dynamic_properties/pdf_reordenado_disponible")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    json!({
        "total_steps_executed": steps_executed,
        "completion_time": Utc::now().to_rfc3339(),
        "has_pdf": has_pdf,
        "document_name": document_name(safe_context),
    })
}
