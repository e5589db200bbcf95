//! Background runner for asynchronous executions.
//!
//! One detached task per execute-async call: publish `workflow_started`,
//! drive the engine to a terminal state, then publish the terminal
//! lifecycle event. The launching handler never awaits the task.

use chrono::Utc;
use serde_json::json;
use tracing::{error, info};

use crate::config::AppState;
use crate::context::{document_name, safe_projection};
use crate::engine::Engine;
use crate::events::ProgressEvent;
use crate::models::{ExecStatus, Execution};

/// Spawn the background task driving one async execution.
pub fn spawn_execution(state: AppState, execution: Execution) {
    tokio::spawn(async move {
        run_workflow_async(state, execution).await;
    });
}

/// Drive one execution to a terminal state, publishing lifecycle events.
pub async fn run_workflow_async(state: AppState, mut execution: Execution) {
    info!(execution_id = %execution.id, "starting async execution");

    state.broker.publish(
        execution.id,
        &ProgressEvent::WorkflowStarted {
            execution_id: execution.id.to_string(),
            workflow_id: execution.workflow_id.to_string(),
        },
    );

    let engine = Engine::new(&state);
    match engine.run(&mut execution).await {
        Ok(()) => {
            // `workflow_completed` is published by the engine itself; the
            // runner only reports the failure side of the terminal state.
            if execution.status == ExecStatus::Failed {
                let safe_context = safe_projection(&execution.context);
                let document = document_name(&safe_context);
                state.broker.publish(
                    execution.id,
                    &ProgressEvent::WorkflowFailed {
                        execution_id: execution.id.to_string(),
                        final_context: safe_context,
                        error_summary: json!({
                            "failed_at": Utc::now().to_rfc3339(),
                            "document_name": document,
                        }),
                    },
                );
            }
        }
        Err(e) => {
            error!(execution_id = %execution.id, "async execution error: {}", e);

            if !execution.status.is_terminal() {
                execution.status = ExecStatus::Failed;
                if let Err(persist_err) = state.store.update_execution(&execution).await {
                    error!(execution_id = %execution.id,
                        "failed to persist failed status: {}", persist_err);
                }
            }

            let safe_context = safe_projection(&execution.context);
            let document = document_name(&safe_context);
            state.broker.publish(
                execution.id,
                &ProgressEvent::WorkflowError {
                    execution_id: execution.id.to_string(),
                    error: e.to_string(),
                    final_context: safe_context,
                    error_details: json!({
                        "error_time": Utc::now().to_rfc3339(),
                        "document_name": document,
                    }),
                },
            );
        }
    }

    info!(execution_id = %execution.id, status = %execution.status, "async execution finished");
}
