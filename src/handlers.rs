//! HTTP request handlers and router for the control surface.
//!
//! CRUD for workflows and steps, synchronous and asynchronous execution
//! launch, status polling, manual advance and step-side progress
//! reporting. Contexts returned to clients are always base64-scrubbed.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::config::AppState;
use crate::context::{safe_projection, scrub_base64};
use crate::engine::Engine;
use crate::events::ProgressEvent;
use crate::models::{ExecStatus, Execution, Mode, StepStatus, Workflow};
use crate::store::StoreError;
use crate::tasks;
use crate::types::*;
use crate::worker::WorkerClient;
use crate::ws;

type ApiResponse = (StatusCode, Json<Value>);

/// Build the full application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        // Workflow CRUD
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/workflows/:wf_id",
            get(get_workflow).patch(patch_workflow).delete(delete_workflow),
        )
        // Step CRUD
        .route("/workflows/:wf_id/steps", post(add_step).get(list_steps))
        .route(
            "/steps/:step_id",
            get(get_step).patch(patch_step).delete(delete_step),
        )
        .route("/available-steps", get(available_steps))
        // Execution launch
        .route("/workflows/:wf_id/execute", post(execute_workflow))
        .route("/workflows/:wf_id/execute-async", post(execute_workflow_async))
        .route("/execute/", post(execute_legacy))
        .route("/execute-async/", post(execute_legacy_async))
        // Execution tracking
        .route("/workflows/:wf_id/executions", get(workflow_executions))
        .route("/executions/:exec_id/status", get(execution_status))
        .route("/executions/:exec_id/steps", get(execution_steps))
        .route("/executions/:exec_id/next", post(next_step))
        // Step-side reporting
        .route(
            "/executions/:exec_id/steps/:step_name/progress",
            post(report_step_progress),
        )
        .route(
            "/executions/:exec_id/steps/:step_name/complete",
            post(report_step_completed),
        )
        // Progress channel
        .route("/ws/:exec_id", get(ws::ws_handler))
        // Health check
        .route("/healthz", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a store failure onto the HTTP surface.
fn store_error(e: StoreError) -> ApiResponse {
    match e {
        StoreError::NotFound => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))),
        StoreError::MaxVisitsExceeded { step } => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("max_visits exceeded for step '{}'", step)})),
        ),
        StoreError::Conflict(msg) => (StatusCode::CONFLICT, Json(json!({"error": msg}))),
        StoreError::InvalidData(msg) => (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))),
        other => {
            error!("storage failure: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": other.to_string()})),
            )
        }
    }
}

fn not_found(what: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{} not found", what)})),
    )
}

/// JSON shape of an execution as returned by the API, context scrubbed.
fn execution_body(execution: &Execution) -> Value {
    json!({
        "id": execution.id,
        "workflow_id": execution.workflow_id,
        "status": execution.status,
        "mode": execution.mode,
        "current_step_id": execution.current_step_id,
        "context": scrub_base64(&execution.context),
        "additional_data": execution.additional_data,
        "custom_status": execution.custom_status,
        "created_at": execution.created_at,
        "updated_at": execution.updated_at,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow CRUD
// ═══════════════════════════════════════════════════════════════════════════

/// POST /workflows
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<WorkflowCreate>,
) -> ApiResponse {
    match state.store.create_workflow(&body).await {
        Ok(workflow) => (StatusCode::OK, Json(json!(workflow))),
        Err(e) => store_error(e),
    }
}

/// GET /workflows
pub async fn list_workflows(State(state): State<AppState>) -> ApiResponse {
    match state.store.list_workflows().await {
        Ok(workflows) => (StatusCode::OK, Json(json!(workflows))),
        Err(e) => store_error(e),
    }
}

/// GET /workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
) -> ApiResponse {
    match state.store.get_workflow(wf_id).await {
        Ok(Some(workflow)) => (StatusCode::OK, Json(json!(workflow))),
        Ok(None) => not_found("workflow"),
        Err(e) => store_error(e),
    }
}

/// PATCH /workflows/{id} - partial update; an empty body is a no-op.
pub async fn patch_workflow(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
    Json(body): Json<WorkflowUpdate>,
) -> ApiResponse {
    match state.store.update_workflow(wf_id, &body).await {
        Ok(Some(workflow)) => (StatusCode::OK, Json(json!(workflow))),
        Ok(None) => not_found("workflow"),
        Err(e) => store_error(e),
    }
}

/// DELETE /workflows/{id}
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
) -> Response {
    match state.store.delete_workflow(wf_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("workflow").into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step CRUD
// ═══════════════════════════════════════════════════════════════════════════

/// POST /workflows/{id}/steps
pub async fn add_step(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
    Json(body): Json<StepCreate>,
) -> ApiResponse {
    match state.store.get_workflow(wf_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    }
    match state.store.create_step(wf_id, &body).await {
        Ok(step) => (StatusCode::OK, Json(json!(step))),
        Err(e) => store_error(e),
    }
}

/// GET /workflows/{id}/steps
pub async fn list_steps(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
) -> ApiResponse {
    match state.store.list_steps(wf_id).await {
        Ok(steps) => (StatusCode::OK, Json(json!(steps))),
        Err(e) => store_error(e),
    }
}

/// GET /steps/{id}
pub async fn get_step(State(state): State<AppState>, Path(step_id): Path<Uuid>) -> ApiResponse {
    match state.store.get_step(step_id).await {
        Ok(Some(step)) => (StatusCode::OK, Json(json!(step))),
        Ok(None) => not_found("step"),
        Err(e) => store_error(e),
    }
}

/// PATCH /steps/{id}
pub async fn patch_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(body): Json<StepUpdate>,
) -> ApiResponse {
    match state.store.update_step(step_id, &body).await {
        Ok(Some(step)) => (StatusCode::OK, Json(json!(step))),
        Ok(None) => not_found("step"),
        Err(e) => store_error(e),
    }
}

/// DELETE /steps/{id}
pub async fn delete_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
) -> Response {
    match state.store.delete_step(step_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("step").into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

/// GET /available-steps - enumerate the step names the worker exposes.
pub async fn available_steps(State(state): State<AppState>) -> ApiResponse {
    let worker = WorkerClient::new(&state.config.worker_base_url, state.http_client.clone());
    match worker.list_available_steps().await {
        Ok(steps) => (StatusCode::OK, Json(steps)),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": format!("failed to list worker steps: {}", e)})),
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution launch
// ═══════════════════════════════════════════════════════════════════════════

/// Split a free-form launch body: a recognized `mode` key selects the mode
/// for this execution, every other top-level key seeds the initial context.
fn split_launch_body(body: Value, default_mode: Mode) -> (Mode, Map<String, Value>) {
    let mut data = body.as_object().cloned().unwrap_or_default();
    let mode = data
        .remove("mode")
        .and_then(|v| serde_json::from_value::<Mode>(v).ok())
        .unwrap_or(default_mode);
    (mode, data)
}

/// Launch an execution and, in automatic mode, drive it to a terminal
/// state before responding. A failed workflow still answers 200 so the
/// client can read the final context.
async fn launch_sync(
    state: &AppState,
    workflow: &Workflow,
    mode: Mode,
    initial_data: Map<String, Value>,
) -> ApiResponse {
    let engine = Engine::new(state);
    let mut execution = match engine.start_execution(workflow, mode, initial_data).await {
        Ok(execution) => execution,
        Err(e) => return store_error(e),
    };

    if execution.mode == Mode::Automatic {
        if let Err(e) = engine.run(&mut execution).await {
            error!(execution_id = %execution.id, "sync execution error: {}", e);
            if !execution.status.is_terminal() {
                execution.status = ExecStatus::Failed;
                if let Err(persist_err) = state.store.update_execution(&execution).await {
                    error!(execution_id = %execution.id,
                        "failed to persist failed status: {}", persist_err);
                }
            }
            state.broker.publish(
                execution.id,
                &ProgressEvent::WorkflowError {
                    execution_id: execution.id.to_string(),
                    error: e.to_string(),
                    final_context: safe_projection(&execution.context),
                    error_details: json!({"error_time": Utc::now().to_rfc3339()}),
                },
            );
        }
    }

    (StatusCode::OK, Json(execution_body(&execution)))
}

/// Launch an execution in the background and answer immediately with the
/// tracking endpoints.
async fn launch_async(
    state: &AppState,
    workflow: &Workflow,
    mode: Mode,
    initial_data: Map<String, Value>,
) -> ApiResponse {
    let engine = Engine::new(state);
    let execution = match engine.start_execution(workflow, mode, initial_data).await {
        Ok(execution) => execution,
        Err(e) => return store_error(e),
    };

    let response = AsyncLaunchResponse {
        execution_id: execution.id.to_string(),
        workflow_id: workflow.id.to_string(),
        status: execution.status.to_string(),
        tracking_url: format!("/executions/{}/status", execution.id),
        websocket_url: format!("/ws/{}", execution.id),
        created_at: Some(execution.created_at.to_rfc3339()),
    };
    tasks::spawn_execution(state.clone(), execution);

    (StatusCode::OK, Json(json!(response)))
}

/// POST /workflows/{id}/execute - synchronous launch.
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let workflow = match state.store.get_workflow(wf_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    };
    let (mode, initial_data) = split_launch_body(body, workflow.mode);
    launch_sync(&state, &workflow, mode, initial_data).await
}

/// POST /workflows/{id}/execute-async
pub async fn execute_workflow_async(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let workflow = match state.store.get_workflow(wf_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    };
    let (mode, initial_data) = split_launch_body(body, workflow.mode);
    launch_async(&state, &workflow, mode, initial_data).await
}

/// POST /execute/ - legacy launch body carrying the workflow id.
pub async fn execute_legacy(
    State(state): State<AppState>,
    Json(body): Json<ExecutionLaunch>,
) -> ApiResponse {
    let workflow = match state.store.get_workflow(body.workflow_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    };
    let mode = body.mode.unwrap_or(workflow.mode);
    launch_sync(&state, &workflow, mode, body.data.unwrap_or_default()).await
}

/// POST /execute-async/ - legacy async launch.
pub async fn execute_legacy_async(
    State(state): State<AppState>,
    Json(body): Json<ExecutionLaunch>,
) -> ApiResponse {
    let workflow = match state.store.get_workflow(body.workflow_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    };
    let mode = body.mode.unwrap_or(workflow.mode);
    launch_async(&state, &workflow, mode, body.data.unwrap_or_default()).await
}

// ═══════════════════════════════════════════════════════════════════════════
// Execution tracking
// ═══════════════════════════════════════════════════════════════════════════

/// GET /workflows/{id}/executions - history with pagination.
pub async fn workflow_executions(
    State(state): State<AppState>,
    Path(wf_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    let (limit, offset) = query.clamped();
    let include_context = query.include_context;

    match state.store.get_workflow(wf_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("workflow"),
        Err(e) => return store_error(e),
    }

    let total = match state.store.count_executions(wf_id).await {
        Ok(total) => total,
        Err(e) => return store_error(e),
    };
    let executions = match state.store.list_executions(wf_id, limit, offset).await {
        Ok(executions) => executions,
        Err(e) => return store_error(e),
    };

    let rows: Vec<Value> = executions
        .iter()
        .map(|execution| {
            if include_context {
                json!({
                    "id": execution.id,
                    "workflow_id": execution.workflow_id,
                    "status": execution.status,
                    "current_step_id": execution.current_step_id,
                    "context": scrub_base64(&execution.context),
                    "created_at": execution.created_at,
                    "updated_at": execution.updated_at,
                })
            } else {
                json!({
                    "id": execution.id,
                    "workflow_id": execution.workflow_id,
                    "status": execution.status,
                    "current_step_id": execution.current_step_id,
                    "created_at": execution.created_at,
                    "updated_at": execution.updated_at,
                    "has_context": execution.context.as_object().is_some_and(|c| !c.is_empty()),
                    "context_summary": {
                        "uuid_proceso": execution.context.get("uuid_proceso"),
                        "nombre_documento": execution.context
                            .pointer("/dynamic_properties/nombre_documento"),
                        "mime_type": execution.context.pointer("/dynamic_properties/mime_type"),
                    },
                })
            }
        })
        .collect();

    let has_more = offset + limit < total;
    let base = format!("/workflows/{}/executions", wf_id);
    (
        StatusCode::OK,
        Json(json!({
            "executions": rows,
            "pagination": {
                "total": total,
                "limit": limit,
                "offset": offset,
                "has_more": has_more,
            },
            "links": {
                "self": format!("{base}?limit={limit}&offset={offset}&include_context={include_context}"),
                "next": has_more.then(|| format!(
                    "{base}?limit={limit}&offset={}&include_context={include_context}",
                    offset + limit
                )),
                "prev": (offset > 0).then(|| format!(
                    "{base}?limit={limit}&offset={}&include_context={include_context}",
                    (offset - limit).max(0)
                )),
            },
        })),
    )
}

/// GET /executions/{id}/status - rich status, progress and history tail.
pub async fn execution_status(
    State(state): State<AppState>,
    Path(exec_id): Path<Uuid>,
) -> ApiResponse {
    let execution = match state.store.get_execution(exec_id).await {
        Ok(Some(execution)) => execution,
        Ok(None) => return not_found("execution"),
        Err(e) => return store_error(e),
    };

    let workflow = match state.store.get_workflow(execution.workflow_id).await {
        Ok(workflow) => workflow,
        Err(e) => return store_error(e),
    };
    let all_steps = match state.store.list_steps(execution.workflow_id).await {
        Ok(steps) => steps,
        Err(e) => return store_error(e),
    };
    let executed = match state.store.list_step_executions(exec_id).await {
        Ok(executed) => executed,
        Err(e) => return store_error(e),
    };

    let total_steps = all_steps.len();
    let completed_steps = executed
        .iter()
        .filter(|se| se.status == StepStatus::Success)
        .count();
    let failed_steps = executed
        .iter()
        .filter(|se| se.status == StepStatus::Failed)
        .count();
    let percentage = if total_steps > 0 {
        ((completed_steps as f64 / total_steps as f64) * 10_000.0).round() / 100.0
    } else {
        0.0
    };

    let current_step = match execution.current_step_id {
        Some(step_id) => match state.store.get_step(step_id).await {
            Ok(step) => step,
            Err(e) => return store_error(e),
        },
        None => None,
    };

    // History tail: only the most recent attempt, with its scrubbed output.
    let mut steps_history = Vec::new();
    if let Some(last) = executed.last() {
        let step_name = match state.store.get_step(last.step_id).await {
            Ok(step) => step.map(|s| s.name),
            Err(e) => return store_error(e),
        };
        let duration_seconds = match (last.started_at, last.finished_at) {
            (Some(start), Some(finish)) => {
                Some((finish - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        steps_history.push(json!({
            "step_name": step_name.unwrap_or_else(|| "Unknown".to_string()),
            "status": last.status,
            "attempt": last.attempt,
            "started_at": last.started_at,
            "finished_at": last.finished_at,
            "duration_seconds": duration_seconds,
            "output_payload": last.output_payload.as_ref().map(scrub_base64),
        }));
    }

    (
        StatusCode::OK,
        Json(json!({
            "execution_id": execution.id,
            "workflow_id": execution.workflow_id,
            "workflow_name": workflow.map(|w| w.name).unwrap_or_else(|| "Unknown".to_string()),
            "status": execution.status,
            "mode": execution.mode,
            "created_at": execution.created_at,
            "updated_at": execution.updated_at,
            "context": scrub_base64(&execution.context),
            "current_step": current_step.map(|step| json!({
                "id": step.id,
                "name": step.name,
                "order": step.order,
            })),
            "progress": {
                "total_steps": total_steps,
                "completed_steps": completed_steps,
                "failed_steps": failed_steps,
                "percentage": percentage,
                "is_completed": execution.status == ExecStatus::Completed,
                "is_failed": execution.status == ExecStatus::Failed,
                "is_running": execution.status == ExecStatus::Running,
            },
            "steps_history": steps_history,
            "tracking_urls": {
                "status": format!("/executions/{}/status", exec_id),
                "steps": format!("/executions/{}/steps", exec_id),
                "websocket": format!("/ws/{}", exec_id),
            },
        })),
    )
}

/// GET /executions/{id}/steps - full attempt log of one execution.
pub async fn execution_steps(
    State(state): State<AppState>,
    Path(exec_id): Path<Uuid>,
) -> ApiResponse {
    match state.store.get_execution(exec_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("execution"),
        Err(e) => return store_error(e),
    }
    match state.store.list_step_executions(exec_id).await {
        Ok(executed) => (StatusCode::OK, Json(json!(executed))),
        Err(e) => store_error(e),
    }
}

/// POST /executions/{id}/next - advance one step, manual mode only.
pub async fn next_step(State(state): State<AppState>, Path(exec_id): Path<Uuid>) -> ApiResponse {
    let mut execution = match state.store.get_execution(exec_id).await {
        Ok(Some(execution)) => execution,
        Ok(None) => return not_found("execution"),
        Err(e) => return store_error(e),
    };

    if execution.mode != Mode::Manual {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "only manual executions can be advanced"})),
        );
    }
    if execution.status.is_terminal() {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("execution is already {}", execution.status),
            })),
        );
    }

    let engine = Engine::new(&state);
    match engine.advance(&mut execution).await {
        Ok(_) => (StatusCode::OK, Json(execution_body(&execution))),
        Err(e) => store_error(e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step-side reporting
// ═══════════════════════════════════════════════════════════════════════════

/// POST /executions/{id}/steps/{step_name}/progress
///
/// Running steps report progress here; the report is folded into the
/// attempt's output snapshot and broadcast as `step_progress`.
pub async fn report_step_progress(
    State(state): State<AppState>,
    Path((exec_id, step_name)): Path<(Uuid, String)>,
    Json(progress): Json<Value>,
) -> ApiResponse {
    match state.store.get_execution(exec_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("execution"),
        Err(e) => return store_error(e),
    }

    let running = match state.store.latest_running_step(exec_id, &step_name).await {
        Ok(running) => running,
        Err(e) => return store_error(e),
    };

    if let Some(mut step_execution) = running {
        let clean_progress = scrub_base64(&progress);
        let mut output = step_execution
            .output_payload
            .take()
            .unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut output {
            map.insert("progress".to_string(), clean_progress.clone());
            map.insert("last_update".to_string(), json!(Utc::now().to_rfc3339()));
        }
        step_execution.output_payload = Some(output);
        if let Err(e) = state.store.update_step_execution(&step_execution).await {
            return store_error(e);
        }

        state.broker.publish(
            exec_id,
            &ProgressEvent::StepProgress {
                step_name: step_name.clone(),
                progress: clean_progress,
                execution_id: exec_id.to_string(),
            },
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "execution_id": exec_id,
            "step_name": step_name,
            "progress_recorded": scrub_base64(&progress),
        })),
    )
}

/// POST /executions/{id}/steps/{step_name}/complete
pub async fn report_step_completed(
    State(state): State<AppState>,
    Path((exec_id, step_name)): Path<(Uuid, String)>,
    Json(result): Json<Value>,
) -> ApiResponse {
    match state.store.get_execution(exec_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("execution"),
        Err(e) => return store_error(e),
    }

    let clean_result = scrub_base64(&result);
    state.broker.publish(
        exec_id,
        &ProgressEvent::StepCompleted {
            step_name: step_name.clone(),
            result: clean_result.clone(),
            execution_id: exec_id.to_string(),
            completed_at: Utc::now().to_rfc3339(),
        },
    );

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "execution_id": exec_id,
            "step_name": step_name,
            "completion_recorded": clean_result,
        })),
    )
}

/// GET /healthz
pub async fn health() -> ApiResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
