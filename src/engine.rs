//! Execution engine: the state machine that drives one execution.
//!
//! One `advance` call performs exactly one step transition: select the
//! next step, claim an attempt under the visit cap, dispatch it to the
//! remote worker, persist the outcome and publish progress events.
//! `run` loops `advance` for automatic executions until a terminal state.
//!
//! Remote step failures are terminal for the execution; there is no
//! engine-level retry. Operators clone the inputs into a new execution
//! instead.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::ProgressBroker;
use crate::config::AppState;
use crate::context::{safe_projection, scrub_base64};
use crate::events::{ProgressEvent, completion_summary};
use crate::models::{ExecStatus, Execution, Mode, Step, StepStatus, Workflow};
use crate::store::{Store, StoreError, StoreResult};
use crate::worker::WorkerClient;

/// Outcome of one `advance` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// One step ran; the execution is still live.
    StepAdvanced,
    /// The execution is (or just became) terminal.
    Terminal,
}

/// Drives executions of one workflow store against one remote worker.
pub struct Engine {
    store: Arc<dyn Store>,
    worker: WorkerClient,
    broker: Arc<ProgressBroker>,
}

impl Engine {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            worker: WorkerClient::new(&state.config.worker_base_url, state.http_client.clone()),
            broker: state.broker.clone(),
        }
    }

    /// Create a fresh execution of `workflow`. All launch-body keys land in
    /// the initial context next to the tracking `execution_id`.
    pub async fn start_execution(
        &self,
        workflow: &Workflow,
        mode: Mode,
        initial_data: Map<String, Value>,
    ) -> StoreResult<Execution> {
        let id = Uuid::new_v4();
        let mut context = Map::new();
        for (key, value) in initial_data {
            context.insert(key, value);
        }
        // The tracking id always wins over whatever the launch body carried.
        context.insert("execution_id".to_string(), json!(id.to_string()));

        let now = Utc::now();
        let execution = Execution {
            id,
            workflow_id: workflow.id,
            status: ExecStatus::Running,
            mode,
            current_step_id: None,
            context: Value::Object(context),
            additional_data: None,
            custom_status: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_execution(&execution).await?;
        info!(execution_id = %id, workflow_id = %workflow.id, mode = %mode, "execution created");
        Ok(execution)
    }

    /// Run the execution to a terminal state (automatic mode). Manual
    /// executions stop after one transition; the next advance comes from
    /// the API.
    pub async fn run(&self, execution: &mut Execution) -> StoreResult<()> {
        loop {
            match self.advance(execution).await? {
                Advance::Terminal => return Ok(()),
                Advance::StepAdvanced => {
                    if execution.mode != Mode::Automatic
                        || execution.status != ExecStatus::Running
                    {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Perform exactly one step transition.
    pub async fn advance(&self, execution: &mut Execution) -> StoreResult<Advance> {
        // Terminal statuses are sinks.
        if execution.status.is_terminal() {
            info!(execution_id = %execution.id, status = %execution.status,
                "advance on terminal execution is a no-op");
            return Ok(Advance::Terminal);
        }

        let Some(step) = self.select_next_step(execution).await? else {
            return self.complete(execution, None).await;
        };

        // Claim the attempt under the visit cap; the gateway counts and
        // inserts in one transaction.
        let input_payload = scrub_base64(&execution.context);
        let mut step_execution = match self
            .store
            .begin_step_execution(execution, &step, &input_payload)
            .await
        {
            Ok(se) => se,
            Err(StoreError::MaxVisitsExceeded { .. }) => {
                warn!(execution_id = %execution.id, step = %step.name, "max_visits exceeded");
                execution.status = ExecStatus::Failed;
                self.store.update_execution(execution).await?;
                self.broker.publish(
                    execution.id,
                    &ProgressEvent::MaxVisitsExceeded {
                        step: step.name.clone(),
                    },
                );
                return Ok(Advance::Terminal);
            }
            Err(e) => return Err(e),
        };
        execution.current_step_id = Some(step.id);
        self.broker.publish(
            execution.id,
            &ProgressEvent::StepStarted {
                step: step.name.clone(),
            },
        );
        info!(execution_id = %execution.id, step = %step.name,
            attempt = step_execution.attempt, "step started");

        match self.worker.invoke(&step.name, &execution.context, &json!({})).await {
            Ok(output) => {
                if let Value::Object(context) = &mut execution.context {
                    for (key, value) in output.context_patch {
                        context.insert(key, value);
                    }
                    // The routing hint overrides order-based sequencing for
                    // the next transition; its absence means fall through.
                    match &output.next {
                        Some(next) => {
                            context.insert("next_step_name".to_string(), json!(next));
                        }
                        None => {
                            context.remove("next_step_name");
                        }
                    }
                }

                step_execution.status = StepStatus::Success;
                step_execution.output_payload = Some(scrub_base64(&output.raw));
                step_execution.finished_at = Some(Utc::now());
                self.store.update_step_execution(&step_execution).await?;
                self.store.update_execution(execution).await?;
                info!(execution_id = %execution.id, step = %step.name, "step succeeded");
            }
            Err(e) => {
                error!(execution_id = %execution.id, step = %step.name, "step failed: {}", e);
                step_execution.status = StepStatus::Failed;
                step_execution.output_payload = Some(json!({"error": e.to_string()}));
                step_execution.finished_at = Some(Utc::now());
                execution.status = ExecStatus::Failed;
                self.store.update_step_execution(&step_execution).await?;
                self.store.update_execution(execution).await?;
                self.broker.publish(
                    execution.id,
                    &ProgressEvent::StepError {
                        step: step.name.clone(),
                        error: e.to_string(),
                    },
                );
                return Ok(Advance::Terminal);
            }
        }

        let safe_context = safe_projection(&execution.context);
        self.broker.publish(
            execution.id,
            &ProgressEvent::StepFinished {
                step: step.name.clone(),
                context: safe_context,
                step_summary: json!({
                    "step_name": step.name,
                    "execution_id": execution.id.to_string(),
                    "workflow_status": execution.status,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            },
        );

        if self.should_auto_complete(execution, &step).await? {
            info!(execution_id = %execution.id, step = %step.name,
                "workflow auto-completion detected");
            return self.complete(execution, Some("automatic_detection")).await;
        }

        Ok(Advance::StepAdvanced)
    }

    /// Pick the next step: first step of the workflow when none ran yet,
    /// the routing hint by name when set, otherwise the next step by order.
    async fn select_next_step(&self, execution: &Execution) -> StoreResult<Option<Step>> {
        let next_hint = execution
            .context
            .get("next_step_name")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match (execution.current_step_id, next_hint) {
            (None, _) => self.store.first_step(execution.workflow_id).await,
            (Some(_), Some(name)) => {
                self.store.step_by_name(execution.workflow_id, &name).await
            }
            (Some(current_id), None) => match self.store.get_step(current_id).await? {
                Some(current) => {
                    self.store
                        .step_after(execution.workflow_id, current.order)
                        .await
                }
                None => Ok(None),
            },
        }
    }

    /// A workflow is complete after a successful step when no routing hint
    /// is set and the step was the last by order, when the hint resolves to
    /// no step of this workflow, or when the step is marked terminal.
    async fn should_auto_complete(
        &self,
        execution: &Execution,
        last_step: &Step,
    ) -> StoreResult<bool> {
        if execution.status != ExecStatus::Running {
            return Ok(false);
        }
        if last_step.is_terminal {
            return Ok(true);
        }
        match execution
            .context
            .get("next_step_name")
            .and_then(Value::as_str)
        {
            Some(name) => Ok(self
                .store
                .step_by_name(execution.workflow_id, name)
                .await?
                .is_none()),
            None => {
                let max_order = self.store.max_step_order(execution.workflow_id).await?;
                Ok(max_order.is_none_or(|max| last_step.order >= max))
            }
        }
    }

    /// Mark the execution completed, record the completion metadata and
    /// publish `workflow_completed`.
    async fn complete(
        &self,
        execution: &mut Execution,
        completion_reason: Option<&str>,
    ) -> StoreResult<Advance> {
        execution.status = ExecStatus::Completed;
        execution.current_step_id = None;
        if let Some(reason) = completion_reason {
            if let Value::Object(context) = &mut execution.context {
                context.insert("auto_completed".to_string(), json!(true));
                context.insert("completed_at".to_string(), json!(Utc::now().to_rfc3339()));
                context.insert("completion_reason".to_string(), json!(reason));
            }
        }
        self.store.update_execution(execution).await?;

        let safe_context = safe_projection(&execution.context);
        let summary = completion_summary(&safe_context);
        self.broker.publish(
            execution.id,
            &ProgressEvent::WorkflowCompleted {
                execution_id: execution.id.to_string(),
                final_context: safe_context,
                completion_reason: completion_reason.map(str::to_owned),
                summary,
            },
        );
        info!(execution_id = %execution.id, "workflow completed");
        Ok(Advance::Terminal)
    }
}
