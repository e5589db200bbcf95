//! HTTP client for the remote step worker.
//!
//! Every step of every workflow is executed by the worker service: the
//! engine POSTs the execution context to `{base}/steps/{name}` and merges
//! the returned context patch. Failures are surfaced typed and are never
//! retried here; retry belongs to the worker side.

use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::info;

/// Fallback per-step budget, in seconds.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 700;

/// Budget for listing the worker's available steps.
const LIST_STEPS_TIMEOUT_SECS: u64 = 30;

/// Per-step invocation budgets. Document-processing steps block for the
/// whole OCR / annotation round-trip, so these run long.
fn step_timeout_secs(step_name: &str) -> u64 {
    match step_name {
        "fetch_user" => 600,
        "validate_user" => 600,
        "transform_data" => 600,
        "approve_user" => 990,
        _ => DEFAULT_STEP_TIMEOUT_SECS,
    }
}

/// Failure invoking a remote step.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("timeout ({timeout_secs}s) invoking step '{step}' on worker")]
    Timeout { step: String, timeout_secs: u64 },

    #[error("worker returned HTTP {status} for step '{step}': {body}")]
    Http {
        step: String,
        status: u16,
        body: String,
    },

    #[error("connection error invoking step '{step}' on worker: {source}")]
    Transport {
        step: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Parsed worker response: a context patch plus an optional routing hint.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub context_patch: Map<String, Value>,
    pub next: Option<String>,
    pub raw: Value,
}

impl StepOutput {
    /// A response with a top-level `context` object uses it as the patch;
    /// otherwise the whole object is the patch (minus the `next` hint,
    /// which routes instead of merging).
    pub fn from_response(raw: Value) -> Self {
        let next = raw
            .get("next")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let context_patch = match raw.get("context") {
            Some(Value::Object(patch)) => patch.clone(),
            _ => {
                let mut patch = raw.as_object().cloned().unwrap_or_default();
                patch.remove("next");
                patch
            }
        };

        Self {
            context_patch,
            next,
            raw,
        }
    }
}

/// Client for the remote step worker service.
#[derive(Clone)]
pub struct WorkerClient {
    base_url: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// POST {base}/steps/{step_name} with the current context and step
    /// config, under the step's timeout budget.
    pub async fn invoke(
        &self,
        step_name: &str,
        context: &Value,
        config: &Value,
    ) -> Result<StepOutput, WorkerError> {
        let url = format!("{}/steps/{}", self.base_url, step_name);
        let timeout_secs = step_timeout_secs(step_name);
        let payload = json!({
            "step": step_name,
            "context": context,
            "config": config,
        });

        info!(step = %step_name, timeout_secs, "invoking remote step");

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify(step_name, timeout_secs, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Http {
                step: step_name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| classify(step_name, timeout_secs, e))?;

        Ok(StepOutput::from_response(raw))
    }

    /// GET {base}/steps - enumerate the step names the worker exposes.
    pub async fn list_available_steps(&self) -> Result<Value, WorkerError> {
        let url = format!("{}/steps", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(LIST_STEPS_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| classify("steps", LIST_STEPS_TIMEOUT_SECS, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Http {
                step: "steps".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| classify("steps", LIST_STEPS_TIMEOUT_SECS, e))
    }
}

fn classify(step: &str, timeout_secs: u64, source: reqwest::Error) -> WorkerError {
    if source.is_timeout() {
        WorkerError::Timeout {
            step: step.to_string(),
            timeout_secs,
        }
    } else {
        WorkerError::Transport {
            step: step.to_string(),
            source,
        }
    }
}
