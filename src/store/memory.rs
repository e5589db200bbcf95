//! In-process [`Store`] backend.
//!
//! Used by the test suite and when the service runs without
//! `DATABASE_URL`. A single async mutex guards all state, so the
//! transactional visit-cap claim is trivially serialized.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{ExecStatus, Execution, Step, StepExecution, StepStatus, Workflow};
use crate::types::{StepCreate, StepUpdate, WorkflowCreate, WorkflowUpdate};

use super::{Store, StoreError, StoreResult, validate_step, validate_workflow_name};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    steps: HashMap<Uuid, Step>,
    executions: HashMap<Uuid, Execution>,
    step_executions: Vec<StepExecution>,
}

impl Inner {
    fn sorted_steps(&self, workflow_id: Uuid) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.order, s.id));
        steps
    }
}

/// Memory-backed [`Store`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_workflow(&self, def: &WorkflowCreate) -> StoreResult<Workflow> {
        validate_workflow_name(&def.name)?;
        for step in &def.steps {
            validate_step(&step.name, step.max_visits)?;
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: def.name.clone(),
            mode: def.mode,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().await;
        inner.workflows.insert(workflow.id, workflow.clone());
        for step_def in &def.steps {
            let step = Step {
                id: Uuid::new_v4(),
                workflow_id: workflow.id,
                name: step_def.name.clone(),
                order: step_def.order,
                max_visits: step_def.max_visits,
                is_terminal: step_def.is_terminal,
                created_at: now,
                updated_at: now,
            };
            inner.steps.insert(step.id, step);
        }
        Ok(workflow)
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        let inner = self.inner.lock().await;
        let mut workflows: Vec<Workflow> = inner.workflows.values().cloned().collect();
        workflows.sort_by_key(|w| (w.created_at, w.id));
        Ok(workflows)
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        Ok(self.inner.lock().await.workflows.get(&id).cloned())
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        patch: &WorkflowUpdate,
    ) -> StoreResult<Option<Workflow>> {
        if let Some(name) = &patch.name {
            validate_workflow_name(name)?;
        }
        let mut inner = self.inner.lock().await;
        let Some(workflow) = inner.workflows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            workflow.name = name.clone();
        }
        if let Some(mode) = patch.mode {
            workflow.mode = mode;
        }
        workflow.updated_at = Utc::now();
        Ok(Some(workflow.clone()))
    }

    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.workflows.contains_key(&id) {
            return Ok(false);
        }
        let active = inner
            .executions
            .values()
            .any(|e| e.workflow_id == id && !e.status.is_terminal());
        if active {
            return Err(StoreError::Conflict(
                "workflow has non-terminal executions".to_string(),
            ));
        }
        inner.workflows.remove(&id);
        inner.steps.retain(|_, s| s.workflow_id != id);
        inner.executions.retain(|_, e| e.workflow_id != id);
        inner.step_executions.retain(|se| se.workflow_id != id);
        Ok(true)
    }

    async fn create_step(&self, workflow_id: Uuid, def: &StepCreate) -> StoreResult<Step> {
        validate_step(&def.name, def.max_visits)?;
        let mut inner = self.inner.lock().await;
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound);
        }
        let now = Utc::now();
        let step = Step {
            id: Uuid::new_v4(),
            workflow_id,
            name: def.name.clone(),
            order: def.order,
            max_visits: def.max_visits,
            is_terminal: def.is_terminal,
            created_at: now,
            updated_at: now,
        };
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn list_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<Step>> {
        Ok(self.inner.lock().await.sorted_steps(workflow_id))
    }

    async fn get_step(&self, id: Uuid) -> StoreResult<Option<Step>> {
        Ok(self.inner.lock().await.steps.get(&id).cloned())
    }

    async fn update_step(&self, id: Uuid, patch: &StepUpdate) -> StoreResult<Option<Step>> {
        if let Some(max_visits) = patch.max_visits {
            if max_visits < 1 {
                return Err(StoreError::InvalidData(
                    "max_visits must be at least 1".to_string(),
                ));
            }
        }
        let mut inner = self.inner.lock().await;
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            step.name = name.clone();
        }
        if let Some(order) = patch.order {
            step.order = order;
        }
        if let Some(max_visits) = patch.max_visits {
            step.max_visits = max_visits;
        }
        if let Some(is_terminal) = patch.is_terminal {
            step.is_terminal = is_terminal;
        }
        step.updated_at = Utc::now();
        Ok(Some(step.clone()))
    }

    async fn delete_step(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.steps.contains_key(&id) {
            return Ok(false);
        }
        let referenced = inner
            .executions
            .values()
            .any(|e| e.current_step_id == Some(id) && e.status == ExecStatus::Running);
        if referenced {
            return Err(StoreError::Conflict(
                "step is the current step of a running execution".to_string(),
            ));
        }
        inner.steps.remove(&id);
        Ok(true)
    }

    async fn first_step(&self, workflow_id: Uuid) -> StoreResult<Option<Step>> {
        Ok(self
            .inner
            .lock()
            .await
            .sorted_steps(workflow_id)
            .into_iter()
            .next())
    }

    async fn step_after(&self, workflow_id: Uuid, order: i32) -> StoreResult<Option<Step>> {
        Ok(self
            .inner
            .lock()
            .await
            .sorted_steps(workflow_id)
            .into_iter()
            .find(|s| s.order > order))
    }

    async fn step_by_name(&self, workflow_id: Uuid, name: &str) -> StoreResult<Option<Step>> {
        Ok(self
            .inner
            .lock()
            .await
            .sorted_steps(workflow_id)
            .into_iter()
            .find(|s| s.name == name))
    }

    async fn max_step_order(&self, workflow_id: Uuid) -> StoreResult<Option<i32>> {
        Ok(self
            .inner
            .lock()
            .await
            .sorted_steps(workflow_id)
            .last()
            .map(|s| s.order))
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.inner.lock().await.executions.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &Execution) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.executions.get_mut(&execution.id) else {
            return Err(StoreError::NotFound);
        };
        *stored = Execution {
            updated_at: Utc::now(),
            ..execution.clone()
        };
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_executions(&self, workflow_id: Uuid) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .count() as i64)
    }

    async fn begin_step_execution(
        &self,
        execution: &Execution,
        step: &Step,
        input_payload: &Value,
    ) -> StoreResult<StepExecution> {
        let mut inner = self.inner.lock().await;
        if !inner.executions.contains_key(&execution.id) {
            return Err(StoreError::NotFound);
        }

        let visits = inner
            .step_executions
            .iter()
            .filter(|se| se.execution_id == execution.id && se.step_id == step.id)
            .count() as i32;
        if visits >= step.max_visits {
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
            attempt: visits + 1,
            input_payload: Some(input_payload.clone()),
            output_payload: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        inner.step_executions.push(step_execution.clone());

        if let Some(stored) = inner.executions.get_mut(&execution.id) {
            stored.current_step_id = Some(step.id);
            stored.updated_at = Utc::now();
        }
        Ok(step_execution)
    }

    async fn update_step_execution(&self, step_execution: &StepExecution) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner
            .step_executions
            .iter_mut()
            .find(|se| se.id == step_execution.id)
        else {
            return Err(StoreError::NotFound);
        };
        stored.status = step_execution.status;
        stored.output_payload = step_execution.output_payload.clone();
        stored.finished_at = step_execution.finished_at;
        Ok(())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        let inner = self.inner.lock().await;
        let mut attempts: Vec<StepExecution> = inner
            .step_executions
            .iter()
            .filter(|se| se.execution_id == execution_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|se| se.started_at);
        Ok(attempts)
    }

    async fn latest_running_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> StoreResult<Option<StepExecution>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&StepExecution> = inner
            .step_executions
            .iter()
            .filter(|se| {
                se.execution_id == execution_id
                    && se.status == StepStatus::Running
                    && inner
                        .steps
                        .get(&se.step_id)
                        .is_some_and(|s| s.name == step_name)
            })
            .collect();
        candidates.sort_by_key(|se| se.started_at);
        Ok(candidates.last().map(|se| (*se).clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    fn workflow_def(steps: Vec<StepCreate>) -> WorkflowCreate {
        WorkflowCreate {
            name: "wf".to_string(),
            mode: crate::models::Mode::Automatic,
            steps,
        }
    }

    fn step_def(name: &str, order: i32, max_visits: i32) -> StepCreate {
        StepCreate {
            name: name.to_string(),
            order,
            max_visits,
            is_terminal: false,
        }
    }

    fn execution_for(workflow: &Workflow) -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            status: ExecStatus::Running,
            mode: workflow.mode,
            current_step_id: None,
            context: json!({}),
            additional_data: None,
            custom_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_step_ordering_ties_break_by_id() {
        let store = MemStore::new();
        let wf = store
            .create_workflow(&workflow_def(vec![
                step_def("a", 1, 1),
                step_def("b", 1, 1),
                step_def("c", 2, 1),
            ]))
            .await
            .unwrap();
        let steps = store.list_steps(wf.id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].order <= steps[1].order);
        assert!(steps[0].order == 1 && steps[1].order == 1);
        assert!(steps[0].id < steps[1].id);
        assert_eq!(steps[2].name, "c");
    }

    #[tokio::test]
    async fn test_begin_step_execution_enforces_visit_cap() {
        let store = MemStore::new();
        let wf = store
            .create_workflow(&workflow_def(vec![step_def("u", 1, 2)]))
            .await
            .unwrap();
        let step = store.first_step(wf.id).await.unwrap().unwrap();
        let exec = execution_for(&wf);
        store.create_execution(&exec).await.unwrap();

        let first = store
            .begin_step_execution(&exec, &step, &json!({}))
            .await
            .unwrap();
        assert_eq!(first.attempt, 1);
        let second = store
            .begin_step_execution(&exec, &step, &json!({}))
            .await
            .unwrap();
        assert_eq!(second.attempt, 2);

        let third = store.begin_step_execution(&exec, &step, &json!({})).await;
        assert!(matches!(
            third,
            Err(StoreError::MaxVisitsExceeded { step }) if step == "u"
        ));
        assert_eq!(store.list_step_executions(exec.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_cannot_exceed_cap() {
        let store = Arc::new(MemStore::new());
        let wf = store
            .create_workflow(&workflow_def(vec![step_def("u", 1, 1)]))
            .await
            .unwrap();
        let step = store.first_step(wf.id).await.unwrap().unwrap();
        let exec = execution_for(&wf);
        store.create_execution(&exec).await.unwrap();

        let input_a = json!({});
        let input_b = json!({});
        let (a, b) = tokio::join!(
            store.begin_step_execution(&exec, &step, &input_a),
            store.begin_step_execution(&exec, &step, &input_b),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(store.list_step_executions(exec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_workflow_with_running_execution_conflicts() {
        let store = MemStore::new();
        let wf = store
            .create_workflow(&workflow_def(vec![step_def("a", 1, 1)]))
            .await
            .unwrap();
        let exec = execution_for(&wf);
        store.create_execution(&exec).await.unwrap();

        let result = store.delete_workflow(wf.id).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let mut done = exec.clone();
        done.status = ExecStatus::Completed;
        store.update_execution(&done).await.unwrap();
        assert!(store.delete_workflow(wf.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_step_referenced_by_running_execution_conflicts() {
        let store = MemStore::new();
        let wf = store
            .create_workflow(&workflow_def(vec![step_def("a", 1, 1)]))
            .await
            .unwrap();
        let step = store.first_step(wf.id).await.unwrap().unwrap();
        let mut exec = execution_for(&wf);
        exec.current_step_id = Some(step.id);
        store.create_execution(&exec).await.unwrap();

        assert!(matches!(
            store.delete_step(step.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_execution_persists_nested_context() {
        let store = MemStore::new();
        let wf = store.create_workflow(&workflow_def(vec![])).await.unwrap();
        let mut exec = execution_for(&wf);
        store.create_execution(&exec).await.unwrap();

        exec.context = json!({"dynamic_properties": {"a": 1}});
        store.update_execution(&exec).await.unwrap();
        exec.context["dynamic_properties"]["b"] = json!(2);
        store.update_execution(&exec).await.unwrap();

        let reloaded = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(reloaded.context["dynamic_properties"]["a"], 1);
        assert_eq!(reloaded.context["dynamic_properties"]["b"], 2);
    }
}
