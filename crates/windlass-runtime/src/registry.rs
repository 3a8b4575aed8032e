//! Coordinator registry: locates the single-writer coordinator for a
//! workflow id. Creation is racy-safe by compare-and-insert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use windlass_kernel::clock::LogicalClock;
use windlass_kernel::event::derive_idempotency_key;
use windlass_kernel::ids::WorkflowId;
use windlass_kernel::wal::WalService;

use crate::coordinator::WorkflowCoordinator;
use crate::dispatcher::StepCommitter;
use crate::error::EngineError;

/// Registry of per-workflow coordinators, keyed by workflow id.
pub struct CoordinatorRegistry {
    wal: Arc<WalService>,
    clock: Arc<LogicalClock>,
    coordinators: Mutex<HashMap<WorkflowId, Arc<WorkflowCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new(wal: Arc<WalService>, clock: Arc<LogicalClock>) -> Self {
        Self {
            wal,
            clock,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowCoordinator>> {
        self.lock().get(workflow_id).cloned()
    }

    /// Returns the coordinator for `workflow_id`, creating one if absent.
    /// Two racing callers get the same instance.
    pub fn get_or_create(&self, workflow_id: &str) -> Arc<WorkflowCoordinator> {
        let mut coordinators = self.lock();
        Arc::clone(coordinators.entry(workflow_id.to_string()).or_insert_with(
            || {
                Arc::new(WorkflowCoordinator::new(
                    workflow_id,
                    Arc::clone(&self.wal),
                    Arc::clone(&self.clock),
                ))
            },
        ))
    }

    /// Creates the workflow's coordinator and its `workflow_created` event.
    pub fn create_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        input: Value,
        steps: Vec<String>,
    ) -> Result<Arc<WorkflowCoordinator>, EngineError> {
        let coordinator = self.get_or_create(workflow_id);
        coordinator.create(name, input, steps)?;
        Ok(coordinator)
    }

    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<WorkflowId, Arc<WorkflowCoordinator>>> {
        match self.coordinators.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StepCommitter for CoordinatorRegistry {
    fn commit_completed(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        result: Value,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        let coordinator = self.get(workflow_id).ok_or_else(|| EngineError::NotFound {
            workflow_id: workflow_id.to_string(),
        })?;
        let key = derive_idempotency_key(workflow_id, step, attempt);
        coordinator.step_completed(step, result, duration_ms, Some(&key))
    }

    fn commit_failed(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        error: &str,
        retryable: bool,
    ) -> Result<(), EngineError> {
        let coordinator = self.get(workflow_id).ok_or_else(|| EngineError::NotFound {
            workflow_id: workflow_id.to_string(),
        })?;
        let key = derive_idempotency_key(workflow_id, step, attempt);
        coordinator.step_failed(step, error, retryable, Some(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_kernel::wal::WalOptions;

    fn registry(dir: &std::path::Path) -> CoordinatorRegistry {
        let wal = Arc::new(WalService::open(WalOptions::new(dir)).unwrap());
        CoordinatorRegistry::new(wal, Arc::new(LogicalClock::new()))
    }

    #[test]
    fn get_or_create_returns_the_same_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let a = registry.get_or_create("wf-1");
        let b = registry.get_or_create("wf-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.workflow_ids(), vec!["wf-1".to_string()]);
    }

    #[test]
    fn commit_against_unknown_workflow_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry
            .commit_completed("wf-missing", "s1", 1, json!({}), 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn committer_derives_the_idempotency_key_from_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .create_workflow("wf-1", "flow", json!({}), vec!["s1".into()])
            .unwrap();
        registry.get("wf-1").unwrap().advance().unwrap();

        registry
            .commit_completed("wf-1", "s1", 1, json!({"ok": true}), 10)
            .unwrap();
        // A second commit of the same attempt collides on the derived key.
        let err = registry
            .commit_completed("wf-1", "s1", 1, json!({"ok": true}), 10)
            .unwrap_err();
        assert!(matches!(err, EngineError::Duplicate { .. }));

        let state = registry.get("wf-1").unwrap().state();
        let key = derive_idempotency_key("wf-1", "s1", 1);
        assert!(state.idempotency_key_exists(&key));
    }
}
