//! Startup recovery: rebuild every workflow's coordinator from the WAL.
//!
//! Recovery performs no WAL writes. A workflow is rebuilt exactly by replay;
//! non-terminal workflows are reported as resumable so the caller can decide
//! to re-drive them via `advance`.

use tracing::info;

use windlass_kernel::ids::WorkflowId;
use windlass_kernel::wal::WalService;

use crate::error::EngineError;
use crate::registry::CoordinatorRegistry;

/// What startup recovery found in the log.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub hydrated: usize,
    /// Non-terminal workflows that can be re-driven.
    pub resumable: Vec<WorkflowId>,
    pub terminal: Vec<WorkflowId>,
}

/// Hydrates a coordinator for every workflow present in the WAL.
pub fn recover(
    wal: &WalService,
    registry: &CoordinatorRegistry,
) -> Result<RecoveryReport, EngineError> {
    let mut report = RecoveryReport::default();
    for workflow_id in wal.workflow_ids()? {
        let coordinator = registry.get_or_create(&workflow_id);
        coordinator.hydrate()?;
        report.hydrated += 1;
        if coordinator.state().is_terminal() {
            report.terminal.push(workflow_id);
        } else {
            report.resumable.push(workflow_id);
        }
    }
    info!(
        hydrated = report.hydrated,
        resumable = report.resumable.len(),
        terminal = report.terminal.len(),
        "recovery complete"
    );
    Ok(report)
}
