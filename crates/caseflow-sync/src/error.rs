use caseflow_isolation::TenantViolation;
use caseflow_schemas::{Case, CaseId};
use caseflow_store::StoreError;
use caseflow_workflow::WorkflowError;
use thiserror::Error;

use crate::reconcile::ReconcileWatch;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Rejected locally; nothing was applied and the store was never called.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Another writer got there first. `current` is the row as the store holds
    /// it now; `reason` is why the request does not apply to it.
    #[error("case {} has changed (now '{}'), please refresh", .current.case_id, .current.status)]
    CaseChanged {
        current: Box<Case>,
        reason: Option<WorkflowError>,
    },

    #[error(transparent)]
    TenantViolation(#[from] TenantViolation),

    /// The outcome of the write is unknown. The projection was rolled back
    /// and a background read is settling it; `reconcile` reports the result.
    #[error("change pending, retrying (case {case_id}): {cause}")]
    StoreUnavailable {
        case_id: CaseId,
        cause: StoreError,
        reconcile: ReconcileWatch,
    },

    /// An earlier change on this case is still being reconciled.
    #[error("case {case_id} has a change pending confirmation; try again shortly")]
    ChangePending { case_id: CaseId },

    #[error("case {case_id} not found")]
    NotFound { case_id: CaseId },

    #[error(transparent)]
    Store(StoreError),
}

impl SyncError {
    /// The workflow rule behind the failure, if there is one.
    pub fn workflow_error(&self) -> Option<&WorkflowError> {
        match self {
            SyncError::Workflow(e) => Some(e),
            SyncError::CaseChanged { reason, .. } => reason.as_ref(),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Workflow(e) => e.code(),
            SyncError::CaseChanged { .. } => "CASE_CHANGED",
            SyncError::TenantViolation(_) => "TENANT_VIOLATION",
            SyncError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            SyncError::ChangePending { .. } => "CHANGE_PENDING",
            SyncError::NotFound { .. } => "NOT_FOUND",
            SyncError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { case_id } => SyncError::NotFound { case_id },
            StoreError::Tenant(v) => SyncError::TenantViolation(v),
            other => SyncError::Store(other),
        }
    }
}
