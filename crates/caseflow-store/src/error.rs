use caseflow_isolation::TenantViolation;
use caseflow_schemas::{Case, CaseId};
use thiserror::Error;

/// Failures reported by a [`crate::RemoteStore`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("case {case_id} not found")]
    NotFound { case_id: CaseId },

    #[error("case {case_id} already exists")]
    AlreadyExists { case_id: CaseId },

    /// The conditional write found a different current status. Carries the
    /// row as the store holds it now.
    #[error("case {} was changed by someone else; it is now '{}'", .current.case_id, .current.status)]
    Conflict { current: Box<Case> },

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store did not answer in time")]
    Timeout,

    #[error(transparent)]
    Tenant(#[from] TenantViolation),

    #[error("remote store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The write may or may not have landed; only a later read can tell.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }

    pub fn conflict(current: Case) -> Self {
        StoreError::Conflict {
            current: Box::new(current),
        }
    }
}
