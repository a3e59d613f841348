//! Request and response types for all caseflow-daemon HTTP endpoints.
//!
//! No business logic lives here.

use caseflow_schemas::{
    Actor, AmendmentEntry, AttachmentRef, BusinessFields, Case, CaseId, CaseStatus,
};
use caseflow_sync::HistoryItem;
use caseflow_workflow::{AmendmentRequest, TransitionRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// The workflow rule behind the refusal, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The case as the store holds it now (CASE_CHANGED only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Case>,
}

/// 202 body: the write's outcome is being reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResponse {
    pub pending: bool,
    pub code: String,
    pub message: String,
    pub case_id: CaseId,
}

// ---------------------------------------------------------------------------
// /v1/cases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCaseBody {
    pub case_id: CaseId,
    #[serde(default)]
    pub fields: BusinessFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub case_id: CaseId,
    pub history: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AmendmentsResponse {
    pub case_id: CaseId,
    pub amendments: Vec<AmendmentEntry>,
}

/// POST /v1/cases/:case_id/transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionBody {
    pub to: CaseStatus,
    pub actor: Actor,
    /// The status the actor was looking at. A case that has since moved is
    /// refused with CASE_CHANGED.
    #[serde(default)]
    pub from: Option<CaseStatus>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Resubmit with the same id to make a retry recognisable.
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

impl TransitionBody {
    pub fn into_request(self) -> TransitionRequest {
        let mut req = TransitionRequest::new(self.to, self.actor).with_attachments(self.attachments);
        if let Some(detail) = self.detail {
            req = req.with_detail(detail);
        }
        if let Some(from) = self.from {
            req = req.with_expected_from(from);
        }
        if let Some(id) = self.request_id {
            req.request_id = id;
        }
        req
    }
}

/// POST /v1/cases/:case_id/amendments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendmentBody {
    pub actor: Actor,
    pub reason: String,
    /// Fields to set; `null` removes a field.
    pub fields: BusinessFields,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

impl AmendmentBody {
    pub fn into_request(self) -> AmendmentRequest {
        let mut req = AmendmentRequest::new(self.actor, self.reason, self.fields);
        if let Some(id) = self.request_id {
            req.request_id = id;
        }
        req
    }
}
