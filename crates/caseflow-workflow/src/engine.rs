//! Workflow engine
//!
//! The single authority on whether a requested transition (or amendment) is
//! legal. It is pure given its inputs: the caller supplies the case as it
//! currently believes it to be, the request, and the clock reading. Nothing
//! here performs I/O, which is what lets the sync coordinator re-run the exact
//! same validation against a freshly read remote row after a conflict.
//!
//! # Validation order (transitions)
//!
//! 1. target differs from current status        → [`WorkflowError::NoOp`]
//! 2. edge exists in the graph                  → [`WorkflowError::InvalidTransition`]
//! 3. gate authorizes `actor.role` for the edge → [`WorkflowError::Unauthorized`]
//! 4. leaving an amendable state with an amendment still pending
//!                                              → [`WorkflowError::AmendmentPending`]

use caseflow_schemas::{
    Actor, AmendmentEntry, AttachmentRef, BusinessFields, Case, CaseId, CaseStatus, FieldChange,
    Role, StatusHistoryEntry,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::graph::{edge, Transition};
use crate::permission::PermissionGate;

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Rejections produced before anything is applied. None of these ever reach
/// the remote store and none need a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("invalid transition: '{from}' -> '{to}' is not permitted")]
    InvalidTransition { from: CaseStatus, to: CaseStatus },

    #[error("unauthorized: role '{role}' may not {action}")]
    Unauthorized { role: Role, action: String },

    #[error("no-op: case is already '{status}'")]
    NoOp { status: CaseStatus },

    #[error("case {case_id} has an amendment whose outcome is not yet known; wait for it to settle")]
    AmendmentPending { case_id: CaseId },

    #[error("case cannot be amended while '{status}'")]
    NotAmendable { status: CaseStatus },

    #[error("amendment changes no field")]
    EmptyAmendment,
}

impl WorkflowError {
    /// Stable machine-readable code for API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            WorkflowError::Unauthorized { .. } => "UNAUTHORIZED",
            WorkflowError::NoOp { .. } => "NO_OP",
            WorkflowError::AmendmentPending { .. } => "AMENDMENT_PENDING",
            WorkflowError::NotAmendable { .. } => "NOT_AMENDABLE",
            WorkflowError::EmptyAmendment => "EMPTY_AMENDMENT",
        }
    }
}

// ---------------------------------------------------------------------------
// Requests / outcomes
// ---------------------------------------------------------------------------

/// A caller's wish to move a case to `to`.
///
/// `request_id` becomes the history entry id, so resubmitting the same request
/// object yields the same entry id. `expected_from` is the status the actor
/// was looking at; when set, a case that has since moved is refused instead
/// of being transitioned from a status the actor never saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub request_id: Uuid,
    pub to: CaseStatus,
    pub actor: Actor,
    pub detail: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub expected_from: Option<CaseStatus>,
}

impl TransitionRequest {
    pub fn new(to: CaseStatus, actor: Actor) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            to,
            actor,
            detail: None,
            attachments: Vec::new(),
            expected_from: None,
        }
    }

    pub fn with_expected_from(mut self, from: CaseStatus) -> Self {
        self.expected_from = Some(from);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A validated transition, ready for the store and the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub case_id: CaseId,
    pub transition: Transition,
    pub entry: StatusHistoryEntry,
}

impl TransitionOutcome {
    pub fn from_status(&self) -> CaseStatus {
        self.transition.from
    }

    pub fn new_status(&self) -> CaseStatus {
        self.transition.to
    }
}

/// A caller's wish to change business fields. A `null` value removes the field.
#[derive(Debug, Clone, PartialEq)]
pub struct AmendmentRequest {
    pub request_id: Uuid,
    pub actor: Actor,
    pub reason: String,
    pub fields: BusinessFields,
}

impl AmendmentRequest {
    pub fn new(actor: Actor, reason: impl Into<String>, fields: BusinessFields) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            actor,
            reason: reason.into(),
            fields,
        }
    }
}

/// A validated amendment: the ledger entry plus the resulting field map.
#[derive(Debug, Clone, PartialEq)]
pub struct AmendmentPlan {
    pub entry: AmendmentEntry,
    pub fields_after: BusinessFields,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Validates transitions and amendments against the graph and the injected gate.
#[derive(Debug, Clone)]
pub struct WorkflowEngine<G> {
    gate: G,
}

impl<G: PermissionGate> WorkflowEngine<G> {
    pub fn new(gate: G) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Validate `req` against `case` and, on success, produce the new status
    /// plus a fully-formed history entry stamped `at`.
    pub fn request_transition(
        &self,
        case: &Case,
        req: &TransitionRequest,
        amendment_pending: bool,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let from = case.status;

        if req.to == from {
            return Err(WorkflowError::NoOp { status: from });
        }

        let transition = edge(from, req.to).ok_or(WorkflowError::InvalidTransition {
            from,
            to: req.to,
        })?;

        if !self.gate.can_perform(&req.actor.role, &transition) {
            return Err(WorkflowError::Unauthorized {
                role: req.actor.role.clone(),
                action: format!("move a case from '{}' to '{}'", from, req.to),
            });
        }

        if from.is_amendable() && amendment_pending {
            return Err(WorkflowError::AmendmentPending {
                case_id: case.case_id.clone(),
            });
        }

        let entry = StatusHistoryEntry {
            entry_id: req.request_id,
            case_id: case.case_id.clone(),
            status: req.to,
            timestamp: at,
            actor: req.actor.clone(),
            detail: req.detail.clone(),
            attachments: req.attachments.clone(),
        };

        Ok(TransitionOutcome {
            case_id: case.case_id.clone(),
            transition,
            entry,
        })
    }

    /// Validate an amendment and compute its ordered field diff.
    pub fn plan_amendment(
        &self,
        case: &Case,
        req: &AmendmentRequest,
        amendment_pending: bool,
        at: DateTime<Utc>,
    ) -> Result<AmendmentPlan, WorkflowError> {
        if !case.status.is_amendable() {
            return Err(WorkflowError::NotAmendable {
                status: case.status,
            });
        }

        if !self.gate.can_amend(&req.actor.role) {
            return Err(WorkflowError::Unauthorized {
                role: req.actor.role.clone(),
                action: "amend a case".to_string(),
            });
        }

        if amendment_pending {
            return Err(WorkflowError::AmendmentPending {
                case_id: case.case_id.clone(),
            });
        }

        let (changes, fields_after) = diff_fields(&case.fields, &req.fields);
        if changes.is_empty() {
            return Err(WorkflowError::EmptyAmendment);
        }

        Ok(AmendmentPlan {
            entry: AmendmentEntry {
                amendment_id: req.request_id,
                case_id: case.case_id.clone(),
                timestamp: at,
                actor: req.actor.clone(),
                reason: req.reason.clone(),
                changes,
            },
            fields_after,
        })
    }
}

/// Apply `updates` over `current`; returns the changed fields (sorted by name,
/// since both maps are ordered) and the resulting map.
fn diff_fields(
    current: &BusinessFields,
    updates: &BusinessFields,
) -> (Vec<FieldChange>, BusinessFields) {
    let mut after = current.clone();
    let mut changes = Vec::new();

    for (field, value) in updates {
        let old = current.get(field).cloned();
        let new = match value {
            Value::Null => None,
            v => Some(v.clone()),
        };
        if old == new {
            continue;
        }
        match &new {
            Some(v) => {
                after.insert(field.clone(), v.clone());
            }
            None => {
                after.remove(field);
            }
        }
        changes.push(FieldChange {
            field: field.clone(),
            old,
            new,
        });
    }

    (changes, after)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Capability;
    use crate::permission::CapabilityTable;
    use caseflow_schemas::Country;
    use serde_json::json;

    fn engine() -> WorkflowEngine<CapabilityTable> {
        WorkflowEngine::new(
            CapabilityTable::new()
                .grant("operations", [Capability::PrepareOrder])
                .grant("sales", [Capability::AmendCase, Capability::CompleteCase])
                .grant("manager", Capability::ALL),
        )
    }

    fn case_at(status: CaseStatus) -> Case {
        let now = Utc::now();
        let mut fields = BusinessFields::new();
        fields.insert("hospital".into(), json!("General"));
        fields.insert("surgeon".into(), json!("Dr. Tan"));
        Case {
            case_id: CaseId::new("C-100"),
            country: Country::new("MY"),
            status,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    #[test]
    fn valid_transition_builds_entry() {
        let case = case_at(CaseStatus::CaseBooked);
        let req = TransitionRequest::new(
            CaseStatus::OrderPreparation,
            Actor::new("u-ops", "operations"),
        )
        .with_detail("picking started");
        let at = Utc::now();

        let out = engine().request_transition(&case, &req, false, at).unwrap();
        assert_eq!(out.from_status(), CaseStatus::CaseBooked);
        assert_eq!(out.new_status(), CaseStatus::OrderPreparation);
        assert_eq!(out.entry.entry_id, req.request_id);
        assert_eq!(out.entry.status, CaseStatus::OrderPreparation);
        assert_eq!(out.entry.timestamp, at);
        assert_eq!(out.entry.detail.as_deref(), Some("picking started"));
    }

    #[test]
    fn same_status_is_noop_before_anything_else() {
        // Even an unknown role gets NoOp: the check order puts it first.
        let case = case_at(CaseStatus::CaseBooked);
        let req = TransitionRequest::new(CaseStatus::CaseBooked, Actor::new("x", "nobody"));
        let err = engine()
            .request_transition(&case, &req, false, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::NoOp {
                status: CaseStatus::CaseBooked
            }
        );
    }

    #[test]
    fn missing_edge_is_invalid_even_for_manager() {
        let case = case_at(CaseStatus::CaseBooked);
        let req = TransitionRequest::new(CaseStatus::CaseClosed, Actor::new("m", "manager"));
        let err = engine()
            .request_transition(&case, &req, false, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn gate_denial_is_unauthorized() {
        let case = case_at(CaseStatus::CaseBooked);
        let req =
            TransitionRequest::new(CaseStatus::OrderPreparation, Actor::new("d", "driver"));
        let err = engine()
            .request_transition(&case, &req, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
        assert!(err.to_string().contains("driver"));
    }

    #[test]
    fn pending_amendment_blocks_leaving_amendable_state() {
        let case = case_at(CaseStatus::OrderPrepared);
        let req = TransitionRequest::new(
            CaseStatus::PendingDeliveryHospital,
            Actor::new("m", "manager"),
        );
        let err = engine()
            .request_transition(&case, &req, true, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "AMENDMENT_PENDING");

        // Outside amendable states the flag is irrelevant.
        let case = case_at(CaseStatus::DeliveredHospital);
        let req = TransitionRequest::new(CaseStatus::CaseCompleted, Actor::new("m", "manager"));
        assert!(engine()
            .request_transition(&case, &req, true, Utc::now())
            .is_ok());
    }

    #[test]
    fn amendment_diff_is_ordered_and_minimal() {
        let case = case_at(CaseStatus::OrderPreparation);
        let mut fields = BusinessFields::new();
        fields.insert("surgeon".into(), json!("Dr. Lim"));
        fields.insert("hospital".into(), json!("General")); // unchanged
        fields.insert("procedure".into(), json!("ACL"));
        let req = AmendmentRequest::new(Actor::new("s", "sales"), "surgeon swap", fields);

        let plan = engine()
            .plan_amendment(&case, &req, false, Utc::now())
            .unwrap();
        let names: Vec<_> = plan.entry.changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(names, vec!["procedure", "surgeon"]);
        assert_eq!(plan.entry.changes[0].old, None);
        assert_eq!(plan.entry.changes[1].old, Some(json!("Dr. Tan")));
        assert_eq!(plan.fields_after["surgeon"], json!("Dr. Lim"));
    }

    #[test]
    fn null_removes_a_field() {
        let case = case_at(CaseStatus::CaseBooked);
        let mut fields = BusinessFields::new();
        fields.insert("surgeon".into(), Value::Null);
        let req = AmendmentRequest::new(Actor::new("s", "sales"), "tbc", fields);

        let plan = engine()
            .plan_amendment(&case, &req, false, Utc::now())
            .unwrap();
        assert!(!plan.fields_after.contains_key("surgeon"));
        assert_eq!(plan.entry.changes[0].new, None);
    }

    #[test]
    fn amendment_rules() {
        let eng = engine();
        let mut fields = BusinessFields::new();
        fields.insert("hospital".into(), json!("General"));
        let unchanged = AmendmentRequest::new(Actor::new("s", "sales"), "noop", fields.clone());
        assert_eq!(
            eng.plan_amendment(&case_at(CaseStatus::CaseBooked), &unchanged, false, Utc::now())
                .unwrap_err(),
            WorkflowError::EmptyAmendment
        );

        fields.insert("hospital".into(), json!("Mercy"));
        let req = AmendmentRequest::new(Actor::new("s", "sales"), "move", fields.clone());
        assert_eq!(
            eng.plan_amendment(&case_at(CaseStatus::DeliveredHospital), &req, false, Utc::now())
                .unwrap_err()
                .code(),
            "NOT_AMENDABLE"
        );
        assert_eq!(
            eng.plan_amendment(&case_at(CaseStatus::CaseBooked), &req, true, Utc::now())
                .unwrap_err()
                .code(),
            "AMENDMENT_PENDING"
        );

        let ops = AmendmentRequest::new(Actor::new("o", "operations"), "move", fields);
        assert_eq!(
            eng.plan_amendment(&case_at(CaseStatus::CaseBooked), &ops, false, Utc::now())
                .unwrap_err()
                .code(),
            "UNAUTHORIZED"
        );
    }
}
