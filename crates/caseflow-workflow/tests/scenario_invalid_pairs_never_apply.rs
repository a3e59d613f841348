//! Scenario: every (from, to) pair outside the graph is rejected
//!
//! # Invariants under test
//!
//! 1. For every pair not present in the graph, `request_transition` returns
//!    `InvalidTransition` (or `NoOp` for `from == to`), even for a role that
//!    holds every capability.
//! 2. The input case is never mutated by a rejected request.
//! 3. Every edge that IS in the graph is accepted for an all-capability role,
//!    and the produced status is always a member of the taxonomy.

use caseflow_schemas::{Actor, BusinessFields, Case, CaseId, Country};
use caseflow_workflow::{
    is_valid_transition, Capability, CapabilityTable, CaseStatus, TransitionRequest,
    WorkflowEngine, WorkflowError,
};
use chrono::Utc;

fn case_at(status: CaseStatus) -> Case {
    let now = Utc::now();
    Case {
        case_id: CaseId::new("C-PROP"),
        country: Country::new("SG"),
        status,
        created_at: now,
        updated_at: now,
        fields: BusinessFields::new(),
    }
}

#[test]
fn pairs_outside_the_graph_are_rejected_without_mutation() {
    let engine = WorkflowEngine::new(CapabilityTable::new().grant("manager", Capability::ALL));
    let actor = Actor::new("u-1", "manager");

    for from in CaseStatus::ALL {
        for to in CaseStatus::ALL {
            let case = case_at(from);
            let before = case.clone();
            let req = TransitionRequest::new(to, actor.clone());
            let result = engine.request_transition(&case, &req, false, Utc::now());

            assert_eq!(case, before, "engine must never mutate its input");

            if is_valid_transition(from, to) {
                let out = result.expect("edge in graph must be accepted");
                assert!(CaseStatus::ALL.contains(&out.new_status()));
            } else if from == to {
                assert_eq!(result.unwrap_err(), WorkflowError::NoOp { status: from });
            } else {
                assert_eq!(
                    result.unwrap_err(),
                    WorkflowError::InvalidTransition { from, to },
                    "{from} -> {to}"
                );
            }
        }
    }
}

#[test]
fn walking_the_happy_path_ends_closed() {
    let engine = WorkflowEngine::new(CapabilityTable::new().grant("manager", Capability::ALL));
    let actor = Actor::new("u-1", "manager");
    let mut case = case_at(CaseStatus::CaseBooked);

    for to in &CaseStatus::ALL[1..10] {
        let req = TransitionRequest::new(*to, actor.clone());
        let out = engine
            .request_transition(&case, &req, false, Utc::now())
            .unwrap();
        case.status = out.new_status();
    }

    assert_eq!(case.status, CaseStatus::CaseClosed);
    assert!(case.status.is_terminal());
}
