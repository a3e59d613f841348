//! Scenario: follow-up writes while an outcome is still unknown
//!
//! GREEN when:
//! - While a transition's outcome is being reconciled, further transitions
//!   and amendments on that case are refused with ChangePending, without
//!   reaching the store; other cases are unaffected.
//! - An amendment whose response was lost keeps the case amendment-pending:
//!   a second amendment is refused as AmendmentPending, the fields are rolled
//!   back, and the reconciliation confirms the stored amendment by id.
//! - Once settled, writes on the case go through again.

use std::sync::Arc;

use caseflow_schemas::{BusinessFields, CaseId, CaseStatus};
use caseflow_store::MemoryStore;
use caseflow_sync::{ReconcileStatus, SyncError};
use caseflow_testkit::{
    amendment, client, seed_case, tenant, transition, Fault, FaultyStore, StoreOp,
};
use caseflow_workflow::WorkflowError;
use serde_json::json;

fn fields(pairs: &[(&str, serde_json::Value)]) -> BusinessFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unknown_transition_outcome_refuses_followups() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    let my = tenant("MY").unwrap();
    seed_case(store.as_ref(), &my, "C-P", CaseStatus::CaseBooked).await.unwrap();
    seed_case(store.as_ref(), &my, "C-Q", CaseStatus::CaseBooked).await.unwrap();
    let c = client(store.clone(), "MY").unwrap();
    let id = CaseId::new("C-P");
    let other = CaseId::new("C-Q");

    store.inject(StoreOp::WriteStatus, Fault::LoseResponse);
    let err = c
        .request_transition(&id, transition(CaseStatus::OrderPreparation, "operations"))
        .await
        .unwrap_err();
    let reconcile = match err {
        SyncError::StoreUnavailable { reconcile, .. } => reconcile,
        other => panic!("expected StoreUnavailable, got {other:?}"),
    };

    let writes = store.calls(StoreOp::WriteStatus);
    let err = c
        .request_transition(&id, transition(CaseStatus::CaseCancelled, "booking"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ChangePending { .. }), "{err:?}");
    let err = c
        .request_amendment(
            &id,
            amendment("booking", "typo", fields(&[("surgeon", json!("Dr. Tan"))])),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CHANGE_PENDING");
    assert_eq!(store.calls(StoreOp::WriteStatus), writes);
    assert_eq!(store.calls(StoreOp::Amend), 0);

    // Other cases are not blocked.
    c.request_transition(&other, transition(CaseStatus::OrderPreparation, "operations"))
        .await
        .unwrap();

    assert!(matches!(
        reconcile.settled().await,
        ReconcileStatus::Confirmed { .. }
    ));
    let receipt = c
        .request_transition(&id, transition(CaseStatus::OrderPrepared, "operations"))
        .await
        .unwrap();
    assert_eq!(receipt.case.status, CaseStatus::OrderPrepared);
    assert_eq!(c.list_history(&id).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn lost_amendment_response_is_confirmed_by_id() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-M", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let c = client(store.clone(), "MY").unwrap();
    let id = CaseId::new("C-M");
    let before = c.load_case(&id).await.unwrap();

    store.inject(StoreOp::Amend, Fault::LoseResponse);
    let req = amendment("booking", "surgeon changed", fields(&[("surgeon", json!("Dr. Lim"))]));
    let err = c.request_amendment(&id, req.clone()).await.unwrap_err();
    let reconcile = match err {
        SyncError::StoreUnavailable { reconcile, .. } => reconcile,
        other => panic!("expected StoreUnavailable, got {other:?}"),
    };

    let view = c.case_view(&id).await.unwrap();
    assert_eq!(view.case.fields, before.case.fields);
    assert!(view.amendment_pending);

    let err = c
        .request_amendment(
            &id,
            amendment("sales", "again", fields(&[("surgeon", json!("Dr. Ong"))])),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Workflow(WorkflowError::AmendmentPending { .. })
    ));
    // Moving a still-amendable case would race the unknown amendment.
    let err = c
        .request_transition(&id, transition(CaseStatus::OrderPreparation, "operations"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AMENDMENT_PENDING");

    assert!(matches!(
        reconcile.settled().await,
        ReconcileStatus::Confirmed { .. }
    ));
    let view = c.case_view(&id).await.unwrap();
    assert!(!view.amendment_pending);
    assert_eq!(view.case.fields["surgeon"], json!("Dr. Lim"));
    assert_eq!(view.amendments.len(), 1);
    assert_eq!(view.amendments[0].amendment_id, req.request_id);
}

#[tokio::test(start_paused = true)]
async fn refused_amendment_is_corrected() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-N", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let c = client(store.clone(), "MY").unwrap();
    let id = CaseId::new("C-N");

    store.inject(StoreOp::Amend, Fault::Hang);
    let err = c
        .request_amendment(
            &id,
            amendment("booking", "x", fields(&[("hospital", json!("North"))])),
        )
        .await
        .unwrap_err();
    let reconcile = match err {
        SyncError::StoreUnavailable { reconcile, .. } => reconcile,
        other => panic!("expected StoreUnavailable, got {other:?}"),
    };
    assert!(matches!(
        reconcile.settled().await,
        ReconcileStatus::Corrected { .. }
    ));

    let view = c.case_view(&id).await.unwrap();
    assert!(view.amendments.is_empty());
    assert!(!view.case.fields.contains_key("hospital"));

    // The case is amendable again.
    c.request_amendment(
        &id,
        amendment("booking", "x", fields(&[("hospital", json!("North"))])),
    )
    .await
    .unwrap();
}
