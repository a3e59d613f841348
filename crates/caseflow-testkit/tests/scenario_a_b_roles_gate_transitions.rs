//! Scenario: operations moves a booked case forward, a driver cannot
//!
//! GREEN when:
//! - Operations takes `Case Booked` to `Order Preparation`; history holds
//!   exactly one entry matching the request, and `current_status` reports it.
//! - A driver asking for the same edge is refused as Unauthorized, the store
//!   never sees a write and history still holds one entry.

use std::sync::Arc;

use caseflow_schemas::{CaseId, CaseStatus};
use caseflow_store::MemoryStore;
use caseflow_sync::{LedgerState, SyncError};
use caseflow_testkit::{client, seed_case, tenant, transition, FaultyStore, StoreOp};
use caseflow_workflow::WorkflowError;

#[tokio::test]
async fn operations_prepares_then_driver_is_refused() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-A", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let c = client(store.clone(), "MY").unwrap();
    let id = CaseId::new("C-A");

    // Scenario A
    let receipt = c
        .request_transition(&id, transition(CaseStatus::OrderPreparation, "operations"))
        .await
        .unwrap();
    assert_eq!(receipt.ledger, LedgerState::Recorded);
    assert_eq!(c.current_status(&id).await.unwrap(), CaseStatus::OrderPreparation);

    let history = c.list_history(&id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CaseStatus::OrderPreparation);
    assert_eq!(history[0].actor.role.as_str(), "operations");

    // Scenario B: the driver asks for the edge out of the status they saw.
    let reset = seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-B", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let id_b = reset.case_id;
    let writes_before = store.calls(StoreOp::WriteStatus);
    let err = c
        .request_transition(&id_b, transition(CaseStatus::OrderPreparation, "driver"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Workflow(WorkflowError::Unauthorized { .. })
    ));
    assert_eq!(store.calls(StoreOp::WriteStatus), writes_before);
    assert_eq!(c.current_status(&id_b).await.unwrap(), CaseStatus::CaseBooked);

    // On the first case the same refusal leaves its one entry alone.
    let err = c
        .request_transition(&id, transition(CaseStatus::OrderPrepared, "driver"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    assert_eq!(c.list_history(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn edges_outside_the_graph_never_write() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-1", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let c = client(store.clone(), "MY").unwrap();
    let id = CaseId::new("C-1");

    for to in CaseStatus::ALL {
        if caseflow_workflow::is_valid_transition(CaseStatus::CaseBooked, to) {
            continue;
        }
        let err = c
            .request_transition(&id, transition(to, "manager"))
            .await
            .unwrap_err();
        let code = err.code();
        assert!(code == "INVALID_TRANSITION" || code == "NO_OP", "{to}: {code}");
    }
    assert_eq!(store.calls(StoreOp::WriteStatus), 0);
    assert_eq!(c.current_status(&id).await.unwrap(), CaseStatus::CaseBooked);
    assert!(c.list_history(&id).await.unwrap().is_empty());
}
