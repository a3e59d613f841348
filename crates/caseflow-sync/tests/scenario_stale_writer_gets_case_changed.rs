//! Scenario: stale writer gets CaseChanged; change feed converges clients
//!
//! GREEN when:
//! - Two clients share one store. A commits first; B, still holding the old
//!   status, is refused with `CaseChanged` carrying A's row, and B's
//!   projection is rolled back and shows A's status with no provisional
//!   history.
//! - The reason names why B's request no longer applies.
//! - A client running the change feed sees another client's transition
//!   without reloading, and a case subscription is called with it.

use std::sync::Arc;
use std::time::Duration;

use caseflow_isolation::TenantScope;
use caseflow_schemas::{Actor, BusinessFields, CaseId, CaseStatus, NewCase};
use caseflow_store::{MemoryStore, RemoteStore, StatusWrite};
use caseflow_sync::{CaseView, SyncCoordinator, SyncError, SyncSettings};
use caseflow_workflow::{Capability, CapabilityTable, TransitionRequest, WorkflowError};
use tokio::sync::mpsc;

fn client(store: &Arc<MemoryStore>) -> SyncCoordinator {
    SyncCoordinator::new(
        store.clone(),
        Arc::new(CapabilityTable::new().grant("manager", Capability::ALL)),
        TenantScope::new("MY").unwrap(),
        SyncSettings::default(),
    )
}

fn manager(id: &str) -> Actor {
    Actor::new(id, "manager")
}

async fn seed_at(store: &MemoryStore, id: &str, path: &[CaseStatus]) {
    let my = TenantScope::new("MY").unwrap();
    store
        .create_case(my.scope(NewCase {
            case_id: CaseId::new(id),
            fields: BusinessFields::new(),
        }))
        .await
        .unwrap();
    let mut from = CaseStatus::CaseBooked;
    for &to in path {
        store
            .write_case_status(my.scope(StatusWrite {
                write_id: uuid::Uuid::new_v4(),
                case_id: CaseId::new(id),
                expected: from,
                to,
            }))
            .await
            .unwrap();
        from = to;
    }
}

#[tokio::test]
async fn second_writer_on_a_moved_case_is_refused() {
    let store = Arc::new(MemoryStore::new());
    seed_at(
        &store,
        "C-1",
        &[CaseStatus::OrderPreparation, CaseStatus::OrderPrepared],
    )
    .await;
    let id = CaseId::new("C-1");

    let a = client(&store);
    let b = client(&store);
    a.load_case(&id).await.unwrap();
    b.load_case(&id).await.unwrap();

    a.request_transition(
        &id,
        TransitionRequest::new(CaseStatus::PendingDeliveryHospital, manager("a")),
    )
    .await
    .unwrap();

    // B never saw A's write: its local view still says Order Prepared, so the
    // engine accepts and the conditional write is what catches it.
    let err = b
        .request_transition(&id, TransitionRequest::new(CaseStatus::CaseCancelled, manager("b")))
        .await
        .unwrap_err();

    match &err {
        SyncError::CaseChanged { current, reason } => {
            assert_eq!(current.status, CaseStatus::PendingDeliveryHospital);
            assert_eq!(
                reason,
                &Some(WorkflowError::InvalidTransition {
                    from: CaseStatus::OrderPrepared,
                    to: CaseStatus::CaseCancelled,
                })
            );
        }
        other => panic!("expected CaseChanged, got {other:?}"),
    }
    assert_eq!(err.code(), "CASE_CHANGED");

    let view = b.case_view(&id).await.unwrap();
    assert_eq!(view.case.status, CaseStatus::PendingDeliveryHospital);
    assert!(view.history.iter().all(|i| !i.provisional));
}

#[tokio::test]
async fn completed_then_closed_refuses_stale_cancel() {
    let store = Arc::new(MemoryStore::new());
    seed_at(
        &store,
        "C-2",
        &[
            CaseStatus::OrderPreparation,
            CaseStatus::OrderPrepared,
            CaseStatus::PendingDeliveryHospital,
            CaseStatus::DeliveredHospital,
            CaseStatus::CaseCompleted,
            CaseStatus::PendingDeliveryOffice,
            CaseStatus::DeliveredOffice,
            CaseStatus::ToBeBilled,
        ],
    )
    .await;
    let id = CaseId::new("C-2");
    let a = client(&store);
    let b = client(&store);
    a.load_case(&id).await.unwrap();
    b.load_case(&id).await.unwrap();

    a.request_transition(&id, TransitionRequest::new(CaseStatus::CaseClosed, manager("a")))
        .await
        .unwrap();
    let err = b
        .request_transition(&id, TransitionRequest::new(CaseStatus::CaseCancelled, manager("b")))
        .await
        .unwrap_err();

    // Closed is terminal, so re-validation against the fresh row fails on the graph.
    assert_eq!(
        err.workflow_error(),
        Some(&WorkflowError::InvalidTransition {
            from: CaseStatus::CaseClosed,
            to: CaseStatus::CaseCancelled,
        })
    );
    let my = TenantScope::new("MY").unwrap();
    let server = store.read_case(my.scope(id.clone())).await.unwrap();
    assert_eq!(server.status, CaseStatus::CaseClosed);
    assert_eq!(store.list_history(my.scope(id)).await.unwrap().len(), 1);
}

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<CaseView>, status: CaseStatus) -> CaseView {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = rx.recv().await.expect("subscription ended");
            if view.case.status == status {
                return view;
            }
        }
    })
    .await
    .expect("status never reached the subscriber")
}

#[tokio::test]
async fn change_feed_merges_remote_transitions() {
    let store = Arc::new(MemoryStore::new());
    seed_at(&store, "C-3", &[]).await;
    let id = CaseId::new("C-3");

    let watcher = client(&store);
    let writer = client(&store);
    let feed = watcher.start_change_feed();
    watcher.load_case(&id).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = watcher
        .subscribe_to_case(&id, move |view| {
            let _ = tx.send(view.clone());
        })
        .await
        .unwrap();
    assert!(sub.is_active());

    let first = rx.recv().await.unwrap();
    assert_eq!(first.case.status, CaseStatus::CaseBooked);

    writer.load_case(&id).await.unwrap();
    let receipt = writer
        .request_transition(
            &id,
            TransitionRequest::new(CaseStatus::OrderPreparation, manager("w")),
        )
        .await
        .unwrap();

    wait_for(&mut rx, CaseStatus::OrderPreparation).await;
    // The history echo may arrive after the status row.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let v = watcher.case_view(&id).await.unwrap();
            if v.history.iter().any(|i| i.entry == receipt.entry) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    drop(sub);
    feed.abort();
}
