//! Scenario: completion and cancellation race on a delivered case
//!
//! GREEN when:
//! - Two clients, both looking at `Delivered (Hospital)`, submit
//!   `Case Completed` and `Case Cancelled` at the same moment.
//! - Exactly one write lands. The other client is told the case changed,
//!   with InvalidTransition as the reason and the winner's row attached.
//! - The store holds exactly one history entry, and the loser's projection
//!   already shows the winner's status.

use std::sync::Arc;

use caseflow_schemas::{CaseId, CaseStatus};
use caseflow_store::{MemoryStore, RemoteStore};
use caseflow_sync::SyncError;
use caseflow_testkit::{client, seed_case, tenant, transition, FaultyStore, StoreOp};
use caseflow_workflow::WorkflowError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exactly_one_of_two_racing_writers_wins() {
    let shared: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
    let my = tenant("MY").unwrap();
    seed_case(shared.as_ref(), &my, "C-9", CaseStatus::DeliveredHospital)
        .await
        .unwrap();
    let id = CaseId::new("C-9");

    // Each client reaches the shared store through its own wrapper so both
    // writes can be parked and released together.
    let sales_store = Arc::new(FaultyStore::new(Arc::clone(&shared)));
    let booking_store = Arc::new(FaultyStore::new(Arc::clone(&shared)));
    let sales = client(sales_store.clone(), "MY").unwrap();
    let booking = client(booking_store.clone(), "MY").unwrap();
    sales.load_case(&id).await.unwrap();
    booking.load_case(&id).await.unwrap();

    let hold_sales = sales_store.hold(StoreOp::WriteStatus);
    let hold_booking = booking_store.hold(StoreOp::WriteStatus);

    let s = sales.clone();
    let sid = id.clone();
    let complete = tokio::spawn(async move {
        s.request_transition(&sid, transition(CaseStatus::CaseCompleted, "sales"))
            .await
    });
    let b = booking.clone();
    let bid = id.clone();
    let cancel = tokio::spawn(async move {
        b.request_transition(&bid, transition(CaseStatus::CaseCancelled, "booking"))
            .await
    });

    // Both passed local validation and are at the store.
    hold_sales.arrived().await;
    hold_booking.arrived().await;
    hold_sales.release();
    hold_booking.release();

    let results = [complete.await.unwrap(), cancel.await.unwrap()];
    let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(wins.len(), 1, "exactly one writer must win: {results:?}");
    let winner = wins[0].case.status;

    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one writer must lose");
    match loser {
        SyncError::CaseChanged { current, reason } => {
            assert_eq!(current.status, winner);
            assert!(
                matches!(reason, Some(WorkflowError::InvalidTransition { .. })),
                "reason was {reason:?}"
            );
        }
        other => panic!("expected CaseChanged, got {other:?}"),
    }

    let stored = shared.read_case(my.scope(id.clone())).await.unwrap();
    assert_eq!(stored.status, winner);
    let history = shared.list_history(my.scope(id.clone())).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, winner);

    // Both projections agree with the store, with no leftover provisional entry.
    for c in [&sales, &booking] {
        let view = c.case_view(&id).await.unwrap();
        assert_eq!(view.case.status, winner);
        assert!(view.history.iter().all(|h| !h.provisional));
    }
}
