//! Scenario: the status write lands but the history append does not answer
//!
//! GREEN when:
//! - The transition still commits (the status is authoritative) and the
//!   receipt says the ledger entry was deferred.
//! - One background re-append runs. If the first append had landed, dedup
//!   suppresses the retry, so the store holds exactly one entry either way.
//! - Resubmitting the identical request afterwards is a NoOp, not a second
//!   entry.

use std::sync::Arc;
use std::time::Duration;

use caseflow_schemas::{CaseId, CaseStatus};
use caseflow_store::{MemoryStore, RemoteStore, StoreError};
use caseflow_sync::{LedgerState, SyncCoordinator};
use caseflow_testkit::{
    client, fast_settings, seed_case, tenant, transition, Fault, FaultyStore, StoreOp,
};

async fn setup() -> (Arc<FaultyStore>, SyncCoordinator, CaseId) {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
    seed_case(store.as_ref(), &tenant("MY").unwrap(), "C-L", CaseStatus::CaseBooked)
        .await
        .unwrap();
    let c = client(store.clone(), "MY").unwrap();
    (store, c, CaseId::new("C-L"))
}

async fn stored_history(store: &FaultyStore, id: &CaseId) -> usize {
    store
        .inner()
        .list_history(tenant("MY").unwrap().scope(id.clone()))
        .await
        .unwrap()
        .len()
}

#[tokio::test(start_paused = true)]
async fn lost_append_response_is_deduplicated_on_retry() {
    let (store, c, id) = setup().await;
    store.inject(StoreOp::AppendHistory, Fault::LoseResponse);

    let req = transition(CaseStatus::OrderPreparation, "operations");
    let receipt = c.request_transition(&id, req.clone()).await.unwrap();
    assert_eq!(receipt.ledger, LedgerState::Deferred);
    assert_eq!(receipt.case.status, CaseStatus::OrderPreparation);
    assert_eq!(stored_history(&store, &id).await, 1);

    // The provisional entry is gone until the re-append is confirmed.
    let view = c.case_view(&id).await.unwrap();
    assert!(view.history.is_empty());

    tokio::time::sleep(fast_settings().reconcile_delay * 2).await;
    assert_eq!(store.calls(StoreOp::AppendHistory), 2);
    assert_eq!(stored_history(&store, &id).await, 1);

    let history = c.list_history(&id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entry_id, req.request_id);

    let again = c.request_transition(&id, req).await.unwrap_err();
    assert_eq!(again.code(), "NO_OP");
    assert_eq!(stored_history(&store, &id).await, 1);
}

#[tokio::test(start_paused = true)]
async fn refused_append_is_recorded_by_the_retry() {
    let (store, c, id) = setup().await;
    store.inject(
        StoreOp::AppendHistory,
        Fault::Fail(StoreError::Unavailable("ledger offline".into())),
    );

    let receipt = c
        .request_transition(&id, transition(CaseStatus::OrderPreparation, "operations"))
        .await
        .unwrap();
    assert_eq!(receipt.ledger, LedgerState::Deferred);
    assert_eq!(stored_history(&store, &id).await, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stored_history(&store, &id).await, 1);
    assert_eq!(c.list_history(&id).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_append_of_same_status_within_window_is_suppressed() {
    let (store, _c, id) = setup().await;
    let my = tenant("MY").unwrap();

    // Two clients record the same move with different entry ids.
    let first = transition(CaseStatus::OrderPreparation, "operations");
    let second = transition(CaseStatus::OrderPreparation, "manager");
    for req in [&first, &second] {
        let entry = caseflow_schemas::StatusHistoryEntry {
            entry_id: req.request_id,
            case_id: id.clone(),
            status: req.to,
            timestamp: chrono::Utc::now(),
            actor: req.actor.clone(),
            detail: None,
            attachments: Vec::new(),
        };
        store.append_history(my.scope(entry)).await.unwrap();
    }
    assert_eq!(stored_history(&store, &id).await, 1);
}
