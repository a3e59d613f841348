//! In-process scenario tests for caseflow-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`; no network I/O required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use caseflow_daemon::{routes, state};
use caseflow_isolation::TenantScope;
use caseflow_store::MemoryStore;
use caseflow_sync::{SyncCoordinator, SyncSettings};
use caseflow_workflow::{Capability, CapabilityTable};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_state() -> Arc<state::AppState> {
    let gate = CapabilityTable::new()
        .grant("booking", [Capability::CancelCase, Capability::AmendCase])
        .grant(
            "operations",
            [
                Capability::PrepareOrder,
                Capability::DispatchOrder,
                Capability::ReturnToOffice,
            ],
        );
    let coordinator = SyncCoordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(gate),
        TenantScope::new("MY").unwrap(),
        SyncSettings::default(),
    );
    Arc::new(state::AppState::new(coordinator, "memory", None))
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(st: &Arc<state::AppState>, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let router = routes::build_router(Arc::clone(st));
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

async fn create(st: &Arc<state::AppState>, id: &str) {
    let (status, _) = call(
        st,
        post("/v1/cases", json!({"case_id": id, "fields": {"hospital": "General"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

fn transition_body(to: &str, role: &str) -> Value {
    json!({"to": to, "actor": {"id": "u-1", "role": role}})
}

// ---------------------------------------------------------------------------
// GET /v1/health, /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state();
    let (status, body) = call(&st, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "caseflow-daemon");
}

#[tokio::test]
async fn status_reports_tenant_and_backend() {
    let st = make_state();
    let (status, body) = call(&st, get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["country"], "MY");
    assert_eq!(json["store_backend"], "memory");
}

// ---------------------------------------------------------------------------
// Cases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_then_view_starts_at_case_booked() {
    let st = make_state();
    create(&st, "C-1").await;

    let (status, body) = call(&st, get("/v1/cases/C-1")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["case"]["status"], "Case Booked");
    assert_eq!(json["case"]["country"], "MY");
    assert_eq!(json["case"]["fields"]["hospital"], "General");

    let (status, body) = call(&st, post("/v1/cases", json!({"case_id": "C-1"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(parse_json(body)["code"], "STORE_ERROR");
}

#[tokio::test]
async fn unknown_case_is_404() {
    let st = make_state();
    let (status, body) = call(&st, get("/v1/cases/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(body)["code"], "NOT_FOUND");
}

#[tokio::test]
async fn permitted_transition_returns_receipt_and_history() {
    let st = make_state();
    create(&st, "C-1").await;

    let (status, body) = call(
        &st,
        post(
            "/v1/cases/C-1/transitions",
            json!({
                "to": "Order Preparation",
                "actor": {"id": "u-1", "role": "operations"},
                "detail": "picking started",
                "attachments": ["att-1"]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["case"]["status"], "Order Preparation");
    assert_eq!(json["ledger"], "recorded");
    assert_eq!(json["entry"]["attachments"][0], "att-1");

    let (status, body) = call(&st, get("/v1/cases/C-1/history")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    let history = json["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["status"], "Order Preparation");
    assert_eq!(history[0]["provisional"], false);
    assert_eq!(history[0]["actor"]["role"], "operations");
}

#[tokio::test]
async fn rejections_map_to_specific_status_codes() {
    let st = make_state();
    create(&st, "C-1").await;

    // Edge does not exist.
    let (status, body) = call(
        &st,
        post("/v1/cases/C-1/transitions", transition_body("Case Closed", "operations")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(parse_json(body)["code"], "INVALID_TRANSITION");

    // Role lacks the capability.
    let (status, body) = call(
        &st,
        post("/v1/cases/C-1/transitions", transition_body("Order Preparation", "booking")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(parse_json(body)["code"], "UNAUTHORIZED");

    // Already there.
    let (status, body) = call(
        &st,
        post("/v1/cases/C-1/transitions", transition_body("Case Booked", "operations")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(parse_json(body)["code"], "NO_OP");

    let (_, body) = call(&st, get("/v1/cases/C-1")).await;
    let json = parse_json(body);
    assert_eq!(json["case"]["status"], "Case Booked");
    assert!(json["history"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stale_from_is_refused_with_current_row() {
    let st = make_state();
    create(&st, "C-1").await;
    let (status, _) = call(
        &st,
        post("/v1/cases/C-1/transitions", transition_body("Order Preparation", "operations")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &st,
        post(
            "/v1/cases/C-1/transitions",
            json!({
                "to": "Case Cancelled",
                "from": "Case Booked",
                "actor": {"id": "u-2", "role": "booking"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let json = parse_json(body);
    assert_eq!(json["code"], "CASE_CHANGED");
    assert_eq!(json["current"]["status"], "Order Preparation");
    assert!(json["reason"]
        .as_str()
        .unwrap()
        .contains("'Case Booked' -> 'Case Cancelled'"));
}

#[tokio::test]
async fn amendments_are_listed_after_posting() {
    let st = make_state();
    create(&st, "C-1").await;

    let (status, body) = call(
        &st,
        post(
            "/v1/cases/C-1/amendments",
            json!({
                "actor": {"id": "u-2", "role": "booking"},
                "reason": "surgeon changed",
                "fields": {"surgeon": "Dr. Lim", "hospital": null}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["case"]["fields"]["surgeon"], "Dr. Lim");
    assert!(json["case"]["fields"].get("hospital").is_none());

    let (status, body) = call(&st, get("/v1/cases/C-1/amendments")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    let list = json["amendments"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["reason"], "surgeon changed");
    assert_eq!(list[0]["changes"].as_array().unwrap().len(), 2);

    // Operations may not amend.
    let (status, body) = call(
        &st,
        post(
            "/v1/cases/C-1/amendments",
            json!({
                "actor": {"id": "u-3", "role": "operations"},
                "reason": "x",
                "fields": {"surgeon": "Dr. Ng"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(parse_json(body)["code"], "UNAUTHORIZED");
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transitions_are_relayed_onto_the_bus() {
    let st = make_state();
    let mut bus = st.bus.subscribe();
    let relay = state::spawn_notice_relay(st.coordinator.notifications(), st.bus.clone());
    create(&st, "C-1").await;

    let (status, _) = call(
        &st,
        post("/v1/cases/C-1/transitions", transition_body("Order Preparation", "operations")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let msg = tokio::time::timeout(std::time::Duration::from_secs(2), bus.recv())
        .await
        .expect("no bus message")
        .unwrap();
    match msg {
        state::BusMsg::Transition(n) => {
            assert_eq!(n.case_id.as_str(), "C-1");
            assert_eq!(n.new_status.label(), "Order Preparation");
        }
        other => panic!("expected transition notice, got {other:?}"),
    }
    relay.abort();
}

#[tokio::test]
async fn case_stream_is_an_event_stream() {
    let st = make_state();
    create(&st, "C-1").await;
    let router = routes::build_router(Arc::clone(&st));
    let resp = router.oneshot(get("/v1/cases/C-1/stream")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(ct.starts_with("text/event-stream"), "content-type was {ct}");
}
