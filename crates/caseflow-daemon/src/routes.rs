//! Axum router and all HTTP handlers for caseflow-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. The daemon trusts the `actor` in request bodies.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use caseflow_schemas::CaseId;
use caseflow_store::StoreError;
use caseflow_sync::{CaseView, SyncError};
use caseflow_workflow::WorkflowError;
use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{info, warn};

use crate::{
    api_types::{
        AmendmentBody, AmendmentsResponse, CreateCaseBody, ErrorResponse, HealthResponse,
        HistoryResponse, PendingResponse, TransitionBody,
    },
    state::{AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/cases", post(create_case))
        .route("/v1/cases/:case_id", get(case_view))
        .route("/v1/cases/:case_id/history", get(case_history))
        .route(
            "/v1/cases/:case_id/amendments",
            get(case_amendments).post(amend_case),
        )
        .route("/v1/cases/:case_id/transitions", post(transition))
        .route("/v1/cases/:case_id/stream", get(case_stream))
        .route("/v1/notifications/stream", get(notifications_stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn workflow_status(e: &WorkflowError) -> StatusCode {
    match e {
        WorkflowError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        WorkflowError::InvalidTransition { .. } => StatusCode::CONFLICT,
        WorkflowError::NoOp { .. }
        | WorkflowError::AmendmentPending { .. }
        | WorkflowError::NotAmendable { .. }
        | WorkflowError::EmptyAmendment => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Map a coordinator failure to its HTTP response. The body always names the
/// specific reason.
pub(crate) fn sync_error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::Workflow(e) => workflow_status(e),
        SyncError::CaseChanged { .. } | SyncError::ChangePending { .. } => StatusCode::CONFLICT,
        SyncError::StoreUnavailable { case_id, .. } => {
            return (
                StatusCode::ACCEPTED,
                Json(PendingResponse {
                    pending: true,
                    code: err.code().to_string(),
                    message: err.to_string(),
                    case_id: case_id.clone(),
                }),
            )
                .into_response();
        }
        SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::TenantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SyncError::Store(StoreError::AlreadyExists { .. }) => StatusCode::CONFLICT,
        SyncError::Store(e) if e.is_outcome_unknown() => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Store(_) => StatusCode::BAD_GATEWAY,
    };

    let current = match &err {
        SyncError::CaseChanged { current, .. } => Some((**current).clone()),
        _ => None,
    };
    let body = ErrorResponse {
        error: err.to_string(),
        code: err.code().to_string(),
        reason: err.workflow_error().map(|e| e.to_string()),
        current,
    };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health, GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.status()))
}

// ---------------------------------------------------------------------------
// Cases
// ---------------------------------------------------------------------------

pub(crate) async fn create_case(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateCaseBody>,
) -> Response {
    let new = caseflow_schemas::NewCase {
        case_id: body.case_id,
        fields: body.fields,
    };
    match st.coordinator.create_case(new).await {
        Ok(view) => {
            info!(case_id = %view.case.case_id, "cases/create");
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(err) => sync_error_response(err),
    }
}

pub(crate) async fn case_view(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
) -> Response {
    match st.coordinator.case_view(&CaseId::new(case_id)).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => sync_error_response(err),
    }
}

pub(crate) async fn case_history(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
) -> Response {
    let case_id = CaseId::new(case_id);
    match st.coordinator.case_view(&case_id).await {
        Ok(view) => (
            StatusCode::OK,
            Json(HistoryResponse {
                case_id,
                history: view.history,
            }),
        )
            .into_response(),
        Err(err) => sync_error_response(err),
    }
}

pub(crate) async fn case_amendments(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
) -> Response {
    let case_id = CaseId::new(case_id);
    match st.coordinator.list_amendments(&case_id).await {
        Ok(amendments) => (
            StatusCode::OK,
            Json(AmendmentsResponse {
                case_id,
                amendments,
            }),
        )
            .into_response(),
        Err(err) => sync_error_response(err),
    }
}

pub(crate) async fn transition(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Response {
    let case_id = CaseId::new(case_id);
    match st
        .coordinator
        .request_transition(&case_id, body.into_request())
        .await
    {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(err) => sync_error_response(err),
    }
}

pub(crate) async fn amend_case(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
    Json(body): Json<AmendmentBody>,
) -> Response {
    let case_id = CaseId::new(case_id);
    match st
        .coordinator
        .request_amendment(&case_id, body.into_request())
        .await
    {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(err) => sync_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    headers
}

/// GET /v1/cases/:case_id/stream: the case view, re-sent on every change.
pub(crate) async fn case_stream(
    State(st): State<Arc<AppState>>,
    Path(case_id): Path<String>,
) -> Response {
    match st.coordinator.watch_case(&CaseId::new(case_id)).await {
        Ok(rx) => (
            sse_headers(),
            Sse::new(watch_to_sse(rx)).keep_alive(KeepAlive::new()),
        )
            .into_response(),
        Err(err) => sync_error_response(err),
    }
}

fn watch_to_sse(
    rx: watch::Receiver<CaseView>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    WatchStream::new(rx).filter_map(|view| async move {
        let data = serde_json::to_string(&view).ok()?;
        Some(Ok(Event::default().event("case").data(data)))
    })
}

/// GET /v1/notifications/stream: transition notices plus heartbeats.
pub(crate) async fn notifications_stream(State(st): State<Arc<AppState>>) -> Response {
    let rx = st.bus.subscribe();
    (
        sse_headers(),
        Sse::new(broadcast_to_sse(rx)).keep_alive(KeepAlive::new()),
    )
        .into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Transition(_) => "transition",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(err) => {
                warn!(error = %err, "notification stream lagged");
                None
            }
        }
    })
}
