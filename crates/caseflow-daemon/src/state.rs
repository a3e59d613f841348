//! Shared runtime state for caseflow-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The coordinator owns
//! the case projection; this module only adds the SSE bus and build info.

use std::time::Duration;

use caseflow_schemas::TransitionNotice;
use caseflow_sync::SyncCoordinator;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Transition(TransitionNotice),
    LogLine { level: String, msg: String },
}

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Returned by GET /v1/status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub country: String,
    /// "memory" | "postgres"
    pub store_backend: String,
    pub config_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub coordinator: SyncCoordinator,
    pub store_backend: &'static str,
    pub config_hash: Option<String>,
}

impl AppState {
    pub fn new(
        coordinator: SyncCoordinator,
        store_backend: &'static str,
        config_hash: Option<String>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "caseflow-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            coordinator,
            store_backend,
            config_hash,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            country: self.coordinator.tenant().country().to_string(),
            store_backend: self.store_backend.to_string(),
            config_hash: self.config_hash.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Forward every transition notice from the coordinator onto the SSE bus.
pub fn spawn_notice_relay(
    mut notices: broadcast::Receiver<TransitionNotice>,
    bus: broadcast::Sender<BusMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(n) => {
                    let _ = bus.send(BusMsg::Transition(n));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "notice relay lagged; notices dropped");
                    let _ = bus.send(BusMsg::LogLine {
                        level: "WARN".to_string(),
                        msg: format!("{missed} transition notice(s) dropped"),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
