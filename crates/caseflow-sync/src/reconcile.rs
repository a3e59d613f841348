//! Unknown-outcome reconciliation state.
//!
//! A write that timed out (or hit an unavailable store) may have landed. The
//! coordinator rolls the projection back, marks the case pending and reads
//! the store again in the background. The result is published on a watch
//! channel so callers that care can wait for it.

use caseflow_schemas::Case;
use serde::Serialize;
use tokio::sync::watch;

/// Background reads attempted before giving up; the delay doubles each time.
pub const MAX_RECONCILE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconcileStatus {
    Pending,
    /// The write had landed. `case` is the row as read back, which may
    /// already show a later writer's status.
    Confirmed { case: Box<Case> },
    /// The write had not landed (or was superseded); the projection was
    /// corrected to the store's value.
    Corrected { case: Box<Case> },
    /// The store stayed unreachable. The change feed is the remaining path
    /// back to consistency.
    Failed { reason: String },
}

impl ReconcileStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ReconcileStatus::Pending)
    }
}

/// Receiving side of one reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileWatch {
    rx: watch::Receiver<ReconcileStatus>,
}

impl ReconcileWatch {
    pub(crate) fn new(rx: watch::Receiver<ReconcileStatus>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> ReconcileStatus {
        self.rx.borrow().clone()
    }

    /// Wait until the reconciliation leaves `Pending`.
    pub async fn settled(mut self) -> ReconcileStatus {
        loop {
            let now = self.rx.borrow_and_update().clone();
            if !now.is_pending() {
                return now;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone; whatever it last published is final.
                return self.rx.borrow().clone();
            }
        }
    }
}
