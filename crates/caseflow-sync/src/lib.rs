//! caseflow-sync
//!
//! Client-side half of the case engine: a projection of the tenant's cases,
//! optimistic transitions written through to the remote store, conflict and
//! unknown-outcome reconciliation, and the change-feed merge loop.
//!
//! The [`SyncCoordinator`] is the only writer of the projection. Callers
//! (daemon routes, the CLI, tests) drive it through async methods and read it
//! back through [`CaseView`] snapshots or watch subscriptions.

mod coordinator;
mod error;
mod projection;
mod reconcile;
mod subscription;

pub use coordinator::{
    AmendmentReceipt, LedgerState, SyncCoordinator, SyncSettings, TransitionReceipt,
    DEFAULT_RECONCILE_DELAY, DEFAULT_WRITE_TIMEOUT,
};
pub use error::SyncError;
pub use projection::{CaseView, HistoryItem};
pub use reconcile::{ReconcileStatus, ReconcileWatch, MAX_RECONCILE_ATTEMPTS};
pub use subscription::CaseSubscription;
