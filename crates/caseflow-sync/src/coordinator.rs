//! Optimistic sync coordinator.
//!
//! # Request lifecycle
//!
//! 1. **Validate** against the local projection with the pure engine. Local
//!    rejections return immediately; the store is never called.
//! 2. **Snapshot + optimistic apply**: status and a provisional history
//!    entry are applied to the projection.
//! 3. **Write-through** in a spawned task holding the case lock: a
//!    conditional status write, then the history append, each bounded by
//!    `write_timeout`. Dropping the caller's future never cancels it.
//! 4. **Reconcile**:
//!    - success: server row and stored entry replace the optimistic state,
//!      a [`TransitionNotice`] is broadcast;
//!    - conflict: rollback, merge the server row, fail with
//!      [`SyncError::CaseChanged`];
//!    - unavailable/timeout: rollback, mark the case pending and settle it
//!      with a background read; the caller gets
//!      [`SyncError::StoreUnavailable`]. The read asks the store for the
//!      write by id, so a write that landed and was then overtaken by
//!      another writer still counts as landed.
//!
//! Independently, [`SyncCoordinator::start_change_feed`] merges every
//! tenant mutation from the store into the projection, last writer wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use caseflow_isolation::TenantScope;
use caseflow_schemas::{
    AmendmentEntry, Case, CaseChange, CaseChangeEvent, CaseId, CaseStatus, NewCase,
    StatusHistoryEntry, TransitionNotice,
};
use caseflow_store::{
    AmendmentWrite, FeedItem, LandedWrite, RemoteStore, StatusWrite, StoreError, WriteLookup,
};
use caseflow_workflow::{
    AmendmentPlan, AmendmentRequest, PermissionGate, TransitionOutcome, TransitionRequest,
    WorkflowEngine, WorkflowError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::projection::{CaseView, PendingKind, Projection, Snapshot};
use crate::reconcile::{ReconcileStatus, ReconcileWatch, MAX_RECONCILE_ATTEMPTS};
use crate::subscription::CaseSubscription;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_millis(250);
const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub write_timeout: Duration,
    pub reconcile_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconcile_delay: DEFAULT_RECONCILE_DELAY,
        }
    }
}

/// Whether the history entry of a committed transition reached the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Recorded,
    /// The status write landed but the append failed; one background
    /// re-append is scheduled.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReceipt {
    /// The row as the store holds it after the write.
    pub case: Case,
    /// Stored entry when `ledger` is `Recorded`, otherwise the provisional one.
    pub entry: StatusHistoryEntry,
    pub ledger: LedgerState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmendmentReceipt {
    pub case: Case,
    pub entry: AmendmentEntry,
}

type Gate = Arc<dyn PermissionGate>;

struct Shared {
    store: Arc<dyn RemoteStore>,
    engine: WorkflowEngine<Gate>,
    tenant: TenantScope,
    settings: SyncSettings,
    projection: Mutex<Projection>,
    case_locks: Mutex<HashMap<CaseId, Arc<tokio::sync::Mutex<()>>>>,
    notices: broadcast::Sender<TransitionNotice>,
}

/// Cheap to clone; all clones share one projection.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        gate: Arc<dyn PermissionGate>,
        tenant: TenantScope,
        settings: SyncSettings,
    ) -> Self {
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                engine: WorkflowEngine::new(gate),
                tenant,
                settings,
                projection: Mutex::new(Projection::default()),
                case_locks: Mutex::new(HashMap::new()),
                notices,
            }),
        }
    }

    pub fn tenant(&self) -> &TenantScope {
        &self.shared.tenant
    }

    pub fn settings(&self) -> SyncSettings {
        self.shared.settings
    }

    /// Subscribe to the store's change feed and merge it into the projection
    /// until the feed closes or every coordinator handle is dropped.
    pub fn start_change_feed(&self) -> JoinHandle<()> {
        let mut feed = self.shared.store.subscribe(&self.shared.tenant);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                match item {
                    FeedItem::Event(ev) => shared.merge_event(ev),
                    FeedItem::Lagged { missed } => {
                        warn!(missed, "change feed lagged; resyncing cached cases");
                        shared.resync().await;
                    }
                }
            }
            debug!("change feed closed");
        })
    }

    /// Every successful transition, for the notification subsystem.
    pub fn notifications(&self) -> broadcast::Receiver<TransitionNotice> {
        self.shared.notices.subscribe()
    }

    pub async fn create_case(&self, new: NewCase) -> Result<CaseView, SyncError> {
        let shared = &self.shared;
        let case = shared
            .bounded(shared.store.create_case(shared.tenant.scope(new)))
            .await?;
        shared.tenant.guard_case(&case)?;
        info!(case_id = %case.case_id, country = %case.country, "case created");

        let case_id = case.case_id.clone();
        let mut p = shared.projection();
        p.load(case, Vec::new(), Vec::new());
        p.view(&case_id).ok_or(SyncError::NotFound { case_id })
    }

    /// Read the case from the store and install or refresh it locally.
    pub async fn load_case(&self, case_id: &CaseId) -> Result<CaseView, SyncError> {
        self.shared.load(case_id).await
    }

    pub async fn case_view(&self, case_id: &CaseId) -> Result<CaseView, SyncError> {
        self.shared.ensure_loaded(case_id).await
    }

    pub async fn current_status(&self, case_id: &CaseId) -> Result<CaseStatus, SyncError> {
        Ok(self.shared.ensure_loaded(case_id).await?.case.status)
    }

    /// History as this client sees it, provisional entries included.
    pub async fn list_history(
        &self,
        case_id: &CaseId,
    ) -> Result<Vec<StatusHistoryEntry>, SyncError> {
        let view = self.shared.ensure_loaded(case_id).await?;
        Ok(view.history.into_iter().map(|i| i.entry).collect())
    }

    pub async fn list_amendments(&self, case_id: &CaseId) -> Result<Vec<AmendmentEntry>, SyncError> {
        Ok(self.shared.ensure_loaded(case_id).await?.amendments)
    }

    /// The pending reconciliation of `case_id`, if one is running.
    pub fn reconcile_status(&self, case_id: &CaseId) -> Option<ReconcileWatch> {
        self.shared.projection().watch_reconcile(case_id)
    }

    /// Latest-value stream of the case view.
    pub async fn watch_case(&self, case_id: &CaseId) -> Result<watch::Receiver<CaseView>, SyncError> {
        self.shared.ensure_loaded(case_id).await?;
        let rx = self.shared.projection().watch_updates(case_id);
        rx.ok_or_else(|| SyncError::NotFound {
            case_id: case_id.clone(),
        })
    }

    /// Call `callback` with the current view and after every change. Dropping
    /// the returned handle stops the callbacks; it never affects writes.
    pub async fn subscribe_to_case<F>(
        &self,
        case_id: &CaseId,
        callback: F,
    ) -> Result<CaseSubscription, SyncError>
    where
        F: Fn(&CaseView) + Send + 'static,
    {
        let rx = self.watch_case(case_id).await?;
        Ok(CaseSubscription::spawn(rx, callback))
    }

    pub async fn request_transition(
        &self,
        case_id: &CaseId,
        req: TransitionRequest,
    ) -> Result<TransitionReceipt, SyncError> {
        let shared = Arc::clone(&self.shared);
        let guard = shared.case_lock(case_id).lock_owned().await;
        let current = shared.ensure_loaded(case_id).await?;

        let pending = shared.projection().pending(case_id);
        if pending == Some(PendingKind::Transition) {
            return Err(SyncError::ChangePending {
                case_id: case_id.clone(),
            });
        }

        if let Some(seen) = req.expected_from {
            if seen != current.case.status {
                let reason =
                    shared.revalidate(&current.case, &req, seen, current.amendment_pending);
                info!(
                    case_id = %case_id,
                    seen = %seen,
                    now = %current.case.status,
                    "transition refused: requester saw a stale status"
                );
                return Err(SyncError::CaseChanged {
                    current: Box::new(current.case),
                    reason: Some(reason),
                });
            }
        }

        let outcome = shared
            .engine
            .request_transition(&current.case, &req, current.amendment_pending, Utc::now())
            .map_err(|e| {
                info!(
                    case_id = %case_id,
                    actor = %req.actor.id,
                    role = %req.actor.role,
                    code = e.code(),
                    "transition rejected: {e}"
                );
                e
            })?;

        let snap = shared.projection().apply_transition(&outcome.entry);
        let snap = snap.ok_or_else(|| SyncError::NotFound {
            case_id: case_id.clone(),
        })?;

        let task = tokio::spawn(Arc::clone(&shared).commit_transition(guard, req, outcome, snap));
        task.await.map_err(|e| {
            error!(case_id = %case_id, error = %e, "write-through task failed");
            SyncError::Store(StoreError::Backend(format!("write-through task failed: {e}")))
        })?
    }

    pub async fn request_amendment(
        &self,
        case_id: &CaseId,
        req: AmendmentRequest,
    ) -> Result<AmendmentReceipt, SyncError> {
        let shared = Arc::clone(&self.shared);
        let guard = shared.case_lock(case_id).lock_owned().await;
        let current = shared.ensure_loaded(case_id).await?;

        let pending = shared.projection().pending(case_id);
        if pending == Some(PendingKind::Transition) {
            return Err(SyncError::ChangePending {
                case_id: case_id.clone(),
            });
        }

        let plan = shared
            .engine
            .plan_amendment(&current.case, &req, current.amendment_pending, Utc::now())
            .map_err(|e| {
                info!(case_id = %case_id, actor = %req.actor.id, code = e.code(), "amendment rejected: {e}");
                e
            })?;

        let snap = shared
            .projection()
            .apply_amendment(case_id, &plan.fields_after);
        let snap = snap.ok_or_else(|| SyncError::NotFound {
            case_id: case_id.clone(),
        })?;

        let expected = current.case.status;
        let task = tokio::spawn(
            Arc::clone(&shared).commit_amendment(guard, expected, req, plan, snap),
        );
        task.await.map_err(|e| {
            error!(case_id = %case_id, error = %e, "write-through task failed");
            SyncError::Store(StoreError::Backend(format!("write-through task failed: {e}")))
        })?
    }
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

impl Shared {
    fn projection(&self) -> MutexGuard<'_, Projection> {
        self.projection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn case_lock(&self, case_id: &CaseId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.case_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(case_id.clone()).or_default())
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.settings.write_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn load(&self, case_id: &CaseId) -> Result<CaseView, SyncError> {
        let case = self
            .bounded(self.store.read_case(self.tenant.scope(case_id.clone())))
            .await?;
        self.tenant.guard_case(&case)?;
        let history = self
            .bounded(self.store.list_history(self.tenant.scope(case_id.clone())))
            .await?;
        let amendments = self
            .bounded(self.store.list_amendments(self.tenant.scope(case_id.clone())))
            .await?;

        let mut p = self.projection();
        p.load(case, history, amendments);
        p.view(case_id).ok_or_else(|| SyncError::NotFound {
            case_id: case_id.clone(),
        })
    }

    async fn ensure_loaded(&self, case_id: &CaseId) -> Result<CaseView, SyncError> {
        let cached = self.projection().view(case_id);
        match cached {
            Some(view) => Ok(view),
            None => self.load(case_id).await,
        }
    }

    async fn resync(&self) {
        let ids = self.projection().case_ids();
        for id in ids {
            if let Err(err) = self.load(&id).await {
                warn!(case_id = %id, error = %err, "resync read failed");
            }
        }
    }

    fn merge_event(&self, ev: CaseChangeEvent) {
        // Logged at error level by the guard.
        if self.tenant.guard_event(&ev).is_err() {
            return;
        }
        let mut p = self.projection();
        let applied = match ev.change {
            CaseChange::Created { .. } => false,
            CaseChange::StatusWritten { case, .. } => p.merge_case(&case),
            CaseChange::HistoryAppended { entry } => p.merge_history(entry),
            CaseChange::Amended { case, entry } => {
                let a = p.merge_case(&case);
                p.merge_amendment(entry) || a
            }
        };
        if applied {
            debug!(case_id = %ev.case_id, "merged change feed event");
        }
    }

    /// Why `req` does not apply to the case as it is now.
    fn revalidate(
        &self,
        current: &Case,
        req: &TransitionRequest,
        stale_from: CaseStatus,
        amendment_pending: bool,
    ) -> WorkflowError {
        match self
            .engine
            .request_transition(current, req, amendment_pending, Utc::now())
        {
            Err(e) => e,
            // The edge exists from the new status too, but the requester
            // asked for the edge out of a status the case has left.
            Ok(_) => WorkflowError::InvalidTransition {
                from: stale_from,
                to: req.to,
            },
        }
    }

    /// `at` is the server time of the status write.
    fn notify(&self, outcome: &TransitionOutcome, server: &Case, at: DateTime<Utc>) {
        let notice = TransitionNotice {
            case_id: server.case_id.clone(),
            country: server.country.clone(),
            old_status: outcome.from_status(),
            new_status: outcome.new_status(),
            actor: outcome.entry.actor.clone(),
            at,
        };
        // No subscriber is fine.
        let _ = self.notices.send(notice);
    }

    // -- transitions ---------------------------------------------------------

    async fn commit_transition(
        self: Arc<Self>,
        _guard: OwnedMutexGuard<()>,
        req: TransitionRequest,
        outcome: TransitionOutcome,
        snap: Snapshot,
    ) -> Result<TransitionReceipt, SyncError> {
        let case_id = outcome.case_id.clone();
        let entry_id = outcome.entry.entry_id;
        let write = StatusWrite {
            write_id: entry_id,
            case_id: case_id.clone(),
            expected: outcome.from_status(),
            to: outcome.new_status(),
        };

        match self
            .bounded(self.store.write_case_status(self.tenant.scope(write)))
            .await
        {
            Ok(server) => {
                let appended = self
                    .bounded(self.store.append_history(self.tenant.scope(outcome.entry.clone())))
                    .await;
                let (stored, ledger) = match appended {
                    Ok(a) => (Some(a.entry), LedgerState::Recorded),
                    Err(err) => {
                        warn!(
                            case_id = %case_id,
                            entry_id = %entry_id,
                            error = %err,
                            "status written but history append failed; scheduling one re-append"
                        );
                        Arc::clone(&self).spawn_deferred_append(outcome.entry.clone());
                        (None, LedgerState::Deferred)
                    }
                };

                self.projection()
                    .confirm_transition(&server, entry_id, stored.clone());
                self.notify(&outcome, &server, server.updated_at);
                info!(
                    case_id = %case_id,
                    from = %outcome.from_status(),
                    to = %outcome.new_status(),
                    actor = %outcome.entry.actor.id,
                    "transition committed"
                );

                Ok(TransitionReceipt {
                    case: server,
                    entry: stored.unwrap_or(outcome.entry),
                    ledger,
                })
            }

            Err(StoreError::Conflict { current }) => {
                let guarded = self.tenant.guard_case(&current);
                let amendment_pending = {
                    let mut p = self.projection();
                    p.rollback(&case_id, &snap, Some(entry_id));
                    if guarded.is_ok() {
                        p.merge_case(&current);
                    }
                    p.view(&case_id).map(|v| v.amendment_pending).unwrap_or(false)
                };
                guarded?;
                let reason =
                    self.revalidate(&current, &req, outcome.from_status(), amendment_pending);
                warn!(
                    case_id = %case_id,
                    requested = %outcome.new_status(),
                    now = %current.status,
                    "transition lost the race: {reason}"
                );
                Err(SyncError::CaseChanged {
                    current,
                    reason: Some(reason),
                })
            }

            Err(err) if err.is_outcome_unknown() => {
                let watch = {
                    let mut p = self.projection();
                    p.rollback(&case_id, &snap, Some(entry_id));
                    p.mark_pending(&case_id, PendingKind::Transition)
                };
                warn!(
                    case_id = %case_id,
                    to = %outcome.new_status(),
                    error = %err,
                    "write outcome unknown; rolled back and reconciling"
                );
                Arc::clone(&self).spawn_transition_reconcile(outcome);
                Err(SyncError::StoreUnavailable {
                    case_id,
                    cause: err,
                    reconcile: watch,
                })
            }

            Err(err) => {
                self.projection().rollback(&case_id, &snap, Some(entry_id));
                error!(case_id = %case_id, error = %err, "status write refused; rolled back");
                Err(err.into())
            }
        }
    }

    /// One re-append of an entry whose status write already landed.
    /// Deduplication suppresses it if the first append did land after all.
    fn spawn_deferred_append(self: Arc<Self>, entry: StatusHistoryEntry) {
        tokio::spawn(async move {
            tokio::time::sleep(self.settings.reconcile_delay).await;
            let res = self
                .bounded(self.store.append_history(self.tenant.scope(entry.clone())))
                .await;
            match res {
                Ok(a) => {
                    info!(
                        case_id = %entry.case_id,
                        entry_id = %entry.entry_id,
                        duplicate = a.outcome.is_duplicate(),
                        "deferred history entry recorded"
                    );
                    self.projection().merge_history(a.entry);
                }
                Err(err) => error!(
                    case_id = %entry.case_id,
                    entry_id = %entry.entry_id,
                    error = %err,
                    "history entry could not be recorded; ledger has a gap for this transition"
                ),
            }
        });
    }

    /// One reconciliation read: the case, plus the record of `write_id`
    /// when one is asked for.
    async fn read_once(
        &self,
        case_id: &CaseId,
        write_id: Option<Uuid>,
    ) -> Result<(Case, Option<LandedWrite>), StoreError> {
        let case = self
            .bounded(self.store.read_case(self.tenant.scope(case_id.clone())))
            .await?;
        let landed = match write_id {
            Some(write_id) => {
                let lookup = WriteLookup {
                    case_id: case_id.clone(),
                    write_id,
                };
                self.bounded(self.store.find_status_write(self.tenant.scope(lookup)))
                    .await?
            }
            None => None,
        };
        Ok((case, landed))
    }

    /// Read the case back after `reconcile_delay`, doubling the delay on
    /// failure, up to [`MAX_RECONCILE_ATTEMPTS`] reads.
    async fn read_back(
        &self,
        case_id: &CaseId,
        write_id: Option<Uuid>,
    ) -> Result<(Case, Option<LandedWrite>), String> {
        let mut delay = self.settings.reconcile_delay;
        let mut last = String::from("no attempt made");
        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            tokio::time::sleep(delay).await;
            match self.read_once(case_id, write_id).await {
                Ok((case, landed)) => match self.tenant.guard_case(&case) {
                    Ok(()) => return Ok((case, landed)),
                    Err(v) => return Err(v.to_string()),
                },
                Err(err) => {
                    warn!(case_id = %case_id, attempt, error = %err, "reconciliation read failed");
                    last = err.to_string();
                    delay = delay.saturating_mul(2);
                }
            }
        }
        Err(last)
    }

    fn spawn_transition_reconcile(self: Arc<Self>, outcome: TransitionOutcome) {
        tokio::spawn(async move {
            // Lock-free: writes on this case get ChangePending until it settles.
            let case_id = outcome.case_id.clone();

            let write_id = Some(outcome.entry.entry_id);
            let status = match self.read_back(&case_id, write_id).await {
                Ok((server, Some(landed))) => {
                    self.projection().merge_case(&server);
                    // The append never ran; if it somehow did, dedup suppresses it.
                    let appended = self
                        .bounded(
                            self.store
                                .append_history(self.tenant.scope(outcome.entry.clone())),
                        )
                        .await;
                    match appended {
                        Ok(a) => {
                            self.projection().merge_history(a.entry);
                        }
                        Err(err) => {
                            warn!(case_id = %case_id, error = %err, "confirmed write but history append failed");
                            Arc::clone(&self).spawn_deferred_append(outcome.entry.clone());
                        }
                    }
                    self.notify(&outcome, &server, landed.at);
                    info!(
                        case_id = %case_id,
                        landed = %landed.to,
                        now = %server.status,
                        "unknown outcome confirmed: write had landed"
                    );
                    ReconcileStatus::Confirmed {
                        case: Box::new(server),
                    }
                }
                Ok((server, None)) => {
                    self.projection().merge_case(&server);
                    info!(case_id = %case_id, status = %server.status, "unknown outcome corrected: write had not landed");
                    ReconcileStatus::Corrected {
                        case: Box::new(server),
                    }
                }
                Err(reason) => {
                    error!(case_id = %case_id, reason = %reason, "reconciliation gave up");
                    ReconcileStatus::Failed { reason }
                }
            };

            self.projection().settle(&case_id, status);
        });
    }

    // -- amendments ----------------------------------------------------------

    async fn commit_amendment(
        self: Arc<Self>,
        _guard: OwnedMutexGuard<()>,
        expected: CaseStatus,
        req: AmendmentRequest,
        plan: AmendmentPlan,
        snap: Snapshot,
    ) -> Result<AmendmentReceipt, SyncError> {
        let case_id = plan.entry.case_id.clone();
        let write = AmendmentWrite {
            case_id: case_id.clone(),
            expected,
            fields_after: plan.fields_after.clone(),
            entry: plan.entry.clone(),
        };

        match self
            .bounded(self.store.amend_case(self.tenant.scope(write)))
            .await
        {
            Ok((server, entry)) => {
                self.projection().confirm_amendment(&server, entry.clone());
                info!(
                    case_id = %case_id,
                    changes = entry.changes.len(),
                    actor = %entry.actor.id,
                    "amendment committed"
                );
                Ok(AmendmentReceipt {
                    case: server,
                    entry,
                })
            }

            Err(StoreError::Conflict { current }) => {
                let guarded = self.tenant.guard_case(&current);
                {
                    let mut p = self.projection();
                    p.rollback(&case_id, &snap, None);
                    p.abandon_amendment(&case_id);
                    if guarded.is_ok() {
                        p.merge_case(&current);
                    }
                }
                guarded?;
                let reason = self
                    .engine
                    .plan_amendment(&current, &req, false, Utc::now())
                    .err();
                warn!(case_id = %case_id, now = %current.status, "amendment lost the race");
                Err(SyncError::CaseChanged { current, reason })
            }

            Err(err) if err.is_outcome_unknown() => {
                let watch = {
                    let mut p = self.projection();
                    p.rollback(&case_id, &snap, None);
                    p.mark_pending(&case_id, PendingKind::Amendment)
                };
                warn!(case_id = %case_id, error = %err, "amendment outcome unknown; rolled back and reconciling");
                Arc::clone(&self).spawn_amendment_reconcile(plan.entry);
                Err(SyncError::StoreUnavailable {
                    case_id,
                    cause: err,
                    reconcile: watch,
                })
            }

            Err(err) => {
                {
                    let mut p = self.projection();
                    p.rollback(&case_id, &snap, None);
                    p.abandon_amendment(&case_id);
                }
                error!(case_id = %case_id, error = %err, "amendment refused; rolled back");
                Err(err.into())
            }
        }
    }

    fn spawn_amendment_reconcile(self: Arc<Self>, entry: AmendmentEntry) {
        tokio::spawn(async move {
            let case_id = entry.case_id.clone();

            let status = match self.read_back(&case_id, None).await {
                Ok((server, _)) => {
                    let listed = self
                        .bounded(self.store.list_amendments(self.tenant.scope(case_id.clone())))
                        .await;
                    let stored = listed
                        .ok()
                        .and_then(|l| l.into_iter().find(|a| a.amendment_id == entry.amendment_id));
                    let mut p = self.projection();
                    p.merge_case(&server);
                    match stored {
                        Some(a) => {
                            p.merge_amendment(a);
                            info!(case_id = %case_id, "unknown amendment outcome confirmed");
                            ReconcileStatus::Confirmed {
                                case: Box::new(server),
                            }
                        }
                        None => {
                            info!(case_id = %case_id, "unknown amendment outcome corrected");
                            ReconcileStatus::Corrected {
                                case: Box::new(server),
                            }
                        }
                    }
                }
                Err(reason) => {
                    error!(case_id = %case_id, reason = %reason, "amendment reconciliation gave up");
                    ReconcileStatus::Failed { reason }
                }
            };

            self.projection().settle(&case_id, status);
        });
    }
}
