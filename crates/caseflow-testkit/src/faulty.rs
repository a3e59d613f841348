//! A [`RemoteStore`] wrapper that misbehaves on request.
//!
//! Faults are armed per operation. A queued fault fires on the next call
//! only; a sticky fault fires on every call until cleared. A [`Hold`] parks
//! calls of one operation until it is released, which lets a scenario line
//! up concurrent writers at the store.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use caseflow_isolation::{Scoped, TenantScope};
use caseflow_schemas::{AmendmentEntry, Case, CaseId, NewCase, StatusHistoryEntry};
use caseflow_store::{
    AmendmentWrite, ChangeFeed, HistoryAppend, LandedWrite, RemoteStore, StatusWrite, StoreError,
    WriteLookup,
};
use tokio::sync::{watch, Notify};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateCase,
    ReadCase,
    ListCases,
    WriteStatus,
    FindWrite,
    AppendHistory,
    ListHistory,
    Amend,
    ListAmendments,
}

#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without reaching the wrapped store.
    Fail(StoreError),
    /// Never answer; the caller's own timeout decides.
    Hang,
    /// Apply on the wrapped store, then report a timeout: the write landed
    /// but the caller cannot know.
    LoseResponse,
}

#[derive(Clone)]
struct Gate {
    open: watch::Receiver<bool>,
    arrived: Arc<Notify>,
}

impl Gate {
    async fn pass(mut self) {
        self.arrived.notify_one();
        while !*self.open.borrow_and_update() {
            // Sender dropped means the hold was released.
            if self.open.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Parks calls of one operation until released or dropped.
pub struct Hold {
    open: watch::Sender<bool>,
    arrived: Arc<Notify>,
}

impl Hold {
    /// Resolves once a call has reached the hold.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.open.send_replace(true);
    }
}

#[derive(Default)]
struct FaultState {
    queued: HashMap<StoreOp, VecDeque<Fault>>,
    sticky: HashMap<StoreOp, Fault>,
    gates: HashMap<StoreOp, Gate>,
    calls: HashMap<StoreOp, usize>,
    forged_reads: VecDeque<Case>,
}

pub struct FaultyStore {
    inner: Arc<dyn RemoteStore>,
    state: Mutex<FaultState>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn RemoteStore>) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn RemoteStore> {
        &self.inner
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm `fault` for the next call of `op`. Several calls queue in order.
    pub fn inject(&self, op: StoreOp, fault: Fault) {
        self.state().queued.entry(op).or_default().push_back(fault);
    }

    /// Arm `fault` for every call of `op` until [`FaultyStore::clear`].
    pub fn fail_always(&self, op: StoreOp, fault: Fault) {
        self.state().sticky.insert(op, fault);
    }

    pub fn clear(&self, op: StoreOp) {
        let mut s = self.state();
        s.queued.remove(&op);
        s.sticky.remove(&op);
        s.gates.remove(&op);
    }

    /// Park every call of `op` until the returned handle is released.
    pub fn hold(&self, op: StoreOp) -> Hold {
        let (open, rx) = watch::channel(false);
        let arrived = Arc::new(Notify::new());
        self.state().gates.insert(
            op,
            Gate {
                open: rx,
                arrived: Arc::clone(&arrived),
            },
        );
        Hold { open, arrived }
    }

    /// The next `read_case` answers with `case` instead of asking the
    /// wrapped store.
    pub fn forge_read(&self, case: Case) {
        self.state().forged_reads.push_back(case);
    }

    /// Calls of `op` seen so far, faulted ones included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn arm(&self, op: StoreOp) -> (Option<Fault>, Option<Gate>) {
        let mut s = self.state();
        *s.calls.entry(op).or_default() += 1;
        let fault = s
            .queued
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
            .or_else(|| s.sticky.get(&op).cloned());
        (fault, s.gates.get(&op).cloned())
    }

    async fn run<T>(
        &self,
        op: StoreOp,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let (fault, gate) = self.arm(op);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match fault {
            None => call.await,
            Some(Fault::Fail(err)) => {
                debug!(?op, error = %err, "injected failure");
                Err(err)
            }
            Some(Fault::Hang) => {
                debug!(?op, "injected hang");
                std::future::pending::<Result<T, StoreError>>().await
            }
            Some(Fault::LoseResponse) => {
                let applied = call.await;
                debug!(?op, applied = applied.is_ok(), "injected lost response");
                Err(StoreError::Timeout)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for FaultyStore {
    async fn create_case(&self, q: Scoped<NewCase>) -> Result<Case, StoreError> {
        self.run(StoreOp::CreateCase, self.inner.create_case(q)).await
    }

    async fn read_case(&self, q: Scoped<CaseId>) -> Result<Case, StoreError> {
        let forged = self.state().forged_reads.pop_front();
        if let Some(case) = forged {
            debug!(case_id = %case.case_id, country = %case.country, "forged read");
            return Ok(case);
        }
        self.run(StoreOp::ReadCase, self.inner.read_case(q)).await
    }

    async fn list_cases(&self, q: Scoped<()>) -> Result<Vec<Case>, StoreError> {
        self.run(StoreOp::ListCases, self.inner.list_cases(q)).await
    }

    async fn write_case_status(&self, q: Scoped<StatusWrite>) -> Result<Case, StoreError> {
        self.run(StoreOp::WriteStatus, self.inner.write_case_status(q))
            .await
    }

    async fn find_status_write(
        &self,
        q: Scoped<WriteLookup>,
    ) -> Result<Option<LandedWrite>, StoreError> {
        self.run(StoreOp::FindWrite, self.inner.find_status_write(q))
            .await
    }

    async fn append_history(
        &self,
        q: Scoped<StatusHistoryEntry>,
    ) -> Result<HistoryAppend, StoreError> {
        self.run(StoreOp::AppendHistory, self.inner.append_history(q))
            .await
    }

    async fn list_history(&self, q: Scoped<CaseId>) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        self.run(StoreOp::ListHistory, self.inner.list_history(q)).await
    }

    async fn amend_case(
        &self,
        q: Scoped<AmendmentWrite>,
    ) -> Result<(Case, AmendmentEntry), StoreError> {
        self.run(StoreOp::Amend, self.inner.amend_case(q)).await
    }

    async fn list_amendments(&self, q: Scoped<CaseId>) -> Result<Vec<AmendmentEntry>, StoreError> {
        self.run(StoreOp::ListAmendments, self.inner.list_amendments(q))
            .await
    }

    fn subscribe(&self, tenant: &TenantScope) -> ChangeFeed {
        self.inner.subscribe(tenant)
    }
}
