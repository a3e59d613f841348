//! Local projection of the tenant's cases.
//!
//! # Invariants
//!
//! - **Single writer**: only the coordinator holds a `Projection`; every
//!   mutation goes through the methods below.
//! - **Server wins**: a case row is replaced only by a row whose `updated_at`
//!   is strictly newer than the newest one already merged. Equal rows are
//!   skipped, so change-feed echoes of our own writes are no-ops.
//! - **Fixed country**: a row whose country differs from the slot's is
//!   never merged.
//! - **Exact rollback**: if no server data was merged into a slot since its
//!   snapshot was taken, rollback restores the snapshot as it was (status,
//!   fields and history). Otherwise only the provisional parts of the failed
//!   request are removed and server-merged data is kept.
//! - **History is a set**: confirmed entries are keyed by `entry_id`, ordered
//!   by server timestamp then arrival; provisional entries sort last.

use std::collections::HashMap;

use caseflow_schemas::{AmendmentEntry, BusinessFields, Case, CaseId, StatusHistoryEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::reconcile::{ReconcileStatus, ReconcileWatch};

/// A history entry as the client currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryItem {
    #[serde(flatten)]
    pub entry: StatusHistoryEntry,
    /// Applied locally, not yet confirmed by the store.
    pub provisional: bool,
}

/// Everything a UI needs to render one case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseView {
    pub case: Case,
    pub history: Vec<HistoryItem>,
    pub amendments: Vec<AmendmentEntry>,
    /// An amendment is in flight or its outcome is being reconciled.
    pub amendment_pending: bool,
    /// A write's outcome is unknown and a background read is settling it.
    pub reconcile_pending: bool,
}

/// Why a slot is waiting on a background read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Transition,
    Amendment,
}

/// State captured before an optimistic apply.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    case: Case,
    history: Vec<HistoryItem>,
    generation: u64,
    server_ts: DateTime<Utc>,
}

struct CaseSlot {
    view: CaseView,
    /// Newest `updated_at` merged from the store.
    server_ts: DateTime<Utc>,
    /// Bumped on every merge of server data.
    generation: u64,
    pending: Option<(PendingKind, watch::Sender<ReconcileStatus>)>,
    updates: watch::Sender<CaseView>,
}

impl CaseSlot {
    fn publish(&self) {
        self.updates.send_replace(self.view.clone());
    }

    fn sort_history(&mut self) {
        // Stable: ties keep arrival order.
        self.view
            .history
            .sort_by_key(|i| (i.provisional, i.entry.timestamp));
    }

    fn upsert_confirmed(&mut self, entry: StatusHistoryEntry) -> bool {
        if let Some(existing) = self
            .view
            .history
            .iter_mut()
            .find(|i| i.entry.entry_id == entry.entry_id)
        {
            if !existing.provisional && existing.entry == entry {
                return false;
            }
            existing.entry = entry;
            existing.provisional = false;
        } else {
            self.view.history.push(HistoryItem {
                entry,
                provisional: false,
            });
        }
        self.sort_history();
        true
    }

    fn merge_case(&mut self, server: &Case) -> bool {
        if server.updated_at <= self.server_ts {
            return false;
        }
        // A case never changes country.
        if server.country != self.view.case.country {
            tracing::error!(
                case_id = %server.case_id,
                expected = %self.view.case.country,
                found = %server.country,
                "refusing to merge a row from another country"
            );
            return false;
        }
        self.view.case = server.clone();
        self.server_ts = server.updated_at;
        true
    }
}

#[derive(Default)]
pub(crate) struct Projection {
    slots: HashMap<CaseId, CaseSlot>,
}

impl Projection {
    pub(crate) fn case_ids(&self) -> Vec<CaseId> {
        self.slots.keys().cloned().collect()
    }

    pub(crate) fn view(&self, case_id: &CaseId) -> Option<CaseView> {
        self.slots.get(case_id).map(|s| s.view.clone())
    }

    pub(crate) fn pending(&self, case_id: &CaseId) -> Option<PendingKind> {
        self.slots
            .get(case_id)
            .and_then(|s| s.pending.as_ref().map(|(k, _)| *k))
    }

    pub(crate) fn watch_updates(&self, case_id: &CaseId) -> Option<watch::Receiver<CaseView>> {
        self.slots.get(case_id).map(|s| s.updates.subscribe())
    }

    pub(crate) fn watch_reconcile(&self, case_id: &CaseId) -> Option<ReconcileWatch> {
        self.slots
            .get(case_id)
            .and_then(|s| s.pending.as_ref())
            .map(|(_, tx)| ReconcileWatch::new(tx.subscribe()))
    }

    /// Install or refresh a slot from a full store read. Provisional history
    /// and pending markers survive the refresh.
    pub(crate) fn load(
        &mut self,
        case: Case,
        history: Vec<StatusHistoryEntry>,
        amendments: Vec<AmendmentEntry>,
    ) {
        match self.slots.get_mut(&case.case_id) {
            Some(slot) => {
                let mut changed = slot.merge_case(&case);
                for e in history {
                    changed |= slot.upsert_confirmed(e);
                }
                for a in amendments {
                    if !slot
                        .view
                        .amendments
                        .iter()
                        .any(|x| x.amendment_id == a.amendment_id)
                    {
                        slot.view.amendments.push(a);
                        changed = true;
                    }
                }
                if changed {
                    slot.view.amendments.sort_by_key(|a| a.timestamp);
                    slot.generation += 1;
                    slot.publish();
                }
            }
            None => {
                let view = CaseView {
                    case: case.clone(),
                    history: history
                        .into_iter()
                        .map(|entry| HistoryItem {
                            entry,
                            provisional: false,
                        })
                        .collect(),
                    amendments,
                    amendment_pending: false,
                    reconcile_pending: false,
                };
                let (updates, _rx) = watch::channel(view.clone());
                let mut slot = CaseSlot {
                    view,
                    server_ts: case.updated_at,
                    generation: 0,
                    pending: None,
                    updates,
                };
                slot.sort_history();
                self.slots.insert(case.case_id.clone(), slot);
            }
        }
    }

    // -- change feed -------------------------------------------------------

    /// Last-writer-wins merge of a server row. Unknown cases are ignored.
    pub(crate) fn merge_case(&mut self, server: &Case) -> bool {
        let Some(slot) = self.slots.get_mut(&server.case_id) else {
            return false;
        };
        if !slot.merge_case(server) {
            return false;
        }
        slot.generation += 1;
        slot.publish();
        true
    }

    pub(crate) fn merge_history(&mut self, entry: StatusHistoryEntry) -> bool {
        let Some(slot) = self.slots.get_mut(&entry.case_id) else {
            return false;
        };
        if !slot.upsert_confirmed(entry) {
            return false;
        }
        slot.generation += 1;
        slot.publish();
        true
    }

    pub(crate) fn merge_amendment(&mut self, entry: AmendmentEntry) -> bool {
        let Some(slot) = self.slots.get_mut(&entry.case_id) else {
            return false;
        };
        if slot
            .view
            .amendments
            .iter()
            .any(|a| a.amendment_id == entry.amendment_id)
        {
            return false;
        }
        slot.view.amendments.push(entry);
        slot.view.amendments.sort_by_key(|a| a.timestamp);
        slot.generation += 1;
        slot.publish();
        true
    }

    // -- optimistic apply / rollback ---------------------------------------

    fn snapshot(slot: &CaseSlot) -> Snapshot {
        Snapshot {
            case: slot.view.case.clone(),
            history: slot.view.history.clone(),
            generation: slot.generation,
            server_ts: slot.server_ts,
        }
    }

    pub(crate) fn apply_transition(
        &mut self,
        provisional: &StatusHistoryEntry,
    ) -> Option<Snapshot> {
        let slot = self.slots.get_mut(&provisional.case_id)?;
        let snap = Self::snapshot(slot);
        slot.view.case.status = provisional.status;
        slot.view.history.push(HistoryItem {
            entry: provisional.clone(),
            provisional: true,
        });
        slot.publish();
        Some(snap)
    }

    pub(crate) fn apply_amendment(
        &mut self,
        case_id: &CaseId,
        fields_after: &BusinessFields,
    ) -> Option<Snapshot> {
        let slot = self.slots.get_mut(case_id)?;
        let snap = Self::snapshot(slot);
        slot.view.case.fields = fields_after.clone();
        slot.view.amendment_pending = true;
        slot.publish();
        Some(snap)
    }

    /// Undo an optimistic apply. `entry_id` names the provisional history
    /// entry to drop when an exact restore is not possible.
    pub(crate) fn rollback(&mut self, case_id: &CaseId, snap: &Snapshot, entry_id: Option<Uuid>) {
        let Some(slot) = self.slots.get_mut(case_id) else {
            return;
        };
        if slot.generation == snap.generation {
            slot.view.case = snap.case.clone();
            slot.view.history = snap.history.clone();
        } else {
            if slot.server_ts == snap.server_ts {
                slot.view.case = snap.case.clone();
            }
            if let Some(id) = entry_id {
                slot.view
                    .history
                    .retain(|i| !(i.provisional && i.entry.entry_id == id));
            }
        }
        slot.publish();
    }

    /// The status write landed. Replace the provisional entry with the stored
    /// one, or drop it when the ledger append did not happen.
    pub(crate) fn confirm_transition(
        &mut self,
        server: &Case,
        provisional_id: Uuid,
        stored: Option<StatusHistoryEntry>,
    ) {
        let Some(slot) = self.slots.get_mut(&server.case_id) else {
            return;
        };
        slot.merge_case(server);
        match stored {
            Some(entry) => {
                slot.view
                    .history
                    .retain(|i| !(i.provisional && i.entry.entry_id == provisional_id));
                slot.upsert_confirmed(entry);
            }
            None => slot
                .view
                .history
                .retain(|i| !(i.provisional && i.entry.entry_id == provisional_id)),
        }
        slot.generation += 1;
        slot.publish();
    }

    pub(crate) fn confirm_amendment(&mut self, server: &Case, entry: AmendmentEntry) {
        let Some(slot) = self.slots.get_mut(&server.case_id) else {
            return;
        };
        slot.merge_case(server);
        if !slot
            .view
            .amendments
            .iter()
            .any(|a| a.amendment_id == entry.amendment_id)
        {
            slot.view.amendments.push(entry);
            slot.view.amendments.sort_by_key(|a| a.timestamp);
        }
        slot.view.amendment_pending = false;
        slot.generation += 1;
        slot.publish();
    }

    /// An amendment failed with a known outcome.
    pub(crate) fn abandon_amendment(&mut self, case_id: &CaseId) {
        if let Some(slot) = self.slots.get_mut(case_id) {
            slot.view.amendment_pending = false;
            slot.publish();
        }
    }

    // -- reconciliation ------------------------------------------------------

    pub(crate) fn mark_pending(&mut self, case_id: &CaseId, kind: PendingKind) -> ReconcileWatch {
        let (tx, rx) = watch::channel(ReconcileStatus::Pending);
        if let Some(slot) = self.slots.get_mut(case_id) {
            slot.view.reconcile_pending = true;
            if kind == PendingKind::Amendment {
                slot.view.amendment_pending = true;
            }
            slot.pending = Some((kind, tx));
            slot.publish();
        }
        ReconcileWatch::new(rx)
    }

    pub(crate) fn settle(&mut self, case_id: &CaseId, status: ReconcileStatus) {
        let Some(slot) = self.slots.get_mut(case_id) else {
            return;
        };
        if let Some((kind, tx)) = slot.pending.take() {
            if kind == PendingKind::Amendment {
                slot.view.amendment_pending = false;
            }
            tx.send_replace(status);
        }
        slot.view.reconcile_pending = false;
        slot.publish();
    }
}
