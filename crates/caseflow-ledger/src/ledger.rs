//! In-memory history ledger.
//!
//! # Invariants
//!
//! - **Append-only**: there is no update or delete; corrections are new entries.
//! - **Retry dedup**: an entry is suppressed when the same case already has an
//!   entry with the same status and `|Δt| < window`, or when the same
//!   `entry_id` was already ingested. Suppression is an outcome, not an error.
//! - **Stable order**: `list` is ascending by `(timestamp, seq)`; `seq` is
//!   assigned at ingest and never changes, so ties never re-order.

use std::collections::HashMap;

use caseflow_schemas::{AmendmentEntry, CaseId, CaseStatus, StatusHistoryEntry};
use chrono::Duration;
use uuid::Uuid;

/// Default de-duplication window.
pub const DEFAULT_DEDUPE_WINDOW_MS: i64 = 5_000;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored with this ingest sequence number.
    Appended { seq: u64 },
    /// An equivalent entry already exists; nothing was stored.
    DuplicateSuppressed { existing_id: Uuid, existing_seq: u64 },
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        !self.is_appended()
    }
}

/// A stored status entry plus its ingest sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub seq: u64,
    pub entry: StatusHistoryEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmendmentRow {
    pub seq: u64,
    pub entry: AmendmentEntry,
}

/// Per-case append-only status and amendment history.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    window: Duration,
    next_seq: u64,
    status: HashMap<CaseId, Vec<LedgerRow>>,
    amendments: HashMap<CaseId, Vec<AmendmentRow>>,
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::with_window(Duration::milliseconds(DEFAULT_DEDUPE_WINDOW_MS))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            next_seq: 0,
            status: HashMap::new(),
            amendments: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Next sequence number to be assigned (equals the number of rows ingested).
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append unless an equivalent entry is already present.
    pub fn append(&mut self, entry: StatusHistoryEntry) -> AppendOutcome {
        let rows = self.status.entry(entry.case_id.clone()).or_default();

        if let Some(existing) = find_duplicate(rows, &entry, self.window) {
            return AppendOutcome::DuplicateSuppressed {
                existing_id: existing.entry.entry_id,
                existing_seq: existing.seq,
            };
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        // Insert after every row with timestamp <= ours: equal timestamps keep
        // ingest order because earlier rows carry smaller seqs.
        let at = rows.partition_point(|r| r.entry.timestamp <= entry.timestamp);
        rows.insert(at, LedgerRow { seq, entry });

        AppendOutcome::Appended { seq }
    }

    /// Entries for `case_id`, ascending by timestamp then ingest sequence.
    pub fn list(&self, case_id: &CaseId) -> Vec<StatusHistoryEntry> {
        self.rows(case_id).iter().map(|r| r.entry.clone()).collect()
    }

    pub fn rows(&self, case_id: &CaseId) -> &[LedgerRow] {
        self.status.get(case_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, case_id: &CaseId) -> usize {
        self.rows(case_id).len()
    }

    pub fn is_empty(&self, case_id: &CaseId) -> bool {
        self.rows(case_id).is_empty()
    }

    /// Status of the newest entry, if any.
    pub fn last_status(&self, case_id: &CaseId) -> Option<CaseStatus> {
        self.rows(case_id).last().map(|r| r.entry.status)
    }

    /// Amendments are never window-deduplicated; only a repeated `amendment_id` is suppressed.
    pub fn append_amendment(&mut self, entry: AmendmentEntry) -> AppendOutcome {
        let rows = self.amendments.entry(entry.case_id.clone()).or_default();

        if let Some(existing) = rows
            .iter()
            .find(|r| r.entry.amendment_id == entry.amendment_id)
        {
            return AppendOutcome::DuplicateSuppressed {
                existing_id: existing.entry.amendment_id,
                existing_seq: existing.seq,
            };
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let at = rows.partition_point(|r| r.entry.timestamp <= entry.timestamp);
        rows.insert(at, AmendmentRow { seq, entry });

        AppendOutcome::Appended { seq }
    }

    pub fn amendments(&self, case_id: &CaseId) -> Vec<AmendmentEntry> {
        self.amendments
            .get(case_id)
            .map(|rows| rows.iter().map(|r| r.entry.clone()).collect())
            .unwrap_or_default()
    }
}

/// Dedup predicate shared with the Postgres store's SQL (`abs(Δt) < window`).
pub fn is_duplicate_of(
    existing: &StatusHistoryEntry,
    candidate: &StatusHistoryEntry,
    window: Duration,
) -> bool {
    if existing.entry_id == candidate.entry_id {
        return true;
    }
    existing.case_id == candidate.case_id
        && existing.status == candidate.status
        && (existing.timestamp - candidate.timestamp).abs() < window
}

fn find_duplicate<'a>(
    rows: &'a [LedgerRow],
    candidate: &StatusHistoryEntry,
    window: Duration,
) -> Option<&'a LedgerRow> {
    rows.iter()
        .find(|r| is_duplicate_of(&r.entry, candidate, window))
}
