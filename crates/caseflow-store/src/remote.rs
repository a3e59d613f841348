//! Remote store interface.
//!
//! Every method takes a [`Scoped`] query, so a call without a country
//! predicate does not type-check. Writes are conditional on the status the
//! caller last saw; the store, not the caller, stamps timestamps.

use async_trait::async_trait;
use caseflow_isolation::{Scoped, TenantScope};
use caseflow_ledger::AppendOutcome;
use caseflow_schemas::{
    AmendmentEntry, BusinessFields, Case, CaseChangeEvent, CaseId, CaseStatus, NewCase,
    StatusHistoryEntry,
};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;

/// Conditional status write: applies only if the stored status is still `expected`.
///
/// `write_id` is recorded with the write when it applies. The coordinator
/// uses the id of the history entry it will append, so the record answers
/// "did this request land?" after later writes have moved the case on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub write_id: Uuid,
    pub case_id: CaseId,
    pub expected: CaseStatus,
    pub to: CaseStatus,
}

/// Lookup of one status write by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLookup {
    pub case_id: CaseId,
    pub write_id: Uuid,
}

/// A status write the store applied. Kept for the life of the case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandedWrite {
    pub write_id: Uuid,
    pub case_id: CaseId,
    pub from: CaseStatus,
    pub to: CaseStatus,
    /// Server time of the write; the `updated_at` it stamped.
    pub at: DateTime<Utc>,
}

/// Conditional amendment: replaces the field map and records `entry`, only if
/// the stored status is still `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct AmendmentWrite {
    pub case_id: CaseId,
    pub expected: CaseStatus,
    pub fields_after: BusinessFields,
    pub entry: AmendmentEntry,
}

/// Result of a history append: the entry as stored (server timestamp), or the
/// already-stored entry that suppressed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryAppend {
    pub outcome: AppendOutcome,
    pub entry: StatusHistoryEntry,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a case at the initial status. Does not write history.
    async fn create_case(&self, q: Scoped<NewCase>) -> Result<Case, StoreError>;

    async fn read_case(&self, q: Scoped<CaseId>) -> Result<Case, StoreError>;

    /// Every case of the scoped tenant.
    async fn list_cases(&self, q: Scoped<()>) -> Result<Vec<Case>, StoreError>;

    /// `Err(Conflict { current })` when the stored status is not `expected`.
    async fn write_case_status(&self, q: Scoped<StatusWrite>) -> Result<Case, StoreError>;

    /// The applied write with this id, or `None` if it never applied.
    async fn find_status_write(
        &self,
        q: Scoped<WriteLookup>,
    ) -> Result<Option<LandedWrite>, StoreError>;

    /// Append-only; duplicates are suppressed, not rejected. An entry whose
    /// `entry_id` names an applied status write is stamped with that write's
    /// server time, otherwise with the time of the append.
    async fn append_history(
        &self,
        q: Scoped<StatusHistoryEntry>,
    ) -> Result<HistoryAppend, StoreError>;

    /// Ascending by (timestamp, ingest order).
    async fn list_history(&self, q: Scoped<CaseId>) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn amend_case(
        &self,
        q: Scoped<AmendmentWrite>,
    ) -> Result<(Case, AmendmentEntry), StoreError>;

    async fn list_amendments(&self, q: Scoped<CaseId>) -> Result<Vec<AmendmentEntry>, StoreError>;

    /// Push feed of every mutation in `tenant`, starting now.
    fn subscribe(&self, tenant: &TenantScope) -> ChangeFeed;
}

// ---------------------------------------------------------------------------
// ChangeFeed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(CaseChangeEvent),
    /// The subscriber fell behind and `missed` events were dropped (0 when
    /// the store cannot count them); local state must be re-read.
    Lagged { missed: u64 },
}

/// Tenant-filtered view of a store's change broadcast.
///
/// Events whose envelope names another tenant are skipped here; the consumer
/// still guards the embedded row. Gaps the store itself detects (a dropped
/// notification connection) arrive as [`FeedItem::Lagged`].
#[derive(Debug)]
pub struct ChangeFeed {
    tenant: TenantScope,
    rx: broadcast::Receiver<FeedItem>,
}

impl ChangeFeed {
    pub fn new(tenant: TenantScope, rx: broadcast::Receiver<FeedItem>) -> Self {
        Self { tenant, rx }
    }

    pub fn tenant(&self) -> &TenantScope {
        &self.tenant
    }

    /// Next item for this tenant; `None` once the store side is gone.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(FeedItem::Event(ev)) if ev.country == *self.tenant.country() => {
                    return Some(FeedItem::Event(ev));
                }
                Ok(FeedItem::Event(_)) => continue,
                Ok(gap @ FeedItem::Lagged { .. }) => return Some(gap),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        country = %self.tenant.country(),
                        missed,
                        "change feed lagged"
                    );
                    return Some(FeedItem::Lagged { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
