//! In-process authoritative store.
//!
//! # Invariants
//!
//! - Every write is conditional and applied under one lock, so concurrent
//!   conditional writes on the same case linearize: exactly one wins.
//! - Server timestamps strictly increase across the whole store, so
//!   last-writer-wins on `updated_at` is total.
//! - Each tenant's rows live in their own slot of a [`TenantMap`]; a query
//!   can only reach the slot of its own scope.
//! - Every accepted mutation is published on the change feed after the lock
//!   is released.
//! - Every applied status write is remembered by `write_id`, so whether a
//!   write landed stays answerable after later writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use caseflow_isolation::{Scoped, TenantMap, TenantScope};
use caseflow_ledger::{AppendOutcome, HistoryLedger, LedgerJournal, DEFAULT_DEDUPE_WINDOW_MS};
use caseflow_schemas::{
    AmendmentEntry, Case, CaseChange, CaseChangeEvent, CaseId, CaseStatus, NewCase,
    StatusHistoryEntry,
};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::remote::{
    AmendmentWrite, ChangeFeed, FeedItem, HistoryAppend, LandedWrite, RemoteStore, StatusWrite,
    WriteLookup,
};

const FEED_CAPACITY: usize = 1024;

struct TenantData {
    cases: BTreeMap<CaseId, Case>,
    ledger: HistoryLedger,
    writes: HashMap<Uuid, LandedWrite>,
}

struct Inner {
    tenants: TenantMap<TenantData>,
    journal: Option<LedgerJournal>,
    last_stamp: Option<DateTime<Utc>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<FeedItem>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(
            Arc::new(SystemClock),
            Duration::milliseconds(DEFAULT_DEDUPE_WINDOW_MS),
        )
    }

    pub fn with_clock(clock: Arc<dyn Clock>, window: Duration) -> Self {
        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                tenants: TenantMap::new(),
                journal: None,
                last_stamp: None,
            }),
            feed,
            clock,
            window,
        }
    }

    /// Mirror every accepted history/amendment entry to `journal`.
    pub fn with_journal(self, journal: LedgerJournal) -> Self {
        if let Ok(mut g) = self.inner.lock() {
            g.journal = Some(journal);
        }
        self
    }

    /// Publish an event on the feed as-is, bypassing every write path.
    /// Fault-injection harnesses use it to forge feed traffic.
    pub fn publish(&self, ev: CaseChangeEvent) {
        // No receivers is fine.
        let _ = self.feed.send(FeedItem::Event(ev));
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn emit(&self, ev: CaseChangeEvent) {
        let _ = self.feed.send(FeedItem::Event(ev));
    }
}

impl Inner {
    fn stamp(&mut self, clock: &dyn Clock) -> DateTime<Utc> {
        let mut now = clock.now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn tenant(&mut self, scope: &TenantScope, window: Duration) -> &mut TenantData {
        self.tenants.get_or_insert_with(scope, || TenantData {
            cases: BTreeMap::new(),
            ledger: HistoryLedger::with_window(window),
            writes: HashMap::new(),
        })
    }

    fn case_mut<'a>(
        data: &'a mut TenantData,
        case_id: &CaseId,
    ) -> Result<&'a mut Case, StoreError> {
        data.cases.get_mut(case_id).ok_or_else(|| StoreError::NotFound {
            case_id: case_id.clone(),
        })
    }

    fn mirror_status(&mut self, case: &Case, entry: &StatusHistoryEntry) {
        if let Some(j) = self.journal.as_mut() {
            if let Err(err) = j.append_status(&case.country, entry) {
                tracing::error!(case_id = %entry.case_id, error = %err, "journal append failed");
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_case(&self, q: Scoped<NewCase>) -> Result<Case, StoreError> {
        let scope = q.tenant();
        let (country, new) = q.into_parts();

        let case = {
            let mut g = self.lock()?;
            let now = g.stamp(self.clock.as_ref());
            let data = g.tenant(&scope, self.window);
            if data.cases.contains_key(&new.case_id) {
                return Err(StoreError::AlreadyExists {
                    case_id: new.case_id,
                });
            }
            let case = Case {
                case_id: new.case_id.clone(),
                country: country.clone(),
                status: CaseStatus::INITIAL,
                created_at: now,
                updated_at: now,
                fields: new.fields,
            };
            data.cases.insert(new.case_id, case.clone());
            case
        };

        tracing::debug!(case_id = %case.case_id, country = %country, "case created");
        self.emit(CaseChangeEvent {
            country,
            case_id: case.case_id.clone(),
            change: CaseChange::Created { case: case.clone() },
        });
        Ok(case)
    }

    async fn read_case(&self, q: Scoped<CaseId>) -> Result<Case, StoreError> {
        let scope = q.tenant();
        let mut g = self.lock()?;
        let data = g.tenant(&scope, self.window);
        let case = Inner::case_mut(data, q.query())?.clone();
        q.guard_case(&case)?;
        Ok(case)
    }

    async fn list_cases(&self, q: Scoped<()>) -> Result<Vec<Case>, StoreError> {
        let scope = q.tenant();
        let g = self.lock()?;
        let cases: Vec<Case> = g
            .tenants
            .get(&scope)
            .map(|d| d.cases.values().cloned().collect())
            .unwrap_or_default();
        for c in &cases {
            q.guard_case(c)?;
        }
        Ok(cases)
    }

    async fn write_case_status(&self, q: Scoped<StatusWrite>) -> Result<Case, StoreError> {
        let scope = q.tenant();
        let w = q.query();

        let (case, previous) = {
            let mut g = self.lock()?;
            let now = g.stamp(self.clock.as_ref());
            let data = g.tenant(&scope, self.window);
            let case = Inner::case_mut(data, &w.case_id)?;
            if case.status != w.expected {
                return Err(StoreError::conflict(case.clone()));
            }
            let previous = case.status;
            case.status = w.to;
            case.updated_at = now;
            let case = case.clone();
            data.writes.insert(
                w.write_id,
                LandedWrite {
                    write_id: w.write_id,
                    case_id: w.case_id.clone(),
                    from: previous,
                    to: w.to,
                    at: now,
                },
            );
            (case, previous)
        };

        tracing::debug!(
            case_id = %case.case_id,
            from = %previous,
            to = %case.status,
            "status written"
        );
        self.emit(CaseChangeEvent {
            country: case.country.clone(),
            case_id: case.case_id.clone(),
            change: CaseChange::StatusWritten {
                previous,
                case: case.clone(),
            },
        });
        Ok(case)
    }

    async fn find_status_write(
        &self,
        q: Scoped<WriteLookup>,
    ) -> Result<Option<LandedWrite>, StoreError> {
        let scope = q.tenant();
        let lookup = q.query();
        let g = self.lock()?;
        let Some(data) = g.tenants.get(&scope) else {
            return Err(StoreError::NotFound {
                case_id: lookup.case_id.clone(),
            });
        };
        if !data.cases.contains_key(&lookup.case_id) {
            return Err(StoreError::NotFound {
                case_id: lookup.case_id.clone(),
            });
        }
        Ok(data
            .writes
            .get(&lookup.write_id)
            .filter(|w| w.case_id == lookup.case_id)
            .cloned())
    }

    async fn append_history(
        &self,
        q: Scoped<StatusHistoryEntry>,
    ) -> Result<HistoryAppend, StoreError> {
        let scope = q.tenant();
        let (country, mut entry) = q.into_parts();

        let result = {
            let mut g = self.lock()?;
            let now = g.stamp(self.clock.as_ref());
            let data = g.tenant(&scope, self.window);
            let case = Inner::case_mut(data, &entry.case_id)?.clone();

            entry.timestamp = data
                .writes
                .get(&entry.entry_id)
                .filter(|w| w.case_id == entry.case_id)
                .map_or(now, |w| w.at);
            let outcome = data.ledger.append(entry.clone());
            let stored = match outcome {
                AppendOutcome::Appended { .. } => entry,
                AppendOutcome::DuplicateSuppressed { existing_seq, .. } => data
                    .ledger
                    .rows(&entry.case_id)
                    .iter()
                    .find(|r| r.seq == existing_seq)
                    .map(|r| r.entry.clone())
                    .ok_or_else(|| {
                        StoreError::Backend("suppressing entry vanished from ledger".into())
                    })?,
            };
            if outcome.is_appended() {
                g.mirror_status(&case, &stored);
            }
            HistoryAppend {
                outcome,
                entry: stored,
            }
        };

        if result.outcome.is_appended() {
            self.emit(CaseChangeEvent {
                country,
                case_id: result.entry.case_id.clone(),
                change: CaseChange::HistoryAppended {
                    entry: result.entry.clone(),
                },
            });
        } else {
            tracing::debug!(
                case_id = %result.entry.case_id,
                status = %result.entry.status,
                "history append suppressed as duplicate"
            );
        }
        Ok(result)
    }

    async fn list_history(
        &self,
        q: Scoped<CaseId>,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let scope = q.tenant();
        let g = self.lock()?;
        let Some(data) = g.tenants.get(&scope) else {
            return Err(StoreError::NotFound {
                case_id: q.query().clone(),
            });
        };
        if !data.cases.contains_key(q.query()) {
            return Err(StoreError::NotFound {
                case_id: q.query().clone(),
            });
        }
        Ok(data.ledger.list(q.query()))
    }

    async fn amend_case(
        &self,
        q: Scoped<AmendmentWrite>,
    ) -> Result<(Case, AmendmentEntry), StoreError> {
        let scope = q.tenant();
        let (country, w) = q.into_parts();

        let (case, entry) = {
            let mut g = self.lock()?;
            let now = g.stamp(self.clock.as_ref());
            let data = g.tenant(&scope, self.window);
            let case = Inner::case_mut(data, &w.case_id)?;
            if case.status != w.expected {
                return Err(StoreError::conflict(case.clone()));
            }
            case.fields = w.fields_after;
            case.updated_at = now;
            let case = case.clone();

            let mut entry = w.entry;
            entry.timestamp = now;
            let outcome = data.ledger.append_amendment(entry.clone());
            if outcome.is_appended() {
                if let Some(j) = g.journal.as_mut() {
                    if let Err(err) = j.append_amendment(&country, &entry) {
                        tracing::error!(case_id = %entry.case_id, error = %err, "journal append failed");
                    }
                }
            }
            (case, entry)
        };

        self.emit(CaseChangeEvent {
            country,
            case_id: case.case_id.clone(),
            change: CaseChange::Amended {
                case: case.clone(),
                entry: entry.clone(),
            },
        });
        Ok((case, entry))
    }

    async fn list_amendments(&self, q: Scoped<CaseId>) -> Result<Vec<AmendmentEntry>, StoreError> {
        let scope = q.tenant();
        let g = self.lock()?;
        match g.tenants.get(&scope) {
            Some(data) if data.cases.contains_key(q.query()) => {
                Ok(data.ledger.amendments(q.query()))
            }
            _ => Err(StoreError::NotFound {
                case_id: q.query().clone(),
            }),
        }
    }

    fn subscribe(&self, tenant: &TenantScope) -> ChangeFeed {
        ChangeFeed::new(tenant.clone(), self.feed.subscribe())
    }
}
