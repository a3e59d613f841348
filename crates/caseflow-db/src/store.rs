//! Postgres implementation of the remote store.
//!
//! # Invariants
//!
//! - Status and amendment writes are a single conditional `UPDATE ... WHERE
//!   status = $expected`; zero rows affected means Conflict (or NotFound).
//! - `updated_at` is stamped by the server and strictly increases per case.
//! - History appends serialize per case on a transaction-scoped advisory
//!   lock, so the duplicate check and the insert cannot interleave.
//! - Every mutation calls `pg_notify` inside its own transaction: a
//!   notification is delivered if and only if the change committed.
//! - An applied status write inserts its `case_status_writes` row in the
//!   same transaction, so the row exists if and only if the write committed.

use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use caseflow_isolation::{Scoped, TenantScope};
use caseflow_ledger::{is_duplicate_of, AppendOutcome};
use caseflow_schemas::{
    Actor, AmendmentEntry, AttachmentRef, BusinessFields, Case, CaseChange, CaseChangeEvent,
    CaseId, CaseStatus, Country, FieldChange, NewCase, StatusHistoryEntry,
};
use caseflow_store::{
    AmendmentWrite, ChangeFeed, FeedItem, HistoryAppend, LandedWrite, RemoteStore, StatusWrite,
    StoreError, WriteLookup,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// LISTEN/NOTIFY channel carrying JSON `CaseChangeEvent`s.
pub const NOTIFY_CHANNEL: &str = "case_changes";

const FEED_CAPACITY: usize = 1024;

const CASE_COLUMNS: &str = "case_id, country, status, created_at, updated_at, fields";
const HISTORY_COLUMNS: &str =
    "seq, entry_id, case_id, status, ts, actor_id, actor_role, detail, attachments";
const AMENDMENT_COLUMNS: &str =
    "amendment_id, case_id, ts, actor_id, actor_role, reason, changes";

pub struct PgStore {
    pool: PgPool,
    feed: broadcast::Sender<FeedItem>,
    window: Duration,
    listener: JoinHandle<()>,
}

impl PgStore {
    /// Open the notification listener and start forwarding it to subscribers.
    pub async fn connect(pool: PgPool, window: Duration) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .context("failed to open notification connection")?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .with_context(|| format!("LISTEN {NOTIFY_CHANNEL} failed"))?;

        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        let task = tokio::spawn(forward_notifications(listener, feed.clone()));

        Ok(Self {
            pool,
            feed,
            window,
            listener: task,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn forward_notifications(mut listener: PgListener, feed: broadcast::Sender<FeedItem>) {
    loop {
        match listener.try_recv().await {
            Ok(Some(n)) => match serde_json::from_str::<CaseChangeEvent>(n.payload()) {
                Ok(ev) => {
                    let _ = feed.send(FeedItem::Event(ev));
                }
                Err(err) => warn!(error = %err, "undecodable change notification dropped"),
            },
            Ok(None) => {
                // Reconnects on the next call; anything sent meanwhile is gone.
                warn!("notification connection lost; subscribers must resync");
                let _ = feed.send(FeedItem::Lagged { missed: 0 });
            }
            Err(err) => {
                error!(error = %err, "notification listener failed; retrying");
                let _ = feed.send(FeedItem::Lagged { missed: 0 });
                tokio::time::sleep(StdDuration::from_secs(1)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error + row mapping
// ---------------------------------------------------------------------------

fn db_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn decode_err(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("cannot decode {what}: {err}"))
}

fn parse_status(label: &str) -> Result<CaseStatus, StoreError> {
    CaseStatus::parse(label).ok_or_else(|| decode_err("status", format!("unknown label '{label}'")))
}

fn case_from_row(row: &PgRow) -> Result<Case, StoreError> {
    let fields: Value = row.try_get("fields").map_err(db_err)?;
    let fields: BusinessFields =
        serde_json::from_value(fields).map_err(|e| decode_err("case fields", e))?;
    let country: String = row.try_get("country").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Case {
        case_id: CaseId::new(row.try_get::<String, _>("case_id").map_err(db_err)?),
        country: Country::new(country),
        status: parse_status(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        fields,
    })
}

fn entry_from_row(row: &PgRow) -> Result<(i64, StatusHistoryEntry), StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let attachments: Value = row.try_get("attachments").map_err(db_err)?;
    let attachments: Vec<AttachmentRef> =
        serde_json::from_value(attachments).map_err(|e| decode_err("attachments", e))?;
    let actor_id: String = row.try_get("actor_id").map_err(db_err)?;
    let actor_role: String = row.try_get("actor_role").map_err(db_err)?;

    let entry = StatusHistoryEntry {
        entry_id: row.try_get("entry_id").map_err(db_err)?,
        case_id: CaseId::new(row.try_get::<String, _>("case_id").map_err(db_err)?),
        status: parse_status(&status)?,
        timestamp: row.try_get("ts").map_err(db_err)?,
        actor: Actor::new(actor_id, actor_role),
        detail: row.try_get("detail").map_err(db_err)?,
        attachments,
    };
    Ok((row.try_get("seq").map_err(db_err)?, entry))
}

fn amendment_from_row(row: &PgRow) -> Result<AmendmentEntry, StoreError> {
    let changes: Value = row.try_get("changes").map_err(db_err)?;
    let changes: Vec<FieldChange> =
        serde_json::from_value(changes).map_err(|e| decode_err("amendment changes", e))?;
    let actor_id: String = row.try_get("actor_id").map_err(db_err)?;
    let actor_role: String = row.try_get("actor_role").map_err(db_err)?;

    Ok(AmendmentEntry {
        amendment_id: row.try_get("amendment_id").map_err(db_err)?,
        case_id: CaseId::new(row.try_get::<String, _>("case_id").map_err(db_err)?),
        timestamp: row.try_get("ts").map_err(db_err)?,
        actor: Actor::new(actor_id, actor_role),
        reason: row.try_get("reason").map_err(db_err)?,
        changes,
    })
}

fn seq_u64(seq: i64) -> u64 {
    u64::try_from(seq).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Shared statements
// ---------------------------------------------------------------------------

async fn notify(conn: &mut PgConnection, ev: &CaseChangeEvent) -> Result<(), StoreError> {
    let payload = serde_json::to_string(ev).map_err(|e| decode_err("change event", e))?;
    sqlx::query("select pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(payload)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn fetch_case(
    conn: &mut PgConnection,
    country: &Country,
    case_id: &CaseId,
) -> Result<Case, StoreError> {
    let row = sqlx::query(&format!(
        "select {CASE_COLUMNS} from cases where country = $1 and case_id = $2"
    ))
    .bind(country.as_str())
    .bind(case_id.as_str())
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;

    match row {
        Some(row) => case_from_row(&row),
        None => Err(StoreError::NotFound {
            case_id: case_id.clone(),
        }),
    }
}

/// The conditional write matched no row: either the case is gone or its
/// status moved.
async fn explain_miss(
    conn: &mut PgConnection,
    country: &Country,
    case_id: &CaseId,
) -> StoreError {
    match fetch_case(conn, country, case_id).await {
        Ok(current) => StoreError::conflict(current),
        Err(err) => err,
    }
}

#[async_trait]
impl RemoteStore for PgStore {
    async fn create_case(&self, q: Scoped<NewCase>) -> Result<Case, StoreError> {
        let (country, new) = q.into_parts();
        let fields = serde_json::to_value(&new.fields).map_err(|e| decode_err("case fields", e))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            r#"
            insert into cases (country, case_id, status, created_at, updated_at, fields)
            values ($1, $2, $3, clock_timestamp(), clock_timestamp(), $4)
            on conflict (country, case_id) do nothing
            returning {CASE_COLUMNS}
            "#
        ))
        .bind(country.as_str())
        .bind(new.case_id.as_str())
        .bind(CaseStatus::INITIAL.label())
        .bind(fields)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(StoreError::AlreadyExists {
                case_id: new.case_id,
            });
        };
        let case = case_from_row(&row)?;

        notify(
            &mut tx,
            &CaseChangeEvent {
                country,
                case_id: case.case_id.clone(),
                change: CaseChange::Created { case: case.clone() },
            },
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        debug!(case_id = %case.case_id, "case created");
        Ok(case)
    }

    async fn read_case(&self, q: Scoped<CaseId>) -> Result<Case, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let case = fetch_case(&mut conn, q.country(), q.query()).await?;
        q.guard_case(&case)?;
        Ok(case)
    }

    async fn list_cases(&self, q: Scoped<()>) -> Result<Vec<Case>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {CASE_COLUMNS} from cases where country = $1 order by case_id"
        ))
        .bind(q.country().as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let case = case_from_row(row)?;
            q.guard_case(&case)?;
            out.push(case);
        }
        Ok(out)
    }

    async fn write_case_status(&self, q: Scoped<StatusWrite>) -> Result<Case, StoreError> {
        let country = q.country().clone();
        let w = q.query();

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            r#"
            update cases
               set status = $4,
                   updated_at = greatest(clock_timestamp(), updated_at + interval '1 microsecond')
             where country = $1 and case_id = $2 and status = $3
            returning {CASE_COLUMNS}
            "#
        ))
        .bind(country.as_str())
        .bind(w.case_id.as_str())
        .bind(w.expected.label())
        .bind(w.to.label())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(explain_miss(&mut tx, &country, &w.case_id).await);
        };
        let case = case_from_row(&row)?;

        sqlx::query(
            r#"
            insert into case_status_writes
              (write_id, country, case_id, from_status, to_status, at)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(w.write_id)
        .bind(country.as_str())
        .bind(w.case_id.as_str())
        .bind(w.expected.label())
        .bind(w.to.label())
        .bind(case.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        notify(
            &mut tx,
            &CaseChangeEvent {
                country,
                case_id: case.case_id.clone(),
                change: CaseChange::StatusWritten {
                    previous: w.expected,
                    case: case.clone(),
                },
            },
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        debug!(case_id = %case.case_id, from = %w.expected, to = %case.status, "status written");
        Ok(case)
    }

    async fn find_status_write(
        &self,
        q: Scoped<WriteLookup>,
    ) -> Result<Option<LandedWrite>, StoreError> {
        let lookup = q.query();
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_case(&mut conn, q.country(), &lookup.case_id).await?;

        let row = sqlx::query(
            r#"
            select from_status, to_status, at from case_status_writes
             where country = $1 and case_id = $2 and write_id = $3
            "#,
        )
        .bind(q.country().as_str())
        .bind(lookup.case_id.as_str())
        .bind(lookup.write_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let from: String = row.try_get("from_status").map_err(db_err)?;
        let to: String = row.try_get("to_status").map_err(db_err)?;
        Ok(Some(LandedWrite {
            write_id: lookup.write_id,
            case_id: lookup.case_id.clone(),
            from: parse_status(&from)?,
            to: parse_status(&to)?,
            at: row.try_get("at").map_err(db_err)?,
        }))
    }

    async fn append_history(
        &self,
        q: Scoped<StatusHistoryEntry>,
    ) -> Result<HistoryAppend, StoreError> {
        let (country, mut entry) = q.into_parts();
        let lock_key = format!("{}/{}", country, entry.case_id);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
            .bind(&lock_key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // NotFound before anything else.
        fetch_case(&mut tx, &country, &entry.case_id).await?;

        // The status write's own time when this entry records one.
        let (now,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            select coalesce(
              (select at from case_status_writes
                where write_id = $1 and country = $2 and case_id = $3),
              clock_timestamp())
            "#,
        )
        .bind(entry.entry_id)
        .bind(country.as_str())
        .bind(entry.case_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        entry.timestamp = now;

        let window_secs = self.window.num_milliseconds() as f64 / 1000.0;
        let candidates = sqlx::query(&format!(
            r#"
            select {HISTORY_COLUMNS} from status_history
             where country = $1 and case_id = $2
               and (entry_id = $3 or (status = $4 and ts > $5 - make_interval(secs => $6)))
             order by seq
            "#
        ))
        .bind(country.as_str())
        .bind(entry.case_id.as_str())
        .bind(entry.entry_id)
        .bind(entry.status.label())
        .bind(now)
        .bind(window_secs)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in &candidates {
            let (seq, existing) = entry_from_row(row)?;
            if is_duplicate_of(&existing, &entry, self.window) {
                tx.commit().await.map_err(db_err)?;
                debug!(case_id = %entry.case_id, status = %entry.status, "history append suppressed as duplicate");
                return Ok(HistoryAppend {
                    outcome: AppendOutcome::DuplicateSuppressed {
                        existing_id: existing.entry_id,
                        existing_seq: seq_u64(seq),
                    },
                    entry: existing,
                });
            }
        }

        let attachments =
            serde_json::to_value(&entry.attachments).map_err(|e| decode_err("attachments", e))?;
        let (seq,): (i64,) = sqlx::query_as(
            r#"
            insert into status_history
              (entry_id, country, case_id, status, ts, actor_id, actor_role, detail, attachments)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            returning seq
            "#,
        )
        .bind(entry.entry_id)
        .bind(country.as_str())
        .bind(entry.case_id.as_str())
        .bind(entry.status.label())
        .bind(entry.timestamp)
        .bind(&entry.actor.id)
        .bind(entry.actor.role.as_str())
        .bind(&entry.detail)
        .bind(attachments)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        notify(
            &mut tx,
            &CaseChangeEvent {
                country,
                case_id: entry.case_id.clone(),
                change: CaseChange::HistoryAppended {
                    entry: entry.clone(),
                },
            },
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        Ok(HistoryAppend {
            outcome: AppendOutcome::Appended { seq: seq_u64(seq) },
            entry,
        })
    }

    async fn list_history(
        &self,
        q: Scoped<CaseId>,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_case(&mut conn, q.country(), q.query()).await?;

        let rows = sqlx::query(&format!(
            r#"
            select {HISTORY_COLUMNS} from status_history
             where country = $1 and case_id = $2
             order by ts, seq
            "#
        ))
        .bind(q.country().as_str())
        .bind(q.query().as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| entry_from_row(r).map(|(_, e)| e))
            .collect()
    }

    async fn amend_case(
        &self,
        q: Scoped<AmendmentWrite>,
    ) -> Result<(Case, AmendmentEntry), StoreError> {
        let (country, w) = q.into_parts();
        let fields =
            serde_json::to_value(&w.fields_after).map_err(|e| decode_err("case fields", e))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            r#"
            update cases
               set fields = $4,
                   updated_at = greatest(clock_timestamp(), updated_at + interval '1 microsecond')
             where country = $1 and case_id = $2 and status = $3
            returning {CASE_COLUMNS}
            "#
        ))
        .bind(country.as_str())
        .bind(w.case_id.as_str())
        .bind(w.expected.label())
        .bind(fields)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(explain_miss(&mut tx, &country, &w.case_id).await);
        };
        let case = case_from_row(&row)?;

        let mut entry = w.entry;
        entry.timestamp = case.updated_at;
        let changes =
            serde_json::to_value(&entry.changes).map_err(|e| decode_err("amendment changes", e))?;
        sqlx::query(
            r#"
            insert into amendments
              (amendment_id, country, case_id, ts, actor_id, actor_role, reason, changes)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (amendment_id) do nothing
            "#,
        )
        .bind(entry.amendment_id)
        .bind(country.as_str())
        .bind(entry.case_id.as_str())
        .bind(entry.timestamp)
        .bind(&entry.actor.id)
        .bind(entry.actor.role.as_str())
        .bind(&entry.reason)
        .bind(changes)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        notify(
            &mut tx,
            &CaseChangeEvent {
                country,
                case_id: case.case_id.clone(),
                change: CaseChange::Amended {
                    case: case.clone(),
                    entry: entry.clone(),
                },
            },
        )
        .await?;
        tx.commit().await.map_err(db_err)?;

        Ok((case, entry))
    }

    async fn list_amendments(&self, q: Scoped<CaseId>) -> Result<Vec<AmendmentEntry>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_case(&mut conn, q.country(), q.query()).await?;

        let rows = sqlx::query(&format!(
            r#"
            select {AMENDMENT_COLUMNS} from amendments
             where country = $1 and case_id = $2
             order by ts, seq
            "#
        ))
        .bind(q.country().as_str())
        .bind(q.query().as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        rows.iter().map(amendment_from_row).collect()
    }

    fn subscribe(&self, tenant: &TenantScope) -> ChangeFeed {
        ChangeFeed::new(tenant.clone(), self.feed.subscribe())
    }
}
