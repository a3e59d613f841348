//! caseflow-schemas
//!
//! Shared data model for the case lifecycle engine: cases, status history,
//! amendments and the change-feed / notification envelopes. No logic beyond
//! constructors and small accessors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

mod status;

pub use status::CaseStatus;

/// Free-form business fields (hospital, procedure, surgeon, ...). Opaque to the engine.
pub type BusinessFields = BTreeMap<String, Value>;

/// Opaque case identifier, unique within a tenant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant key. Stored upper-cased and trimmed (`"my"` and `" MY "` are the same tenant).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Country(String);

impl Country {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Country {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role name as issued by the surrounding application (booking, operations, ...).
/// The engine never interprets it beyond looking it up in the injected permission table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user performing an action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::new(role),
        }
    }
}

/// Reference to an attachment held by the external file store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(pub String);

/// A unit of work (one surgical equipment booking).
///
/// `country` never changes after creation. `updated_at` is stamped by the
/// remote store on every write and is the last-writer-wins key for change-feed merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: CaseId,
    pub country: Country,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BusinessFields,
}

/// Input for creating a case. Status is always the initial node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCase {
    pub case_id: CaseId,
    #[serde(default)]
    pub fields: BusinessFields,
}

/// Immutable record of one status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    /// Client-generated id; lets change-feed echoes be recognised.
    pub entry_id: Uuid,
    pub case_id: CaseId,
    pub status: CaseStatus,
    /// Server time once persisted; the requester's clock while provisional.
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

/// One field diff inside an amendment. `None` means the field was absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Immutable record of a business-field amendment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AmendmentEntry {
    pub amendment_id: Uuid,
    pub case_id: CaseId,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub reason: String,
    pub changes: Vec<FieldChange>,
}

/// A mutation observed on the remote store, pushed to every subscriber of the tenant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseChangeEvent {
    pub country: Country,
    pub case_id: CaseId,
    pub change: CaseChange,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseChange {
    Created { case: Case },
    StatusWritten { previous: CaseStatus, case: Case },
    HistoryAppended { entry: StatusHistoryEntry },
    Amended { case: Case, entry: AmendmentEntry },
}

impl CaseChangeEvent {
    /// Server timestamp carried by the event.
    pub fn server_ts(&self) -> DateTime<Utc> {
        match &self.change {
            CaseChange::Created { case }
            | CaseChange::StatusWritten { case, .. }
            | CaseChange::Amended { case, .. } => case.updated_at,
            CaseChange::HistoryAppended { entry } => entry.timestamp,
        }
    }

    /// The full case row, when the event carries one.
    pub fn case(&self) -> Option<&Case> {
        match &self.change {
            CaseChange::Created { case }
            | CaseChange::StatusWritten { case, .. }
            | CaseChange::Amended { case, .. } => Some(case),
            CaseChange::HistoryAppended { .. } => None,
        }
    }
}

/// Emitted after every successful transition for the notification subsystem
/// (email/SMS), which may or may not be listening.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionNotice {
    pub case_id: CaseId,
    pub country: Country,
    pub old_status: CaseStatus,
    pub new_status: CaseStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
}
