//! Identifiable entity model shared by every synchronizable record

use crate::resource::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Reserved prefix marking an identifier the server has not acknowledged yet
pub const TEMPORARY_ID_PREFIX: &str = "local_";

/// Whether a global identifier is a placeholder for an offline-created record
pub fn is_temporary_uid(uid: &str) -> bool {
    uid.starts_with(TEMPORARY_ID_PREFIX)
}

/// Allocate a fresh temporary identifier
pub fn temporary_uid() -> String {
    format!("{}{}", TEMPORARY_ID_PREFIX, Uuid::new_v4().simple())
}

/// Locally assigned surrogate key.
///
/// Assigned on first persistence and stable for the lifetime of the row.
/// All foreign keys between local rows use it instead of the global
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything carrying a global identifier
pub trait Identifiable {
    fn uid(&self) -> &str;

    fn is_temporary(&self) -> bool {
        is_temporary_uid(self.uid())
    }
}

/// Upload state of a local row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Matches the server copy
    Synced,
    /// Has local edits not yet accepted by the server
    Pending,
    /// Last push attempt was rejected; retried on the next push cycle
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncState::Synced),
            "pending" => Some(SyncState::Pending),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

/// A synchronizable record of any resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub resource: ResourceType,
    /// Assigned by storage on first save
    pub local_id: Option<LocalId>,
    pub uid: String,
    pub code: Option<String>,
    pub display_name: Option<String>,
    /// Server clock for fetched rows, device clock for local edits
    pub last_updated: Option<DateTime<Utc>>,
    pub state: SyncState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Foreign keys by payload field name
    pub relations: BTreeMap<String, LocalId>,
    /// Resource-specific fields
    pub payload: serde_json::Value,
}

impl Record {
    /// A record as received from the server
    pub fn remote(resource: ResourceType, uid: impl Into<String>) -> Self {
        Self {
            resource,
            local_id: None,
            uid: uid.into(),
            code: None,
            display_name: None,
            last_updated: None,
            state: SyncState::Synced,
            retry_count: 0,
            last_error: None,
            relations: BTreeMap::new(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// A record created on the device under a temporary identifier
    pub fn local(resource: ResourceType, payload: serde_json::Value) -> Self {
        Self {
            uid: temporary_uid(),
            last_updated: Some(Utc::now()),
            state: SyncState::Pending,
            payload,
            ..Self::remote(resource, String::new())
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_relation(mut self, field: impl Into<String>, target: LocalId) -> Self {
        self.relations.insert(field.into(), target);
        self
    }

    /// Has local edits the server has not seen
    pub fn is_dirty(&self) -> bool {
        self.state != SyncState::Synced
    }

    /// Same server-visible version: timestamp, descriptive fields, payload
    /// and relations all equal. Local bookkeeping is ignored.
    pub fn same_version(&self, other: &Record) -> bool {
        self.uid == other.uid
            && self.last_updated == other.last_updated
            && self.code == other.code
            && self.display_name == other.display_name
            && self.payload == other.payload
            && self.relations == other.relations
    }
}

impl Identifiable for Record {
    fn uid(&self) -> &str {
        &self.uid
    }
}

/// Minimal server listing entry used to detect deletions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ExistenceEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

impl Identifiable for ExistenceEntry {
    fn uid(&self) -> &str {
        &self.id
    }
}

impl From<&Record> for ExistenceEntry {
    fn from(record: &Record) -> Self {
        Self {
            id: record.uid.clone(),
            name: record.display_name.clone(),
        }
    }
}

/// Authenticated user as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Server acknowledgement of a pushed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReceipt {
    /// Identifier the server holds the record under
    pub assigned_id: String,
}
