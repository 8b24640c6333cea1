//! Merge of server listings into the local snapshot
//!
//! Given the server's existence listing (every identifier still present),
//! the updated listing (full records changed since the watermark) and the
//! local snapshot, produce the writes that bring the replica in line:
//!
//! 1. Local rows with a server identifier missing from the existence
//!    listing were deleted on the server and get a delete.
//! 2. Updated records become an update when the identifier is already local
//!    (keeping the local surrogate key) and an insert otherwise.
//! 3. Identifiers only present in the existence listing are left for a later
//!    cycle; they show up in the updated listing once the watermark passes
//!    them.
//! 4. Rows under a temporary identifier are never deleted or overwritten.
//!
//! Conflicts with unsynced local edits are last-writer-wins on
//! `last_updated`: the server copy replaces the local edit only when it is
//! strictly newer. Updates carry the [`RowVersion`] they were computed
//! against; storage skips them when the row changed before the commit.

use crate::model::{ExistenceEntry, Identifiable, LocalId, Record, SyncState};
use crate::resource::ResourceType;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Upload state and timestamp of a stored row at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowVersion {
    pub state: SyncState,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RowVersion {
    pub fn of(record: &Record) -> Self {
        Self {
            state: record.state,
            last_updated: record.last_updated,
        }
    }

    /// Whether `record` is still the row this version was taken from
    pub fn matches(&self, record: &Record) -> bool {
        record.state == self.state && record.last_updated == self.last_updated
    }
}

/// A single persistence step. Produced by [`reconcile`], consumed by the
/// write queue, never modified in between.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Insert(Record),
    Update {
        local_id: LocalId,
        record: Record,
        /// Applied only while the stored row still has this version
        expected: RowVersion,
    },
    Delete {
        resource: ResourceType,
        local_id: LocalId,
        uid: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl PendingWrite {
    pub fn kind(&self) -> WriteKind {
        match self {
            PendingWrite::Insert(_) => WriteKind::Insert,
            PendingWrite::Update { .. } => WriteKind::Update,
            PendingWrite::Delete { .. } => WriteKind::Delete,
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            PendingWrite::Insert(record) | PendingWrite::Update { record, .. } => &record.uid,
            PendingWrite::Delete { uid, .. } => uid,
        }
    }

    pub fn resource(&self) -> ResourceType {
        match self {
            PendingWrite::Insert(record) | PendingWrite::Update { record, .. } => record.resource,
            PendingWrite::Delete { resource, .. } => *resource,
        }
    }
}

/// Compute the writes needed to reach the server state.
///
/// At most one operation is emitted per identifier.
pub fn reconcile(
    existence: &[ExistenceEntry],
    updated: Vec<Record>,
    local: &[Record],
) -> Vec<PendingWrite> {
    let present: HashSet<&str> = existence.iter().map(Identifiable::uid).collect();
    let local_index: HashMap<&str, &Record> = local.iter().map(|r| (r.uid(), r)).collect();

    let mut operations = Vec::new();

    for record in local {
        if record.is_temporary() || present.contains(record.uid()) {
            continue;
        }
        if let Some(local_id) = record.local_id {
            operations.push(PendingWrite::Delete {
                resource: record.resource,
                local_id,
                uid: record.uid.clone(),
            });
        }
    }

    for incoming in newest_per_uid(updated) {
        if incoming.is_temporary() || !present.contains(incoming.uid()) {
            tracing::trace!(uid = %incoming.uid, "Skipping record absent from existence listing");
            continue;
        }

        match local_index.get(incoming.uid()) {
            None => operations.push(PendingWrite::Insert(incoming)),
            Some(existing) => {
                if existing.same_version(&incoming) {
                    continue;
                }
                if existing.is_dirty() && incoming.last_updated <= existing.last_updated {
                    tracing::debug!(
                        uid = %incoming.uid,
                        "Keeping newer local edit over server copy"
                    );
                    continue;
                }
                match existing.local_id {
                    Some(local_id) => {
                        let mut record = incoming;
                        record.local_id = Some(local_id);
                        operations.push(PendingWrite::Update {
                            local_id,
                            record,
                            expected: RowVersion::of(existing),
                        });
                    }
                    None => operations.push(PendingWrite::Insert(incoming)),
                }
            }
        }
    }

    operations
}

/// Collapse duplicate identifiers to the newest copy, keeping first-seen order
fn newest_per_uid(records: Vec<Record>) -> Vec<Record> {
    let mut order: Vec<String> = Vec::with_capacity(records.len());
    let mut newest: HashMap<String, Record> = HashMap::with_capacity(records.len());

    for record in records {
        match newest.get(&record.uid) {
            Some(seen) if seen.last_updated >= record.last_updated => {}
            Some(_) => {
                newest.insert(record.uid.clone(), record);
            }
            None => {
                order.push(record.uid.clone());
                newest.insert(record.uid.clone(), record);
            }
        }
    }

    order.into_iter().filter_map(|uid| newest.remove(&uid)).collect()
}
