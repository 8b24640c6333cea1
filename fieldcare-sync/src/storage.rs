//! Storage collaborator contract and the in-memory implementation
//!
//! The engine never talks to a database directly. It reads snapshots,
//! submits reconciled writes inside a transaction, and listens for change
//! notifications through this trait.

use crate::error::{SyncError, SyncResult};
use crate::model::{LocalId, Record, SyncState};
use crate::reconcile::{PendingWrite, WriteKind};
use crate::resource::ResourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the change notification channel
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
    Wiped,
}

/// Published after every persisted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageChange {
    pub resource: ResourceType,
    pub kind: ChangeKind,
}

/// Outcome of a committed transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Updates dropped because the row changed after the snapshot
    pub skipped: usize,
}

impl CommitReceipt {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub(crate) fn record(&mut self, kind: WriteKind) {
        match kind {
            WriteKind::Insert => self.inserted += 1,
            WriteKind::Update => self.updated += 1,
            WriteKind::Delete => self.deleted += 1,
        }
    }
}

/// A unit of work. Dropping it without calling `commit` discards every
/// enqueued operation.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn enqueue(&mut self, operation: PendingWrite) -> SyncResult<()>;

    async fn commit(self: Box<Self>) -> SyncResult<CommitReceipt>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn query_all(&self, resource: ResourceType) -> SyncResult<Vec<Record>>;

    async fn query_by_uids(&self, resource: ResourceType, uids: &[String]) -> SyncResult<Vec<Record>>;

    async fn query_by_uid(&self, resource: ResourceType, uid: &str) -> SyncResult<Option<Record>>;

    async fn query_by_local_id(&self, local_id: LocalId) -> SyncResult<Option<Record>>;

    /// Rows with unsynced local edits, oldest first
    async fn query_pending(&self, resource: ResourceType) -> SyncResult<Vec<Record>>;

    async fn local_id_for(&self, resource: ResourceType, uid: &str) -> SyncResult<Option<LocalId>> {
        Ok(self.query_by_uid(resource, uid).await?.and_then(|r| r.local_id))
    }

    /// Start a transaction. Inserts enqueued on it are upserts keyed by
    /// (resource, uid): a row already holding the identifier keeps its
    /// surrogate key.
    async fn begin_transaction(&self) -> SyncResult<Box<dyn StorageTransaction>>;

    /// Persist a locally created or edited record, assigning a surrogate key
    /// on first save
    async fn save_local(&self, record: Record) -> SyncResult<Record>;

    /// Swap a temporary identifier for the server-assigned one in place
    async fn replace_uid(&self, local_id: LocalId, uid: &str) -> SyncResult<()>;

    async fn mark_synced(&self, local_id: LocalId, last_updated: Option<DateTime<Utc>>) -> SyncResult<()>;

    async fn mark_failed(&self, local_id: LocalId, error: &str) -> SyncResult<()>;

    async fn delete_local(&self, local_id: LocalId) -> SyncResult<()>;

    /// Drop every replicated and local row
    async fn wipe(&self) -> SyncResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<LocalId, Record>,
    next_id: i64,
}

impl MemoryState {
    fn find_uid(&self, resource: ResourceType, uid: &str) -> Option<LocalId> {
        self.rows
            .values()
            .find(|r| r.resource == resource && r.uid == uid)
            .and_then(|r| r.local_id)
    }

    fn allocate(&mut self) -> LocalId {
        self.next_id += 1;
        LocalId(self.next_id)
    }

    fn row_mut(&mut self, local_id: LocalId) -> SyncResult<&mut Record> {
        self.rows
            .get_mut(&local_id)
            .ok_or_else(|| SyncError::NotFound(format!("record {}", local_id)))
    }

    /// Apply one write; `None` when it was skipped
    fn apply(&mut self, operation: PendingWrite) -> SyncResult<Option<StorageChange>> {
        let resource = operation.resource();
        let kind = match operation {
            PendingWrite::Insert(mut record) => match self.find_uid(resource, &record.uid) {
                Some(existing) => {
                    if self.rows.get(&existing).is_some_and(Record::is_dirty) {
                        return Ok(None);
                    }
                    record.local_id = Some(existing);
                    self.rows.insert(existing, record);
                    ChangeKind::Updated
                }
                None => {
                    let local_id = self.allocate();
                    record.local_id = Some(local_id);
                    self.rows.insert(local_id, record);
                    ChangeKind::Inserted
                }
            },
            PendingWrite::Update {
                local_id,
                mut record,
                expected,
            } => {
                let row = self.row_mut(local_id)?;
                if !expected.matches(row) {
                    return Ok(None);
                }
                record.local_id = Some(local_id);
                *row = record;
                ChangeKind::Updated
            }
            PendingWrite::Delete { local_id, .. } => {
                self.rows.remove(&local_id);
                ChangeKind::Deleted
            }
        };
        Ok(Some(StorageChange { resource, kind }))
    }
}

/// Volatile storage, used for tests and for embedding without a database
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, resource: ResourceType, kind: ChangeKind) {
        // No subscribers is fine
        let _ = self.changes.send(StorageChange { resource, kind });
    }

    fn select<F>(&self, filter: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.state.lock().rows.values().filter(|r| filter(r)).cloned().collect()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    changes: broadcast::Sender<StorageChange>,
    staged: Vec<PendingWrite>,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn enqueue(&mut self, operation: PendingWrite) -> SyncResult<()> {
        self.staged.push(operation);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SyncResult<CommitReceipt> {
        let mut receipt = CommitReceipt::default();
        let mut published = Vec::with_capacity(self.staged.len());
        {
            let mut state = self.state.lock();
            // Validate before touching anything so the commit is all-or-nothing
            for operation in &self.staged {
                if let PendingWrite::Update { local_id, .. } = operation {
                    if !state.rows.contains_key(local_id) {
                        return Err(SyncError::Storage(format!("update target {} vanished", local_id)));
                    }
                }
            }
            for operation in self.staged {
                let kind = operation.kind();
                let uid = operation.uid().to_string();
                match state.apply(operation)? {
                    Some(change) => {
                        receipt.record(kind);
                        published.push(change);
                    }
                    None => {
                        tracing::debug!(uid = %uid, "Local edit landed after the snapshot, keeping it");
                        receipt.skipped += 1;
                    }
                }
            }
        }
        for change in published {
            let _ = self.changes.send(change);
        }
        Ok(receipt)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn query_all(&self, resource: ResourceType) -> SyncResult<Vec<Record>> {
        Ok(self.select(|r| r.resource == resource))
    }

    async fn query_by_uids(&self, resource: ResourceType, uids: &[String]) -> SyncResult<Vec<Record>> {
        Ok(self.select(|r| r.resource == resource && uids.contains(&r.uid)))
    }

    async fn query_by_uid(&self, resource: ResourceType, uid: &str) -> SyncResult<Option<Record>> {
        Ok(self.select(|r| r.resource == resource && r.uid == uid).into_iter().next())
    }

    async fn query_by_local_id(&self, local_id: LocalId) -> SyncResult<Option<Record>> {
        Ok(self.state.lock().rows.get(&local_id).cloned())
    }

    async fn query_pending(&self, resource: ResourceType) -> SyncResult<Vec<Record>> {
        Ok(self.select(|r| r.resource == resource && r.is_dirty()))
    }

    async fn begin_transaction(&self) -> SyncResult<Box<dyn StorageTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            changes: self.changes.clone(),
            staged: Vec::new(),
        }))
    }

    async fn save_local(&self, mut record: Record) -> SyncResult<Record> {
        let resource = record.resource;
        let kind = {
            let mut state = self.state.lock();
            match record.local_id {
                Some(local_id) => {
                    let row = state.row_mut(local_id)?;
                    *row = record.clone();
                    ChangeKind::Updated
                }
                None => {
                    if state.find_uid(resource, &record.uid).is_some() {
                        return Err(SyncError::InvalidOperation(format!(
                            "{} {} is already stored",
                            resource, record.uid
                        )));
                    }
                    let local_id = state.allocate();
                    record.local_id = Some(local_id);
                    state.rows.insert(local_id, record.clone());
                    ChangeKind::Inserted
                }
            }
        };
        self.notify(resource, kind);
        Ok(record)
    }

    async fn replace_uid(&self, local_id: LocalId, uid: &str) -> SyncResult<()> {
        let resource = {
            let mut state = self.state.lock();
            let resource = state.row_mut(local_id)?.resource;
            // A server copy fetched under the new identifier is the same record
            if let Some(echo) = state.find_uid(resource, uid).filter(|id| *id != local_id) {
                state.rows.remove(&echo);
            }
            state.row_mut(local_id)?.uid = uid.to_string();
            resource
        };
        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn mark_synced(&self, local_id: LocalId, last_updated: Option<DateTime<Utc>>) -> SyncResult<()> {
        let resource = {
            let mut state = self.state.lock();
            let row = state.row_mut(local_id)?;
            row.state = SyncState::Synced;
            row.retry_count = 0;
            row.last_error = None;
            if last_updated.is_some() {
                row.last_updated = last_updated;
            }
            row.resource
        };
        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn mark_failed(&self, local_id: LocalId, error: &str) -> SyncResult<()> {
        let resource = {
            let mut state = self.state.lock();
            let row = state.row_mut(local_id)?;
            row.state = SyncState::Failed;
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            row.resource
        };
        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn delete_local(&self, local_id: LocalId) -> SyncResult<()> {
        let removed = self.state.lock().rows.remove(&local_id);
        match removed {
            Some(record) => {
                self.notify(record.resource, ChangeKind::Deleted);
                Ok(())
            }
            None => Err(SyncError::NotFound(format!("record {}", local_id))),
        }
    }

    async fn wipe(&self) -> SyncResult<()> {
        self.state.lock().rows.clear();
        for resource in ResourceType::ALL {
            self.notify(resource, ChangeKind::Wiped);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
