//! SQLite-backed replica storage
//!
//! Provides:
//! - Durable storage of replicated and locally created records
//! - Transactional batch writes for reconciled pages
//! - The `sync_metadata` key/value table for watermarks and preferences
//! - Change notifications for the completion gate

use crate::error::{SyncError, SyncResult};
use crate::keyvalue::KeyValueStore;
use crate::model::{LocalId, Record, SyncState};
use crate::reconcile::{PendingWrite, RowVersion};
use crate::resource::ResourceType;
use crate::storage::{
    ChangeKind, CommitReceipt, Storage, StorageChange, StorageTransaction, CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

const RECORD_COLUMNS: &str = "local_id, resource, uid, code, display_name, last_updated, \
                              state, retry_count, last_error, relations, payload";

/// Configuration for the local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Overwrite freed pages so wiped clinical data does not linger on disk
    pub enable_secure_delete: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: "fieldcare.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

impl SqliteConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

/// Local database handle
pub struct SqliteStorage {
    pool: SqlitePool,
    changes: broadcast::Sender<StorageChange>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database and initialize the schema
    pub async fn new(config: SqliteConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(true)
            .pragma("secure_delete", if config.enable_secure_delete { "ON" } else { "OFF" });

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let storage = Self { pool, changes };
        storage.initialize_schema().await?;

        tracing::debug!(path = %config.db_path, "Opened replica database");

        Ok(storage)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource TEXT NOT NULL,
                uid TEXT NOT NULL,
                code TEXT,
                display_name TEXT,
                last_updated TEXT,
                state TEXT NOT NULL DEFAULT 'synced',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                relations TEXT NOT NULL DEFAULT '{}',
                payload TEXT NOT NULL DEFAULT '{}',
                UNIQUE(resource, uid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_state ON records(resource, state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reclaim space after a wipe
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close database connection
    pub async fn close(&self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn notify(&self, resource: ResourceType, kind: ChangeKind) {
        let _ = self.changes.send(StorageChange { resource, kind });
    }

    async fn fetch_records(&self, sql: &str, resource: ResourceType) -> SyncResult<Vec<Record>> {
        let rows = sqlx::query(sql)
            .bind(resource.watermark_key())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn resource_of(&self, local_id: LocalId) -> SyncResult<ResourceType> {
        let row = sqlx::query("SELECT resource FROM records WHERE local_id = ?")
            .bind(local_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("record {}", local_id)))?;
        parse_resource(&row.try_get::<String, _>("resource")?)
    }
}

fn parse_resource(key: &str) -> SyncResult<ResourceType> {
    ResourceType::from_key(key).ok_or_else(|| SyncError::Storage(format!("Unknown resource type: {}", key)))
}

fn parse_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("Invalid timestamp: {}", e)))
}

fn record_from_row(row: &SqliteRow) -> SyncResult<Record> {
    let local_id: i64 = row.try_get("local_id")?;
    let resource: String = row.try_get("resource")?;
    let last_updated: Option<String> = row.try_get("last_updated")?;
    let state: String = row.try_get("state")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let relations: String = row.try_get("relations")?;
    let payload: String = row.try_get("payload")?;

    Ok(Record {
        resource: parse_resource(&resource)?,
        local_id: Some(LocalId(local_id)),
        uid: row.try_get("uid")?,
        code: row.try_get("code")?,
        display_name: row.try_get("display_name")?,
        last_updated: last_updated.as_deref().map(parse_timestamp).transpose()?,
        state: SyncState::parse(&state)
            .ok_or_else(|| SyncError::Storage(format!("Unknown sync state: {}", state)))?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        relations: serde_json::from_str::<BTreeMap<String, LocalId>>(&relations)?,
        payload: serde_json::from_str(&payload)?,
    })
}

/// Open transaction on the pool. Rolled back by sqlx when dropped.
struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    changes: broadcast::Sender<StorageChange>,
    published: Vec<StorageChange>,
    receipt: CommitReceipt,
}

impl SqliteTransaction {
    /// Insert, or overwrite the row holding the same identifier unless it
    /// carries unsynced edits. Returns whether a row was written.
    async fn upsert(&mut self, record: &Record) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (
                resource, uid, code, display_name, last_updated,
                state, retry_count, last_error, relations, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(resource, uid) DO UPDATE SET
                code = excluded.code,
                display_name = excluded.display_name,
                last_updated = excluded.last_updated,
                state = excluded.state,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                relations = excluded.relations,
                payload = excluded.payload
            WHERE records.state = 'synced'
            "#,
        )
        .bind(record.resource.watermark_key())
        .bind(&record.uid)
        .bind(&record.code)
        .bind(&record.display_name)
        .bind(record.last_updated.map(|ts| ts.to_rfc3339()))
        .bind(record.state.as_str())
        .bind(i64::from(record.retry_count))
        .bind(&record.last_error)
        .bind(serde_json::to_string(&record.relations)?)
        .bind(record.payload.to_string())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    fn skip(&mut self, operation: &PendingWrite) -> SyncResult<()> {
        tracing::debug!(uid = %operation.uid(), "Local edit landed after the snapshot, keeping it");
        self.receipt.skipped += 1;
        Ok(())
    }

    async fn overwrite(&mut self, local_id: LocalId, record: &Record) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET uid = ?, code = ?, display_name = ?, last_updated = ?, state = ?,
                retry_count = ?, last_error = ?, relations = ?, payload = ?
            WHERE local_id = ?
            "#,
        )
        .bind(&record.uid)
        .bind(&record.code)
        .bind(&record.display_name)
        .bind(record.last_updated.map(|ts| ts.to_rfc3339()))
        .bind(record.state.as_str())
        .bind(i64::from(record.retry_count))
        .bind(&record.last_error)
        .bind(serde_json::to_string(&record.relations)?)
        .bind(record.payload.to_string())
        .bind(local_id.0)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Storage(format!("update target {} vanished", local_id)));
        }
        Ok(())
    }

    /// Overwrite only while the row still has the snapshot version.
    /// Returns whether the row was written.
    async fn overwrite_if_unchanged(
        &mut self,
        local_id: LocalId,
        record: &Record,
        expected: &RowVersion,
    ) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET uid = ?, code = ?, display_name = ?, last_updated = ?, state = ?,
                retry_count = ?, last_error = ?, relations = ?, payload = ?
            WHERE local_id = ? AND state = ? AND last_updated IS ?
            "#,
        )
        .bind(&record.uid)
        .bind(&record.code)
        .bind(&record.display_name)
        .bind(record.last_updated.map(|ts| ts.to_rfc3339()))
        .bind(record.state.as_str())
        .bind(i64::from(record.retry_count))
        .bind(&record.last_error)
        .bind(serde_json::to_string(&record.relations)?)
        .bind(record.payload.to_string())
        .bind(local_id.0)
        .bind(expected.state.as_str())
        .bind(expected.last_updated.map(|ts| ts.to_rfc3339()))
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM records WHERE local_id = ?")
            .bind(local_id.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(SyncError::Storage(format!("update target {} vanished", local_id))),
        }
    }
}

#[async_trait]
impl StorageTransaction for SqliteTransaction {
    async fn enqueue(&mut self, operation: PendingWrite) -> SyncResult<()> {
        let resource = operation.resource();
        let kind = match &operation {
            PendingWrite::Insert(record) => {
                if !self.upsert(record).await? {
                    return self.skip(&operation);
                }
                ChangeKind::Inserted
            }
            PendingWrite::Update {
                local_id,
                record,
                expected,
            } => {
                if !self.overwrite_if_unchanged(*local_id, record, expected).await? {
                    return self.skip(&operation);
                }
                ChangeKind::Updated
            }
            PendingWrite::Delete { local_id, .. } => {
                sqlx::query("DELETE FROM records WHERE local_id = ?")
                    .bind(local_id.0)
                    .execute(&mut *self.tx)
                    .await?;
                ChangeKind::Deleted
            }
        };
        self.receipt.record(operation.kind());
        self.published.push(StorageChange { resource, kind });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SyncResult<CommitReceipt> {
        let SqliteTransaction {
            tx,
            changes,
            published,
            receipt,
        } = *self;
        tx.commit().await?;
        for change in published {
            let _ = changes.send(change);
        }
        Ok(receipt)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn query_all(&self, resource: ResourceType) -> SyncResult<Vec<Record>> {
        let sql = format!("SELECT {} FROM records WHERE resource = ? ORDER BY local_id", RECORD_COLUMNS);
        self.fetch_records(&sql, resource).await
    }

    async fn query_by_uids(&self, resource: ResourceType, uids: &[String]) -> SyncResult<Vec<Record>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM records WHERE resource = ? AND uid IN ({}) ORDER BY local_id",
            RECORD_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql).bind(resource.watermark_key());
        for uid in uids {
            query = query.bind(uid);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn query_by_uid(&self, resource: ResourceType, uid: &str) -> SyncResult<Option<Record>> {
        let sql = format!("SELECT {} FROM records WHERE resource = ? AND uid = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(resource.watermark_key())
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn query_by_local_id(&self, local_id: LocalId) -> SyncResult<Option<Record>> {
        let sql = format!("SELECT {} FROM records WHERE local_id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql).bind(local_id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn query_pending(&self, resource: ResourceType) -> SyncResult<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM records WHERE resource = ? AND state != 'synced' ORDER BY local_id",
            RECORD_COLUMNS
        );
        self.fetch_records(&sql, resource).await
    }

    async fn local_id_for(&self, resource: ResourceType, uid: &str) -> SyncResult<Option<LocalId>> {
        let row = sqlx::query("SELECT local_id FROM records WHERE resource = ? AND uid = ?")
            .bind(resource.watermark_key())
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(LocalId(row.try_get("local_id")?)),
            None => None,
        })
    }

    async fn begin_transaction(&self) -> SyncResult<Box<dyn StorageTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction {
            tx,
            changes: self.changes.clone(),
            published: Vec::new(),
            receipt: CommitReceipt::default(),
        }))
    }

    async fn save_local(&self, mut record: Record) -> SyncResult<Record> {
        let mut tx = SqliteTransaction {
            tx: self.pool.begin().await?,
            changes: self.changes.clone(),
            published: Vec::new(),
            receipt: CommitReceipt::default(),
        };

        let kind = match record.local_id {
            Some(local_id) => {
                tx.overwrite(local_id, &record).await?;
                ChangeKind::Updated
            }
            None => {
                let existing = sqlx::query("SELECT local_id FROM records WHERE resource = ? AND uid = ?")
                    .bind(record.resource.watermark_key())
                    .bind(&record.uid)
                    .fetch_optional(&mut *tx.tx)
                    .await?;
                if existing.is_some() {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} {} is already stored",
                        record.resource, record.uid
                    )));
                }
                tx.upsert(&record).await?;
                let row = sqlx::query("SELECT local_id FROM records WHERE resource = ? AND uid = ?")
                    .bind(record.resource.watermark_key())
                    .bind(&record.uid)
                    .fetch_one(&mut *tx.tx)
                    .await?;
                record.local_id = Some(LocalId(row.try_get("local_id")?));
                ChangeKind::Inserted
            }
        };
        tx.tx.commit().await?;

        tracing::debug!(
            resource = %record.resource,
            uid = %record.uid,
            local_id = ?record.local_id,
            "Saved local record"
        );
        self.notify(record.resource, kind);
        Ok(record)
    }

    async fn replace_uid(&self, local_id: LocalId, uid: &str) -> SyncResult<()> {
        let resource = self.resource_of(local_id).await?;
        let mut tx = self.pool.begin().await?;

        // A server copy fetched under the new identifier is the same record
        sqlx::query("DELETE FROM records WHERE resource = ? AND uid = ? AND local_id != ?")
            .bind(resource.watermark_key())
            .bind(uid)
            .bind(local_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE records SET uid = ? WHERE local_id = ?")
            .bind(uid)
            .bind(local_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn mark_synced(&self, local_id: LocalId, last_updated: Option<DateTime<Utc>>) -> SyncResult<()> {
        let resource = self.resource_of(local_id).await?;
        sqlx::query(
            r#"
            UPDATE records
            SET state = 'synced',
                retry_count = 0,
                last_error = NULL,
                last_updated = COALESCE(?, last_updated)
            WHERE local_id = ?
            "#,
        )
        .bind(last_updated.map(|ts| ts.to_rfc3339()))
        .bind(local_id.0)
        .execute(&self.pool)
        .await?;

        tracing::debug!(local_id = %local_id, "Marked record as synced");
        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn mark_failed(&self, local_id: LocalId, error: &str) -> SyncResult<()> {
        let resource = self.resource_of(local_id).await?;
        sqlx::query(
            r#"
            UPDATE records
            SET state = 'failed',
                retry_count = retry_count + 1,
                last_error = ?
            WHERE local_id = ?
            "#,
        )
        .bind(error)
        .bind(local_id.0)
        .execute(&self.pool)
        .await?;

        tracing::warn!(local_id = %local_id, error = error, "Record push failed");
        self.notify(resource, ChangeKind::Updated);
        Ok(())
    }

    async fn delete_local(&self, local_id: LocalId) -> SyncResult<()> {
        let resource = self.resource_of(local_id).await?;
        sqlx::query("DELETE FROM records WHERE local_id = ?")
            .bind(local_id.0)
            .execute(&self.pool)
            .await?;
        self.notify(resource, ChangeKind::Deleted);
        Ok(())
    }

    async fn wipe(&self) -> SyncResult<()> {
        sqlx::query("DELETE FROM records").execute(&self.pool).await?;
        for resource in ResourceType::ALL {
            self.notify(resource, ChangeKind::Wiped);
        }
        tracing::info!("Wiped replica database");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn create_test_db() -> (SqliteStorage, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        let storage = SqliteStorage::new(SqliteConfig::new(db_path)).await.unwrap();
        (storage, temp_file)
    }

    fn event(uid: &str) -> Record {
        Record::remote(ResourceType::Events, uid)
            .with_last_updated(Utc::now())
            .with_payload(serde_json::json!({"status": "COMPLETED"}))
    }

    #[tokio::test]
    async fn test_database_creation() {
        let (db, _file) = create_test_db().await;
        assert!(db.query_all(ResourceType::Events).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_committed_batch_is_visible() {
        let (db, _file) = create_test_db().await;

        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Insert(event("ev1"))).await.unwrap();
        tx.enqueue(PendingWrite::Insert(event("ev2"))).await.unwrap();
        let receipt = tx.commit().await.unwrap();

        assert_eq!(receipt.inserted, 2);
        let stored = db.query_all(ResourceType::Events).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].payload["status"], "COMPLETED");
        assert!(stored[0].last_updated.is_some());
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_partial_writes() {
        let (db, _file) = create_test_db().await;

        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Insert(event("ev1"))).await.unwrap();
        let failed = tx
            .enqueue(PendingWrite::Update {
                local_id: LocalId(4242),
                record: event("ev2"),
                expected: RowVersion::of(&event("ev2")),
            })
            .await;
        assert!(failed.is_err());
        drop(tx);

        assert!(db.query_all(ResourceType::Events).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_keeps_local_id() {
        let (db, _file) = create_test_db().await;
        let saved = db.save_local(event("ev1")).await.unwrap();

        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Insert(event("ev1").with_name("again")))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let stored = db.query_by_uid(ResourceType::Events, "ev1").await.unwrap().unwrap();
        assert_eq!(stored.local_id, saved.local_id);
        assert_eq!(stored.display_name.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_update_skipped_when_row_changed_after_snapshot() {
        let (db, _file) = create_test_db().await;
        let snapshot = db.save_local(event("ev1")).await.unwrap();
        let local_id = snapshot.local_id.unwrap();

        let mut edited = snapshot.clone();
        edited.state = SyncState::Pending;
        edited.last_updated = Some(Utc::now());
        edited.payload = serde_json::json!({"status": "ACTIVE"});
        db.save_local(edited).await.unwrap();

        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Update {
            local_id,
            record: event("ev1"),
            expected: RowVersion::of(&snapshot),
        })
        .await
        .unwrap();
        let receipt = tx.commit().await.unwrap();

        assert_eq!(receipt.skipped, 1);
        let stored = db.query_by_local_id(local_id).await.unwrap().unwrap();
        assert_eq!(stored.state, SyncState::Pending);
        assert_eq!(stored.payload["status"], "ACTIVE");

        // Against the current version the same write goes through
        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Update {
            local_id,
            record: event("ev1"),
            expected: RowVersion::of(&stored),
        })
        .await
        .unwrap();
        assert_eq!(tx.commit().await.unwrap().updated, 1);
        let replaced = db.query_by_local_id(local_id).await.unwrap().unwrap();
        assert_eq!(replaced.state, SyncState::Synced);
        assert_eq!(replaced.payload["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_upsert_leaves_dirty_row_alone() {
        let (db, _file) = create_test_db().await;
        let mut dirty = event("ev1");
        dirty.state = SyncState::Pending;
        db.save_local(dirty).await.unwrap();

        let mut tx = db.begin_transaction().await.unwrap();
        tx.enqueue(PendingWrite::Insert(event("ev1").with_name("server")))
            .await
            .unwrap();
        let receipt = tx.commit().await.unwrap();

        assert_eq!(receipt.skipped, 1);
        let stored = db.query_by_uid(ResourceType::Events, "ev1").await.unwrap().unwrap();
        assert_eq!(stored.display_name, None);
        assert_eq!(stored.state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_relations_survive_round_trip() {
        let (db, _file) = create_test_db().await;
        let saved = db
            .save_local(event("ev1").with_relation("program", LocalId(3)))
            .await
            .unwrap();
        let stored = db.query_by_local_id(saved.local_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.relations.get("program"), Some(&LocalId(3)));
    }

    #[tokio::test]
    async fn test_replace_uid_and_lookup() {
        let (db, _file) = create_test_db().await;
        let saved = db
            .save_local(Record::local(ResourceType::Events, serde_json::json!({})))
            .await
            .unwrap();
        let local_id = saved.local_id.unwrap();

        db.replace_uid(local_id, "srv_9").await.unwrap();

        assert_eq!(db.local_id_for(ResourceType::Events, "srv_9").await.unwrap(), Some(local_id));
        assert_eq!(db.local_id_for(ResourceType::Events, &saved.uid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_failed() {
        let (db, _file) = create_test_db().await;
        let saved = db
            .save_local(Record::local(ResourceType::Events, serde_json::json!({})))
            .await
            .unwrap();
        let local_id = saved.local_id.unwrap();

        db.mark_failed(local_id, "Network error").await.unwrap();

        let pending = db.query_pending(ResourceType::Events).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error, Some("Network error".to_string()));

        db.mark_synced(local_id, None).await.unwrap();
        assert!(db.query_pending(ResourceType::Events).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_by_uids() {
        let (db, _file) = create_test_db().await;
        for uid in ["a", "b", "c"] {
            db.save_local(event(uid)).await.unwrap();
        }
        let subset = db
            .query_by_uids(ResourceType::Events, &["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(subset.len(), 2);
        assert!(db.query_by_uids(ResourceType::Events, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_store() {
        let (db, _file) = create_test_db().await;
        db.set("watermark:events", "2024-01-01T00:00:00Z").await.unwrap();
        db.set("watermark:events", "2024-02-01T00:00:00Z").await.unwrap();
        db.set("loaded:events", "true").await.unwrap();

        assert_eq!(
            db.get("watermark:events").await.unwrap().as_deref(),
            Some("2024-02-01T00:00:00Z")
        );

        db.remove_prefix("watermark:").await.unwrap();
        assert_eq!(db.get("watermark:events").await.unwrap(), None);
        assert_eq!(db.get("loaded:events").await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_secure_delete_enabled() {
        let (db, _file) = create_test_db().await;
        let row = sqlx::query("PRAGMA secure_delete").fetch_one(db.pool()).await.unwrap();
        let secure_delete: i64 = row.try_get(0).unwrap();
        assert_eq!(secure_delete, 1, "secure_delete should be enabled");
    }

    #[tokio::test]
    async fn test_wipe_then_vacuum() {
        let (db, _file) = create_test_db().await;
        let mut changes = db.subscribe();
        for i in 0..10 {
            db.save_local(event(&format!("ev{}", i))).await.unwrap();
        }
        db.wipe().await.unwrap();
        db.vacuum().await.unwrap();

        assert!(db.query_all(ResourceType::Events).await.unwrap().is_empty());
        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Inserted);
    }
}
