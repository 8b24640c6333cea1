//! Local-record lifecycle
//!
//! Records created on the device get a temporary identifier and are
//! persisted at once so dependents can point at their surrogate key. A push
//! swaps the temporary identifier for the server-assigned one in place; the
//! surrogate key, and so every foreign key pointing at the row, stays put.

use crate::api::ApiClient;
use crate::controller::attach_relations;
use crate::error::{SyncError, SyncResult};
use crate::model::{is_temporary_uid, Identifiable, LocalId, Record, SyncState};
use crate::resource::{ResourceCategory, ResourceType};
use crate::storage::Storage;
use crate::wire;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of one push cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    /// Left pending because a referenced parent has no permanent id yet
    pub deferred: usize,
}

pub struct LocalRecords {
    storage: Arc<dyn Storage>,
    api: Arc<dyn ApiClient>,
    /// Surrogate key to current global identifier
    identities: DashMap<LocalId, String>,
}

impl LocalRecords {
    pub fn new(storage: Arc<dyn Storage>, api: Arc<dyn ApiClient>) -> Self {
        Self {
            storage,
            api,
            identities: DashMap::new(),
        }
    }

    async fn load(&self, local_id: LocalId) -> SyncResult<Record> {
        self.storage
            .query_by_local_id(local_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("record {}", local_id)))
    }

    /// Create a record offline. Reference fields in `payload` may name
    /// server records or other local records by identifier; both are stored
    /// as surrogate keys.
    pub async fn create(&self, resource: ResourceType, payload: serde_json::Value) -> SyncResult<Record> {
        if resource.category() != ResourceCategory::DataValues {
            return Err(SyncError::InvalidOperation(format!(
                "{} is server-defined and cannot be created locally",
                resource
            )));
        }
        let mut record = Record::local(resource, payload);
        attach_relations(self.storage.as_ref(), &mut record).await?;
        let saved = self.storage.save_local(record).await?;

        if let Some(local_id) = saved.local_id {
            self.identities.insert(local_id, saved.uid.clone());
            tracing::debug!(resource = %resource, local_id = %local_id, "Created local record");
        }
        Ok(saved)
    }

    /// Replace the payload of a record and queue it for upload. A reference
    /// field present in `payload` replaces the stored relation; absent ones
    /// keep it.
    pub async fn update(&self, local_id: LocalId, payload: serde_json::Value) -> SyncResult<Record> {
        let mut record = self.load(local_id).await?;
        record.payload = payload;
        for reference in record.resource.references() {
            if record.payload.get(reference.field).is_some() {
                record.relations.remove(reference.field);
            }
        }
        attach_relations(self.storage.as_ref(), &mut record).await?;
        record.state = SyncState::Pending;
        record.last_updated = Some(Utc::now());
        self.storage.save_local(record).await
    }

    /// Delete a record the server has never seen
    pub async fn delete(&self, local_id: LocalId) -> SyncResult<()> {
        let record = self.load(local_id).await?;
        if !record.is_temporary() {
            return Err(SyncError::InvalidOperation(format!(
                "{} {} is known to the server and cannot be deleted locally",
                record.resource, record.uid
            )));
        }
        self.storage.delete_local(local_id).await?;
        self.identities.remove(&local_id);
        Ok(())
    }

    /// Current global identifier of a row, temporary or permanent
    pub async fn resolve_uid(&self, local_id: LocalId) -> SyncResult<String> {
        if let Some(uid) = self.identities.get(&local_id) {
            return Ok(uid.clone());
        }
        let record = self.load(local_id).await?;
        self.identities.insert(local_id, record.uid.clone());
        Ok(record.uid)
    }

    /// Forget cached identities, after a wipe
    pub fn clear_cache(&self) {
        self.identities.clear();
    }

    /// Global identifiers for every relation of `record`, or `None` when a
    /// referenced parent still carries a temporary identifier
    async fn outbound_references(&self, record: &Record) -> SyncResult<Option<BTreeMap<String, String>>> {
        let mut references = BTreeMap::new();
        for (field, target) in &record.relations {
            let uid = match self.resolve_uid(*target).await {
                Ok(uid) => uid,
                Err(SyncError::NotFound(_)) => {
                    tracing::warn!(field = %field, target = %target, "Dangling reference, sending without it");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if is_temporary_uid(&uid) {
                return Ok(None);
            }
            references.insert(field.clone(), uid);
        }
        Ok(Some(references))
    }

    /// Push every pending record, parents before children.
    ///
    /// `NetworkUnavailable` and `Unauthorized` stop the cycle and are
    /// returned; other API errors mark only the offending record failed.
    pub async fn push_pending(&self) -> SyncResult<PushReport> {
        let mut report = PushReport::default();

        for resource in ResourceType::sync_order(ResourceCategory::DataValues) {
            for record in self.storage.query_pending(resource).await? {
                let Some(local_id) = record.local_id else {
                    continue;
                };
                let Some(references) = self.outbound_references(&record).await? else {
                    tracing::debug!(resource = %resource, local_id = %local_id, "Parent not pushed yet, deferring");
                    report.deferred += 1;
                    continue;
                };

                let payload = wire::record_to_wire(&record, &references);
                match self.api.push(resource, &payload).await {
                    Ok(receipt) => {
                        if record.uid != receipt.assigned_id {
                            self.storage.replace_uid(local_id, &receipt.assigned_id).await?;
                            self.identities.insert(local_id, receipt.assigned_id.clone());
                        }
                        self.storage.mark_synced(local_id, None).await?;
                        report.pushed += 1;
                        tracing::debug!(
                            resource = %resource,
                            local_id = %local_id,
                            uid = %receipt.assigned_id,
                            "Pushed record"
                        );
                    }
                    Err(e) if e.aborts_batch() => {
                        tracing::warn!(error = %e, pushed = report.pushed, "Push aborted");
                        return Err(e.into());
                    }
                    Err(e) => {
                        self.storage.mark_failed(local_id, &e.to_string()).await?;
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            pushed = report.pushed,
            failed = report.failed,
            deferred = report.deferred,
            "Push cycle finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Credentials;
    use crate::error::{ApiError, ApiResult};
    use crate::model::{ExistenceEntry, PushReceipt, UserAccount};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Answers pushes from a script and keeps what it was sent
    #[derive(Default)]
    struct PushServer {
        answers: Mutex<VecDeque<ApiResult<PushReceipt>>>,
        received: Mutex<Vec<(ResourceType, Value)>>,
    }

    impl PushServer {
        fn answering(answers: Vec<ApiResult<PushReceipt>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    fn assigned(id: &str) -> ApiResult<PushReceipt> {
        Ok(PushReceipt {
            assigned_id: id.to_string(),
        })
    }

    #[async_trait]
    impl ApiClient for PushServer {
        async fn authenticate(&self, _credentials: &Credentials) -> ApiResult<UserAccount> {
            Err(ApiError::Unauthorized)
        }

        fn set_credentials(&self, _credentials: Option<Credentials>) {}

        async fn server_time(&self) -> ApiResult<DateTime<Utc>> {
            Ok(Utc::now())
        }

        async fn fetch_existence(&self, _: ResourceType, _: Option<&[String]>) -> ApiResult<Vec<ExistenceEntry>> {
            Ok(Vec::new())
        }

        async fn fetch_updated(
            &self,
            _: ResourceType,
            _: Option<DateTime<Utc>>,
            _: Option<&[String]>,
        ) -> ApiResult<Vec<Record>> {
            Ok(Vec::new())
        }

        async fn push(&self, resource: ResourceType, payload: &Value) -> ApiResult<PushReceipt> {
            self.received.lock().push((resource, payload.clone()));
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::NetworkUnavailable("script exhausted".to_string())))
        }
    }

    fn setup(server: Arc<PushServer>) -> (LocalRecords, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (LocalRecords::new(storage.clone(), server), storage)
    }

    #[tokio::test]
    async fn test_create_assigns_temporary_id_and_local_id() {
        let (records, _storage) = setup(PushServer::answering(vec![]));
        let event = records.create(ResourceType::Events, json!({"status": "ACTIVE"})).await.unwrap();

        assert!(event.is_temporary());
        let local_id = event.local_id.unwrap();
        assert_eq!(records.resolve_uid(local_id).await.unwrap(), event.uid);
    }

    #[tokio::test]
    async fn test_metadata_cannot_be_created_locally() {
        let (records, _storage) = setup(PushServer::answering(vec![]));
        let result = records.create(ResourceType::Programs, json!({})).await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_child_points_at_parent_surrogate_key() {
        let (records, _storage) = setup(PushServer::answering(vec![]));
        let event = records.create(ResourceType::Events, json!({})).await.unwrap();
        let value = records
            .create(ResourceType::DataValues, json!({"event": event.uid, "value": "12"}))
            .await
            .unwrap();

        assert_eq!(value.relations.get("event"), event.local_id.as_ref());
        assert!(value.payload.get("event").is_none());
    }

    #[tokio::test]
    async fn test_push_replaces_temporary_id_in_place() {
        let server = PushServer::answering(vec![assigned("srv_9")]);
        let (records, storage) = setup(server.clone());
        let event = records.create(ResourceType::Events, json!({"status": "ACTIVE"})).await.unwrap();
        let local_id = event.local_id.unwrap();

        let report = records.push_pending().await.unwrap();

        assert_eq!(report.pushed, 1);
        let stored = storage.query_by_local_id(local_id).await.unwrap().unwrap();
        assert_eq!(stored.uid, "srv_9");
        assert_eq!(stored.state, SyncState::Synced);
        assert_eq!(records.resolve_uid(local_id).await.unwrap(), "srv_9");
        // The temporary id never reaches the server
        let received = server.received.lock();
        assert!(received[0].1.get("event").is_none());
    }

    #[tokio::test]
    async fn test_children_follow_parents_in_one_cycle() {
        let server = PushServer::answering(vec![assigned("srv_ev"), assigned("srv_dv")]);
        let (records, _storage) = setup(server.clone());
        let event = records.create(ResourceType::Events, json!({})).await.unwrap();
        records
            .create(ResourceType::DataValues, json!({"event": event.uid}))
            .await
            .unwrap();

        let report = records.push_pending().await.unwrap();

        assert_eq!(report.pushed, 2);
        let received = server.received.lock();
        assert_eq!(received[0].0, ResourceType::Events);
        assert_eq!(received[1].1["event"], "srv_ev");
    }

    #[tokio::test]
    async fn test_child_of_failed_parent_is_deferred() {
        let server = PushServer::answering(vec![Err(ApiError::ServerError {
            status: 409,
            message: "conflict".to_string(),
        })]);
        let (records, storage) = setup(server);
        let event = records.create(ResourceType::Events, json!({})).await.unwrap();
        let value = records
            .create(ResourceType::DataValues, json!({"event": event.uid}))
            .await
            .unwrap();

        let report = records.push_pending().await.unwrap();

        assert_eq!(report, PushReport { pushed: 0, failed: 1, deferred: 1 });
        let failed = storage.query_by_local_id(event.local_id.unwrap()).await.unwrap().unwrap();
        assert!(failed.is_temporary());
        assert_eq!(failed.state, SyncState::Failed);
        assert_eq!(failed.retry_count, 1);
        let child = storage.query_by_local_id(value.local_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(child.state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_network_loss_aborts_push() {
        let server = PushServer::answering(vec![Err(ApiError::NetworkUnavailable("offline".to_string()))]);
        let (records, storage) = setup(server.clone());
        let first = records.create(ResourceType::Events, json!({})).await.unwrap();
        records.create(ResourceType::Events, json!({})).await.unwrap();

        let result = records.push_pending().await;

        assert!(matches!(result, Err(SyncError::Api(ApiError::NetworkUnavailable(_)))));
        assert_eq!(server.received.lock().len(), 1);
        let untouched = storage.query_by_local_id(first.local_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(untouched.state, SyncState::Pending);
        assert_eq!(untouched.retry_count, 0);
    }

    #[tokio::test]
    async fn test_only_unsent_records_can_be_deleted() {
        let server = PushServer::answering(vec![assigned("srv_1")]);
        let (records, storage) = setup(server);
        let pushed = records.create(ResourceType::Events, json!({})).await.unwrap();
        records.push_pending().await.unwrap();
        let draft = records.create(ResourceType::Events, json!({})).await.unwrap();

        assert!(records.delete(pushed.local_id.unwrap()).await.is_err());
        records.delete(draft.local_id.unwrap()).await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_repointed_reference_is_pushed() {
        let server = PushServer::answering(vec![assigned("srv_ev"), assigned("srv_dv")]);
        let (records, _storage) = setup(server.clone());
        let event = records.create(ResourceType::Events, json!({})).await.unwrap();
        let value = records
            .create(ResourceType::DataValues, json!({"event": event.uid, "value": "12"}))
            .await
            .unwrap();

        let edited = records
            .update(value.local_id.unwrap(), json!({"event": "srv_other", "value": "13"}))
            .await
            .unwrap();
        assert!(edited.relations.get("event").is_none());

        records.push_pending().await.unwrap();

        let received = server.received.lock();
        let (resource, payload) = &received[1];
        assert_eq!(*resource, ResourceType::DataValues);
        assert_eq!(payload["event"], "srv_other");
        assert_eq!(payload["value"], "13");
    }

    #[tokio::test]
    async fn test_update_without_reference_keeps_relation() {
        let (records, _storage) = setup(PushServer::answering(vec![]));
        let event = records.create(ResourceType::Events, json!({})).await.unwrap();
        let value = records
            .create(ResourceType::DataValues, json!({"event": event.uid, "value": "12"}))
            .await
            .unwrap();

        let edited = records
            .update(value.local_id.unwrap(), json!({"value": "14"}))
            .await
            .unwrap();

        assert_eq!(edited.relations.get("event"), event.local_id.as_ref());
    }

    #[tokio::test]
    async fn test_update_marks_pending() {
        let server = PushServer::answering(vec![assigned("srv_1")]);
        let (records, _storage) = setup(server);
        let event = records.create(ResourceType::Events, json!({"status": "ACTIVE"})).await.unwrap();
        records.push_pending().await.unwrap();

        let edited = records
            .update(event.local_id.unwrap(), json!({"status": "COMPLETED"}))
            .await
            .unwrap();

        assert_eq!(edited.uid, "srv_1");
        assert_eq!(edited.state, SyncState::Pending);
        assert_eq!(edited.payload["status"], "COMPLETED");
    }
}
