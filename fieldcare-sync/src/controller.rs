//! Resource sync controller
//!
//! One instance per resource type. A sync cycle is:
//! 1. Capture server time (before anything is fetched)
//! 2. Fetch the existence listing and the records updated since the watermark
//! 3. Resolve foreign keys to local surrogate keys
//! 4. Reconcile against the local snapshot
//! 5. Commit the result as one transaction
//! 6. Advance the watermark to the time captured in step 1
//!
//! Any failure before step 6 leaves the watermark untouched.

use crate::api::ApiClient;
use crate::error::SyncResult;
use crate::model::Record;
use crate::reconcile::reconcile;
use crate::resource::ResourceType;
use crate::storage::{CommitReceipt, Storage};
use crate::watermark::{ClockSource, WatermarkStore};
use crate::wire::reference_uid;
use crate::write_queue::WriteQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Fetch only what changed after the stored watermark
    #[default]
    Default,
    /// Ignore the watermark and fetch every record
    DownloadAll,
}

/// Outcome of one controller run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub fetched: usize,
    pub receipt: CommitReceipt,
    /// Server-reported watermark after the run; `None` for subset runs
    pub watermark: Option<DateTime<Utc>>,
}

/// Uniform sync contract shared by every resource type
#[async_trait]
pub trait ResourceController: Send + Sync {
    fn resource(&self) -> ResourceType;

    async fn sync(&self, strategy: SyncStrategy) -> SyncResult<SyncReport>;

    /// Re-fetch an explicit set of records. Does not move the watermark.
    async fn sync_subset(&self, strategy: SyncStrategy, uids: &[String]) -> SyncResult<SyncReport>;
}

/// Move reference fields that point at locally known records out of the
/// payload and into `relations`. References to records not stored yet stay
/// in the payload.
pub async fn attach_relations(storage: &dyn Storage, record: &mut Record) -> SyncResult<()> {
    for reference in record.resource.references() {
        let Some(uid) = record
            .payload
            .get(reference.field)
            .and_then(reference_uid)
            .map(str::to_string)
        else {
            continue;
        };
        if let Some(local_id) = storage.local_id_for(reference.target, &uid).await? {
            record.relations.insert(reference.field.to_string(), local_id);
            if let Some(object) = record.payload.as_object_mut() {
                object.remove(reference.field);
            }
        }
    }
    Ok(())
}

pub struct ResourceSyncController {
    resource: ResourceType,
    api: Arc<dyn ApiClient>,
    storage: Arc<dyn Storage>,
    queue: WriteQueue,
    watermarks: WatermarkStore,
}

impl ResourceSyncController {
    pub fn new(
        resource: ResourceType,
        api: Arc<dyn ApiClient>,
        storage: Arc<dyn Storage>,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            resource,
            api,
            queue: WriteQueue::new(Arc::clone(&storage)),
            storage,
            watermarks,
        }
    }

    async fn with_relations(&self, mut records: Vec<Record>) -> SyncResult<Vec<Record>> {
        for record in &mut records {
            attach_relations(self.storage.as_ref(), record).await?;
        }
        Ok(records)
    }
}

#[async_trait]
impl ResourceController for ResourceSyncController {
    fn resource(&self) -> ResourceType {
        self.resource
    }

    #[tracing::instrument(skip(self), fields(resource = %self.resource))]
    async fn sync(&self, strategy: SyncStrategy) -> SyncResult<SyncReport> {
        let resource = self.resource;
        let server_time = self.api.server_time().await?;
        let since = match strategy {
            SyncStrategy::Default => self.watermarks.get(resource, ClockSource::ServerReported).await?,
            SyncStrategy::DownloadAll => None,
        };

        let existence = self.api.fetch_existence(resource, None).await?;
        let updated = self.api.fetch_updated(resource, since, None).await?;
        let fetched = updated.len();
        tracing::debug!(
            existing = existence.len(),
            updated = fetched,
            since = ?since,
            "Fetched listings"
        );

        let updated = self.with_relations(updated).await?;
        let local = self.storage.query_all(resource).await?;
        let operations = reconcile(&existence, updated, &local);
        let receipt = self.queue.submit(resource, operations).await?;

        let watermark = self
            .watermarks
            .advance(resource, ClockSource::ServerReported, server_time)
            .await?;
        self.watermarks.set(resource, ClockSource::DeviceLocal, Utc::now()).await?;

        tracing::info!(
            inserted = receipt.inserted,
            updated = receipt.updated,
            deleted = receipt.deleted,
            watermark = %watermark,
            "Resource synced"
        );

        Ok(SyncReport {
            fetched,
            receipt,
            watermark: Some(watermark),
        })
    }

    #[tracing::instrument(skip(self, uids), fields(resource = %self.resource, count = uids.len()))]
    async fn sync_subset(&self, _strategy: SyncStrategy, uids: &[String]) -> SyncResult<SyncReport> {
        let resource = self.resource;
        if uids.is_empty() {
            return Ok(SyncReport::default());
        }
        let existence = self.api.fetch_existence(resource, Some(uids)).await?;
        // A targeted refresh wants the current copy whatever the watermark says
        let updated = self.api.fetch_updated(resource, None, Some(uids)).await?;
        let fetched = updated.len();

        let updated = self.with_relations(updated).await?;
        let local = self.storage.query_by_uids(resource, uids).await?;
        let operations = reconcile(&existence, updated, &local);
        let receipt = self.queue.submit(resource, operations).await?;

        tracing::debug!(total = receipt.total(), "Subset synced");

        Ok(SyncReport {
            fetched,
            receipt,
            watermark: None,
        })
    }
}
