//! Watermark store: last-synced timestamp per resource type and clock source

use crate::error::{SyncError, SyncResult};
use crate::keyvalue::KeyValueStore;
use crate::resource::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const KEY_PREFIX: &str = "watermark:";

/// Which clock produced a watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Server time captured before the fetch; bounds "updated since" queries
    ServerReported,
    /// Device time of the last successful sync; informational
    DeviceLocal,
}

impl ClockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockSource::ServerReported => "server",
            ClockSource::DeviceLocal => "device",
        }
    }
}

#[derive(Clone)]
pub struct WatermarkStore {
    kv: Arc<dyn KeyValueStore>,
}

impl WatermarkStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(resource: ResourceType, clock: ClockSource) -> String {
        format!("{}{}:{}", KEY_PREFIX, resource.watermark_key(), clock.as_str())
    }

    pub async fn get(&self, resource: ResourceType, clock: ClockSource) -> SyncResult<Option<DateTime<Utc>>> {
        match self.kv.get(&Self::key(resource, clock)).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|e| SyncError::Storage(format!("Corrupt watermark for {}: {}", resource, e))),
            None => Ok(None),
        }
    }

    pub async fn set(&self, resource: ResourceType, clock: ClockSource, at: DateTime<Utc>) -> SyncResult<()> {
        self.kv.set(&Self::key(resource, clock), &at.to_rfc3339()).await
    }

    /// Move the watermark forward. A value older than the stored one is
    /// ignored, so the watermark never decreases. Returns the stored value.
    pub async fn advance(
        &self,
        resource: ResourceType,
        clock: ClockSource,
        at: DateTime<Utc>,
    ) -> SyncResult<DateTime<Utc>> {
        if let Some(current) = self.get(resource, clock).await? {
            if at < current {
                tracing::warn!(
                    resource = %resource,
                    clock = clock.as_str(),
                    stored = %current,
                    reported = %at,
                    "Clock went backwards, keeping stored watermark"
                );
                return Ok(current);
            }
        }
        self.set(resource, clock, at).await?;
        Ok(at)
    }

    /// Forget every watermark so the next sync is a full fetch
    pub async fn reset_all(&self) -> SyncResult<()> {
        self.kv.remove_prefix(KEY_PREFIX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvalue::MemoryKeyValueStore;
    use chrono::Duration;

    fn store() -> WatermarkStore {
        WatermarkStore::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn test_unset_watermark_is_none() {
        let watermarks = store();
        assert_eq!(
            watermarks.get(ResourceType::Programs, ClockSource::ServerReported).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_clock_sources_are_independent() {
        let watermarks = store();
        let server = Utc::now() - Duration::minutes(5);
        let device = Utc::now();
        watermarks.set(ResourceType::Events, ClockSource::ServerReported, server).await.unwrap();
        watermarks.set(ResourceType::Events, ClockSource::DeviceLocal, device).await.unwrap();

        assert_eq!(
            watermarks.get(ResourceType::Events, ClockSource::ServerReported).await.unwrap(),
            Some(server)
        );
        assert_eq!(
            watermarks.get(ResourceType::Events, ClockSource::DeviceLocal).await.unwrap(),
            Some(device)
        );
    }

    #[tokio::test]
    async fn test_advance_never_decreases() {
        let watermarks = store();
        let later = Utc::now();
        let earlier = later - Duration::hours(1);

        watermarks.advance(ResourceType::Programs, ClockSource::ServerReported, later).await.unwrap();
        let kept = watermarks
            .advance(ResourceType::Programs, ClockSource::ServerReported, earlier)
            .await
            .unwrap();

        assert_eq!(kept, later);
        assert_eq!(
            watermarks.get(ResourceType::Programs, ClockSource::ServerReported).await.unwrap(),
            Some(later)
        );
    }

    #[tokio::test]
    async fn test_reset_all() {
        let watermarks = store();
        for rt in [ResourceType::Programs, ResourceType::Events] {
            watermarks.set(rt, ClockSource::ServerReported, Utc::now()).await.unwrap();
        }
        watermarks.reset_all().await.unwrap();
        for rt in [ResourceType::Programs, ResourceType::Events] {
            assert_eq!(watermarks.get(rt, ClockSource::ServerReported).await.unwrap(), None);
        }
    }
}
