//! Shared fixtures: an in-process server fake and an engine wired to it

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use fieldcare_sync::{
    ApiClient, ApiError, ApiResult, Credentials, ExistenceEntry, KeyValueStore, MemoryCredentialStore,
    MemoryKeyValueStore, MemoryStorage, PushReceipt, Record, ResourceType, Storage, SyncConfig, SyncEngine,
    SyncEvent, UserAccount,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const PASSWORD: &str = "district";

/// Server fake with a ticking clock. Every `server_time` call returns the
/// current clock and moves it one second forward, so anything stamped
/// afterwards is strictly newer than the reported time.
pub struct FakeServer {
    clock: Mutex<DateTime<Utc>>,
    records: Mutex<BTreeMap<ResourceType, Vec<Record>>>,
    failing: Mutex<BTreeMap<ResourceType, ApiError>>,
    push_ids: Mutex<VecDeque<String>>,
    delay: Mutex<Duration>,
    pub reported: Mutex<Vec<DateTime<Utc>>>,
    pub fetches: Mutex<Vec<(ResourceType, Option<DateTime<Utc>>)>>,
    pub pushes: Mutex<Vec<(ResourceType, Value)>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()),
            records: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeMap::new()),
            push_ids: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            reported: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock()
    }

    /// Store or replace a record, stamped with the current clock
    pub fn put(&self, resource: ResourceType, uid: &str, name: &str, payload: Value) {
        let record = Record::remote(resource, uid)
            .with_name(name)
            .with_last_updated(self.now())
            .with_payload(payload);
        let mut records = self.records.lock();
        let list = records.entry(resource).or_default();
        list.retain(|r| r.uid != uid);
        list.push(record);
    }

    pub fn remove(&self, resource: ResourceType, uid: &str) {
        if let Some(list) = self.records.lock().get_mut(&resource) {
            list.retain(|r| r.uid != uid);
        }
    }

    /// Answer every request for `resource` with a server error
    pub fn fail(&self, resource: ResourceType) {
        self.fail_with(
            resource,
            ApiError::ServerError {
                status: 500,
                message: format!("{} unavailable", resource),
            },
        );
    }

    pub fn fail_with(&self, resource: ResourceType, error: ApiError) {
        self.failing.lock().insert(resource, error);
    }

    pub fn heal(&self, resource: ResourceType) {
        self.failing.lock().remove(&resource);
    }

    pub fn assign_ids(&self, ids: &[&str]) {
        self.push_ids.lock().extend(ids.iter().map(|id| id.to_string()));
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Basic metadata: one organisation unit, one program with one stage
    pub fn seed_metadata(&self) {
        self.put(ResourceType::OrganisationUnits, "ou_1", "Ngelehun CHC", Value::Null);
        self.put(
            ResourceType::Programs,
            "prg_1",
            "Antenatal care",
            serde_json::json!({ "programType": "WITHOUT_REGISTRATION" }),
        );
        self.put(
            ResourceType::ProgramStages,
            "ps_1",
            "ANC visit",
            serde_json::json!({ "program": "prg_1" }),
        );
    }

    fn check(&self, resource: ResourceType) -> ApiResult<()> {
        match self.failing.lock().get(&resource) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn matching(&self, resource: ResourceType, uids: Option<&[String]>) -> Vec<Record> {
        self.records
            .lock()
            .get(&resource)
            .map(|list| {
                list.iter()
                    .filter(|r| uids.map_or(true, |uids| uids.contains(&r.uid)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApiClient for FakeServer {
    async fn authenticate(&self, credentials: &Credentials) -> ApiResult<UserAccount> {
        use secrecy::ExposeSecret;
        if credentials.password().expose_secret() != PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        Ok(UserAccount {
            id: format!("user_{}", credentials.username),
            username: Some(credentials.username.clone()),
            display_name: None,
        })
    }

    fn set_credentials(&self, _credentials: Option<Credentials>) {}

    async fn server_time(&self) -> ApiResult<DateTime<Utc>> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut clock = self.clock.lock();
        let reported = *clock;
        *clock = reported + ChronoDuration::seconds(1);
        self.reported.lock().push(reported);
        Ok(reported)
    }

    async fn fetch_existence(
        &self,
        resource: ResourceType,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<ExistenceEntry>> {
        self.check(resource)?;
        Ok(self.matching(resource, uids).iter().map(ExistenceEntry::from).collect())
    }

    async fn fetch_updated(
        &self,
        resource: ResourceType,
        since: Option<DateTime<Utc>>,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<Record>> {
        self.check(resource)?;
        self.fetches.lock().push((resource, since));
        Ok(self
            .matching(resource, uids)
            .into_iter()
            .filter(|r| since.map_or(true, |since| r.last_updated > Some(since)))
            .collect())
    }

    async fn push(&self, resource: ResourceType, payload: &Value) -> ApiResult<PushReceipt> {
        self.check(resource)?;
        let assigned_id = self
            .push_ids
            .lock()
            .pop_front()
            .ok_or_else(|| ApiError::MalformedResponse("no identifier left to assign".to_string()))?;
        self.pushes.lock().push((resource, payload.clone()));

        let mut echoed = payload.clone();
        if let Some(object) = echoed.as_object_mut() {
            object.insert(resource.id_field().to_string(), Value::String(assigned_id.clone()));
        }
        self.put(resource, &assigned_id, "", echoed);
        Ok(PushReceipt { assigned_id })
    }
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub storage: Arc<MemoryStorage>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub engine: SyncEngine,
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        quiescence_window: Duration::from_millis(20),
        event_capacity: 256,
        ..SyncConfig::default()
    }
}

impl Harness {
    pub fn new(server: Arc<FakeServer>) -> Self {
        Self::with_config(server, test_config())
    }

    pub fn with_config(server: Arc<FakeServer>, config: SyncConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        let api: Arc<dyn ApiClient> = server.clone();
        let shared_storage: Arc<dyn Storage> = storage.clone();
        let shared_kv: Arc<dyn KeyValueStore> = kv.clone();
        let engine = SyncEngine::new(
            config,
            api,
            shared_storage,
            shared_kv,
            Arc::new(MemoryCredentialStore::new()),
        );
        Self {
            server,
            storage,
            kv,
            engine,
        }
    }
}

/// Next event matching `pick`, failing the test after a few seconds
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<SyncEvent>,
    mut pick: impl FnMut(&SyncEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

/// Everything already published, without waiting
pub fn drain_events(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
