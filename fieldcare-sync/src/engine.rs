//! Dependency-ordered orchestrator
//!
//! [`SyncEngine`] is the explicit context object owning every controller,
//! the in-flight guard and the phase state machine:
//!
//! ```text
//! idle -> loading-metadata -> loading-data-values -> finishing -> idle
//!              |
//!              +-> failed -> (retry) loading-metadata | (cancel) idle
//! ```
//!
//! Entry points never block the caller. A cycle runs on a spawned task and
//! reports through [`SyncEvent`]s; a call made while a cycle is in flight is
//! dropped, not queued.

use crate::api::{ApiClient, Credentials};
use crate::config::SyncConfig;
use crate::controller::{ResourceController, ResourceSyncController, SyncReport, SyncStrategy};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent, SyncPhase};
use crate::gate::CompletionGate;
use crate::http::HttpApiClient;
use crate::keyvalue::KeyValueStore;
use crate::lifecycle::{LocalRecords, PushReport};
use crate::model::UserAccount;
use crate::preferences::{Preferences, UpdateFrequency};
use crate::resource::{ResourceCategory, ResourceType};
use crate::scheduler::PeriodicSynchronizer;
use crate::session::{CredentialStore, MemoryCredentialStore};
use crate::sqlite::{SqliteConfig, SqliteStorage};
use crate::storage::Storage;
use crate::watermark::WatermarkStore;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Answer to [`SyncEvent::DecisionRequired`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Restart metadata loading from the top of the order
    Retry,
    /// Abandon the load; committed resource types are kept
    Cancel,
}

/// Result of running one category of controllers
#[derive(Debug, Default)]
struct CategoryOutcome {
    failed: Vec<ResourceType>,
    first_error: Option<String>,
}

impl CategoryOutcome {
    fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

struct EngineInner {
    config: SyncConfig,
    api: Arc<dyn ApiClient>,
    storage: Arc<dyn Storage>,
    credentials: Arc<dyn CredentialStore>,
    watermarks: WatermarkStore,
    preferences: Preferences,
    controllers: BTreeMap<ResourceType, Arc<dyn ResourceController>>,
    gate: CompletionGate,
    events: EventBus,
    local: LocalRecords,
    in_flight: AtomicBool,
    phase: RwLock<SyncPhase>,
    decision: Mutex<Option<oneshot::Sender<FailureDecision>>>,
    scheduler: Mutex<Option<PeriodicSynchronizer>>,
}

/// Clears the in-flight flag when dropped, including on panic
struct CycleGuard {
    inner: Arc<EngineInner>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.inner.in_flight.store(false, Ordering::Release);
    }
}

/// Handle to the sync engine. Cheap to clone; all clones share one context.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn ApiClient>,
        storage: Arc<dyn Storage>,
        kv: Arc<dyn KeyValueStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let watermarks = WatermarkStore::new(Arc::clone(&kv));
        let preferences = Preferences::new(kv);
        let controllers = ResourceType::ALL
            .into_iter()
            .map(|resource| {
                let controller: Arc<dyn ResourceController> = Arc::new(ResourceSyncController::new(
                    resource,
                    Arc::clone(&api),
                    Arc::clone(&storage),
                    watermarks.clone(),
                ));
                (resource, controller)
            })
            .collect();

        let inner = EngineInner {
            gate: CompletionGate::new(Arc::clone(&storage), config.quiescence_window),
            events: EventBus::new(config.event_capacity),
            local: LocalRecords::new(Arc::clone(&storage), Arc::clone(&api)),
            config,
            api,
            storage,
            credentials,
            watermarks,
            preferences,
            controllers,
            in_flight: AtomicBool::new(false),
            phase: RwLock::new(SyncPhase::Idle),
            decision: Mutex::new(None),
            scheduler: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Production wiring: SQLite replica, REST client, in-process credentials.
    ///
    /// With `interactive_failure_decisions` on, a failed initial metadata load
    /// holds the cycle (and the in-flight flag) until
    /// [`resolve_failure`](Self::resolve_failure) is called. Every request
    /// made meanwhile, periodic ones included, is dropped. Hosts that
    /// subscribe to events without answering [`SyncEvent::DecisionRequired`]
    /// should turn the option off.
    pub async fn open(config: SyncConfig) -> SyncResult<Self> {
        if config.logging.enabled {
            let installed = logger_redacted::init(&config.logging)
                .map_err(|e| SyncError::Config(e.to_string()))?;
            tracing::debug!(installed, "Logging initialized");
        }
        let storage = Arc::new(SqliteStorage::new(SqliteConfig::new(config.database_path.clone())).await?);
        let api = Arc::new(HttpApiClient::from_config(&config)?);
        let kv: Arc<dyn KeyValueStore> = storage.clone();
        Ok(Self::new(config, api, storage, kv, Arc::new(MemoryCredentialStore::new())))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.read()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn preferences(&self) -> &Preferences {
        &self.inner.preferences
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.inner.watermarks
    }

    pub fn local_records(&self) -> &LocalRecords {
        &self.inner.local
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    fn try_begin(&self) -> Option<CycleGuard> {
        self.inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                inner: Arc::clone(&self.inner),
            })
    }

    fn spawn_cycle<F, Fut>(&self, name: &'static str, cycle: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(Arc<EngineInner>) -> Fut,
        Fut: std::future::Future<Output = SyncResult<bool>> + Send + 'static,
    {
        let Some(guard) = self.try_begin() else {
            tracing::debug!(cycle = name, "Sync already in flight, ignoring request");
            return None;
        };
        let inner = Arc::clone(&self.inner);
        let run = cycle(Arc::clone(&inner));
        Some(tokio::spawn(async move {
            let success = match run.await {
                Ok(success) => success,
                Err(e) => {
                    tracing::error!(cycle = name, error = %e, "Sync cycle aborted");
                    false
                }
            };
            inner.set_phase(SyncPhase::Idle);
            // Free the guard first so a listener may start the next cycle
            drop(guard);
            inner.events.publish(SyncEvent::LoadingFinished { success });
        }))
    }

    /// Load metadata and data values after login. Phases already loaded
    /// once are skipped.
    pub fn load_initial_data(&self) -> Option<JoinHandle<()>> {
        self.spawn_cycle("initial-load", |inner| async move { inner.initial_load().await })
    }

    /// Incremental refresh of everything, pushing local edits first
    pub fn synchronize(&self) -> Option<JoinHandle<()>> {
        self.spawn_cycle("synchronize", |inner| async move { inner.incremental(true).await })
    }

    /// Incremental refresh of metadata only
    pub fn synchronize_metadata(&self) -> Option<JoinHandle<()>> {
        self.spawn_cycle("synchronize-metadata", |inner| async move { inner.incremental(false).await })
    }

    /// Push pending local records, then refresh data values
    pub fn send_local_data(&self) -> Option<JoinHandle<()>> {
        self.spawn_cycle("send-local-data", |inner| async move { inner.send_local().await })
    }

    /// Answer a pending retry/cancel decision. Returns false when nothing
    /// was waiting.
    pub fn resolve_failure(&self, decision: FailureDecision) -> bool {
        match self.inner.decision.lock().take() {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }

    /// Re-fetch specific records of one resource type right away
    pub async fn refresh(&self, resource: ResourceType, uids: &[String]) -> SyncResult<SyncReport> {
        let _guard = self.try_begin().ok_or(SyncError::Busy)?;
        for dependency in resource.dependencies() {
            let prefs = &self.inner.preferences;
            if prefs.is_enabled(*dependency).await? && !prefs.is_loaded(*dependency).await? {
                return Err(SyncError::DependencyUnmet {
                    resource,
                    dependency: *dependency,
                });
            }
        }
        self.inner
            .controller(resource)?
            .sync_subset(SyncStrategy::Default, uids)
            .await
    }

    /// Authenticate and install credentials. Signing in as a different
    /// account or against a different server discards the old replica.
    pub async fn login(&self, server_url: &str, username: &str, password: &str) -> SyncResult<UserAccount> {
        let _guard = self.try_begin().ok_or(SyncError::Busy)?;
        let credentials = Credentials::new(server_url, username, password);
        let account = self.inner.api.authenticate(&credentials).await?;

        let switching = self
            .inner
            .credentials
            .load()
            .is_some_and(|previous| !previous.same_identity(&credentials));
        if switching {
            tracing::info!("Different account than last session, discarding replica");
            self.inner.reset_replica().await?;
        }

        tracing::info!(
            server = %logger_redacted::redact_url(&credentials.server_url),
            user = %account.id,
            "Logged in"
        );
        self.inner.api.set_credentials(Some(credentials.clone()));
        self.inner.credentials.store(credentials);
        Ok(account)
    }

    /// Forget credentials and everything replicated or created locally
    pub async fn logout(&self) -> SyncResult<()> {
        let _guard = self.try_begin().ok_or(SyncError::Busy)?;
        self.stop_periodic_sync();
        self.inner.credentials.clear();
        self.inner.api.set_credentials(None);
        self.inner.reset_replica().await?;
        self.inner.preferences.clear_load_flags().await?;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Persist a new frequency and reschedule the background synchronize
    pub async fn set_update_frequency(&self, frequency: UpdateFrequency) -> SyncResult<()> {
        self.inner.preferences.set_update_frequency(frequency).await?;
        self.schedule(frequency);
        Ok(())
    }

    /// Start the background synchronize at the stored frequency
    pub async fn start_periodic_sync(&self) -> SyncResult<()> {
        let frequency = self.inner.preferences.update_frequency().await?;
        self.schedule(frequency);
        Ok(())
    }

    pub fn stop_periodic_sync(&self) {
        self.inner.scheduler.lock().take();
    }

    fn schedule(&self, frequency: UpdateFrequency) {
        let next = frequency.period().map(|period| {
            let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
            PeriodicSynchronizer::start(period, move || match weak.upgrade() {
                Some(inner) => {
                    SyncEngine { inner }.synchronize();
                    true
                }
                None => false,
            })
        });
        // Replacing the old synchronizer aborts it
        *self.inner.scheduler.lock() = next;
        tracing::info!(frequency = ?frequency, "Update frequency set");
    }

    /// Stop background work. In-flight cycles run to completion.
    pub fn shutdown(&self) {
        self.stop_periodic_sync();
        // Dropping a pending decision cancels it
        self.inner.decision.lock().take();
    }
}

impl EngineInner {
    fn controller(&self, resource: ResourceType) -> SyncResult<&Arc<dyn ResourceController>> {
        self.controllers
            .get(&resource)
            .ok_or_else(|| SyncError::NotFound(format!("controller for {}", resource)))
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
        tracing::info!(phase = %phase, "Sync phase changed");
        self.events.publish(SyncEvent::PhaseChanged { phase });
    }

    async fn reset_replica(&self) -> SyncResult<()> {
        self.watermarks.reset_all().await?;
        self.preferences.clear_loaded_flags().await?;
        self.storage.wipe().await?;
        self.local.clear_cache();
        Ok(())
    }

    /// Wait for storage to go quiet before declaring a phase complete
    async fn drain(&self, collections: &[ResourceType]) {
        self.events.progress("Finishing up");
        self.gate.await_quiescence(collections).await;
    }

    /// Run every enabled controller of a category in dependency order.
    ///
    /// Metadata stops at the first failure. Data values carry on with
    /// whatever does not depend on a failed resource type.
    async fn sync_category(&self, category: ResourceCategory, announce: bool) -> SyncResult<CategoryOutcome> {
        let mut outcome = CategoryOutcome::default();
        let mut synced: Vec<ResourceType> = Vec::new();

        for resource in self.preferences.enabled_resources(category).await? {
            let mut blocked = None;
            for dependency in resource.dependencies() {
                if outcome.failed.contains(dependency) {
                    blocked = Some(*dependency);
                    break;
                }
                let satisfied = synced.contains(dependency)
                    || !self.preferences.is_enabled(*dependency).await?
                    || self.preferences.is_loaded(*dependency).await?;
                if !satisfied {
                    return Err(SyncError::DependencyUnmet {
                        resource,
                        dependency: *dependency,
                    });
                }
            }
            if let Some(dependency) = blocked {
                tracing::warn!(resource = %resource, dependency = %dependency, "Skipping, dependency failed");
                outcome.failed.push(resource);
                continue;
            }

            if announce {
                self.events.progress(format!("Loading {}", resource.watermark_key().replace('_', " ")));
            }
            match self.controller(resource)?.sync(SyncStrategy::Default).await {
                Ok(_) => {
                    self.preferences.set_loaded(resource, true).await?;
                    synced.push(resource);
                }
                Err(e) => {
                    tracing::error!(resource = %resource, error = %e, "Resource sync failed");
                    outcome.failed.push(resource);
                    outcome.first_error.get_or_insert_with(|| e.to_string());
                    if category == ResourceCategory::Metadata {
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Block the cycle until [`SyncEngine::resolve_failure`] answers. With
    /// nobody subscribed to events there is no one to ask, so it cancels.
    async fn await_decision(&self, failed: Vec<ResourceType>, reason: String) -> FailureDecision {
        if !self.config.interactive_failure_decisions {
            return FailureDecision::Cancel;
        }
        if !self.events.has_subscribers() {
            tracing::warn!(failed = ?failed, "No event subscriber to decide on the failure, cancelling");
            return FailureDecision::Cancel;
        }
        let (sender, receiver) = oneshot::channel();
        *self.decision.lock() = Some(sender);
        self.events.publish(SyncEvent::DecisionRequired { failed, reason });
        receiver.await.unwrap_or(FailureDecision::Cancel)
    }

    async fn initial_load(&self) -> SyncResult<bool> {
        self.events.publish(SyncEvent::LoadingStarted);

        if !self.preferences.is_metadata_loaded().await? {
            loop {
                self.set_phase(SyncPhase::LoadingMetadata);
                let outcome = self.sync_category(ResourceCategory::Metadata, true).await?;
                if outcome.succeeded() {
                    break;
                }
                self.set_phase(SyncPhase::Failed);
                let reason = outcome.first_error.unwrap_or_default();
                match self.await_decision(outcome.failed, reason).await {
                    FailureDecision::Retry => {
                        tracing::info!("Retrying metadata load");
                        continue;
                    }
                    FailureDecision::Cancel => {
                        tracing::warn!("Metadata load cancelled");
                        return Ok(false);
                    }
                }
            }
            let metadata = self.preferences.enabled_resources(ResourceCategory::Metadata).await?;
            self.drain(&metadata).await;
        }

        if !self.preferences.is_data_values_loaded().await? {
            self.set_phase(SyncPhase::LoadingDataValues);
            let outcome = self.sync_category(ResourceCategory::DataValues, true).await?;
            if !outcome.succeeded() {
                tracing::warn!(failed = ?outcome.failed, "Data value loading failed, continuing anyway");
            }
        }

        self.set_phase(SyncPhase::Finishing);
        self.drain(&[]).await;
        Ok(true)
    }

    async fn push_local(&self) -> Option<PushReport> {
        match self.local.push_pending().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Sending local data failed");
                None
            }
        }
    }

    async fn incremental(&self, include_data: bool) -> SyncResult<bool> {
        self.set_phase(SyncPhase::LoadingMetadata);
        let outcome = self.sync_category(ResourceCategory::Metadata, false).await?;
        if !outcome.succeeded() {
            self.set_phase(SyncPhase::Failed);
            return Ok(false);
        }
        let metadata = self.preferences.enabled_resources(ResourceCategory::Metadata).await?;
        self.drain(&metadata).await;

        if include_data {
            self.set_phase(SyncPhase::LoadingDataValues);
            self.push_local().await;
            let outcome = self.sync_category(ResourceCategory::DataValues, false).await?;
            if !outcome.succeeded() {
                tracing::warn!(failed = ?outcome.failed, "Data value sync failed, continuing anyway");
            }
        }

        self.set_phase(SyncPhase::Finishing);
        self.drain(&[]).await;
        Ok(true)
    }

    async fn send_local(&self) -> SyncResult<bool> {
        self.set_phase(SyncPhase::LoadingDataValues);
        let pushed = self.push_local().await.is_some();
        let outcome = self.sync_category(ResourceCategory::DataValues, false).await?;
        if !outcome.succeeded() {
            tracing::warn!(failed = ?outcome.failed, "Data value sync failed after push");
        }
        self.set_phase(SyncPhase::Finishing);
        self.drain(&[]).await;
        Ok(pushed)
    }
}
