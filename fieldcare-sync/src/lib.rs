//! Offline-first replica synchronization for FieldCare mobile clients
//!
//! Provides:
//! - Watermark-bounded incremental fetch per resource type
//! - Reconciliation of server listings with the local replica, including
//!   server-side deletions
//! - Dependency-ordered loading of metadata before clinical data
//! - Temporary identifiers for records created offline, replaced in place
//!   once the server assigns the real one
//! - A single in-flight sync cycle with phase notifications
//! - SQLite and in-memory storage backends

pub mod api;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod http;
pub mod keyvalue;
pub mod lifecycle;
pub mod model;
pub mod preferences;
pub mod reconcile;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod sqlite;
pub mod storage;
pub mod watermark;
pub mod wire;
pub mod write_queue;

pub use api::{ApiClient, Credentials};
pub use config::SyncConfig;
pub use controller::{ResourceController, ResourceSyncController, SyncReport, SyncStrategy};
pub use engine::{FailureDecision, SyncEngine};
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use events::{SyncEvent, SyncPhase};
pub use gate::CompletionGate;
pub use http::HttpApiClient;
pub use keyvalue::{KeyValueStore, MemoryKeyValueStore};
pub use lifecycle::{LocalRecords, PushReport};
pub use model::{ExistenceEntry, Identifiable, LocalId, PushReceipt, Record, SyncState, UserAccount};
pub use preferences::{LoadMode, Preferences, UpdateFrequency};
pub use reconcile::{reconcile, PendingWrite, RowVersion};
pub use resource::{ResourceCategory, ResourceType};
pub use session::{CredentialStore, MemoryCredentialStore};
pub use sqlite::{SqliteConfig, SqliteStorage};
pub use storage::{CommitReceipt, MemoryStorage, Storage, StorageChange, StorageTransaction};
pub use watermark::{ClockSource, WatermarkStore};
pub use write_queue::WriteQueue;
