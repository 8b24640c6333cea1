//! Credential storage seam

use crate::api::Credentials;
use parking_lot::RwLock;

/// Where the signed-in account's credentials live between sessions.
/// Encryption at rest is the implementor's concern.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credentials>;

    fn store(&self, credentials: Credentials);

    fn clear(&self);
}

/// Keeps credentials for the lifetime of the process only
#[derive(Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<Credentials> {
        self.current.read().clone()
    }

    fn store(&self, credentials: Credentials) {
        *self.current.write() = Some(credentials);
    }

    fn clear(&self) {
        *self.current.write() = None;
    }
}
