//! API client seam
//!
//! Controllers only see this trait. [`crate::http::HttpApiClient`] is the
//! production implementation; tests plug in scripted fakes.

use crate::error::ApiResult;
use crate::model::{ExistenceEntry, PushReceipt, Record, UserAccount};
use crate::resource::ResourceType;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret, SecretString};
use std::fmt;

/// Server login credentials. The password never appears in `Debug` output.
pub struct Credentials {
    pub server_url: String,
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(server_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Value for the `Authorization` header
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Whether both credentials address the same account
    pub fn same_identity(&self, other: &Credentials) -> bool {
        self.server_url == other.server_url && self.username == other.username
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            server_url: self.server_url.clone(),
            username: self.username.clone(),
            password: Secret::new(self.password.expose_secret().clone()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_url", &logger_redacted::redact_url(&self.server_url))
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Verify credentials against the server without installing them
    async fn authenticate(&self, credentials: &Credentials) -> ApiResult<UserAccount>;

    /// Install or clear the credentials used for every later request
    fn set_credentials(&self, credentials: Option<Credentials>);

    /// Current server clock
    async fn server_time(&self) -> ApiResult<DateTime<Utc>>;

    /// Identifier and name of every record the user can see, optionally
    /// restricted to `uids`
    async fn fetch_existence(
        &self,
        resource: ResourceType,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<ExistenceEntry>>;

    /// Full records changed after `since` (everything when `None`),
    /// optionally restricted to `uids`. Foreign keys are left in the payload
    /// as global identifiers.
    async fn fetch_updated(
        &self,
        resource: ResourceType,
        since: Option<DateTime<Utc>>,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<Record>>;

    /// Send one record upstream
    async fn push(&self, resource: ResourceType, payload: &serde_json::Value) -> ApiResult<PushReceipt>;
}
