//! REST implementation of [`ApiClient`]

use crate::api::{ApiClient, Credentials};
use crate::config::SyncConfig;
use crate::error::{ApiError, ApiResult, SyncError, SyncResult};
use crate::model::{ExistenceEntry, PushReceipt, Record, UserAccount};
use crate::resource::ResourceType;
use crate::wire;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::time::Duration;

/// HTTP client for the platform's web API
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    credentials: RwLock<Option<Credentials>>,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: RwLock::new(None),
        })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(config.server_url.clone(), config.request_timeout)
    }

    /// Server of the installed credentials, else the configured one
    fn base_url(&self) -> String {
        self.credentials
            .read()
            .as_ref()
            .map(|c| c.server_url.clone())
            .unwrap_or_else(|| self.base_url.clone())
    }

    fn authorization(&self) -> Option<String> {
        self.credentials.read().as_ref().map(Credentials::basic_header)
    }

    async fn get_json(&self, url: String, query: &[(&str, String)], authorization: Option<String>) -> ApiResult<Value> {
        let mut req = self.client.get(&url).query(query);
        if let Some(header) = authorization {
            req = req.header(reqwest::header::AUTHORIZATION, header);
        }

        tracing::debug!(url = %logger_redacted::redact_url(&url), "GET");
        let response = req.send().await.map_err(transport_error)?;
        decode(response).await
    }

    async fn listing(
        &self,
        resource: ResourceType,
        fields: &str,
        since: Option<DateTime<Utc>>,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<Value>> {
        let url = format!("{}/api/{}", self.base_url(), resource.endpoint());
        let mut query = vec![("fields", fields.to_string()), ("paging", "false".to_string())];
        if let Some(since) = since {
            query.push(("filter", format!("lastUpdated:gt:{}", wire::format_timestamp(since))));
        }
        if let Some(uids) = uids {
            query.push(("filter", format!("{}:in:[{}]", resource.id_field(), uids.join(","))));
        }
        let body = self.get_json(url, &query, self.authorization()).await?;
        wire::collection_items(resource, body)
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_decode() {
        ApiError::MalformedResponse(err.to_string())
    } else {
        ApiError::NetworkUnavailable(err.to_string())
    }
}

async fn decode(response: reqwest::Response) -> ApiResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::from_status(status.as_u16(), message));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ApiError::MalformedResponse(e.to_string()))
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn authenticate(&self, credentials: &Credentials) -> ApiResult<UserAccount> {
        let url = format!("{}/api/me", credentials.server_url);
        let query = [("fields", "id,username:userCredentials.username,displayName".to_string())];
        let body = self.get_json(url, &query, Some(credentials.basic_header())).await?;
        serde_json::from_value(body).map_err(|e| ApiError::MalformedResponse(e.to_string()))
    }

    fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write() = credentials;
    }

    async fn server_time(&self) -> ApiResult<DateTime<Utc>> {
        let url = format!("{}/api/system/info", self.base_url());
        let body = self.get_json(url, &[], self.authorization()).await?;
        body.get("serverDate")
            .and_then(Value::as_str)
            .and_then(wire::parse_timestamp)
            .ok_or_else(|| ApiError::MalformedResponse("system info without a usable serverDate".to_string()))
    }

    async fn fetch_existence(
        &self,
        resource: ResourceType,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<ExistenceEntry>> {
        let fields = format!("{},name", resource.id_field());
        self.listing(resource, &fields, None, uids)
            .await?
            .into_iter()
            .map(|item| wire::existence_from_wire(resource, item))
            .collect()
    }

    async fn fetch_updated(
        &self,
        resource: ResourceType,
        since: Option<DateTime<Utc>>,
        uids: Option<&[String]>,
    ) -> ApiResult<Vec<Record>> {
        self.listing(resource, "*", since, uids)
            .await?
            .into_iter()
            .map(|item| wire::record_from_wire(resource, item))
            .collect()
    }

    async fn push(&self, resource: ResourceType, payload: &Value) -> ApiResult<PushReceipt> {
        let url = format!("{}/api/{}", self.base_url(), resource.endpoint());
        let mut req = self.client.post(&url).json(payload);
        if let Some(header) = self.authorization() {
            req = req.header(reqwest::header::AUTHORIZATION, header);
        }

        tracing::debug!(url = %logger_redacted::redact_url(&url), resource = %resource, "POST");
        let response = req.send().await.map_err(transport_error)?;
        let body = decode(response).await?;
        wire::push_receipt_from_wire(resource, &body)
    }
}
