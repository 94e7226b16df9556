//! MTA HTTP client

use async_trait::async_trait;
use relaymail_common::config::MtaServerConfig;
use relaymail_storage::{Domain, ItemStatus};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from a remote MTA call
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The server answered with a non-2xx status
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// The request never completed (connect, timeout, TLS)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A 2xx response whose body could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A fully rendered message handed to an MTA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Delivery status reported by an MTA for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RemoteStatus {
    /// Local item status for a terminal remote status; `None` while still in flight
    pub fn terminal_item_status(&self) -> Option<ItemStatus> {
        match self.status.to_ascii_lowercase().as_str() {
            "sent" | "delivered" => Some(ItemStatus::Sent),
            "failed" | "rejected" | "bounced" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

/// Domain settings pushed to an MTA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub delivery_mode: String,
    pub redirect_to: Option<String>,
    pub bcc_to: Option<String>,
    pub dkim_selector: Option<String>,
    pub dkim_enabled: bool,
    pub rate_limit_per_minute: i32,
    pub rate_limit_per_hour: i32,
    pub config_hash: String,
}

impl From<&Domain> for DomainSpec {
    fn from(domain: &Domain) -> Self {
        Self {
            name: domain.name.clone(),
            delivery_mode: domain.delivery_mode.clone(),
            redirect_to: domain.redirect_to.clone(),
            bcc_to: domain.bcc_to.clone(),
            dkim_selector: domain.dkim_selector.clone(),
            dkim_enabled: domain.dkim_enabled,
            rate_limit_per_minute: domain.rate_limit_per_minute,
            rate_limit_per_hour: domain.rate_limit_per_hour,
            config_hash: domain.config_hash.clone(),
        }
    }
}

/// Operations the pipeline needs from an MTA server
#[async_trait]
pub trait MtaClient: Send + Sync {
    /// Submit a message, returning the MTA's message id
    async fn send(&self, message: &OutboundMessage) -> Result<String, ClientError>;

    /// Look up the delivery status of a submitted message
    async fn status(&self, remote_id: &str) -> Result<RemoteStatus, ClientError>;

    /// Liveness probe
    async fn health(&self) -> Result<(), ClientError>;

    /// Create or replace a domain's configuration on the server
    async fn push_domain(&self, domain: &DomainSpec) -> Result<(), ClientError>;

    /// Remove a domain from the server
    async fn remove_domain(&self, name: &str) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// MTA client speaking JSON over HTTP
pub struct HttpMtaClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpMtaClient {
    /// Create a client for one configured server
    pub fn new(config: &MtaServerConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Build a request with optional auth header
    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request
    }

    /// Send a request and turn non-2xx answers into `ClientError::Status`
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!("MTA {} answered {}: {}", self.base_url, status, body);
        Err(ClientError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MtaClient for HttpMtaClient {
    async fn send(&self, message: &OutboundMessage) -> Result<String, ClientError> {
        let response = self
            .execute(
                self.build_request(reqwest::Method::POST, "/api/v1/messages")
                    .json(message),
            )
            .await?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        if body.id.is_empty() {
            return Err(ClientError::InvalidResponse(
                "empty message id".to_string(),
            ));
        }
        Ok(body.id)
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteStatus, ClientError> {
        let path = format!("/api/v1/messages/{}", remote_id);
        let response = self
            .execute(self.build_request(reqwest::Method::GET, &path))
            .await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn health(&self) -> Result<(), ClientError> {
        self.execute(self.build_request(reqwest::Method::GET, "/health"))
            .await?;
        Ok(())
    }

    async fn push_domain(&self, domain: &DomainSpec) -> Result<(), ClientError> {
        let path = format!("/api/v1/domains/{}", domain.name);
        self.execute(self.build_request(reqwest::Method::PUT, &path).json(domain))
            .await?;
        Ok(())
    }

    async fn remove_domain(&self, name: &str) -> Result<(), ClientError> {
        let path = format!("/api/v1/domains/{}", name);
        self.execute(self.build_request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }
}
