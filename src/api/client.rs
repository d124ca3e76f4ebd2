use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use reqwest::Client;

use crate::core::message::{Message, NewMessage};
use crate::utils::url::construct_api_url;

/// Errors from the gateway message API.
#[derive(Debug)]
pub enum ApiError {
    /// The request never produced a response (network, TLS, timeout).
    Request {
        url: String,
        source: reqwest::Error,
    },

    /// The gateway answered with a non-success status.
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// The response body could not be decoded into the expected shape.
    Decode {
        url: String,
        source: reqwest::Error,
    },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Request { url, source } => {
                write!(f, "Request to {url} failed: {source}")
            }
            ApiError::Status { url, status, body } => {
                write!(f, "Request to {url} returned HTTP {status}: {body}")
            }
            ApiError::Decode { url, source } => {
                write!(f, "Failed to decode response from {url}: {source}")
            }
        }
    }
}

impl StdError for ApiError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ApiError::Request { source, .. } | ApiError::Decode { source, .. } => Some(source),
            ApiError::Status { .. } => None,
        }
    }
}

/// Authoritative persistence for conversation messages. `append` returns the
/// saved record; its id supersedes any locally generated one.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, ApiError>;

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError>;
}

/// REST client for the gateway's conversation message endpoints.
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        construct_api_url(
            &self.base_url,
            &format!("conversations/{conversation_id}/messages"),
        )
    }
}

#[async_trait]
impl MessageApi for GatewayClient {
    async fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(conversation_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&message)
            .send()
            .await
            .map_err(|source| ApiError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".into());
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Message>()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        let url = self.messages_url(conversation_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|source| ApiError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".into());
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<Message>>()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }
}
