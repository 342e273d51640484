//! Transport seam between the client and the remote function backend.
//!
//! [`RpcClient`](crate::client::RpcClient) is transport-agnostic: retry,
//! rate limiting and deduplication all operate on the [`Transport`] trait.
//! [`HttpTransport`] is the production implementation; tests substitute
//! mocks or in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

/// Failure classification carried by every [`TransportError`].
///
/// The wire names are kebab-case (`deadline-exceeded`), matching what
/// remote function backends commonly report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    Unavailable,
    DeadlineExceeded,
    Internal,
    Unknown,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Cancelled,
}

impl ErrorCode {
    /// Transient failures worth retrying. Everything else indicates a
    /// request that will keep failing no matter how often it is sent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::DeadlineExceeded
                | ErrorCode::Internal
                | ErrorCode::Unknown
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: ErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorCode::DeadlineExceeded,
            format!("timed out after {}ms", timeout.as_millis()),
        )
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Retryable when the code is transient or the message mentions a
    /// timeout, whatever the code says.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable() || self.message.to_lowercase().contains("timeout")
    }
}

/// Invokes named remote functions with JSON arguments.
#[mockall::automock]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, name: &str, args: &Value) -> Result<Value, TransportError>;
}

/// Envelope the HTTP backend wraps every response in.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP [`Transport`] POSTing `{action, data}` envelopes to one endpoint.
///
/// ```rust,no_run
/// use keel::client::HttpTransport;
/// use secrecy::SecretString;
///
/// let transport = HttpTransport::new("https://api.example.com/fn")
///     .with_auth_token(SecretString::from("service-token"));
/// ```
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn code_for_status(status: StatusCode) -> ErrorCode {
        match status.as_u16() {
            400 => ErrorCode::InvalidArgument,
            401 => ErrorCode::Unauthenticated,
            403 => ErrorCode::PermissionDenied,
            404 => ErrorCode::NotFound,
            429 => ErrorCode::ResourceExhausted,
            code if code >= 500 => ErrorCode::Unavailable,
            _ => ErrorCode::Unknown,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, name: &str, args: &Value) -> Result<Value, TransportError> {
        debug!(name, "Invoking remote function");

        let mut request = self
            .client
            .post(&self.base_url)
            .json(&json!({ "action": name, "data": args }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::new(
                    ErrorCode::DeadlineExceeded,
                    format!("request timed out: {}", err),
                )
            } else if err.is_connect() {
                TransportError::unavailable(format!("connection failed: {}", err))
            } else {
                TransportError::unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                Self::code_for_status(status),
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|err| TransportError::internal(format!("malformed response body: {}", err)))?;

        if envelope.success {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            Err(TransportError::new(
                ErrorCode::Unknown,
                envelope
                    .error
                    .unwrap_or_else(|| "unspecified server error".to_string()),
            ))
        }
    }
}
