//! Transport abstraction for the upstream data provider
//!
//! Defines the `Transport` trait that decouples the retrying client from any
//! concrete wire protocol, plus the `ErrorClassification` every transport must
//! attach to a failure. `HttpTransport` is the JSON-over-HTTP implementation
//! used by the harvester service; tests plug in scripted transports instead.

pub mod classify;
pub mod http;

pub use classify::{classify_code, classify_message, classify_status};
pub use http::HttpTransport;

use common::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream errors to determine the retry strategy.
///
/// - AuthenticationInvalid marks the credential unhealthy and rotates, no delay
/// - RateLimited rotates the credential and backs off linearly
/// - TransientRetryable keeps the credential and backs off exponentially
/// - Fatal is never retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Token rejected by the upstream
    AuthenticationInvalid,
    /// Per-credential or upstream-wide quota hit
    RateLimited,
    /// Timeouts, 5xx, connection resets
    TransientRetryable,
    /// Client errors, bad parameters, missing permissions
    Fatal,
}

impl ErrorClassification {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::AuthenticationInvalid => "authentication_invalid",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::TransientRetryable => "transient",
            ErrorClassification::Fatal => "fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClassification::Fatal)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One logical upstream call: the resource (API name) and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub resource: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Optional column projection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl Request {
    pub fn new(resource: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            resource: resource.into(),
            params,
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

/// Successful upstream payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub data: serde_json::Value,
}

impl Response {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data }
    }

    /// Flatten the payload into row objects.
    ///
    /// Understands the columnar `{"fields": [...], "items": [[...], ...]}`
    /// shape, a plain array of objects, and a single object.
    pub fn records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        if let (Some(fields), Some(items)) = (
            self.data.get("fields").and_then(|f| f.as_array()),
            self.data.get("items").and_then(|i| i.as_array()),
        ) {
            return items
                .iter()
                .filter_map(|row| row.as_array())
                .map(|row| {
                    fields
                        .iter()
                        .zip(row.iter())
                        .filter_map(|(name, value)| {
                            name.as_str().map(|n| (n.to_string(), value.clone()))
                        })
                        .collect()
                })
                .collect();
        }

        match &self.data {
            serde_json::Value::Array(rows) => rows
                .iter()
                .filter_map(|row| row.as_object().cloned())
                .collect(),
            serde_json::Value::Object(obj) => vec![obj.clone()],
            _ => Vec::new(),
        }
    }
}

/// A classified upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{classification} upstream error{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct TransportError {
    pub classification: ErrorClassification,
    pub code: Option<i64>,
    pub message: String,
}

impl TransportError {
    pub fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::AuthenticationInvalid, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::TransientRetryable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Fatal, message)
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Abstraction over the upstream wire protocol.
///
/// The transport receives the exposed credential token for exactly one
/// attempt; it never stores it. Every failure carries a classification so the
/// client can decide between rotating, backing off, and aborting.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Perform one upstream call with the given credential token.
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        credential: &'a str,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;
}
