//! JSON-over-HTTP transport
//!
//! Posts `{"api_name", "token", "params", "fields"}` to a single endpoint and
//! unwraps the provider's envelope `{"code", "msg", "data"}`. A non-zero code
//! inside an HTTP 200 is still a failure and is classified by code and message.

use crate::{ErrorClassification, Request, Response, Result, Transport, TransportError, classify};
use common::Context;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// HTTP transport backed by a shared `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    async fn send(&self, credential: &str, request: &Request) -> Result<Response> {
        let body = serde_json::json!({
            "api_name": request.resource,
            "token": credential,
            "params": request.params,
            "fields": request.fields.join(","),
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::transient(format!("reading response body: {e}")))?;

        if !status.is_success() {
            let classification = classify::classify_status(status.as_u16(), &text);
            warn!(
                resource = %request.resource,
                status = status.as_u16(),
                classification = %classification,
                "upstream returned error status"
            );
            return Err(TransportError::new(
                classification,
                format!("HTTP {}: {}", status.as_u16(), truncate(&text, 256)),
            ));
        }

        let envelope: Envelope = serde_json::from_str(&text).map_err(|e| {
            TransportError::transient(format!("malformed upstream envelope: {e}"))
        })?;

        if envelope.code != 0 {
            let message = envelope.msg.unwrap_or_default();
            let classification = classify::classify_code(envelope.code, &message);
            debug!(
                resource = %request.resource,
                code = envelope.code,
                classification = %classification,
                "upstream returned error code"
            );
            return Err(TransportError::new(classification, message).with_code(envelope.code));
        }

        Ok(Response::new(envelope.data))
    }
}

impl Transport for HttpTransport {
    fn id(&self) -> &str {
        "http"
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        credential: &'a str,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>> {
        Box::pin(async move {
            match ctx.run(self.send(credential, request)).await {
                Ok(result) => result,
                Err(reason) => Err(TransportError::fatal(reason.to_string())),
            }
        })
    }
}

/// Timeouts and connection failures are retryable; request construction errors are not.
fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    let classification = if e.is_builder() {
        ErrorClassification::Fatal
    } else {
        ErrorClassification::TransientRetryable
    };
    TransportError::new(classification, format!("request failed: {e}"))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
