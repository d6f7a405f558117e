//! Retrying upstream client
//!
//! One logical call is up to `max_attempts` attempts. Each attempt selects a
//! credential, waits for a rate limiter token, and invokes the transport. The
//! classification of a failure decides between rotating the credential,
//! backing off, and giving up. Backoff sleeps and the invocation itself race
//! the caller's context so cancellation is observed promptly.

use std::sync::Arc;

use common::Context;
use credential_pool::{CredentialPool, RateLimiter, SelectedCredential};
use tracing::{debug, instrument, warn};
use transport::{ErrorClassification, Request, Response, Transport, TransportError};

use crate::error::{Error, Result};
use crate::policy::RetryPolicy;

/// Client shared by every job talking to one upstream.
pub struct ResilientClient {
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            limiter,
            transport,
            policy,
        }
    }

    /// Call `resource` with `params`.
    pub async fn call(
        &self,
        ctx: &Context,
        resource: &str,
        params: serde_json::Value,
    ) -> Result<Response> {
        self.call_request(ctx, &Request::new(resource, params)).await
    }

    /// Perform one logical call with classification-driven retry.
    #[instrument(skip_all, fields(resource = %request.resource, transport = self.transport.id()))]
    pub async fn call_request(&self, ctx: &Context, request: &Request) -> Result<Response> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last: Option<TransportError> = None;
        // Transient failures retry on the same credential.
        let mut reuse: Option<SelectedCredential> = None;

        for attempt in 0..max_attempts {
            if let Some(reason) = ctx.err() {
                record_call("canceled");
                return Err(reason.into());
            }

            let credential = match reuse.take() {
                Some(credential) => {
                    self.pool.record_attempt(&credential.id).await;
                    credential
                }
                None => self.pool.get_credential().await?,
            };

            if let Err(e) = self.limiter.wait(ctx).await {
                record_call("canceled");
                return Err(e.into());
            }

            let outcome = match ctx
                .run(
                    self.transport
                        .invoke(ctx, credential.token.expose(), request),
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(reason) => {
                    record_call("canceled");
                    return Err(reason.into());
                }
            };

            let err = match outcome {
                Ok(response) => {
                    self.pool.record_success(&credential.id).await;
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "upstream call succeeded after retry");
                    }
                    record_call("success");
                    return Ok(response);
                }
                Err(err) => err,
            };

            let classification = err.classification;
            self.pool.record_error(&credential.id, classification).await;
            metrics::counter!(
                "harvest_upstream_retries_total",
                "classification" => classification.label()
            )
            .increment(1);

            let Some(delay) = self.policy.delay_for(classification, attempt) else {
                warn!(
                    credential_id = %credential.id,
                    error = %err,
                    "fatal upstream error, not retrying"
                );
                record_call("fatal");
                return Err(Error::Fatal(err));
            };
            match classification {
                ErrorClassification::AuthenticationInvalid | ErrorClassification::RateLimited => {
                    self.pool.next_credential(&credential.id).await;
                }
                ErrorClassification::TransientRetryable => reuse = Some(credential.clone()),
                ErrorClassification::Fatal => {}
            }

            warn!(
                attempt = attempt + 1,
                max_attempts,
                credential_id = %credential.id,
                classification = %classification,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upstream attempt failed"
            );
            last = Some(err);

            if attempt + 1 < max_attempts && !delay.is_zero() {
                if let Err(reason) = common::sleep(ctx, delay).await {
                    record_call("canceled");
                    return Err(reason.into());
                }
            }
        }

        record_call("exhausted");
        Err(Error::Exhausted {
            attempts: max_attempts,
            last: last.unwrap_or_else(|| TransportError::fatal("no attempt was made")),
        })
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

fn record_call(outcome: &'static str) {
    metrics::counter!("harvest_upstream_calls_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_pool::{Credential, DEFAULT_UNHEALTHY_RETRY_AFTER};
    use std::collections::VecDeque;
    use std::time::Duration;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Transport that replays a script of outcomes and records which token
    /// each attempt used. Once the script runs out, `fallback` repeats.
    struct ScriptedTransport {
        script: Mutex<VecDeque<transport::Result<Response>>>,
        fallback: transport::Result<Response>,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<transport::Result<Response>>, fallback: transport::Result<Response>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                tokens: Mutex::new(Vec::new()),
            }
        }

        fn always(outcome: transport::Result<Response>) -> Self {
            Self::new(vec![], outcome)
        }

        fn calls(&self) -> usize {
            self.tokens.lock().unwrap().len()
        }

        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn id(&self) -> &str {
            "scripted"
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a Context,
            credential: &'a str,
            _request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = transport::Result<Response>> + Send + 'a>> {
            self.tokens.lock().unwrap().push(credential.to_string());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Box::pin(async move { next })
        }
    }

    /// Transport that never answers.
    struct HangingTransport;

    impl Transport for HangingTransport {
        fn id(&self) -> &str {
            "hanging"
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a Context,
            _credential: &'a str,
            _request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = transport::Result<Response>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    fn ok() -> transport::Result<Response> {
        Ok(Response::new(serde_json::json!({"ok": true})))
    }

    fn pool(ids: &[&str]) -> Arc<CredentialPool> {
        Arc::new(
            CredentialPool::new(
                ids.iter()
                    .map(|id| Credential::new(*id, format!("tok-{id}")))
                    .collect(),
                DEFAULT_UNHEALTHY_RETRY_AFTER,
            )
            .unwrap(),
        )
    }

    fn client(
        pool: Arc<CredentialPool>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> ResilientClient {
        let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)).unwrap());
        ResilientClient::new(pool, limiter, transport, policy)
    }

    fn slow_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::with_delays(
            max_attempts,
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let transport = Arc::new(ScriptedTransport::always(ok()));
        let pool = pool(&["A"]);
        let client = client(pool.clone(), transport.clone(), RetryPolicy::default());

        let response = client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response.data["ok"], true);
        assert_eq!(transport.calls(), 1);
        assert_eq!(pool.get_stats().await.credentials[0].success_count, 1);
    }

    #[tokio::test]
    async fn auth_failures_exhaust_without_delay() {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::auth(
            "token rejected",
        ))));
        let pool = pool(&["A", "B", "C"]);
        let client = client(pool.clone(), transport.clone(), slow_policy(4));

        let started = Instant::now();
        let err = client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(
            started.elapsed() < Duration::from_millis(500),
            "auth retries must not back off, took {:?}",
            started.elapsed()
        );
        assert_eq!(transport.calls(), 4);
        assert!(matches!(err, Error::Exhausted { attempts: 4, .. }));
        assert_eq!(
            err.classification(),
            Some(ErrorClassification::AuthenticationInvalid)
        );
        assert_eq!(pool.healthy_count().await, 0);
    }

    #[tokio::test]
    async fn auth_failure_rotates_to_next_credential() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![Err(TransportError::auth("bad token"))],
            ok(),
        ));
        let pool = pool(&["A", "B", "C"]);
        let client = client(pool.clone(), transport.clone(), slow_policy(3));

        client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(transport.tokens(), vec!["tok-A", "tok-B"]);
        assert_eq!(pool.healthy_count().await, 2);
    }

    #[tokio::test]
    async fn single_credential_pool_retries_same_credential() {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::auth(
            "bad token",
        ))));
        let client = client(pool(&["only"]), transport.clone(), slow_policy(3));

        let err = client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(transport.tokens(), vec!["tok-only"; 3]);
        assert_eq!(
            err.classification(),
            Some(ErrorClassification::AuthenticationInvalid)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![
                Err(TransportError::transient("HTTP 503")),
                Err(TransportError::transient("HTTP 502")),
            ],
            ok(),
        ));
        let pool = pool(&["A", "B"]);
        let policy = RetryPolicy::with_delays(
            5,
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        let client = client(pool.clone(), transport.clone(), policy);

        let started = tokio::time::Instant::now();
        client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(
            transport.tokens(),
            vec!["tok-A", "tok-A", "tok-A"],
            "transient errors keep the credential"
        );
        // 100ms after the first failure, 200ms after the second
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(pool.healthy_count().await, 2);
        let stats = pool.get_stats().await;
        assert_eq!(stats.credentials[0].call_count, 3, "every attempt is counted");
        assert_eq!(stats.credentials[1].call_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rotates_and_backs_off_linearly() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![
                Err(TransportError::rate_limited("per-minute quota")),
                Err(TransportError::rate_limited("per-minute quota")),
            ],
            ok(),
        ));
        let pool = pool(&["A", "B", "C"]);
        let policy = RetryPolicy::with_delays(
            5,
            Duration::from_millis(1),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        let client = client(pool.clone(), transport.clone(), policy);

        let started = tokio::time::Instant::now();
        client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(transport.tokens(), vec!["tok-A", "tok-B", "tok-C"]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "1s + 2s backoff, got {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "got {elapsed:?}");
        assert_eq!(pool.healthy_count().await, 3, "rate limits never affect health");
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::fatal(
            "bad params",
        ))));
        let client = client(pool(&["A", "B"]), transport.clone(), slow_policy(5));

        let err = client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 1);
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(err.classification(), Some(ErrorClassification::Fatal));
    }

    #[tokio::test]
    async fn cancel_during_backoff_returns_promptly() {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::transient(
            "HTTP 500",
        ))));
        let client = Arc::new(client(pool(&["A"]), transport.clone(), slow_policy(5)));
        let (ctx, cancel) = Context::with_cancel();

        let started = Instant::now();
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call(&ctx, "daily", serde_json::json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call must return promptly after cancel")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Context(common::ContextError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.calls(), 1, "no attempt after cancellation");
    }

    #[tokio::test]
    async fn deadline_bounds_retries() {
        let transport = Arc::new(ScriptedTransport::always(Err(TransportError::transient(
            "HTTP 500",
        ))));
        let client = client(pool(&["A"]), transport, slow_policy(5));
        let ctx = Context::background().with_timeout(Duration::from_millis(50));

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            client.call(&ctx, "daily", serde_json::json!({})),
        )
        .await
        .expect("deadline must end the call")
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Context(common::ContextError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_hanging_transport() {
        let client = Arc::new(client(
            pool(&["A"]),
            Arc::new(HangingTransport),
            RetryPolicy::default(),
        ));
        let (ctx, cancel) = Context::with_cancel();
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call(&ctx, "daily", serde_json::json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("hung transport must not outlive cancellation")
            .unwrap()
            .unwrap_err();
        assert!(err.is_context());
    }

    #[tokio::test]
    async fn already_canceled_context_makes_no_attempt() {
        let transport = Arc::new(ScriptedTransport::always(ok()));
        let client = client(pool(&["A"]), transport.clone(), RetryPolicy::default());
        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();

        let err = client
            .call(&ctx, "daily", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_context());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn closed_limiter_fails_the_call() {
        let transport = Arc::new(ScriptedTransport::always(ok()));
        let client = client(pool(&["A"]), transport.clone(), RetryPolicy::default());
        client.limiter().close();

        let err = client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LimiterClosed));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let transport = Arc::new(ScriptedTransport::new(
            vec![Err(TransportError::auth("bad token"))],
            ok(),
        ));
        let client = client(pool(&["A", "B"]), transport, slow_policy(3));
        client
            .call(&Context::background(), "daily", serde_json::json!({}))
            .await
            .unwrap();

        let output = handle.render();
        assert!(output.contains("harvest_upstream_calls_total"));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("classification=\"authentication_invalid\""));
    }
}
