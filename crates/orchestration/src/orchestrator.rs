//! Fan-out of one unit of work into concurrent upstream calls
//!
//! Every sub-task runs to completion (or until its context ends) regardless
//! of how the others fare. The unit's success is judged afterwards by the
//! configured `CompletionPolicy`.

use std::collections::HashMap;
use std::sync::Arc;

use common::Context;
use resilient_client::ResilientClient;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use transport::{Request, Response};

use crate::outcome::{CollectionOutcome, CompletionPolicy};

/// One labeled upstream call of a unit.
#[derive(Debug, Clone)]
pub struct Subtask {
    pub label: String,
    pub request: Request,
}

impl Subtask {
    pub fn new(label: impl Into<String>, request: Request) -> Self {
        Self {
            label: label.into(),
            request,
        }
    }
}

/// Aggregate of one fan-out: the outcome plus the successful responses in
/// sub-task order.
#[derive(Debug, Clone)]
pub struct FanOut {
    pub outcome: CollectionOutcome,
    pub responses: Vec<(String, Response)>,
}

pub struct Orchestrator {
    client: Arc<ResilientClient>,
    policy: CompletionPolicy,
    max_in_flight: Option<usize>,
}

impl Orchestrator {
    pub fn new(client: Arc<ResilientClient>, policy: CompletionPolicy) -> Self {
        Self {
            client,
            policy,
            max_in_flight: None,
        }
    }

    /// Bound the number of concurrently running sub-tasks. Zero means unbounded.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = (max_in_flight > 0).then_some(max_in_flight);
        self
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    /// Run every sub-task concurrently and aggregate the results.
    pub async fn run_all(&self, ctx: &Context, subtasks: Vec<Subtask>) -> FanOut {
        let total = subtasks.len();
        let limit = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let labels: Vec<String> = subtasks.iter().map(|s| s.label.clone()).collect();

        let mut set = JoinSet::new();
        let mut task_index = HashMap::with_capacity(total);
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let client = self.client.clone();
            let ctx = ctx.clone();
            let limit = limit.clone();
            let handle = set.spawn(async move {
                let _permit = match limit {
                    Some(limit) => match ctx.run(limit.acquire_owned()).await {
                        Ok(Ok(permit)) => Some(permit),
                        Ok(Err(_)) => None,
                        Err(reason) => return (index, Err(reason.into())),
                    },
                    None => None,
                };
                (index, client.call_request(&ctx, &subtask.request).await)
            });
            task_index.insert(handle.id(), index);
        }

        let mut results: Vec<Option<Result<Response, String>>> = vec![None; total];
        let mut classifications = vec![None; total];
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, (index, Ok(response)))) => results[index] = Some(Ok(response)),
                Ok((_, (index, Err(e)))) => {
                    classifications[index] = e.classification();
                    results[index] = Some(Err(e.to_string()));
                }
                Err(e) => {
                    if let Some(&index) = task_index.get(&e.id()) {
                        results[index] = Some(Err(format!("sub-task panicked: {e}")));
                    }
                }
            }
        }

        let mut outcome = CollectionOutcome::new();
        let mut responses = Vec::new();
        for (index, (label, result)) in labels.into_iter().zip(results).enumerate() {
            match result {
                Some(Ok(response)) => {
                    outcome.record_success();
                    responses.push((label, response));
                }
                Some(Err(message)) => {
                    warn!(subtask = %label, error = %message, "sub-task failed");
                    outcome.record_failure(label, classifications[index], message);
                }
                None => outcome.record_failure(label, None, "sub-task did not report"),
            }
        }

        let outcome = outcome.finalize(self.policy);
        debug!(
            total = outcome.total,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            success = outcome.success,
            policy = %self.policy,
            "fan-out finished"
        );
        FanOut { outcome, responses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential_pool::{CredentialPool, RateLimiter};
    use resilient_client::RetryPolicy;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use transport::{ErrorClassification, Transport, TransportError};

    /// Fails every request whose resource is listed in `failing`, and tracks
    /// the peak number of concurrent invocations.
    struct FakeTransport {
        failing: Vec<&'static str>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(failing: Vec<&'static str>, delay: Duration) -> Self {
            Self {
                failing,
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for FakeTransport {
        fn id(&self) -> &str {
            "fake"
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a Context,
            _credential: &'a str,
            request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = transport::Result<Response>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.failing.contains(&request.resource.as_str()) {
                    Err(TransportError::fatal(format!("{} rejected", request.resource)))
                } else {
                    Ok(Response::new(serde_json::json!({"resource": request.resource})))
                }
            })
        }
    }

    fn orchestrator(transport: Arc<FakeTransport>, policy: CompletionPolicy) -> Orchestrator {
        let pool = Arc::new(CredentialPool::from_tokens(["tok-a", "tok-b"]).unwrap());
        let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)).unwrap());
        let client = Arc::new(ResilientClient::new(
            pool,
            limiter,
            transport,
            RetryPolicy::new(1),
        ));
        Orchestrator::new(client, policy)
    }

    fn subtasks(resources: &[&str]) -> Vec<Subtask> {
        resources
            .iter()
            .map(|r| Subtask::new(*r, Request::new(*r, serde_json::Value::Null)))
            .collect()
    }

    #[tokio::test]
    async fn one_failure_of_four_fails_unit_under_require_all() {
        let transport = Arc::new(FakeTransport::new(vec!["c"], Duration::from_millis(5)));
        let orch = orchestrator(transport.clone(), CompletionPolicy::RequireAll);

        let fan_out = orch
            .run_all(&Context::background(), subtasks(&["a", "b", "c", "d"]))
            .await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 4, "all sub-tasks run");
        assert_eq!(fan_out.outcome.succeeded, 3);
        assert_eq!(fan_out.outcome.failed, 1);
        assert!(!fan_out.outcome.success);
        assert_eq!(fan_out.outcome.errors[0].label, "c");
        assert_eq!(
            fan_out.outcome.errors[0].classification,
            Some(ErrorClassification::Fatal)
        );
        let labels: Vec<&str> = fan_out.responses.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn best_effort_any_succeeds_with_partial_failures() {
        let transport = Arc::new(FakeTransport::new(vec!["a", "b"], Duration::ZERO));
        let orch = orchestrator(transport, CompletionPolicy::BestEffortAny);
        let fan_out = orch
            .run_all(&Context::background(), subtasks(&["a", "b", "c"]))
            .await;
        assert!(fan_out.outcome.success);
        assert_eq!(fan_out.outcome.failed, 2);
    }

    #[tokio::test]
    async fn empty_unit_is_a_success() {
        let transport = Arc::new(FakeTransport::new(vec![], Duration::ZERO));
        let fan_out = orchestrator(transport, CompletionPolicy::RequireAll)
            .run_all(&Context::background(), Vec::new())
            .await;
        assert!(fan_out.outcome.success);
        assert_eq!(fan_out.outcome.total, 0);
    }

    #[tokio::test]
    async fn sub_tasks_run_concurrently() {
        let transport = Arc::new(FakeTransport::new(vec![], Duration::from_millis(50)));
        let orch = orchestrator(transport.clone(), CompletionPolicy::RequireAll);
        orch.run_all(&Context::background(), subtasks(&["a", "b", "c", "d", "e"]))
            .await;
        assert_eq!(transport.peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn max_in_flight_bounds_concurrency() {
        let transport = Arc::new(FakeTransport::new(vec![], Duration::from_millis(20)));
        let orch =
            orchestrator(transport.clone(), CompletionPolicy::RequireAll).with_max_in_flight(2);
        let fan_out = orch
            .run_all(&Context::background(), subtasks(&["a", "b", "c", "d", "e", "f"]))
            .await;
        assert!(fan_out.outcome.success);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn canceled_context_fails_every_sub_task() {
        let transport = Arc::new(FakeTransport::new(vec![], Duration::ZERO));
        let orch = orchestrator(transport.clone(), CompletionPolicy::BestEffortAny);
        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();

        let fan_out = orch.run_all(&ctx, subtasks(&["a", "b"])).await;
        assert_eq!(fan_out.outcome.failed, 2);
        assert!(!fan_out.outcome.success);
        assert!(fan_out.outcome.errors[0].message.contains("canceled"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
