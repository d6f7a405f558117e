//! Process-wide harvester context
//!
//! Built once in `main` from the loaded config and shared by `Arc` with the
//! admin surface. Owns the credential pool, the rate limiter, the resilient
//! client, the orchestrator, the repository and the job scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use common::Context;
use credential_pool::{Credential, CredentialPool, RateLimiter};
use orchestration::{
    BatchDriver, CollectError, CollectionOutcome, Collector, Invocation, JobError, JobScheduler,
    MemoryRepository, Orchestrator, Schedule, Scope,
};
use resilient_client::ResilientClient;
use serde::Deserialize;
use tracing::info;
use transport::Transport;

use crate::collectors::ApiCollector;
use crate::config::{Config, JobConfig};

/// Optional overrides accepted by a manual trigger.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TriggerParams {
    #[serde(default)]
    resources: Option<Vec<String>>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    lookback_days: Option<u32>,
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, CollectError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| CollectError::InvalidScope(format!("{field} '{value}' is not a date")))
}

/// Scope a job collects when nothing overrides it.
#[derive(Debug, Clone)]
struct JobDefaults {
    resources: Vec<String>,
    lookback_days: u32,
}

impl JobDefaults {
    /// Build the scope for one invocation. Manual params override the defaults.
    fn scope_for(&self, params: &serde_json::Value, today: NaiveDate) -> Result<Scope, CollectError> {
        let params: TriggerParams = if params.is_null() {
            TriggerParams::default()
        } else {
            serde_json::from_value(params.clone())
                .map_err(|e| CollectError::InvalidScope(format!("invalid trigger params: {e}")))?
        };

        let resources = params.resources.unwrap_or_else(|| self.resources.clone());
        let lookback = params.lookback_days.unwrap_or(self.lookback_days);
        let end = match params.end_date {
            Some(ref d) => parse_date("end_date", d)?,
            None => today,
        };
        match params.start_date {
            Some(ref d) => Scope::new(resources, parse_date("start_date", d)?, end),
            None => Ok(Scope::lookback(resources, end, lookback)),
        }
    }
}

async fn run_collection(
    collector: Arc<ApiCollector>,
    defaults: JobDefaults,
    ctx: Context,
    invocation: Invocation,
) -> Result<CollectionOutcome, JobError> {
    let scope = defaults.scope_for(&invocation.params, Utc::now().date_naive())?;
    Ok(collector.collect(&ctx, &scope).await?)
}

/// Explicitly constructed replacement for process-global state.
pub struct Harvester {
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<Orchestrator>,
    repository: Arc<MemoryRepository>,
    scheduler: JobScheduler,
    batch: BatchDriver,
    batch_size: usize,
    started_at: Instant,
}

impl Harvester {
    /// Wire every component from `config`. Must be called inside a tokio runtime.
    pub fn build(config: &Config, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let credentials = config
            .upstream
            .credentials
            .iter()
            .map(|token| Credential::from_token(token.expose().clone()))
            .collect();
        let pool = Arc::new(CredentialPool::new(
            credentials,
            Duration::from_secs(config.pool.unhealthy_retry_secs),
        )?);
        let limiter = Arc::new(RateLimiter::new(
            config.limiter.capacity,
            config.limiter.interval(),
        )?);
        let client = Arc::new(ResilientClient::new(
            pool.clone(),
            limiter.clone(),
            transport,
            config.retry.policy(),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(client, config.orchestrator.policy)
                .with_max_in_flight(config.orchestrator.max_in_flight),
        );

        info!(
            policy = %config.orchestrator.policy,
            max_in_flight = config.orchestrator.max_in_flight,
            limiter_capacity = config.limiter.capacity,
            "harvester built"
        );

        Ok(Self {
            pool,
            limiter,
            orchestrator,
            repository: Arc::new(MemoryRepository::new()),
            scheduler: JobScheduler::new(),
            batch: BatchDriver::new(Duration::from_millis(config.orchestrator.item_delay_ms)),
            batch_size: config.orchestrator.batch_size,
            started_at: Instant::now(),
        })
    }

    /// Register one scheduler job per configured collection job.
    pub async fn register_jobs(&self, jobs: &[JobConfig]) -> anyhow::Result<()> {
        for job in jobs {
            self.register_job(job).await?;
        }
        Ok(())
    }

    pub async fn register_job(&self, job: &JobConfig) -> anyhow::Result<()> {
        let schedule = Schedule::parse(&job.schedule)?;
        let mut collector = ApiCollector::new(
            job.name.clone(),
            job.kind,
            self.orchestrator.clone(),
            self.repository.clone(),
        );
        if job.kind.profile().batched {
            collector = collector.with_batching(self.batch.clone(), self.batch_size);
        }
        let collector = Arc::new(collector);
        let defaults = JobDefaults {
            resources: job.resources.clone(),
            lookback_days: job.lookback_days,
        };

        self.scheduler
            .register(job.name.clone(), schedule, move |ctx, invocation| {
                run_collection(collector.clone(), defaults.clone(), ctx, invocation)
            })
            .await?;
        if !job.enabled {
            self.scheduler.set_enabled(&job.name, false).await?;
        }
        Ok(())
    }

    /// Run a job now and hand its aggregate outcome back to the caller.
    pub async fn trigger_manual_collection(
        &self,
        job: &str,
        params: serde_json::Value,
    ) -> Result<CollectionOutcome, JobError> {
        self.scheduler.trigger_now(job, params).await
    }

    pub fn start(&self) -> Result<(), JobError> {
        self.scheduler.start()
    }

    /// Stop scheduling, cancel in-flight jobs, and close the rate limiter.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.limiter.close();
        info!("harvester shut down");
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn repository(&self) -> &Arc<MemoryRepository> {
        &self.repository
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::JobKind;
    use common::Secret;
    use std::future::Future;
    use std::pin::Pin;
    use transport::{Request, Response, TransportError};

    /// Upstream that serves one row per code and rejects the token "bad".
    struct FakeUpstream;

    impl Transport for FakeUpstream {
        fn id(&self) -> &str {
            "fake"
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a Context,
            credential: &'a str,
            request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = transport::Result<Response>> + Send + 'a>> {
            Box::pin(async move {
                if credential == "bad" {
                    return Err(TransportError::auth("token invalid").with_code(40101));
                }
                Ok(Response::new(serde_json::json!({
                    "fields": ["ts_code", "trade_date", "close"],
                    "items": [[request.params["ts_code"], request.params["end_date"], 1.0]],
                })))
            })
        }
    }

    /// Credentials are set directly so the HARVEST_TOKENS override in
    /// other tests cannot leak in.
    fn config(tokens: &[&str]) -> Config {
        let _lock = crate::config::tests::ENV_MUTEX
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut config = Config::parse(
            r#"
[upstream]
url = "http://127.0.0.1:1"
tokens = ["placeholder"]

[orchestrator]
item_delay_ms = 0
"#,
        )
        .unwrap();
        config.upstream.credentials = tokens.iter().map(|t| Secret::new(t.to_string())).collect();
        config
    }

    fn job(name: &str, kind: JobKind, schedule: &str, resources: &[&str]) -> JobConfig {
        JobConfig {
            name: name.into(),
            kind,
            schedule: schedule.into(),
            enabled: true,
            resources: resources.iter().map(|r| r.to_string()).collect(),
            lookback_days: 1,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn scope_defaults_to_lookback_ending_today() {
        let defaults = JobDefaults {
            resources: vec!["000001.SH".into()],
            lookback_days: 3,
        };
        let scope = defaults
            .scope_for(&serde_json::Value::Null, date(2024, 3, 10))
            .unwrap();
        assert_eq!(scope.resources, vec!["000001.SH"]);
        assert_eq!((scope.start, scope.end), (date(2024, 3, 8), date(2024, 3, 10)));
    }

    #[test]
    fn manual_params_override_scope() {
        let defaults = JobDefaults {
            resources: vec!["000001.SH".into()],
            lookback_days: 1,
        };
        let scope = defaults
            .scope_for(
                &serde_json::json!({
                    "resources": ["600000.SH"],
                    "start_date": "2024-01-02",
                    "end_date": "20240105",
                }),
                date(2024, 3, 10),
            )
            .unwrap();
        assert_eq!(scope.resources, vec!["600000.SH"]);
        assert_eq!((scope.start, scope.end), (date(2024, 1, 2), date(2024, 1, 5)));
    }

    #[test]
    fn bad_params_are_rejected() {
        let defaults = JobDefaults {
            resources: vec![],
            lookback_days: 1,
        };
        let today = date(2024, 3, 10);
        for params in [
            serde_json::json!({"start_date": "yesterday"}),
            serde_json::json!({"start_date": "2024-03-09", "end_date": "2024-03-01"}),
            serde_json::json!({"symbols": ["x"]}),
        ] {
            assert!(matches!(
                defaults.scope_for(&params, today),
                Err(CollectError::InvalidScope(_))
            ));
        }
    }

    #[tokio::test]
    async fn manual_collection_returns_outcome_and_stores_records() {
        let harvester = Harvester::build(&config(&["good"]), Arc::new(FakeUpstream)).unwrap();
        harvester
            .register_jobs(&[job(
                "index-daily",
                JobKind::MarketIndex,
                "daily 08:30",
                &["000001.SH", "399001.SZ"],
            )])
            .await
            .unwrap();

        let outcome = harvester
            .trigger_manual_collection(
                "index-daily",
                serde_json::json!({"start_date": "2024-03-01", "end_date": "2024-03-01"}),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.records, 2);
        assert!(
            harvester
                .repository()
                .get("index_daily", &["000001.SH", "20240301"])
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn bad_token_is_rotated_past() {
        let harvester =
            Harvester::build(&config(&["bad", "good"]), Arc::new(FakeUpstream)).unwrap();
        harvester
            .register_job(&job("sectors", JobKind::Sector, "manual", &["885431.TI"]))
            .await
            .unwrap();

        let outcome = harvester
            .trigger_manual_collection("sectors", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(harvester.pool().healthy_count().await, 1);
    }

    #[tokio::test]
    async fn disabled_jobs_register_disabled() {
        let harvester = Harvester::build(&config(&["good"]), Arc::new(FakeUpstream)).unwrap();
        let mut news = job("news", JobKind::News, "every 15m", &[]);
        news.enabled = false;
        harvester.register_job(&news).await.unwrap();

        let jobs = harvester.scheduler().list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].enabled);
        assert_eq!(jobs[0].schedule, "every 15m");
    }

    #[tokio::test]
    async fn unknown_job_trigger_fails() {
        let harvester = Harvester::build(&config(&["good"]), Arc::new(FakeUpstream)).unwrap();
        assert!(matches!(
            harvester
                .trigger_manual_collection("missing", serde_json::Value::Null)
                .await,
            Err(JobError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_limiter() {
        let harvester = Harvester::build(&config(&["good"]), Arc::new(FakeUpstream)).unwrap();
        harvester.start().unwrap();
        harvester.shutdown().await;
        assert!(!harvester.scheduler().is_running());
        assert!(harvester.limiter.is_closed());
    }
}
