//! Generic job scheduler
//!
//! Jobs are named handler closures with a `Schedule`. A single dispatcher task
//! sleeps until the earliest due job, then dispatches every due job of that
//! epoch onto its own task, so a slow handler never delays another job.
//!
//! Scheduled runs are fire-and-forget: their results surface through logs,
//! the per-job counters in `list_jobs`, and metrics. Manual runs through
//! `trigger_now` return the handler's result to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use common::{CancelHandle, Context};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::outcome::CollectionOutcome;
use crate::schedule::Schedule;

/// Future returned by a job handler.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<CollectionOutcome, JobError>> + Send>>;

type Handler = Arc<dyn Fn(Context, Invocation) -> JobFuture + Send + Sync>;

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Arguments passed to a handler for one run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job: String,
    pub trigger: Trigger,
    /// Caller-supplied parameters for manual runs, `Null` for scheduled runs.
    pub params: serde_json::Value,
    pub fired_at: DateTime<Utc>,
}

/// Snapshot of one job for observability.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub running: u32,
    pub last_error: Option<String>,
    pub last_outcome: Option<CollectionOutcome>,
}

struct Job {
    schedule: Schedule,
    handler: Handler,
    enabled: bool,
    /// Distinguishes a job from a later replacement registered under the same name.
    generation: u64,
    due: Option<Instant>,
    last_run: Option<DateTime<Utc>>,
    runs: u64,
    succeeded: u64,
    failed: u64,
    running: u32,
    last_error: Option<String>,
    last_outcome: Option<CollectionOutcome>,
}

impl Job {
    fn new(schedule: Schedule, handler: Handler, generation: u64) -> Self {
        Self {
            schedule,
            handler,
            enabled: true,
            generation,
            due: next_due(&schedule),
            last_run: None,
            runs: 0,
            succeeded: 0,
            failed: 0,
            running: 0,
            last_error: None,
            last_outcome: None,
        }
    }

    fn info(&self, name: &str, now: Instant, wall: DateTime<Utc>) -> JobInfo {
        let next_run = if self.enabled {
            self.due.and_then(|due| {
                chrono::Duration::from_std(due.saturating_duration_since(now))
                    .ok()
                    .map(|d| wall + d)
            })
        } else {
            None
        };
        JobInfo {
            name: name.to_string(),
            schedule: self.schedule.to_string(),
            enabled: self.enabled,
            last_run: self.last_run,
            next_run,
            runs: self.runs,
            succeeded: self.succeeded,
            failed: self.failed,
            running: self.running,
            last_error: self.last_error.clone(),
            last_outcome: self.last_outcome.clone(),
        }
    }
}

fn next_due(schedule: &Schedule) -> Option<Instant> {
    schedule
        .until_next(Utc::now())
        .map(|delay| Instant::now() + delay)
}

struct Shared {
    jobs: RwLock<HashMap<String, Job>>,
    wake: Notify,
    /// Parent of every handler context.
    root: Context,
    generations: AtomicU64,
}

impl Shared {
    async fn next_wake(&self) -> Option<Instant> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.enabled)
            .filter_map(|job| job.due)
            .min()
    }

    /// Dispatch every enabled job that is due. One call is one epoch.
    async fn dispatch_due(self: &Arc<Self>) {
        let now = Instant::now();
        let wall = Utc::now();

        let mut fired = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for (name, job) in jobs.iter_mut() {
                if !job.enabled || !job.due.is_some_and(|due| due <= now) {
                    continue;
                }
                job.due = job.schedule.until_next(wall).map(|delay| now + delay);
                job.running += 1;
                job.last_run = Some(wall);
                fired.push((name.clone(), job.generation, job.handler.clone()));
            }
        }

        for (name, generation, handler) in fired {
            debug!(job = %name, "dispatching scheduled run");
            let invocation = Invocation {
                job: name.clone(),
                trigger: Trigger::Scheduled,
                params: serde_json::Value::Null,
                fired_at: wall,
            };
            let shared = self.clone();
            tokio::spawn(async move {
                let _ = execute(shared, name, generation, handler, invocation).await;
            });
        }
    }

    async fn finish(&self, name: &str, generation: u64, result: &Result<CollectionOutcome, JobError>) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(name) else {
            return;
        };
        if job.generation != generation {
            return;
        }
        job.running = job.running.saturating_sub(1);
        job.runs += 1;
        match result {
            Ok(outcome) => {
                if outcome.success {
                    job.succeeded += 1;
                    job.last_error = None;
                } else {
                    job.failed += 1;
                    job.last_error = outcome.error_summary();
                }
                job.last_outcome = Some(outcome.clone());
            }
            Err(e) => {
                job.failed += 1;
                job.last_error = Some(e.to_string());
            }
        }
    }
}

/// Run one invocation to completion, isolating panics, and record the result.
async fn execute(
    shared: Arc<Shared>,
    name: String,
    generation: u64,
    handler: Handler,
    invocation: Invocation,
) -> Result<CollectionOutcome, JobError> {
    let started = Instant::now();
    let trigger = invocation.trigger;
    let future = (*handler)(shared.root.clone(), invocation);

    let result = match tokio::spawn(future).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::Panicked(name.clone())),
        Err(_) => Err(JobError::Failed("job task was aborted".into())),
    };

    let elapsed = started.elapsed();
    let status = match &result {
        Ok(outcome) if outcome.success => "success",
        Ok(_) => "failed",
        Err(_) => "error",
    };
    metrics::counter!("harvest_job_runs_total", "job" => name.clone(), "status" => status)
        .increment(1);
    metrics::histogram!("harvest_job_duration_seconds", "job" => name.clone())
        .record(elapsed.as_secs_f64());

    match &result {
        Ok(outcome) if outcome.success => info!(
            job = %name,
            trigger = ?trigger,
            total = outcome.total,
            records = outcome.records,
            duration_ms = elapsed.as_millis() as u64,
            "job run completed"
        ),
        Ok(outcome) => warn!(
            job = %name,
            trigger = ?trigger,
            total = outcome.total,
            failed = outcome.failed,
            errors = outcome.error_summary().unwrap_or_default(),
            duration_ms = elapsed.as_millis() as u64,
            "job run completed with failures"
        ),
        Err(e) => error!(
            job = %name,
            trigger = ?trigger,
            error = %e,
            duration_ms = elapsed.as_millis() as u64,
            "job run failed"
        ),
    }

    shared.finish(&name, generation, &result).await;
    result
}

struct Dispatcher {
    stop: CancelHandle,
    handle: JoinHandle<()>,
}

async fn dispatch_loop(shared: Arc<Shared>, stop: Context) {
    loop {
        let wake_at = shared.next_wake().await;
        let sleep = async {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = stop.done() => break,
            // Registry changed; recompute the earliest due job.
            _ = shared.wake.notified() => continue,
            _ = sleep => {}
        }
        shared.dispatch_due().await;
    }
    debug!("dispatcher exited");
}

/// Registry and dispatcher for named jobs.
pub struct JobScheduler {
    shared: Arc<Shared>,
    root_cancel: CancelHandle,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::with_context(&Context::background())
    }

    /// Scheduler whose handlers run under a child of `parent`.
    pub fn with_context(parent: &Context) -> Self {
        let (root, root_cancel) = parent.child_with_cancel();
        Self {
            shared: Arc::new(Shared {
                jobs: RwLock::new(HashMap::new()),
                wake: Notify::new(),
                root,
                generations: AtomicU64::new(0),
            }),
            root_cancel,
            dispatcher: Mutex::new(None),
        }
    }

    /// Register `handler` under `name`, replacing any job already registered
    /// under that name.
    pub async fn register<F, Fut>(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        handler: F,
    ) -> Result<(), JobError>
    where
        F: Fn(Context, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CollectionOutcome, JobError>> + Send + 'static,
    {
        schedule.validate()?;
        let name = name.into();
        let handler: Handler =
            Arc::new(move |ctx, invocation| Box::pin(handler(ctx, invocation)) as JobFuture);
        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .shared
            .jobs
            .write()
            .await
            .insert(name.clone(), Job::new(schedule, handler, generation))
            .is_some();
        info!(job = %name, schedule = %schedule, replaced, "job registered");
        self.shared.wake.notify_one();
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<(), JobError> {
        self.shared
            .jobs
            .write()
            .await
            .remove(name)
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        info!(job = %name, "job unregistered");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Enable or disable scheduled firing. Disabled jobs can still be triggered.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), JobError> {
        {
            let mut jobs = self.shared.jobs.write().await;
            let job = jobs
                .get_mut(name)
                .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
            if job.enabled == enabled {
                return Ok(());
            }
            job.enabled = enabled;
            if enabled {
                job.due = next_due(&job.schedule);
            }
        }
        info!(job = %name, enabled, "job toggled");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Run `name` now and return its result. The schedule is not disturbed.
    pub async fn trigger_now(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<CollectionOutcome, JobError> {
        let fired_at = Utc::now();
        let (handler, generation) = {
            let mut jobs = self.shared.jobs.write().await;
            let job = jobs
                .get_mut(name)
                .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
            job.running += 1;
            job.last_run = Some(fired_at);
            (job.handler.clone(), job.generation)
        };

        info!(job = %name, "manual run triggered");
        let invocation = Invocation {
            job: name.to_string(),
            trigger: Trigger::Manual,
            params,
            fired_at,
        };
        // Detached so the run is still recorded if the caller goes away.
        let run = tokio::spawn(execute(
            self.shared.clone(),
            name.to_string(),
            generation,
            handler,
            invocation,
        ));
        match run.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::Panicked(name.to_string())),
            Err(_) => Err(JobError::Failed("job task was aborted".into())),
        }
    }

    /// Snapshot of every job, sorted by name.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let now = Instant::now();
        let wall = Utc::now();
        let mut jobs: Vec<JobInfo> = self
            .shared
            .jobs
            .read()
            .await
            .iter()
            .map(|(name, job)| job.info(name, now, wall))
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub async fn job(&self, name: &str) -> Option<JobInfo> {
        let jobs = self.shared.jobs.read().await;
        jobs.get(name)
            .map(|job| job.info(name, Instant::now(), Utc::now()))
    }

    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), JobError> {
        let mut slot = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.shared.root.is_done() {
            return Err(JobError::ShutDown);
        }
        if slot.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return Err(JobError::AlreadyRunning);
        }
        let (stop_ctx, stop) = self.shared.root.child_with_cancel();
        let handle = tokio::spawn(dispatch_loop(self.shared.clone(), stop_ctx));
        *slot = Some(Dispatcher { stop, handle });
        info!("job scheduler started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
    }

    /// Stop the dispatcher once the current epoch is dispatched.
    ///
    /// In-flight handlers keep running; use `shutdown` to cancel them.
    pub async fn stop(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(dispatcher) = dispatcher else {
            return;
        };
        dispatcher.stop.cancel();
        if let Err(e) = dispatcher.handle.await {
            warn!(error = %e, "dispatcher task ended abnormally");
        }
        info!("job scheduler stopped");
    }

    /// Stop the dispatcher and cancel every in-flight handler.
    ///
    /// Final: a shut-down scheduler cannot be started again.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.root_cancel.cancel();
    }

    /// Parent context of every handler.
    pub fn context(&self) -> &Context {
        &self.shared.root
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        let dispatcher = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop.cancel();
        }
    }
}
