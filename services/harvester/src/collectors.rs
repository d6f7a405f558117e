//! Upstream collectors for each job kind
//!
//! Every kind is the same `ApiCollector` with a different upstream API,
//! target table and natural key. A scope with resource codes fans out into one
//! sub-call per code; an empty scope is one date-ranged call. Multi-symbol
//! kinds split the codes into chunks and walk them with the batch driver.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::NaiveDate;
use common::Context;
use orchestration::{
    BatchDriver, CollectError, CollectionOutcome, Collector, Orchestrator, Record, Repository,
    Scope, Subtask, SubtaskError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use transport::Request;

/// Kinds of data the harvester collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    MarketIndex,
    IndustryIndex,
    Sector,
    StockQuote,
    AdjFactor,
    News,
}

/// How one kind maps onto the upstream and the repository.
#[derive(Debug, Clone, Copy)]
pub struct KindProfile {
    pub api: &'static str,
    pub table: &'static str,
    /// Request parameter carrying one resource code
    pub resource_param: &'static str,
    pub key_fields: &'static [&'static str],
    /// Walk resource codes in chunks through the batch driver
    pub batched: bool,
}

impl JobKind {
    pub fn profile(&self) -> KindProfile {
        match self {
            JobKind::MarketIndex => KindProfile {
                api: "index_daily",
                table: "index_daily",
                resource_param: "ts_code",
                key_fields: &["ts_code", "trade_date"],
                batched: false,
            },
            JobKind::IndustryIndex => KindProfile {
                api: "sw_daily",
                table: "industry_daily",
                resource_param: "ts_code",
                key_fields: &["ts_code", "trade_date"],
                batched: false,
            },
            JobKind::Sector => KindProfile {
                api: "ths_daily",
                table: "sector_daily",
                resource_param: "ts_code",
                key_fields: &["ts_code", "trade_date"],
                batched: false,
            },
            JobKind::StockQuote => KindProfile {
                api: "daily",
                table: "stock_daily",
                resource_param: "ts_code",
                key_fields: &["ts_code", "trade_date"],
                batched: true,
            },
            JobKind::AdjFactor => KindProfile {
                api: "adj_factor",
                table: "adj_factor",
                resource_param: "ts_code",
                key_fields: &["ts_code", "trade_date"],
                batched: true,
            },
            JobKind::News => KindProfile {
                api: "news",
                table: "news",
                resource_param: "src",
                key_fields: &["src", "datetime", "title"],
                batched: false,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobKind::MarketIndex => "market_index",
            JobKind::IndustryIndex => "industry_index",
            JobKind::Sector => "sector",
            JobKind::StockQuote => "stock_quote",
            JobKind::AdjFactor => "adj_factor",
            JobKind::News => "news",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Upstream date format.
fn upstream_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// A run of resource codes processed as one batch item.
struct Chunk(Vec<String>);

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("(empty)"),
            [only] => f.write_str(only),
            [first, .., last] => write!(f, "{first}..{last} ({})", self.0.len()),
        }
    }
}

/// Generic collector configured by a `JobKind`.
pub struct ApiCollector {
    name: String,
    kind: JobKind,
    profile: KindProfile,
    key_fields: Vec<String>,
    orchestrator: Arc<Orchestrator>,
    repository: Arc<dyn Repository>,
    batch: Option<(BatchDriver, usize)>,
}

impl ApiCollector {
    pub fn new(
        name: impl Into<String>,
        kind: JobKind,
        orchestrator: Arc<Orchestrator>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        let profile = kind.profile();
        Self {
            name: name.into(),
            kind,
            profile,
            key_fields: profile.key_fields.iter().map(|f| f.to_string()).collect(),
            orchestrator,
            repository,
            batch: None,
        }
    }

    /// Walk resource codes in chunks of `batch_size`, pausing between chunks.
    pub fn with_batching(mut self, driver: BatchDriver, batch_size: usize) -> Self {
        self.batch = Some((driver, batch_size.max(1)));
        self
    }

    fn subtasks(&self, scope: &Scope, resources: &[String]) -> Vec<Subtask> {
        let mut base = serde_json::Map::new();
        base.insert("start_date".into(), upstream_date(scope.start).into());
        base.insert("end_date".into(), upstream_date(scope.end).into());

        if resources.is_empty() {
            let label = format!("{}:{}-{}", self.profile.api, scope.start, scope.end);
            return vec![Subtask::new(
                label,
                Request::new(self.profile.api, serde_json::Value::Object(base)),
            )];
        }

        resources
            .iter()
            .map(|code| {
                let mut params = base.clone();
                params.insert(self.profile.resource_param.into(), code.clone().into());
                Subtask::new(
                    code.clone(),
                    Request::new(self.profile.api, serde_json::Value::Object(params)),
                )
            })
            .collect()
    }

    /// Fan out, flatten the payloads, and upsert them.
    async fn collect_unit(
        &self,
        ctx: &Context,
        scope: &Scope,
        resources: &[String],
    ) -> Result<CollectionOutcome, CollectError> {
        let fan_out = self
            .orchestrator
            .run_all(ctx, self.subtasks(scope, resources))
            .await;
        let mut outcome = fan_out.outcome;

        let mut records: Vec<Record> = Vec::new();
        for (label, response) in &fan_out.responses {
            for mut record in response.records() {
                // Per-resource calls may omit the code they were asked for.
                if !resources.is_empty() {
                    record
                        .entry(self.profile.resource_param)
                        .or_insert_with(|| label.clone().into());
                }
                records.push(record);
            }
        }

        if !records.is_empty() {
            match self
                .repository
                .upsert_batch(self.profile.table, &self.key_fields, records)
                .await
            {
                Ok(written) => outcome.records = written,
                Err(e) => {
                    warn!(
                        collector = %self.name,
                        table = self.profile.table,
                        error = %e,
                        "upsert failed, fetched rows dropped"
                    );
                    // Nothing fetched was persisted.
                    outcome.failed += outcome.succeeded;
                    outcome.succeeded = 0;
                    outcome.errors.push(SubtaskError {
                        label: self.profile.table.to_string(),
                        classification: None,
                        message: e.to_string(),
                    });
                    outcome = outcome.finalize(self.orchestrator.policy());
                }
            }
        }
        debug!(
            collector = %self.name,
            subtasks = outcome.total,
            records = outcome.records,
            "unit collected"
        );
        Ok(outcome)
    }
}

impl Collector for ApiCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect<'a>(
        &'a self,
        ctx: &'a Context,
        scope: &'a Scope,
    ) -> Pin<Box<dyn Future<Output = Result<CollectionOutcome, CollectError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                collector = %self.name,
                kind = %self.kind,
                resources = scope.resources.len(),
                start = %scope.start,
                end = %scope.end,
                "collection started"
            );

            match &self.batch {
                Some((driver, batch_size)) if scope.resources.len() > *batch_size => {
                    let chunks: Vec<Chunk> = scope
                        .resources
                        .chunks(*batch_size)
                        .map(|c| Chunk(c.to_vec()))
                        .collect();
                    let batch = driver
                        .run(ctx, chunks, |ctx, chunk| async move {
                            self.collect_unit(&ctx, scope, &chunk.0).await
                        })
                        .await;
                    Ok(batch.summarize(self.orchestrator.policy()))
                }
                _ => self.collect_unit(ctx, scope, &scope.resources).await,
            }
        })
    }
}
