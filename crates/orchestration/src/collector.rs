//! Collector and repository seams
//!
//! A `Collector` fetches one kind of data for a `Scope` and writes it through
//! a `Repository`. Writes are idempotent upserts keyed by a natural business
//! key, so retries, overlapping jobs and backfills are safe to repeat.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use chrono::{Days, NaiveDate};
use common::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CollectError;
use crate::outcome::CollectionOutcome;

/// One row as returned by the upstream.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Which resources and which date range a collection covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Resource codes, e.g. index or security codes. Empty means "everything".
    #[serde(default)]
    pub resources: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Scope {
    pub fn new(resources: Vec<String>, start: NaiveDate, end: NaiveDate) -> Result<Self, CollectError> {
        if start > end {
            return Err(CollectError::InvalidScope(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self {
            resources,
            start,
            end,
        })
    }

    /// The `days` days ending on `today`, inclusive.
    pub fn lookback(resources: Vec<String>, today: NaiveDate, days: u32) -> Self {
        let start = today
            .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN);
        Self {
            resources,
            start,
            end: today,
        }
    }

    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }
}

/// Business-specific fetch, parse and store for one kind of data.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn collect<'a>(
        &'a self,
        ctx: &'a Context,
        scope: &'a Scope,
    ) -> Pin<Box<dyn Future<Output = Result<CollectionOutcome, CollectError>> + Send + 'a>>;
}

/// Batch-upsert persistence.
pub trait Repository: Send + Sync {
    /// Insert or overwrite `records` in `table`, keyed by the values of
    /// `key_fields`. Returns how many records were written.
    fn upsert_batch<'a>(
        &'a self,
        table: &'a str,
        key_fields: &'a [String],
        records: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, CollectError>> + Send + 'a>>;
}

/// In-memory repository, keyed per table by natural key.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys stored in `table`.
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, BTreeMap::len)
    }

    /// Look up one record by its key values, in key-field order.
    pub async fn get(&self, table: &str, key: &[&str]) -> Option<Record> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(&key.join("|")))
            .cloned()
    }

    /// Row counts per table, sorted by table name.
    pub async fn table_sizes(&self) -> BTreeMap<String, usize> {
        self.tables
            .read()
            .await
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len()))
            .collect()
    }
}

fn natural_key(record: &Record, key_fields: &[String]) -> Result<String, CollectError> {
    if key_fields.is_empty() {
        return Err(CollectError::Repository("no key fields configured".into()));
    }
    let mut parts = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let part = match record.get(field) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => {
                return Err(CollectError::Repository(format!(
                    "record is missing key field '{field}'"
                )));
            }
            Some(other) => other.to_string(),
        };
        parts.push(part);
    }
    Ok(parts.join("|"))
}

impl Repository for MemoryRepository {
    fn upsert_batch<'a>(
        &'a self,
        table: &'a str,
        key_fields: &'a [String],
        records: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, CollectError>> + Send + 'a>> {
        Box::pin(async move {
            // Validate the whole batch before touching the table.
            let keyed = records
                .into_iter()
                .map(|record| natural_key(&record, key_fields).map(|key| (key, record)))
                .collect::<Result<Vec<_>, _>>()?;

            let written = keyed.len();
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table.to_string()).or_default();
            for (key, record) in keyed {
                rows.insert(key, record);
            }
            debug!(table, written, "upserted batch");
            Ok(written)
        })
    }
}
