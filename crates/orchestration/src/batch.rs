//! Sequential batch driver
//!
//! Repeats a unit of work across many entities (e.g. one per security code)
//! one at a time, pausing a fixed delay between items. The pause is on top of
//! the client's rate limiter and is interrupted by cancellation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use common::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CollectError;
use crate::outcome::{CollectionOutcome, CompletionPolicy};

/// Result of the unit for one item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub item: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CollectionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.outcome.as_ref().is_some_and(|o| o.success)
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub items: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items never started because the batch was canceled.
    pub skipped: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchOutcome {
    /// Fold every item into one `CollectionOutcome` judged by `policy`.
    ///
    /// A batch that skipped items is never a success.
    pub fn summarize(&self, policy: CompletionPolicy) -> CollectionOutcome {
        let mut total = CollectionOutcome::new();
        for item in &self.outcomes {
            match (&item.outcome, &item.error) {
                (Some(outcome), _) => total.merge(outcome.clone()),
                (None, Some(error)) => total.record_failure(item.item.clone(), None, error.clone()),
                (None, None) => {}
            }
        }
        let mut total = total.finalize(policy);
        if self.skipped > 0 {
            total.success = false;
            total.errors.push(crate::outcome::SubtaskError {
                label: "batch".into(),
                classification: None,
                message: format!("{} items skipped after cancellation", self.skipped),
            });
        }
        total
    }
}

#[derive(Debug, Clone)]
pub struct BatchDriver {
    item_delay: Duration,
}

impl BatchDriver {
    pub fn new(item_delay: Duration) -> Self {
        Self { item_delay }
    }

    pub fn item_delay(&self) -> Duration {
        self.item_delay
    }

    /// Run `unit` for each item in order.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, items: Vec<T>, mut unit: F) -> BatchOutcome
    where
        T: Display,
        F: FnMut(Context, T) -> Fut,
        Fut: Future<Output = Result<CollectionOutcome, CollectError>>,
    {
        let mut batch = BatchOutcome {
            items: items.len(),
            ..Default::default()
        };
        let count = items.len();

        for (index, item) in items.into_iter().enumerate() {
            if let Some(reason) = ctx.err() {
                batch.skipped = count - index;
                warn!(skipped = batch.skipped, reason = %reason, "batch interrupted");
                break;
            }

            let label = item.to_string();
            let result = unit(ctx.clone(), item).await;
            let entry = match result {
                Ok(outcome) => ItemOutcome {
                    item: label,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    warn!(item = %label, error = %e, "batch item failed");
                    ItemOutcome {
                        item: label,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            if entry.is_success() {
                batch.completed += 1;
            } else {
                batch.failed += 1;
            }
            batch.outcomes.push(entry);

            let remaining = count - index - 1;
            if remaining > 0 && !self.item_delay.is_zero() {
                if let Err(reason) = common::sleep(ctx, self.item_delay).await {
                    batch.skipped = remaining;
                    warn!(skipped = remaining, reason = %reason, "batch interrupted");
                    break;
                }
            }
        }

        info!(
            items = batch.items,
            completed = batch.completed,
            failed = batch.failed,
            skipped = batch.skipped,
            "batch finished"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ok_unit(records: usize) -> CollectionOutcome {
        let mut outcome = CollectionOutcome::new();
        outcome.record_success();
        outcome.records = records;
        outcome.finalize(CompletionPolicy::RequireAll)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_items_in_order_with_delay() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let driver = BatchDriver::new(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let batch = driver
            .run(&Context::background(), vec!["600000.SH", "600036.SH", "000001.SZ"], |_ctx, code| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((code.to_string(), tokio::time::Instant::now()));
                    Ok(ok_unit(10))
                }
            })
            .await;

        assert_eq!((batch.items, batch.completed, batch.failed, batch.skipped), (3, 3, 0, 0));
        let seen = seen.lock().unwrap();
        let codes: Vec<&str> = seen.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(codes, vec!["600000.SH", "600036.SH", "000001.SZ"]);
        assert!(seen[1].1 - seen[0].1 >= Duration::from_millis(200));
        // No trailing delay after the last item.
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(batch.summarize(CompletionPolicy::RequireAll).records, 30);
    }

    #[tokio::test]
    async fn failed_items_do_not_stop_the_batch() {
        let driver = BatchDriver::new(Duration::ZERO);
        let batch = driver
            .run(&Context::background(), vec![1, 2, 3, 4], |_ctx, n| async move {
                match n {
                    2 => Err(CollectError::Payload("bad rows".into())),
                    3 => {
                        let mut outcome = CollectionOutcome::new();
                        outcome.record_failure("daily", None, "timeout");
                        Ok(outcome.finalize(CompletionPolicy::RequireAll))
                    }
                    _ => Ok(ok_unit(1)),
                }
            })
            .await;

        assert_eq!((batch.completed, batch.failed), (2, 2));
        let summary = batch.summarize(CompletionPolicy::RequireAll);
        assert_eq!((summary.total, summary.succeeded, summary.failed), (4, 2, 2));
        assert!(!summary.success);
        assert!(batch.summarize(CompletionPolicy::BestEffortAny).success);
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_items() {
        let driver = BatchDriver::new(Duration::from_secs(3600));
        let (ctx, cancel) = Context::with_cancel();
        let runs = Arc::new(Mutex::new(0));

        let task = {
            let runs = runs.clone();
            tokio::spawn(async move {
                driver
                    .run(&ctx, vec!["a", "b", "c", "d"], |_ctx, _item| {
                        let runs = runs.clone();
                        async move {
                            *runs.lock().unwrap() += 1;
                            Ok(ok_unit(0))
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let batch = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel must interrupt the inter-item delay")
            .unwrap();
        assert_eq!(*runs.lock().unwrap(), 1);
        assert_eq!((batch.completed, batch.skipped), (1, 3));
        let summary = batch.summarize(CompletionPolicy::BestEffortAny);
        assert!(!summary.success);
    }

    #[tokio::test]
    async fn already_canceled_batch_skips_everything() {
        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();
        let batch = BatchDriver::new(Duration::ZERO)
            .run(&ctx, vec!["a", "b"], |_ctx, _item| async { Ok(ok_unit(0)) })
            .await;
        assert_eq!((batch.completed, batch.skipped), (0, 2));
        assert!(batch.outcomes.is_empty());
    }
}
