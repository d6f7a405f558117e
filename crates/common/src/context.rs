//! Cancellation and deadline propagation
//!
//! A `Context` is a cheap, cloneable handle that answers two questions for a
//! blocking operation: has the caller given up, and by when must we be done.
//! Children inherit every cancellation signal and the earliest deadline of
//! their parent, so canceling a scheduler's root context reaches every
//! in-flight retry loop and backoff sleep below it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancels the context it was created with (and every child of it).
///
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel the associated context. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cancellation signals plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A fresh cancelable root context.
    pub fn with_cancel() -> (Self, CancelHandle) {
        Self::background().child_with_cancel()
    }

    /// Derive a child that can be canceled independently of `self`.
    pub fn child_with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(rx);
        (
            Self {
                signals,
                deadline: self.deadline,
            },
            CancelHandle { tx: Arc::new(tx) },
        )
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child whose deadline is the earlier of `deadline` and the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            signals: self.signals.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check: `Some(reason)` once the context is done.
    pub fn err(&self) -> Option<ContextError> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) -> ContextError {
        if let Some(reason) = self.err() {
            return reason;
        }

        let canceled = wait_any(self.signals.clone());
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = canceled => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                canceled.await;
                ContextError::Canceled
            }
        }
    }

    /// Run `fut` to completion unless the context finishes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            out = fut => Ok(out),
        }
    }
}

/// Sleep for `duration`, returning early with the reason if `ctx` finishes.
pub async fn sleep(ctx: &Context, duration: Duration) -> Result<(), ContextError> {
    ctx.run(tokio::time::sleep(duration)).await
}

async fn wait_any(signals: Vec<watch::Receiver<bool>>) {
    if signals.is_empty() {
        return std::future::pending().await;
    }
    let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = signals
        .into_iter()
        .map(|mut rx| {
            Box::pin(async move {
                // A dropped sender can never cancel.
                if rx.wait_for(|canceled| *canceled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
        .collect();
    futures_util::future::select_all(waits).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        let res = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(res.is_err(), "background context must not resolve");
    }

    #[tokio::test]
    async fn cancel_resolves_done() {
        let (ctx, cancel) = Context::with_cancel();
        assert!(!ctx.is_done());
        cancel.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        assert_eq!(ctx.done().await, ContextError::Canceled);
        assert!(cancel.is_canceled());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child() {
        let (parent, cancel) = Context::with_cancel();
        let (child, _child_cancel) = parent.child_with_cancel();
        let waiter = tokio::spawn(async move { child.done().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ContextError::Canceled);
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let (parent, _cancel) = Context::with_cancel();
        let (child, child_cancel) = parent.child_with_cancel();
        child_cancel.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancel() {
        let (ctx, cancel) = Context::with_cancel();
        let started = std::time::Instant::now();
        let handle = tokio::spawn(async move { sleep(&ctx, Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let res = handle.await.unwrap();
        assert_eq!(res, Err(ContextError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let ctx = Context::background();
        assert_eq!(sleep(&ctx, Duration::from_millis(5)).await, Ok(()));
    }
}
