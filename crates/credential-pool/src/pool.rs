//! Round-robin credential selection with per-credential health tracking
//!
//! The pool holds every configured token together with its usage counters.
//! Selection is round-robin over an atomic cursor. Only an authentication
//! failure marks a credential unhealthy: throttling and server errors are not
//! the token's fault and leave its health alone.
//!
//! Unhealthy credentials are skipped while any other credential is eligible.
//! After `unhealthy_retry_after` an unhealthy credential becomes eligible
//! again so a token that was only invalidated temporarily gets retried; a
//! success restores it. When no credential is eligible the pool falls back to
//! plain round-robin, so it always yields something.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::Secret;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use transport::ErrorClassification;

use crate::error::{Error, Result};

/// Default probation before an unhealthy credential is tried again.
pub const DEFAULT_UNHEALTHY_RETRY_AFTER: Duration = Duration::from_secs(600);

/// An upstream token and its log-safe identifier.
#[derive(Debug, Clone)]
pub struct Credential {
    id: String,
    token: Secret<String>,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: Secret::new(token.into()),
        }
    }

    /// Build a credential whose identifier is the token's fingerprint.
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = Secret::new(token.into());
        Self {
            id: token.fingerprint(),
            token,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &Secret<String> {
        &self.token
    }
}

/// A credential handed out for one attempt.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub id: String,
    pub token: Secret<String>,
}

/// Immutable usage snapshot for one credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialStats {
    pub id: String,
    pub call_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub healthy: bool,
}

/// Overall pool condition for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Every credential healthy
    Healthy,
    /// Some credentials unhealthy
    Degraded,
    /// No healthy credential left
    Unhealthy,
}

impl PoolStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PoolStatus::Healthy => "healthy",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Deep-copied pool snapshot, safe to hold after the call returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub credentials: Vec<CredentialStats>,
}

#[derive(Debug)]
struct Entry {
    credential: Credential,
    call_count: u64,
    success_count: u64,
    error_count: u64,
    last_used_at: Option<DateTime<Utc>>,
    healthy: bool,
    unhealthy_since: Option<Instant>,
}

impl Entry {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            call_count: 0,
            success_count: 0,
            error_count: 0,
            last_used_at: None,
            healthy: true,
            unhealthy_since: None,
        }
    }

    fn id(&self) -> &str {
        &self.credential.id
    }

    fn is_eligible(&self, now: Instant, retry_after: Duration) -> bool {
        self.healthy
            || self
                .unhealthy_since
                .is_none_or(|since| now.duration_since(since) >= retry_after)
    }

    fn stats(&self) -> CredentialStats {
        CredentialStats {
            id: self.credential.id.clone(),
            call_count: self.call_count,
            success_count: self.success_count,
            error_count: self.error_count,
            last_used_at: self.last_used_at,
            healthy: self.healthy,
        }
    }
}

/// Round-robin pool of upstream credentials.
///
/// Uses an `AtomicUsize` for the round-robin cursor and a `RwLock` for the
/// credential list and stats. Never empty.
pub struct CredentialPool {
    entries: RwLock<Vec<Entry>>,
    next_index: AtomicUsize,
    unhealthy_retry_after: Duration,
}

impl CredentialPool {
    /// Create a pool from the given credentials. Duplicate ids are dropped.
    ///
    /// Fails with `Error::Empty` if no credential is supplied.
    pub fn new(credentials: Vec<Credential>, unhealthy_retry_after: Duration) -> Result<Self> {
        let mut entries: Vec<Entry> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            if entries.iter().any(|e| e.id() == credential.id) {
                warn!(credential_id = %credential.id, "duplicate credential ignored");
                continue;
            }
            entries.push(Entry::new(credential));
        }
        if entries.is_empty() {
            return Err(Error::Empty);
        }
        info!(credentials = entries.len(), "credential pool initialized");
        Ok(Self {
            entries: RwLock::new(entries),
            next_index: AtomicUsize::new(0),
            unhealthy_retry_after,
        })
    }

    /// Create a pool from bare tokens, identified by fingerprint.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials = tokens.into_iter().map(Credential::from_token).collect();
        Self::new(credentials, DEFAULT_UNHEALTHY_RETRY_AFTER)
    }

    /// Select the next credential round-robin and record the selection.
    ///
    /// Skips credentials that are unhealthy and still in probation as long as
    /// another credential is eligible.
    pub async fn get_credential(&self) -> Result<SelectedCredential> {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        if n == 0 {
            return Err(Error::Empty);
        }

        let now = Instant::now();
        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        let idx = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| entries[i].is_eligible(now, self.unhealthy_retry_after))
            .unwrap_or(start);

        if idx != start {
            debug!(
                skipped = (idx + n - start) % n,
                "skipped unhealthy credentials"
            );
            // Continue the rotation after the credential actually handed out.
            self.next_index.store(idx + 1, Ordering::Relaxed);
        }

        let entry = &mut entries[idx];
        entry.call_count += 1;
        entry.last_used_at = Some(Utc::now());
        if !entry.healthy {
            debug!(credential_id = entry.id(), "handing out unhealthy credential");
        }

        Ok(SelectedCredential {
            id: entry.credential.id.clone(),
            token: entry.credential.token.clone(),
        })
    }

    /// Record another attempt on a credential already handed out, without
    /// moving the rotation.
    pub async fn record_attempt(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id() == id) {
            entry.call_count += 1;
            entry.last_used_at = Some(Utc::now());
        }
    }

    /// Advance the cursor past `failed_id` if it is the credential the next
    /// `get_credential()` would yield.
    pub async fn next_credential(&self, failed_id: &str) {
        let entries = self.entries.write().await;
        let n = entries.len();
        if n < 2 {
            return;
        }
        let cursor = self.next_index.load(Ordering::Relaxed) % n;
        if entries[cursor].id() == failed_id {
            self.next_index.store(cursor + 1, Ordering::Relaxed);
            debug!(credential_id = failed_id, "advanced past failed credential");
        }
    }

    /// Record a successful call: restores health.
    pub async fn record_success(&self, id: &str) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id() == id) else {
            debug!(credential_id = id, "success for credential no longer in pool");
            return;
        };
        entry.success_count += 1;
        if !entry.healthy {
            info!(credential_id = id, "credential healthy again");
        }
        entry.healthy = true;
        entry.unhealthy_since = None;
        let healthy = entries.iter().filter(|e| e.healthy).count();
        metrics::gauge!("harvest_pool_healthy_credentials").set(healthy as f64);
    }

    /// Record a failed call.
    ///
    /// - AuthenticationInvalid → unhealthy
    /// - RateLimited / TransientRetryable / Fatal → counted, health unchanged
    pub async fn record_error(&self, id: &str, kind: ErrorClassification) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id() == id) else {
            debug!(credential_id = id, "error for credential no longer in pool");
            return;
        };
        entry.error_count += 1;
        metrics::counter!("harvest_credential_errors_total", "classification" => kind.label())
            .increment(1);

        match kind {
            ErrorClassification::AuthenticationInvalid => {
                warn!(credential_id = id, "credential marked unhealthy (authentication invalid)");
                entry.healthy = false;
                entry.unhealthy_since = Some(Instant::now());
                let healthy = entries.iter().filter(|e| e.healthy).count();
                metrics::gauge!("harvest_pool_healthy_credentials").set(healthy as f64);
            }
            other => {
                debug!(credential_id = id, classification = %other, "error recorded, health unchanged");
            }
        }
    }

    /// Add a credential at runtime. Starts healthy.
    ///
    /// Re-adding an existing id replaces its token and marks it healthy while
    /// keeping its counters. Returns `true` if the id was new.
    pub async fn add_credential(&self, credential: Credential) -> bool {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id() == credential.id) {
            entry.credential = credential;
            entry.healthy = true;
            entry.unhealthy_since = None;
            info!(credential_id = entry.id(), "credential token replaced");
            return false;
        }
        info!(credential_id = %credential.id, "credential added to pool");
        entries.push(Entry::new(credential));
        true
    }

    /// Remove a credential at runtime.
    ///
    /// Fails with `NotFound` for unknown ids and `LastCredential` when the
    /// pool would become empty.
    pub async fn remove_credential(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let Some(pos) = entries.iter().position(|e| e.id() == id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if entries.len() == 1 {
            return Err(Error::LastCredential(id.to_string()));
        }
        entries.remove(pos);
        info!(credential_id = id, "credential removed from pool");
        Ok(())
    }

    /// Snapshot of every credential's stats.
    pub async fn get_stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let credentials: Vec<CredentialStats> = entries.iter().map(Entry::stats).collect();
        let total = credentials.len();
        let healthy = credentials.iter().filter(|c| c.healthy).count();
        let status = if healthy == total && total > 0 {
            PoolStatus::Healthy
        } else if healthy > 0 {
            PoolStatus::Degraded
        } else {
            PoolStatus::Unhealthy
        };
        PoolStats {
            status,
            total,
            healthy,
            unhealthy: total - healthy,
            credentials,
        }
    }

    pub async fn healthy_count(&self) -> usize {
        self.entries.read().await.iter().filter(|e| e.healthy).count()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Always false: a pool keeps at least one credential.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.id().to_string())
            .collect()
    }
}
