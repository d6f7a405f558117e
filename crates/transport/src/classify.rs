//! Error classification for upstream responses
//!
//! The provider reports failures three ways: HTTP status codes, a numeric
//! `code` inside an HTTP 200 envelope, and free-text messages (partly in
//! Chinese). Message patterns win over codes because the provider reuses some
//! codes for unrelated failures (e.g. 40203 covers both per-minute throttling
//! and missing API permissions).

use crate::ErrorClassification;

/// Token rejected or expired.
const AUTH_PATTERNS: &[&str] = &[
    "token不对",
    "token无效",
    "token已过期",
    "invalid token",
    "token expired",
    "unauthorized",
];

/// Per-credential or upstream-wide throttling.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "每分钟最多访问",
    "每天最多访问",
    "访问频率",
    "请求过于频繁",
    "rate limit",
    "too many requests",
];

/// Permission problems: retrying with another token of the same tier cannot help.
const FATAL_PATTERNS: &[&str] = &["没有访问该接口的权限", "permission denied", "积分不足"];

/// Server-side hiccups.
const TRANSIENT_PATTERNS: &[&str] = &[
    "系统繁忙",
    "服务器错误",
    "server busy",
    "temporarily unavailable",
    "timed out",
];

/// Classify an error message by known phrases, case-insensitively.
///
/// Returns `None` when no pattern matches.
pub fn classify_message(message: &str) -> Option<ErrorClassification> {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(AUTH_PATTERNS) {
        Some(ErrorClassification::AuthenticationInvalid)
    } else if matches(RATE_LIMIT_PATTERNS) {
        Some(ErrorClassification::RateLimited)
    } else if matches(FATAL_PATTERNS) {
        Some(ErrorClassification::Fatal)
    } else if matches(TRANSIENT_PATTERNS) {
        Some(ErrorClassification::TransientRetryable)
    } else {
        None
    }
}

/// Classify a non-zero envelope `code` and its message.
pub fn classify_code(code: i64, message: &str) -> ErrorClassification {
    if let Some(classification) = classify_message(message) {
        return classification;
    }
    match code {
        401 | 40001 | 40101 => ErrorClassification::AuthenticationInvalid,
        429 | 40029 | 40203 => ErrorClassification::RateLimited,
        -1 | -2002 | 500..=599 => ErrorClassification::TransientRetryable,
        _ => ErrorClassification::Fatal,
    }
}

/// Classify a non-success HTTP status and its body.
///
/// 401/403 are credential problems, 429 is throttling, 408/5xx are retryable.
/// Remaining 4xx statuses are fatal unless the body says otherwise.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::AuthenticationInvalid,
        429 => ErrorClassification::RateLimited,
        408 | 500..=599 => ErrorClassification::TransientRetryable,
        400..=499 => classify_message(body).unwrap_or(ErrorClassification::Fatal),
        _ => ErrorClassification::TransientRetryable,
    }
}
