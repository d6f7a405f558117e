//! Resilient upstream client
//!
//! Combines the credential pool, the rate limiter and a pluggable transport to
//! perform one logical upstream call. Every failed attempt is classified and
//! handled accordingly:
//!
//! - AuthenticationInvalid: mark the credential unhealthy, rotate, retry at once
//! - RateLimited: rotate and back off linearly
//! - TransientRetryable: keep the credential and back off exponentially
//! - Fatal: give up immediately
//!
//! All waits honor the caller's `Context`.

pub mod client;
pub mod error;
pub mod policy;

pub use client::ResilientClient;
pub use error::{Error, Result};
pub use policy::RetryPolicy;
