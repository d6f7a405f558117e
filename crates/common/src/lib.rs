//! Common types for the market data harvester
//!
//! Shared by every crate in the workspace: the configuration error type, the
//! `Secret` wrapper used for upstream tokens, and `Context`, the cancellation
//! and deadline handle threaded through every blocking call.

mod context;
mod error;
mod secret;

pub use context::{CancelHandle, Context, ContextError, sleep};
pub use error::{Error, Result};
pub use secret::Secret;
