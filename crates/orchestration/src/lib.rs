//! Job scheduling and fan-out orchestration
//!
//! - `JobScheduler`: one generic engine firing named jobs on a schedule or on
//!   demand. Every firing runs on its own task.
//! - `Orchestrator`: runs the sub-calls of one unit of work concurrently
//!   through a `ResilientClient` and aggregates their outcomes without
//!   aborting early.
//! - `BatchDriver`: repeats a unit across many entities with a fixed delay
//!   between items.
//! - `Collector` / `Repository`: the seams business-specific code plugs into.

pub mod batch;
pub mod collector;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod schedule;
pub mod scheduler;

pub use batch::{BatchDriver, BatchOutcome, ItemOutcome};
pub use collector::{Collector, MemoryRepository, Record, Repository, Scope};
pub use error::{CollectError, JobError};
pub use orchestrator::{FanOut, Orchestrator, Subtask};
pub use outcome::{CollectionOutcome, CompletionPolicy, SubtaskError};
pub use schedule::Schedule;
pub use scheduler::{Invocation, JobFuture, JobInfo, JobScheduler, Trigger};
