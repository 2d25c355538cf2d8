//! Shared domain types for the swarmforge orchestration engine.
//!
//! This crate holds the data model every other `swarmforge-*` crate builds
//! on: work items, worker identity/state, opaque payloads, the error
//! taxonomy, and the tagged event stream published on the event bus.
//! Nothing in here talks to a child process, a clock in real time, or a
//! network socket — it is pure data plus the publish/subscribe plumbing.

pub mod error;
pub mod events;
pub mod payload;
pub mod result;
pub mod work_item;
pub mod worker;

pub use error::OrchestratorError;
pub use events::{Event, EventBus};
pub use payload::Payload;
pub use result::ExecutionResult;
pub use work_item::{Complexity, WorkItem, WorkItemBuilder, WorkItemId, WorkKind};
pub use worker::{WorkerId, WorkerState, WorkerStats};
