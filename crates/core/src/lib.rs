//! Core domain types and the durable task store.
//!
//! A task is a unit of work executed by a sandboxed agent container. Every
//! task lives in its own directory under the data root as a JSON document,
//! with an append-only event trail and raw per-turn output artifacts beside
//! it. The [`Store`] owns all of that state behind a single lock and
//! broadcasts a coalesced change signal to subscribers after every mutation.

pub mod error;
pub mod store;
pub mod task;

pub use error::{Error, Result};
pub use store::Store;
pub use task::{clamp_timeout, EventKind, Task, TaskEvent, TaskStatus, TaskUsage};
