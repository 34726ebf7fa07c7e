//! Task execution engine.
//!
//! Owns everything between "operator dragged a card into progress" and "the
//! task branch is merged back": container invocation, the multi-turn loop,
//! worktree isolation, the commit pipeline with conflict resolution, startup
//! recovery, and the container monitor.

mod commit;
mod container;
mod error;
mod monitor;
mod output;
mod recovery;
mod runner;
mod snapshot;
mod title;

pub use container::{container_name, CONTAINER_PREFIX};
pub use error::{Result, RunnerError};
pub use monitor::{ContainerInfo, MONITOR_GRACE, MONITOR_POLL_INTERVAL};
pub use output::{parse_agent_output, AgentOutput, AgentUsage};
pub use recovery::recover_orphaned_tasks;
pub use runner::{Runner, RunnerConfig};
