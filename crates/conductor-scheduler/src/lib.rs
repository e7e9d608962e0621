//! Task scheduling and fleet orchestration: the bounded priority queue,
//! the dispatcher that pairs tasks with idle agents, run statistics, and
//! the process-level supervisor.

pub mod orchestrator;
pub mod queue;
pub mod stats;
pub mod supervisor;

pub use orchestrator::Orchestrator;
pub use queue::TaskQueue;
pub use stats::{Stats, StatsSnapshot};
pub use supervisor::Supervisor;
