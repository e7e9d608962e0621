//! Agent runtime: one supervised unit of container + long-lived worker
//! process, driven over the broker channel.

pub mod config;
pub mod health;
pub mod runtime;
pub mod worker;

pub use config::AgentConfig;
pub use runtime::{AgentRuntime, AgentState};
pub use worker::{OutputLine, OutputStream, WorkerProcess};
