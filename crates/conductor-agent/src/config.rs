//! Per-agent configuration, derived from the engine configuration.

use conductor_core::config::EngineConfig;
use conductor_core::ids::AgentId;
use std::path::PathBuf;
use std::time::Duration;

/// Everything one agent runtime needs to know about itself.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub container_name: String,
    pub work_dir: PathBuf,
    /// Environment tag resolved by the workspace controller.
    pub environment: String,
    pub snapshots_enabled: bool,
    pub snapshot_before_task: bool,
    pub restore_on_error: bool,
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_failures: u32,
    /// Command launching the worker binary in headless mode.
    pub worker_command: Vec<String>,
}

impl AgentConfig {
    pub fn from_engine(engine: &EngineConfig, agent_id: AgentId) -> Self {
        Self {
            container_name: format!("claude-agent-{agent_id}"),
            work_dir: engine
                .isolated_workspace
                .workspace_root
                .join(agent_id.as_str()),
            environment: engine.isolated_workspace.default_environment.clone(),
            snapshots_enabled: engine.isolated_workspace.enabled,
            snapshot_before_task: engine.task_execution.snapshot_before_task,
            restore_on_error: engine.task_execution.restore_on_error,
            socket_path: engine.communication.socket_path.clone(),
            connect_timeout: engine.communication.message_timeout,
            health_check_interval: Duration::from_secs(engine.agent.health_check_interval),
            health_check_failures: engine.agent.health_check_failures,
            worker_command: vec!["claude-code".to_string(), "--headless".to_string()],
            agent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths_follow_conventions() {
        let engine = EngineConfig::default();
        let config = AgentConfig::from_engine(&engine, AgentId::numbered(4));

        assert_eq!(config.container_name, "claude-agent-agent_004");
        assert!(config.work_dir.ends_with("agent_004"));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.health_check_failures, 3);
        assert_eq!(config.worker_command[1], "--headless");
    }
}
