//! Engine configuration.
//!
//! Every knob has a serde default so a missing file, an empty file, and a
//! partial file all produce a runnable configuration.

use crate::error::{Error, Result};
use crate::task::duration_secs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target agent count.
    pub num_agents: usize,
    /// Minimum agents that must start for the engine to proceed.
    pub min_agents: usize,
    /// Dispatcher pool size.
    pub max_workers: usize,
    /// Default per-task wall-clock budget in seconds.
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    pub log_level: String,
    pub agent: AgentSection,
    pub communication: CommunicationSection,
    pub task_queue: TaskQueueSection,
    pub isolated_workspace: IsolatedWorkspaceSection,
    pub task_execution: TaskExecutionSection,
    pub result_store: ResultStoreSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_agents: 3,
            min_agents: 1,
            max_workers: 10,
            task_timeout: Duration::from_secs(300),
            log_level: "INFO".to_string(),
            agent: AgentSection::default(),
            communication: CommunicationSection::default(),
            task_queue: TaskQueueSection::default(),
            isolated_workspace: IsolatedWorkspaceSection::default(),
            task_execution: TaskExecutionSection::default(),
            result_store: ResultStoreSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub container_memory: String,
    pub container_cpu: String,
    /// Seconds between health probes.
    pub health_check_interval: u64,
    /// Consecutive probe failures before the agent is marked failed.
    pub health_check_failures: u32,
    /// Whether the supervisor attempts a restart after a health failure.
    pub auto_restart: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            container_memory: "2g".to_string(),
            container_cpu: "1.0".to_string(),
            health_check_interval: 30,
            health_check_failures: 3,
            auto_restart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationSection {
    pub socket_path: PathBuf,
    #[serde(with = "duration_secs")]
    pub message_timeout: Duration,
    pub retry_count: u32,
}

impl Default for CommunicationSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/claude_orchestrator.sock"),
            message_timeout: Duration::from_secs(5),
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueSection {
    pub max_size: usize,
    pub priority_levels: u8,
    /// Priority added per second of queue age; 0 disables aging.
    pub aging_rate: f64,
}

impl Default for TaskQueueSection {
    fn default() -> Self {
        Self {
            max_size: 1000,
            priority_levels: 10,
            aging_rate: 0.0,
        }
    }
}

/// Isolation mode for agent workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    #[default]
    Sandbox,
    Shared,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolatedWorkspaceSection {
    pub enabled: bool,
    pub mode: IsolationMode,
    /// Host directory under which per-agent workspaces are created.
    pub workspace_root: PathBuf,
    /// Named environments selectable per agent by tag.
    pub environments: Vec<EnvironmentConfig>,
    /// Environment tag used when an agent does not name one.
    pub default_environment: String,
    /// Snapshots retained per agent before the oldest is evicted.
    pub max_snapshots: usize,
}

impl Default for IsolatedWorkspaceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: IsolationMode::Sandbox,
            workspace_root: PathBuf::from("/tmp/claude_workspaces"),
            environments: Vec::new(),
            default_environment: "minimal".to_string(),
            max_snapshots: 5,
        }
    }
}

/// A named workspace environment: base image, packages installed at
/// creation, and extra volume mounts relative to the agent workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Guest mount path keyed by workspace-relative host subdirectory.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
}

impl EnvironmentConfig {
    /// Built-in fallback used when no environment matches the requested tag.
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            image: "alpine:latest".to_string(),
            packages: vec!["git".to_string(), "curl".to_string()],
            volumes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutionSection {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub parallel_execution: bool,
    pub cleanup_on_failure: bool,
    pub snapshot_before_task: bool,
    pub restore_on_error: bool,
}

impl Default for TaskExecutionSection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            parallel_execution: true,
            cleanup_on_failure: true,
            snapshot_before_task: false,
            restore_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultStoreSection {
    pub max_entries: usize,
    /// Seconds a result is retained; 0 keeps results until evicted by size.
    pub max_age_secs: u64,
}

impl Default for ResultStoreSection {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age_secs: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file, falling back to defaults for
    /// anything the file does not mention.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency. Violations abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.num_agents == 0 {
            return Err(Error::Configuration("num_agents must be at least 1".into()));
        }
        if self.min_agents == 0 || self.min_agents > self.num_agents {
            return Err(Error::Configuration(format!(
                "min_agents must be in 1..={}",
                self.num_agents
            )));
        }
        if self.max_workers == 0 {
            return Err(Error::Configuration("max_workers must be at least 1".into()));
        }
        if self.task_queue.max_size == 0 {
            return Err(Error::Configuration(
                "task_queue.max_size must be at least 1".into(),
            ));
        }
        if self.task_queue.aging_rate < 0.0 {
            return Err(Error::Configuration(
                "task_queue.aging_rate must be non-negative".into(),
            ));
        }
        if self.agent.health_check_failures == 0 {
            return Err(Error::Configuration(
                "agent.health_check_failures must be at least 1".into(),
            ));
        }
        if self.agent.health_check_interval == 0 {
            return Err(Error::Configuration(
                "agent.health_check_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// Resolve an environment tag against the configured environments,
    /// falling back to the built-in minimal environment.
    pub fn environment(&self, tag: &str) -> EnvironmentConfig {
        self.isolated_workspace
            .environments
            .iter()
            .find(|env| env.name == tag)
            .cloned()
            .unwrap_or_else(EnvironmentConfig::minimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.num_agents, 3);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert_eq!(config.task_queue.max_size, 1000);
        assert_eq!(config.agent.health_check_failures, 3);
        assert_eq!(
            config.communication.socket_path,
            PathBuf::from("/tmp/claude_orchestrator.sock")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_overlays_defaults() {
        let yaml = r#"
num_agents: 5
agent:
  container_memory: "4g"
task_queue:
  max_size: 50
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.num_agents, 5);
        assert_eq!(config.agent.container_memory, "4g");
        assert_eq!(config.task_queue.max_size, 50);
        // Untouched sections keep defaults.
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.agent.health_check_interval, 30);
    }

    #[test]
    fn test_invalid_min_agents_rejected() {
        let mut config = EngineConfig::default();
        config.min_agents = 4;
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_environment_resolution_falls_back_to_minimal() {
        let mut config = EngineConfig::default();
        config.isolated_workspace.environments.push(EnvironmentConfig {
            name: "python".into(),
            image: "python:3.12-slim".into(),
            packages: vec!["pytest".into()],
            volumes: HashMap::new(),
        });

        assert_eq!(config.environment("python").image, "python:3.12-slim");
        assert_eq!(config.environment("haskell").name, "minimal");
    }
}
