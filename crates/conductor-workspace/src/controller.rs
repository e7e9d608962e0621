//! Container lifecycle controller.

use crate::environments::{install_command, parse_cpus, parse_memory};
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, RemoveImageOptions};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use chrono::{DateTime, Utc};
use conductor_core::config::{EngineConfig, EnvironmentConfig};
use conductor_core::ids::AgentId;
use conductor_core::retry::{CircuitBreaker, RetryPolicy};
use conductor_core::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const GUEST_WORKSPACE: &str = "/workspace";
const PIDS_LIMIT: i64 = 1024;
const NOFILE_LIMIT: i64 = 1024;
const STOP_GRACE_SECS: i64 = 5;

/// Immutable description of one agent's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub agent_id: AgentId,
    pub container_name: String,
    pub image: String,
    pub environment: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub binds: Vec<String>,
    pub user: Option<String>,
}

/// A live workspace container.
#[derive(Debug, Clone)]
pub struct WorkspaceContainer {
    pub container_id: String,
    pub config: ContainerSpec,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub workspace_path: PathBuf,
    pub ports: HashMap<String, u16>,
}

/// Output of a synchronous in-container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Owns every container in the fleet. Exactly one active container per
/// agent id; the conventional name `claude-agent-<agent_id>` makes stale
/// containers from earlier runs discoverable and removable.
pub struct WorkspaceController {
    docker: Docker,
    workspace_root: PathBuf,
    environments: Vec<EnvironmentConfig>,
    memory_bytes: i64,
    nano_cpus: i64,
    max_snapshots: usize,
    user: Option<String>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    containers: Mutex<HashMap<AgentId, WorkspaceContainer>>,
    snapshots: Mutex<HashMap<AgentId, Vec<String>>>,
}

impl WorkspaceController {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| Error::Container {
            message: format!("failed to connect to container runtime: {e}"),
            status_code: None,
        })?;
        Self::with_docker(docker, config)
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker, config: &EngineConfig) -> Result<Self> {
        let memory_bytes = parse_memory(&config.agent.container_memory)?;
        let nano_cpus = parse_cpus(&config.agent.container_cpu)?;
        let user = host_user_mapping();

        Ok(Self {
            docker,
            workspace_root: config.isolated_workspace.workspace_root.clone(),
            environments: config.isolated_workspace.environments.clone(),
            memory_bytes,
            nano_cpus,
            max_snapshots: config.isolated_workspace.max_snapshots.max(1),
            user,
            // max_retries counts retries, RetryPolicy counts attempts.
            retry: RetryPolicy::new(
                config.task_execution.max_retries + 1,
                config.task_execution.retry_delay,
            ),
            breaker: CircuitBreaker::new("container_runtime", 5, Duration::from_secs(60)),
            containers: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn container_name(&self, agent_id: &AgentId) -> String {
        format!("claude-agent-{agent_id}")
    }

    pub fn workspace_dir(&self, agent_id: &AgentId) -> PathBuf {
        self.workspace_root.join(agent_id.as_str())
    }

    fn resolve_environment(&self, tag: &str) -> EnvironmentConfig {
        self.environments
            .iter()
            .find(|env| env.name == tag)
            .cloned()
            .unwrap_or_else(EnvironmentConfig::minimal)
    }

    /// Create (or recreate) the agent's container and return it running.
    ///
    /// Idempotent: any container already holding the conventional name is
    /// removed first. A failure part-way through removes the partial
    /// container before the error propagates.
    pub async fn create_workspace(
        &self,
        agent_id: &AgentId,
        environment: &str,
    ) -> Result<WorkspaceContainer> {
        let env = self.resolve_environment(environment);
        let spec = self.build_spec(agent_id, &env)?;

        let workspace = self
            .retry
            .run("create_workspace", || {
                let spec = spec.clone();
                let env = env.clone();
                async move {
                    self.breaker
                        .run(|| self.create_once(spec, env))
                        .await
                }
            })
            .await?;

        self.containers
            .lock()
            .expect("container map lock poisoned")
            .insert(agent_id.clone(), workspace.clone());

        info!(
            agent_id = %agent_id,
            container = %workspace.container_id,
            image = %workspace.config.image,
            "Workspace created"
        );
        Ok(workspace)
    }

    fn build_spec(&self, agent_id: &AgentId, env: &EnvironmentConfig) -> Result<ContainerSpec> {
        let workspace_dir = self.workspace_dir(agent_id);
        let mut binds = vec![format!("{}:{GUEST_WORKSPACE}", workspace_dir.display())];
        for (host_subdir, guest_path) in &env.volumes {
            binds.push(format!(
                "{}:{guest_path}",
                workspace_dir.join(host_subdir).display()
            ));
        }

        Ok(ContainerSpec {
            agent_id: agent_id.clone(),
            container_name: self.container_name(agent_id),
            image: env.image.clone(),
            environment: env.name.clone(),
            memory_bytes: self.memory_bytes,
            nano_cpus: self.nano_cpus,
            binds,
            user: self.user.clone(),
        })
    }

    async fn create_once(
        &self,
        spec: ContainerSpec,
        env: EnvironmentConfig,
    ) -> Result<WorkspaceContainer> {
        self.remove_by_name(&spec.container_name).await;
        self.prepare_host_dirs(&spec)?;

        match self.provision(&spec, &env).await {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                // Never leak a half-created container.
                self.remove_by_name(&spec.container_name).await;
                Err(e)
            }
        }
    }

    fn prepare_host_dirs(&self, spec: &ContainerSpec) -> Result<()> {
        for bind in &spec.binds {
            if let Some((host, _guest)) = bind.split_once(':') {
                std::fs::create_dir_all(host).map_err(|e| Error::WorkspaceCreation {
                    agent_id: spec.agent_id.to_string(),
                    message: format!("cannot create {host}: {e}"),
                })?;
            }
        }
        Ok(())
    }

    async fn provision(
        &self,
        spec: &ContainerSpec,
        env: &EnvironmentConfig,
    ) -> Result<WorkspaceContainer> {
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(GUEST_WORKSPACE.to_string()),
            user: spec.user.clone(),
            env: Some(vec![
                format!("AGENT_ID={}", spec.agent_id),
                format!("WORKSPACE={GUEST_WORKSPACE}"),
                format!("CONDUCTOR_ENV={}", spec.environment),
            ]),
            host_config: Some(self.build_host_config(spec)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.container_name.as_str(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| container_error("create container", e))?;

        self.docker
            .start_container(&spec.container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| container_error("start container", e))?;

        let inspected = self
            .docker
            .inspect_container(&spec.container_name, None)
            .await
            .map_err(|e| container_error("inspect container", e))?;
        let running = inspected
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(Error::Container {
                message: format!("container {} is not running after start", spec.container_name),
                status_code: None,
            });
        }

        if let Some(install) = install_command(env) {
            match self.exec_in(&spec.container_name, &install, Duration::from_secs(300)).await {
                Ok(output) if !output.success() => {
                    warn!(
                        container = %spec.container_name,
                        exit_code = output.exit_code,
                        "Package install failed"
                    );
                }
                Err(e) => {
                    warn!(container = %spec.container_name, error = %e, "Package install failed");
                }
                Ok(_) => {}
            }
        }

        Ok(WorkspaceContainer {
            container_id: created.id,
            config: spec.clone(),
            created_at: Utc::now(),
            status: "running".to_string(),
            workspace_path: self.workspace_dir(&spec.agent_id),
            ports: HashMap::new(),
        })
    }

    fn build_host_config(&self, spec: &ContainerSpec) -> HostConfig {
        HostConfig {
            binds: Some(spec.binds.clone()),
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(PIDS_LIMIT),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(NOFILE_LIMIT),
                hard: Some(NOFILE_LIMIT),
            }]),
            ..Default::default()
        }
    }

    /// Run a shell command inside the agent's container, bounded by
    /// `deadline`. A non-zero exit code is reported, never raised.
    pub async fn exec(
        &self,
        agent_id: &AgentId,
        command: &str,
        deadline: Duration,
    ) -> Result<ExecOutput> {
        let name = self.container_name(agent_id);
        self.exec_in(&name, command, deadline).await
    }

    async fn exec_in(
        &self,
        container_name: &str,
        command: &str,
        deadline: Duration,
    ) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_name, options)
            .await
            .map_err(|e| container_error("create exec", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| container_error("start exec", e))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            let collect = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Error reading exec output");
                            break;
                        }
                    }
                }
            };
            if timeout(deadline, collect).await.is_err() {
                debug!(container = %container_name, "Exec deadline elapsed");
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| container_error("inspect exec", e))?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Commit the container filesystem to a named image. Committing to an
    /// existing name replaces it, so names stay unique per agent.
    pub async fn create_snapshot(
        &self,
        agent_id: &AgentId,
        name: Option<String>,
    ) -> Result<String> {
        let container = self.lookup(agent_id)?;
        let snapshot_name =
            name.unwrap_or_else(|| format!("snapshot-{}", Utc::now().format("%Y%m%d%H%M%S")));

        let options = CommitContainerOptions {
            container: container.container_id.clone(),
            repo: container.config.container_name.clone(),
            tag: snapshot_name.clone(),
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| container_error("commit container", e))?;

        let evicted = {
            let mut snapshots = self.snapshots.lock().expect("snapshot map lock poisoned");
            let names = snapshots.entry(agent_id.clone()).or_default();
            names.retain(|n| n != &snapshot_name);
            names.push(snapshot_name.clone());
            if names.len() > self.max_snapshots {
                Some(names.remove(0))
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            let image = format!("{}:{old}", container.config.container_name);
            if let Err(e) = self
                .docker
                .remove_image(&image, None::<RemoveImageOptions>, None)
                .await
            {
                warn!(image = %image, error = %e, "Failed to evict old snapshot");
            }
        }

        info!(agent_id = %agent_id, snapshot = %snapshot_name, "Snapshot created");
        Ok(snapshot_name)
    }

    /// Replace the agent's container with one started from the named
    /// snapshot, keeping the workspace volume.
    pub async fn restore_snapshot(&self, agent_id: &AgentId, name: &str) -> Result<()> {
        let known = self
            .snapshots
            .lock()
            .expect("snapshot map lock poisoned")
            .get(agent_id)
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false);
        if !known {
            return Err(Error::SnapshotNotFound {
                agent_id: agent_id.to_string(),
                name: name.to_string(),
            });
        }

        let mut spec = self.lookup(agent_id)?.config;
        self.cleanup(agent_id, true).await?;
        spec.image = format!("{}:{name}", spec.container_name);

        let env = EnvironmentConfig {
            name: spec.environment.clone(),
            image: spec.image.clone(),
            // The snapshot already carries its packages.
            packages: Vec::new(),
            volumes: HashMap::new(),
        };
        let workspace = self.create_once(spec, env).await?;
        self.containers
            .lock()
            .expect("container map lock poisoned")
            .insert(agent_id.clone(), workspace);

        info!(agent_id = %agent_id, snapshot = %name, "Snapshot restored");
        Ok(())
    }

    /// Stop and remove the agent's container. Safe to call repeatedly and
    /// on agents that never started.
    pub async fn cleanup(&self, agent_id: &AgentId, preserve_volumes: bool) -> Result<()> {
        let name = self.container_name(agent_id);

        if let Err(e) = self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            if !is_not_found(&e) {
                debug!(container = %name, error = %e, "Stop failed, forcing removal");
            }
        }
        self.remove_by_name(&name).await;

        let removed = self
            .containers
            .lock()
            .expect("container map lock poisoned")
            .remove(agent_id);

        if !preserve_volumes {
            let dir = self.workspace_dir(agent_id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    // Cleanup is best-effort; never block shutdown on it.
                    warn!(path = %dir.display(), error = %e, "Workspace dir removal failed");
                }
            }
        }

        if removed.is_some() {
            info!(agent_id = %agent_id, "Workspace cleaned up");
        }
        Ok(())
    }

    /// Remove workspaces whose containers outlived `max_age`.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| Error::Internal(format!("bad max_age: {e}")))?;
        let stale: Vec<AgentId> = {
            let containers = self.containers.lock().expect("container map lock poisoned");
            containers
                .iter()
                .filter(|(_, c)| c.created_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let count = stale.len();
        for agent_id in stale {
            self.cleanup(&agent_id, false).await?;
        }
        Ok(count)
    }

    /// The tracked container for an agent, if any.
    pub fn workspace_info(&self, agent_id: &AgentId) -> Option<WorkspaceContainer> {
        self.containers
            .lock()
            .expect("container map lock poisoned")
            .get(agent_id)
            .cloned()
    }

    pub fn list_workspaces(&self) -> Vec<WorkspaceContainer> {
        self.containers
            .lock()
            .expect("container map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot names recorded for an agent, oldest first.
    pub fn snapshot_names(&self, agent_id: &AgentId) -> Vec<String> {
        self.snapshots
            .lock()
            .expect("snapshot map lock poisoned")
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lookup(&self, agent_id: &AgentId) -> Result<WorkspaceContainer> {
        self.containers
            .lock()
            .expect("container map lock poisoned")
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    async fn remove_by_name(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            if !is_not_found(&e) {
                debug!(container = %name, error = %e, "Container removal failed");
            }
        }
    }
}

fn container_error(operation: &str, e: bollard::errors::Error) -> Error {
    let status_code = match &e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    };
    Error::Container {
        message: format!("{operation}: {e}"),
        status_code,
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// `uid:gid` of the invoking user, mapped into the container so files
/// written under /workspace stay owned by the host user.
fn host_user_mapping() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    Some(format!("{uid}:{gid}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::config::EngineConfig;

    fn controller() -> WorkspaceController {
        let docker = Docker::connect_with_local_defaults().expect("docker handle");
        WorkspaceController::with_docker(docker, &EngineConfig::default()).expect("controller")
    }

    #[test]
    fn test_container_name_convention() {
        let controller = controller();
        assert_eq!(
            controller.container_name(&AgentId::numbered(7)),
            "claude-agent-agent_007"
        );
    }

    #[test]
    fn test_workspace_dir_is_per_agent() {
        let controller = controller();
        let a = controller.workspace_dir(&AgentId::numbered(0));
        let b = controller.workspace_dir(&AgentId::numbered(1));
        assert_ne!(a, b);
        assert!(a.ends_with("agent_000"));
    }

    #[test]
    fn test_spec_binds_workspace_and_env_volumes() {
        let controller = controller();
        let mut env = EnvironmentConfig::minimal();
        env.volumes
            .insert("cache".to_string(), "/cache".to_string());

        let spec = controller
            .build_spec(&AgentId::numbered(0), &env)
            .expect("spec");
        assert!(spec.binds.iter().any(|b| b.ends_with(":/workspace")));
        assert!(spec.binds.iter().any(|b| b.ends_with(":/cache")));
        assert_eq!(spec.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(spec.nano_cpus, 1_000_000_000);
    }

    #[test]
    fn test_host_config_drops_capabilities() {
        let controller = controller();
        let spec = controller
            .build_spec(&AgentId::numbered(0), &EnvironmentConfig::minimal())
            .expect("spec");
        let host_config = controller.build_host_config(&spec);

        assert_eq!(host_config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host_config.security_opt,
            Some(vec!["no-new-privileges".to_string()])
        );
        assert_eq!(host_config.pids_limit, Some(1024));
    }

    #[test]
    fn test_environment_resolution_falls_back() {
        let controller = controller();
        let env = controller.resolve_environment("no-such-tag");
        assert_eq!(env.name, "minimal");
    }

    #[test]
    fn test_unknown_snapshot_is_snapshot_not_found() {
        let controller = controller();
        let err = futures::executor::block_on(
            controller.restore_snapshot(&AgentId::numbered(0), "nope"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));
    }
}
