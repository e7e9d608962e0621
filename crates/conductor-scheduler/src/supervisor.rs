//! Process-level lifecycle: signals, stats reporting, agent restarts.

use crate::orchestrator::Orchestrator;
use conductor_agent::AgentState;
use conductor_core::config::EngineConfig;
use conductor_core::ids::AgentId;
use conductor_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sysinfo::System;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// What to do with an agent found in the failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    Quarantine,
}

/// One restart attempt per agent, then quarantine.
pub fn restart_decision(auto_restart: bool, previous_attempts: u32) -> RestartDecision {
    if auto_restart && previous_attempts == 0 {
        RestartDecision::Restart
    } else {
        RestartDecision::Quarantine
    }
}

/// Owns the orchestrator and the process lifecycle around it.
pub struct Supervisor {
    orchestrator: Arc<Orchestrator>,
    restart_attempts: StdMutex<HashMap<AgentId, u32>>,
}

impl Supervisor {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            orchestrator: Arc::new(Orchestrator::new(config)?),
            restart_attempts: StdMutex::new(HashMap::new()),
        })
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Start everything, then run until SIGINT/SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.orchestrator.start().await?;

        let stats_handle = self.spawn_stats_reporter();
        let monitor_handle = self.spawn_health_sweep();

        wait_for_shutdown_signal().await?;
        info!("Shutdown signal received");

        stats_handle.abort();
        monitor_handle.abort();

        self.drain().await;
        self.orchestrator.shutdown().await;

        let stats = self.orchestrator.stats();
        info!(
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            avg_execution_secs = stats.average_execution_time,
            total_execution_secs = stats.total_execution_time,
            "Final statistics"
        );
        Ok(())
    }

    fn spawn_stats_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.orchestrator();
        tokio::spawn(async move {
            let mut ticker = interval(STATS_REPORT_INTERVAL);
            ticker.tick().await;
            let mut system = System::new_all();
            loop {
                ticker.tick().await;
                system.refresh_all();
                let stats = orchestrator.stats();
                let load = System::load_average();
                info!(
                    tasks_completed = stats.tasks_completed,
                    tasks_failed = stats.tasks_failed,
                    avg_execution_secs = stats.average_execution_time,
                    queued = orchestrator.queue().size(),
                    cpu_percent = system.global_cpu_usage(),
                    memory_used_bytes = system.used_memory(),
                    load_one = load.one,
                    "Stats report"
                );
            }
        })
    }

    /// Watch for failed agents; restart each once, then quarantine.
    fn spawn_health_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                supervisor.sweep_failed_agents().await;
            }
        })
    }

    async fn sweep_failed_agents(&self) {
        let auto_restart = self.orchestrator.config().agent.auto_restart;
        let failed: Vec<AgentId> = self
            .orchestrator
            .agent_states()
            .into_iter()
            .filter(|(_, state, _)| *state == AgentState::Failed)
            .map(|(agent_id, _, _)| agent_id)
            .collect();

        for agent_id in failed {
            let attempts = {
                let mut map = self
                    .restart_attempts
                    .lock()
                    .expect("restart map lock poisoned");
                let entry = map.entry(agent_id.clone()).or_insert(0);
                let current = *entry;
                *entry += 1;
                current
            };

            match restart_decision(auto_restart, attempts) {
                RestartDecision::Restart => {
                    warn!(agent_id = %agent_id, "Attempting restart of failed agent");
                    if let Err(e) = self.orchestrator.restart_agent(&agent_id).await {
                        error!(agent_id = %agent_id, error = %e, "Restart failed");
                        if let Some(runtime) = self.orchestrator.quarantine_agent(&agent_id) {
                            runtime.stop().await;
                        }
                    }
                }
                RestartDecision::Quarantine => {
                    if let Some(runtime) = self.orchestrator.quarantine_agent(&agent_id) {
                        runtime.stop().await;
                    }
                }
            }
        }
    }

    /// Let in-flight work finish, bounded by the grace window.
    async fn drain(&self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let busy = self
                .orchestrator
                .agent_states()
                .iter()
                .any(|(_, state, _)| *state == AgentState::Busy);
            if !busy && self.orchestrator.queue().is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!("Shutdown grace period elapsed with work in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
        }
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_restarts() {
        assert_eq!(restart_decision(true, 0), RestartDecision::Restart);
    }

    #[test]
    fn test_second_failure_quarantines() {
        assert_eq!(restart_decision(true, 1), RestartDecision::Quarantine);
        assert_eq!(restart_decision(true, 5), RestartDecision::Quarantine);
    }

    #[test]
    fn test_disabled_auto_restart_always_quarantines() {
        assert_eq!(restart_decision(false, 0), RestartDecision::Quarantine);
    }
}
