//! End-to-end task lifecycle: agent fleet, selection, dispatch, results.

use crate::queue::TaskQueue;
use crate::stats::{Stats, StatsSnapshot};
use conductor_agent::{AgentConfig, AgentRuntime, AgentState};
use conductor_channel::ChannelServer;
use conductor_core::config::EngineConfig;
use conductor_core::ids::{AgentId, TaskId};
use conductor_core::message::{AgentMessage, MessageType};
use conductor_core::store::ResultStore;
use conductor_core::task::{Task, TaskResult, TaskStatus};
use conductor_core::{Error, Result};
use conductor_workspace::WorkspaceController;
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

/// How long a dispatcher waits between availability re-checks.
const CLAIM_POLL: Duration = Duration::from_millis(200);

/// Selection view of one agent.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub agent_id: AgentId,
    pub idle: bool,
    pub tasks_completed: u64,
}

/// Deterministic selection policy: idle agents only, fewest completed
/// tasks first, ties broken by lexicographic agent id.
pub fn select_agent(candidates: &[AgentCandidate]) -> Option<AgentId> {
    candidates
        .iter()
        .filter(|c| c.idle)
        .min_by(|a, b| {
            a.tasks_completed
                .cmp(&b.tasks_completed)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        })
        .map(|c| c.agent_id.clone())
}

/// Aggregate status of a parallel task from its subtask results.
pub fn aggregate_result(parent: &Task, results: &[TaskResult]) -> TaskResult {
    let succeeded = results
        .iter()
        .filter(|r| r.status == TaskStatus::Success)
        .count();
    let failed = results.len() - succeeded;

    let status = if results.is_empty() || succeeded == 0 {
        TaskStatus::Failed
    } else if failed == 0 {
        TaskStatus::Success
    } else {
        TaskStatus::Partial
    };

    let mut output = Map::new();
    output.insert("subtasks".to_string(), json!(results.len()));
    output.insert("succeeded".to_string(), json!(succeeded));
    output.insert("failed".to_string(), json!(failed));

    let execution_time = results
        .iter()
        .map(|r| r.execution_time)
        .fold(0.0_f64, f64::max);

    TaskResult {
        task_id: parent.task_id.clone(),
        agent_id: AgentId::none(),
        status,
        result: output,
        error: if status == TaskStatus::Failed {
            Some("all subtasks failed".to_string())
        } else {
            None
        },
        execution_time,
        timestamp: chrono::Utc::now(),
    }
}

/// The coordinator: owns the broker channel, the agent set, the task
/// queue, and the result store.
pub struct Orchestrator {
    config: EngineConfig,
    workspace: Arc<WorkspaceController>,
    broker: StdMutex<Option<Arc<ChannelServer>>>,
    agents: StdMutex<BTreeMap<AgentId, Arc<AgentRuntime>>>,
    queue: Arc<TaskQueue>,
    results: Arc<ResultStore>,
    stats: Arc<Stats>,
    dispatch_permits: Arc<Semaphore>,
    completion: Notify,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let workspace = Arc::new(WorkspaceController::new(&config)?);
        Ok(Self {
            queue: Arc::new(TaskQueue::new(&config.task_queue)),
            results: Arc::new(ResultStore::new(&config.result_store)),
            stats: Arc::new(Stats::new()),
            dispatch_permits: Arc::new(Semaphore::new(config.max_workers)),
            broker: StdMutex::new(None),
            agents: StdMutex::new(BTreeMap::new()),
            completion: Notify::new(),
            workspace,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn get_task_result(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.results.get(task_id)
    }

    /// Open the broker and bring up the fleet. Proceeds only if at least
    /// `min_agents` agents started.
    pub async fn start(&self) -> Result<()> {
        info!(num_agents = self.config.num_agents, "Starting orchestrator");

        let broker = Arc::new(
            ChannelServer::bind(
                &self.config.communication.socket_path,
                AgentId::coordinator(),
            )
            .await?,
        );
        *self.broker.lock().expect("broker lock poisoned") = Some(broker);

        let mut set = JoinSet::new();
        for index in 0..self.config.num_agents {
            let agent_id = AgentId::numbered(index);
            let runtime = Arc::new(AgentRuntime::new(
                AgentConfig::from_engine(&self.config, agent_id),
                Arc::clone(&self.workspace),
            ));
            set.spawn(async move {
                let outcome = runtime.start().await;
                (runtime, outcome)
            });
        }

        let mut started = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((runtime, Ok(()))) => {
                    info!(agent_id = %runtime.agent_id(), "Agent joined fleet");
                    self.agents
                        .lock()
                        .expect("agent map lock poisoned")
                        .insert(runtime.agent_id().clone(), runtime);
                    started += 1;
                }
                Ok((runtime, Err(e))) => {
                    error!(agent_id = %runtime.agent_id(), error = %e, "Agent failed to start");
                    runtime.stop().await;
                }
                Err(e) => {
                    error!(error = %e, "Agent startup task panicked");
                }
            }
        }

        if started < self.config.min_agents {
            self.shutdown().await;
            return Err(Error::InsufficientAgents {
                started,
                required: self.config.min_agents,
            });
        }

        info!(active_agents = started, "Orchestrator started");
        Ok(())
    }

    /// Execute one task to completion. Operational failures come back as
    /// results; invalid descriptors are raised.
    pub fn execute_task<'a>(
        self: &'a Arc<Self>,
        task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TaskResult>> + Send + 'a>> {
        Box::pin(self.execute_task_inner(task))
    }

    async fn execute_task_inner(self: &Arc<Self>, task: Task) -> Result<TaskResult> {
        task.validate()?;

        if task.parallel {
            let results = self.execute_parallel_task(task.clone()).await?;
            return Ok(aggregate_result(&task, &results));
        }

        if task.timeout.is_zero() {
            let result = TaskResult::timed_out(task.task_id.clone(), AgentId::none());
            self.record(&result);
            return Ok(result);
        }

        // A stale result under the same id must not satisfy this run.
        let prior_timestamp = self.results.get(&task.task_id).map(|r| r.timestamp);
        let fresh = |result: &TaskResult| match prior_timestamp {
            Some(prior) => result.timestamp > prior,
            None => true,
        };

        if let Err(e) = self.queue.enqueue(task.clone()) {
            match e {
                Error::QueueFull { .. } => {
                    warn!(task_id = %task.task_id, "Rejecting task, queue full");
                    let result = TaskResult::failed(
                        task.task_id.clone(),
                        AgentId::none(),
                        "queue_full",
                    );
                    self.record(&result);
                    return Ok(result);
                }
                other => return Err(other),
            }
        }

        let deadline = Instant::now() + task.timeout;
        loop {
            if let Some(result) = self.results.get(&task.task_id) {
                if fresh(&result) {
                    return Ok(result);
                }
            }

            if let Some(agent) = self.try_claim_agent() {
                // Drive the queue head, which may be someone else's task;
                // priority order wins over submission order.
                match self.queue.try_dequeue() {
                    Some(next) => {
                        let own = next.task_id == task.task_id;
                        let result = self.dispatch(next, agent).await;
                        if own {
                            return Ok(result);
                        }
                        continue;
                    }
                    None => agent.mark_idle(),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.queue.remove(&task.task_id);
                if let Some(result) = self.results.get(&task.task_id) {
                    if fresh(&result) {
                        return Ok(result);
                    }
                }
                warn!(task_id = %task.task_id, "No agent became available in time");
                let result = TaskResult::failed(
                    task.task_id.clone(),
                    AgentId::none(),
                    "no_available_agents",
                );
                self.record(&result);
                return Ok(result);
            }

            let wait = (deadline - now).min(CLAIM_POLL);
            let _ = timeout(wait, self.completion.notified()).await;
        }
    }

    /// Fan a parallel task out over the fleet, one agent per subtask.
    /// Returns per-subtask results in subtask order; the aggregate parent
    /// result is recorded in the result store.
    pub async fn execute_parallel_task(self: &Arc<Self>, task: Task) -> Result<Vec<TaskResult>> {
        task.validate()?;

        if task.subtasks.is_empty() {
            let mut single = task;
            single.parallel = false;
            return Ok(vec![self.execute_task(single).await?]);
        }

        let subtasks: Vec<Task> = (0..task.subtasks.len())
            .filter_map(|index| task.materialize_subtask(index))
            .collect();

        let mut set = JoinSet::new();
        for (index, subtask) in subtasks.iter().cloned().enumerate() {
            let this = Arc::clone(self);
            set.spawn(async move { (index, this.execute_task(subtask).await) });
        }

        let mut slots: Vec<Option<TaskResult>> = vec![None; subtasks.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(e))) => {
                    slots[index] = Some(TaskResult::failed(
                        subtasks[index].task_id.clone(),
                        AgentId::none(),
                        e.to_string(),
                    ));
                }
                Err(e) => error!(error = %e, "Subtask dispatch panicked"),
            }
        }

        let results: Vec<TaskResult> = slots.into_iter().flatten().collect();
        let aggregate = aggregate_result(&task, &results);
        self.results.insert(aggregate);
        Ok(results)
    }

    /// Claim the preferred idle agent, marking it busy under the map lock
    /// so no other dispatcher can claim it concurrently.
    fn try_claim_agent(&self) -> Option<Arc<AgentRuntime>> {
        let agents = self.agents.lock().expect("agent map lock poisoned");
        let candidates: Vec<AgentCandidate> = agents
            .values()
            .map(|runtime| AgentCandidate {
                agent_id: runtime.agent_id().clone(),
                idle: runtime.is_idle(),
                tasks_completed: runtime.tasks_completed(),
            })
            .collect();

        let selected = select_agent(&candidates)?;
        let runtime = agents.get(&selected)?;
        runtime.mark_busy();
        Some(Arc::clone(runtime))
    }

    /// Run one task on one claimed agent, bounded by the task timeout.
    async fn dispatch(&self, task: Task, agent: Arc<AgentRuntime>) -> TaskResult {
        let permit = match Arc::clone(&self.dispatch_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                agent.mark_idle();
                let result = TaskResult::failed(
                    task.task_id.clone(),
                    AgentId::none(),
                    "dispatcher shut down",
                );
                self.record(&result);
                return result;
            }
        };

        let task_id = task.task_id.clone();
        let agent_id = agent.agent_id().clone();
        let budget = task.timeout;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.execute_task(&task).await })
        };

        let result = match timeout(budget, runner).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(
                    agent_id = %agent_id,
                    task_id = %task_id,
                    error = %join_error,
                    "Agent crashed during task"
                );
                agent.mark_idle();
                TaskResult::failed(task_id, agent_id, format!("agent_crashed: {join_error}"))
            }
            Err(_) => {
                warn!(agent_id = %agent_id, task_id = %task_id, "Task timed out");
                // The runaway run unwinds on its own; the abort frees the
                // agent and the health loop judges the worker afterwards.
                agent.abort_current();
                TaskResult::timed_out(task_id, agent_id)
                    .with_execution_time(budget.as_secs_f64())
            }
        };

        drop(permit);
        self.record(&result);
        result
    }

    fn record(&self, result: &TaskResult) {
        self.stats.record(result);
        self.results.insert(result.clone());
        self.completion.notify_waiters();
    }

    /// Lifecycle view of the fleet.
    pub fn agent_states(&self) -> Vec<(AgentId, AgentState, u64)> {
        self.agents
            .lock()
            .expect("agent map lock poisoned")
            .values()
            .map(|runtime| {
                (
                    runtime.agent_id().clone(),
                    runtime.state(),
                    runtime.tasks_completed(),
                )
            })
            .collect()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Arc<AgentRuntime>> {
        self.agents
            .lock()
            .expect("agent map lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Tear an agent down and bring it back up.
    pub async fn restart_agent(&self, agent_id: &AgentId) -> Result<()> {
        let runtime = self
            .agent(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        info!(agent_id = %agent_id, "Restarting agent");
        runtime.stop().await;
        runtime.start().await?;
        self.completion.notify_waiters();
        Ok(())
    }

    /// Remove an agent from the dispatchable set. The caller owns the
    /// returned runtime's teardown.
    pub fn quarantine_agent(&self, agent_id: &AgentId) -> Option<Arc<AgentRuntime>> {
        let removed = self
            .agents
            .lock()
            .expect("agent map lock poisoned")
            .remove(agent_id);
        if removed.is_some() {
            warn!(agent_id = %agent_id, "Agent quarantined");
        }
        removed
    }

    /// Broadcast the shutdown notice, stop every agent, close the broker.
    pub async fn shutdown(&self) {
        info!("Stopping orchestrator");

        let broker = self
            .broker
            .lock()
            .expect("broker lock poisoned")
            .clone();
        if let Some(broker) = &broker {
            let mut payload = Map::new();
            payload.insert("event".to_string(), json!("shutdown"));
            let notice = AgentMessage::new(
                AgentId::coordinator(),
                AgentId::broadcast(),
                MessageType::StatusUpdate,
                payload,
            );
            let _ = broker.broadcast(notice, None).await;
        }

        let agents: Vec<Arc<AgentRuntime>> = {
            let mut map = self.agents.lock().expect("agent map lock poisoned");
            let drained = map.values().cloned().collect();
            map.clear();
            drained
        };
        let mut set = JoinSet::new();
        for agent in agents {
            set.spawn(async move { agent.stop().await });
        }
        while set.join_next().await.is_some() {}

        let broker = self
            .broker
            .lock()
            .expect("broker lock poisoned")
            .take();
        if let Some(broker) = broker {
            broker.close().await;
        }

        info!("Orchestrator stopped");
    }
}
