//! The agent runtime: owns one workspace container and one worker process,
//! executes tasks, and serves peer task requests from the broker.

use crate::config::AgentConfig;
use crate::health::HealthMonitor;
use crate::worker::{OutputLine, OutputStream, WorkerProcess};
use conductor_channel::{ChannelClient, Protocol};
use conductor_core::ids::AgentId;
use conductor_core::message::MessageType;
use conductor_core::task::{Task, TaskResult, TaskType};
use conductor_core::{Error, Result};
use conductor_workspace::WorkspaceController;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const HEALTH_PROBE_COMMAND: &str = "echo health_check";
const HEALTH_PROBE_WINDOW: Duration = Duration::from_secs(5);
const MESSAGE_POLL: Duration = Duration::from_millis(100);

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }
}

/// One supervised agent.
pub struct AgentRuntime {
    config: AgentConfig,
    workspace: Arc<WorkspaceController>,
    state_tx: watch::Sender<AgentState>,
    worker: StdMutex<Option<Arc<WorkerProcess>>>,
    channel: StdMutex<Option<Arc<ChannelClient>>>,
    protocol: StdMutex<Option<Arc<Protocol>>>,
    health: HealthMonitor,
    tasks_completed: AtomicU64,
    abort: Notify,
    /// Serializes dispatcher tasks with peer-to-peer task requests; the
    /// agent runs exactly one task at a time.
    task_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, workspace: Arc<WorkspaceController>) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let health = HealthMonitor::new(config.health_check_failures);
        Self {
            config,
            workspace,
            state_tx,
            worker: StdMutex::new(None),
            channel: StdMutex::new(None),
            protocol: StdMutex::new(None),
            health,
            tasks_completed: AtomicU64::new(0),
            abort: Notify::new(),
            task_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            loops: StdMutex::new(Vec::new()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.config.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == AgentState::Idle
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: AgentState) {
        let _ = self.state_tx.send(state);
    }

    /// Flip to busy. Called by the dispatcher under its agent-map lock so
    /// two dispatches can never claim the same agent.
    pub fn mark_busy(&self) {
        self.set_state(AgentState::Busy);
    }

    pub fn mark_idle(&self) {
        if self.state() == AgentState::Busy {
            self.set_state(AgentState::Idle);
        }
    }

    /// Bring the agent up: workspace container, worker process, broker
    /// connection, message and health loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_state(AgentState::Starting);
        let _ = self.shutdown_tx.send(false);
        self.health.record_success();
        info!(agent_id = %self.config.agent_id, "Starting agent");

        std::fs::create_dir_all(&self.config.work_dir).map_err(|e| Error::WorkspaceCreation {
            agent_id: self.config.agent_id.to_string(),
            message: format!("cannot create {}: {e}", self.config.work_dir.display()),
        })?;

        if let Err(e) = self
            .workspace
            .create_workspace(&self.config.agent_id, &self.config.environment)
            .await
        {
            self.set_state(AgentState::Failed);
            return Err(e);
        }

        let worker = match WorkerProcess::start(
            self.workspace.docker().clone(),
            self.config.container_name.clone(),
            self.config.worker_command.clone(),
        )
        .await
        {
            Ok(worker) => Arc::new(worker),
            Err(e) => {
                self.set_state(AgentState::Failed);
                return Err(e);
            }
        };
        *self.worker.lock().expect("worker lock poisoned") = Some(worker);

        let channel = match ChannelClient::connect(
            &self.config.socket_path,
            self.config.agent_id.clone(),
            self.config.connect_timeout,
        )
        .await
        {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                self.set_state(AgentState::Failed);
                return Err(e);
            }
        };
        let protocol = Arc::new(Protocol::new(channel.clone()));
        self.register_task_handler(&protocol);

        let mut hello = Map::new();
        hello.insert("event".to_string(), json!("connected"));
        hello.insert("state".to_string(), json!(AgentState::Idle.as_str()));
        protocol
            .send_message(AgentId::coordinator(), MessageType::StatusUpdate, hello)
            .await?;

        *self.channel.lock().expect("channel lock poisoned") = Some(channel);
        *self.protocol.lock().expect("protocol lock poisoned") = Some(protocol.clone());

        self.spawn_message_loop(protocol);
        self.spawn_health_loop();

        self.set_state(AgentState::Idle);
        info!(agent_id = %self.config.agent_id, "Agent started");
        Ok(())
    }

    fn register_task_handler(self: &Arc<Self>, protocol: &Arc<Protocol>) {
        let runtime = Arc::clone(self);
        let responder = Arc::clone(protocol);
        protocol.register_handler(
            MessageType::TaskRequest,
            conductor_channel::protocol::handler(move |request| {
                let runtime = Arc::clone(&runtime);
                let responder = Arc::clone(&responder);
                async move {
                    let task: Task =
                        match serde_json::from_value(Value::Object(request.payload.clone())) {
                            Ok(task) => task,
                            Err(e) => {
                                warn!(
                                    sender = %request.sender_id,
                                    error = %e,
                                    "Rejecting malformed peer task request"
                                );
                                let mut payload = Map::new();
                                payload.insert("error".to_string(), json!(e.to_string()));
                                let _ = responder.send_response(&request, payload).await;
                                return;
                            }
                        };
                    info!(
                        agent_id = %runtime.config.agent_id,
                        task_id = %task.task_id,
                        sender = %request.sender_id,
                        "Executing peer task request"
                    );
                    let result = runtime.execute_task(&task).await;
                    let payload = match serde_json::to_value(&result) {
                        Ok(Value::Object(map)) => map,
                        _ => Map::new(),
                    };
                    let _ = responder.send_response(&request, payload).await;
                }
            }),
        );
    }

    fn spawn_message_loop(self: &Arc<Self>, protocol: Arc<Protocol>) {
        let agent_id = self.config.agent_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = protocol.process_messages(MESSAGE_POLL) => {
                        if let Err(e) = result {
                            warn!(agent_id = %agent_id, error = %e, "Protocol violation");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.loops.lock().expect("loop list lock poisoned").push(handle);
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(runtime.config.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so probes start one
            // interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Probes only make sense between tasks; a busy
                        // worker legitimately answers nothing.
                        if runtime.state() != AgentState::Idle {
                            continue;
                        }
                        if runtime.probe_worker().await {
                            runtime.health.record_success();
                        } else if runtime.health.record_failure() {
                            error!(
                                agent_id = %runtime.config.agent_id,
                                "Health check failed, marking agent failed"
                            );
                            runtime.set_state(AgentState::Failed);
                            break;
                        } else {
                            warn!(
                                agent_id = %runtime.config.agent_id,
                                failures = runtime.health.consecutive_failures(),
                                "Health probe missed"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.loops.lock().expect("loop list lock poisoned").push(handle);
    }

    async fn probe_worker(&self) -> bool {
        let worker = match self.worker() {
            Ok(worker) => worker,
            Err(_) => return false,
        };
        if worker.send_command(HEALTH_PROBE_COMMAND).await.is_err() {
            return false;
        }
        !worker.read_output(HEALTH_PROBE_WINDOW).await.is_empty()
    }

    fn worker(&self) -> Result<Arc<WorkerProcess>> {
        self.worker
            .lock()
            .expect("worker lock poisoned")
            .clone()
            .ok_or_else(|| Error::Worker("worker process is not running".into()))
    }

    /// Execute one task to completion and return its result. Operational
    /// failures are captured in the result, never raised.
    pub async fn execute_task(&self, task: &Task) -> TaskResult {
        let _running = self.task_lock.lock().await;
        let start = Instant::now();
        self.mark_busy();
        info!(
            agent_id = %self.config.agent_id,
            task_id = %task.task_id,
            task_type = task.task_type.as_str(),
            "Executing task"
        );

        let snapshot = if self.config.snapshots_enabled && self.config.snapshot_before_task {
            match self
                .workspace
                .create_snapshot(&self.config.agent_id, None)
                .await
            {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!(agent_id = %self.config.agent_id, error = %e, "Pre-task snapshot failed");
                    None
                }
            }
        } else {
            None
        };

        let outcome = tokio::select! {
            outcome = self.run_task(task) => outcome,
            _ = self.abort.notified() => {
                warn!(
                    agent_id = %self.config.agent_id,
                    task_id = %task.task_id,
                    "Task aborted by dispatcher"
                );
                Err(Error::Worker("task aborted".into()))
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(output) => TaskResult::success(
                task.task_id.clone(),
                self.config.agent_id.clone(),
                output,
            )
            .with_execution_time(elapsed),
            Err(e) => {
                error!(
                    agent_id = %self.config.agent_id,
                    task_id = %task.task_id,
                    error = %e,
                    "Task failed"
                );
                if self.config.restore_on_error {
                    if let Some(name) = &snapshot {
                        if let Err(restore_err) = self
                            .workspace
                            .restore_snapshot(&self.config.agent_id, name)
                            .await
                        {
                            warn!(
                                agent_id = %self.config.agent_id,
                                error = %restore_err,
                                "Post-failure restore failed"
                            );
                        }
                    }
                }
                TaskResult::failed(task.task_id.clone(), self.config.agent_id.clone(), e.to_string())
                    .with_execution_time(elapsed)
            }
        };

        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.mark_idle();
        result
    }

    /// Cancel the in-flight task collection, freeing the agent.
    pub fn abort_current(&self) {
        self.abort.notify_waiters();
    }

    async fn run_task(&self, task: &Task) -> Result<Map<String, Value>> {
        match task.task_type {
            TaskType::CodeReview => self.run_code_review(task).await,
            TaskType::Refactor => self.run_refactor(task).await,
            TaskType::TestGeneration => self.run_test_generation(task).await,
            TaskType::Analysis => self.run_analysis(task).await,
            TaskType::Generic => self.run_generic(task).await,
        }
    }

    async fn run_code_review(&self, task: &Task) -> Result<Map<String, Value>> {
        let worker = self.worker()?;
        let mut details = Map::new();
        let mut total_issues = 0i64;

        for file in &task.files {
            let Some(name) = self.stage_file(file).await? else {
                continue;
            };
            worker.send_command(&review_command(&name)).await?;
            let outputs = worker.read_output(Duration::from_secs(10)).await;
            let parsed = parse_structured(&outputs, "issue_count");
            total_issues += parsed
                .get("issue_count")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            details.insert(file.display().to_string(), Value::Object(parsed));
        }

        let mut result = Map::new();
        result.insert("files_reviewed".to_string(), json!(task.files.len()));
        result.insert("total_issues".to_string(), json!(total_issues));
        result.insert("details".to_string(), Value::Object(details));
        Ok(result)
    }

    async fn run_refactor(&self, task: &Task) -> Result<Map<String, Value>> {
        let worker = self.worker()?;
        let mut names = Vec::new();
        for file in &task.files {
            if let Some(name) = self.stage_file(file).await? {
                names.push(name);
            }
        }

        worker
            .send_command(&refactor_command(&names, &task.description))
            .await?;
        let outputs = worker.read_output(Duration::from_secs(30)).await;

        let mut result = Map::new();
        result.insert("refactored".to_string(), json!(true));
        result.insert("files_affected".to_string(), json!(task.files.len()));
        result.insert("output".to_string(), json!(format_output(&outputs)));
        Ok(result)
    }

    async fn run_test_generation(&self, task: &Task) -> Result<Map<String, Value>> {
        let worker = self.worker()?;
        let mut details = Map::new();
        let mut total_tests = 0i64;

        for file in &task.files {
            let Some(name) = self.stage_file(file).await? else {
                continue;
            };
            worker.send_command(&generate_tests_command(&name)).await?;
            let outputs = worker.read_output(Duration::from_secs(20)).await;
            let parsed = parse_structured(&outputs, "test_count");
            total_tests += parsed.get("test_count").and_then(Value::as_i64).unwrap_or(0);
            details.insert(file.display().to_string(), Value::Object(parsed));
        }

        let mut result = Map::new();
        result.insert("files_processed".to_string(), json!(task.files.len()));
        result.insert("total_tests_generated".to_string(), json!(total_tests));
        result.insert("details".to_string(), Value::Object(details));
        Ok(result)
    }

    async fn run_analysis(&self, task: &Task) -> Result<Map<String, Value>> {
        let worker = self.worker()?;
        worker
            .send_command(&format!("analyze {}", task.description))
            .await?;
        let outputs = worker.read_output(task.timeout).await;

        let mut result = Map::new();
        result.insert("analysis_type".to_string(), json!(task.description));
        result.insert("result".to_string(), json!(format_output(&outputs)));
        Ok(result)
    }

    async fn run_generic(&self, task: &Task) -> Result<Map<String, Value>> {
        let worker = self.worker()?;
        worker.send_command(&task.description).await?;
        let outputs = worker.read_output(task.timeout).await;

        let mut result = Map::new();
        result.insert("output".to_string(), json!(format_output(&outputs)));
        Ok(result)
    }

    /// Copy a host file into the bind-mounted workspace so the worker sees
    /// it under /workspace. Missing files are skipped.
    async fn stage_file(&self, file: &std::path::Path) -> Result<Option<String>> {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Ok(None);
        };
        if !file.exists() {
            warn!(
                agent_id = %self.config.agent_id,
                file = %file.display(),
                "Skipping missing task file"
            );
            return Ok(None);
        }
        let dest = self.config.work_dir.join(&name);
        tokio::fs::copy(file, &dest).await.map_err(|e| {
            Error::Worker(format!("cannot stage {} into workspace: {e}", file.display()))
        })?;
        Ok(Some(name))
    }

    /// Tear the agent down: worker, container, channel, loops.
    pub async fn stop(&self) {
        info!(agent_id = %self.config.agent_id, "Stopping agent");
        self.set_state(AgentState::Stopping);
        let _ = self.shutdown_tx.send(true);
        self.abort.notify_waiters();

        let worker = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = worker {
            worker.stop().await;
        }

        if let Err(e) = self.workspace.cleanup(&self.config.agent_id, true).await {
            warn!(agent_id = %self.config.agent_id, error = %e, "Workspace cleanup failed");
        }

        let channel = self.channel.lock().expect("channel lock poisoned").take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.protocol.lock().expect("protocol lock poisoned").take();

        for handle in self
            .loops
            .lock()
            .expect("loop list lock poisoned")
            .drain(..)
        {
            handle.abort();
        }

        self.set_state(AgentState::Stopped);
        debug!(agent_id = %self.config.agent_id, "Agent stopped");
    }
}

fn review_command(name: &str) -> String {
    format!("review {name}")
}

fn generate_tests_command(name: &str) -> String {
    format!("generate-tests {name}")
}

fn refactor_command(names: &[String], description: &str) -> String {
    let mut command = format!("refactor {}", names.join(" "));
    if !description.is_empty() {
        command.push_str(&format!(" --description '{description}'"));
    }
    command
}

/// Join stdout lines and try to parse them as one structured record; on
/// failure preserve the raw text with a zeroed count.
fn parse_structured(outputs: &[OutputLine], count_key: &str) -> Map<String, Value> {
    let text = outputs
        .iter()
        .filter(|line| line.stream == OutputStream::Stdout)
        .map(|line| line.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("raw_output".to_string(), json!(text));
            map.insert(count_key.to_string(), json!(0));
            map
        }
    }
}

/// Render all captured lines with their stream tags.
fn format_output(outputs: &[OutputLine]) -> String {
    outputs
        .iter()
        .map(|line| format!("[{}] {}", line.stream.as_str(), line.content))
        .collect::<Vec<_>>()
        .join("\n")
}
