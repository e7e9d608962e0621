//! Task and result types.

use crate::error::{Error, Result};
use crate::ids::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Serialize durations as float seconds on the wire and in config files.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let secs = Option::<f64>::deserialize(deserializer)?;
            match secs {
                Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
                Some(_) => Err(serde::de::Error::custom("duration must be non-negative")),
                None => Ok(None),
            }
        }
    }
}

/// Kind of work a task asks an agent to perform.
///
/// Unrecognized tags fold to `Generic` so newer submitters can extend the
/// vocabulary without breaking older engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeReview,
    Refactor,
    TestGeneration,
    Analysis,
    #[default]
    Generic,
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "code_review" => TaskType::CodeReview,
            "refactor" => TaskType::Refactor,
            "test_generation" => TaskType::TestGeneration,
            "analysis" => TaskType::Analysis,
            _ => TaskType::Generic,
        })
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeReview => "code_review",
            TaskType::Refactor => "refactor",
            TaskType::TestGeneration => "test_generation",
            TaskType::Analysis => "analysis",
            TaskType::Generic => "generic",
        }
    }

    /// Task types that consume staged files.
    pub fn consumes_files(&self) -> bool {
        matches!(
            self,
            TaskType::CodeReview | TaskType::Refactor | TaskType::TestGeneration
        )
    }
}

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "TaskId::generate")]
    pub task_id: TaskId,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
    /// 1-10, higher dispatches earlier.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            task_id: TaskId::generate(),
            task_type: TaskType::Generic,
            description: String::new(),
            files: Vec::new(),
            parallel: false,
            subtasks: Vec::new(),
            priority: DEFAULT_PRIORITY,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// Partial descriptor for one branch of a parallel task. Unset fields
/// inherit from the parent at materialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskSpec {
    #[serde(rename = "type", default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default, with = "duration_secs::option")]
    pub timeout: Option<Duration>,
}

impl Task {
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            task_type,
            description: description.into(),
            ..Default::default()
        }
    }

    /// Validate the descriptor. Violations are programming errors on the
    /// submitter's side and surface as `TaskValidation`.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.as_str().is_empty() {
            return Err(Error::TaskValidation("task_id must not be empty".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(Error::TaskValidation(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        if self.parallel && self.subtasks.is_empty() {
            return Err(Error::TaskValidation(
                "parallel task requires at least one subtask".into(),
            ));
        }
        Ok(())
    }

    /// Materialize the `index`-th subtask, applying the inheritance rules:
    /// priority always inherited, timeout inherited unless the spec carries
    /// its own, task type defaults to the parent's.
    pub fn materialize_subtask(&self, index: usize) -> Option<Task> {
        let spec = self.subtasks.get(index)?;
        Some(Task {
            task_id: self.task_id.subtask(index),
            task_type: spec.task_type.unwrap_or(self.task_type),
            description: spec.description.clone(),
            files: spec.files.clone(),
            parallel: false,
            subtasks: Vec::new(),
            priority: self.priority,
            timeout: spec.timeout.unwrap_or(self.timeout),
        })
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
    Timeout,
    /// Reserved for parallel tasks where some subtasks succeeded and some
    /// did not.
    Partial,
}

/// Outcome delivered to the submitter. Operational failures are carried
/// here rather than raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock seconds from dispatch to completion.
    #[serde(default)]
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, agent_id: AgentId, result: Map<String, Value>) -> Self {
        Self {
            task_id,
            agent_id,
            status: TaskStatus::Success,
            result,
            error: None,
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(task_id: TaskId, agent_id: AgentId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id,
            status: TaskStatus::Failed,
            result: Map::new(),
            error: Some(error.into()),
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn timed_out(task_id: TaskId, agent_id: AgentId) -> Self {
        Self {
            task_id,
            agent_id,
            status: TaskStatus::Timeout,
            result: Map::new(),
            error: Some("task execution timeout".into()),
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = seconds;
        self
    }
}
