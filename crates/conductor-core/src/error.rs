//! Error types for Conductor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Resource errors
    #[error("Insufficient agents started: {started} of {required} required")]
    InsufficientAgents { started: usize, required: usize },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Channel errors
    #[error("Channel bind failed at {path}: {message}")]
    ChannelBind { path: String, message: String },

    #[error("Channel connect failed at {path}: {message}")]
    ChannelConnect { path: String, message: String },

    #[error("Channel write failed: {0}")]
    ChannelWrite(String),

    #[error("Channel closed")]
    ChannelClosed,

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Duplicate message id {message_id} from {sender_id}")]
    DuplicateMessageId {
        sender_id: String,
        message_id: String,
    },

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    // Container errors
    #[error("Container error: {message}")]
    Container {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Snapshot not found for agent {agent_id}: {name}")]
    SnapshotNotFound { agent_id: String, name: String },

    #[error("Workspace creation failed for agent {agent_id}: {message}")]
    WorkspaceCreation { agent_id: String, message: String },

    #[error("Workspace cleanup failed for agent {agent_id}: {message}")]
    WorkspaceCleanup { agent_id: String, message: String },

    // Task errors
    #[error("Task validation failed: {0}")]
    TaskValidation(String),

    #[error("Task queue full at capacity {capacity}")]
    QueueFull { capacity: usize },

    #[error("Worker process error: {0}")]
    Worker(String),

    #[error("Circuit breaker open for {operation}")]
    CircuitOpen { operation: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl Error {
    /// Whether the dispatcher may transparently retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Container { .. }
                | Error::ChannelConnect { .. }
                | Error::ChannelWrite(_)
                | Error::Io(_)
        )
    }
}
