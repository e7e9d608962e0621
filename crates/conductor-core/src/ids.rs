//! Identifiers for domain entities.
//!
//! Task and agent ids are caller-assigned opaque strings (the orchestrator
//! names agents `agent_000`, `agent_001`, ... so lexicographic order is
//! start order). Message ids are minted from UUIDv7 so they sort by time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_string_id!(TaskId);
define_string_id!(AgentId);
define_string_id!(MessageId);

impl TaskId {
    /// Mint a fresh task id for submitters that do not supply one.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Derived id for the `index`-th subtask of a parallel task.
    pub fn subtask(&self, index: usize) -> Self {
        Self(format!("{}_sub{}", self.0, index))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::generate()
    }
}

impl AgentId {
    /// The placeholder id carried by results for tasks that were rejected
    /// before any agent was assigned.
    pub fn none() -> Self {
        Self("none".to_string())
    }

    /// The coordinator's well-known id on the broker.
    pub fn coordinator() -> Self {
        Self("orchestrator".to_string())
    }

    /// The reserved receiver id addressing every connected peer.
    pub fn broadcast() -> Self {
        Self("broadcast".to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == "broadcast"
    }

    /// Conventional id for the `index`-th agent in the fleet.
    pub fn numbered(index: usize) -> Self {
        Self(format!("agent_{index:03}"))
    }
}

impl MessageId {
    /// Mint a fresh message id, unique per sender.
    pub fn generate(sender: &AgentId) -> Self {
        Self(format!("{}_{}", sender, Uuid::now_v7()))
    }
}
