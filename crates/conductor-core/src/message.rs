//! Wire messages exchanged between agents and the coordinator.

use crate::ids::{AgentId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message kinds on the broker socket. An unknown tag fails
/// deserialization, which the channel surfaces as a protocol error; payload
/// schemas stay opaque so the vocabulary can grow behind these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    Coordination,
    Heartbeat,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::Coordination => "coordination",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
        }
    }
}

/// One framed message. Fields map 1:1 onto the wire representation; unknown
/// payload keys are preserved untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub receiver_id: AgentId,
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
}

impl AgentMessage {
    pub fn new(
        sender_id: AgentId,
        receiver_id: AgentId,
        message_type: MessageType,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: MessageId::generate(&sender_id),
            sender_id,
            receiver_id,
            message_type,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build the reply to `request`: targeted at its sender and correlated
    /// to its message id.
    pub fn response_to(request: &AgentMessage, sender_id: AgentId, payload: Map<String, Value>) -> Self {
        Self {
            message_id: MessageId::generate(&sender_id),
            sender_id,
            receiver_id: request.sender_id.clone(),
            message_type: MessageType::TaskResponse,
            payload,
            timestamp: Utc::now(),
            correlation_id: Some(request.message_id.clone()),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_string_form() {
        assert_eq!(MessageType::TaskRequest.as_str(), "task_request");
        let json = serde_json::to_string(&MessageType::StatusUpdate).unwrap();
        assert_eq!(json, "\"status_update\"");
    }

    #[test]
    fn test_response_correlation() {
        let request = AgentMessage::new(
            AgentId::numbered(1),
            AgentId::numbered(2),
            MessageType::TaskRequest,
            Map::new(),
        );
        let response = AgentMessage::response_to(&request, AgentId::numbered(2), Map::new());

        assert_eq!(response.receiver_id, request.sender_id);
        assert_eq!(response.correlation_id, Some(request.message_id.clone()));
        assert_eq!(response.message_type, MessageType::TaskResponse);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let raw = r#"{
            "message_id": "a_1",
            "sender_id": "a",
            "receiver_id": "b",
            "message_type": "telepathy",
            "payload": {},
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        assert!(serde_json::from_str::<AgentMessage>(raw).is_err());
    }
}
