//! Wire protocol between the bridge and the assistant host.
//! Uses NDJSON (newline-delimited JSON): one request line out, event lines back.

use serde::{Deserialize, Serialize};

/// Request from the bridge to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequest {
    /// Unique request identifier for correlation
    pub id: String,
    /// Method to invoke
    pub method: HostMethod,
    /// Session to inject into
    #[serde(default)]
    pub session: String,
    /// User message text
    #[serde(default)]
    pub message: String,
    /// Who sent the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Recent channel chatter preceding the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextLine>,
}

/// One line of prior channel history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLine {
    pub author: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMethod {
    /// Add a user message to a session and stream the reply
    Inject,
    /// Health check
    Ping,
}

impl HostRequest {
    pub fn inject(session: &str, message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: HostMethod::Inject,
            session: session.to_string(),
            message: message.to_string(),
            sender: None,
            context: Vec::new(),
        }
    }

    pub fn ping() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: HostMethod::Ping,
            session: String::new(),
            message: String::new(),
            sender: None,
            context: Vec::new(),
        }
    }
}

/// Events streamed back by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Incremental generated text
    Text { content: String },
    /// Generation finished
    Done {
        #[serde(default)]
        final_text: Option<String>,
    },
    /// Generation failed
    Error { message: String },
    /// Reply to a ping
    Pong,
}

impl HostEvent {
    /// Whether no further events follow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostEvent::Done { .. } | HostEvent::Error { .. } | HostEvent::Pong
        )
    }
}

/// Event line as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEnvelope {
    /// Request ID this event belongs to (hosts may omit it)
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub event: HostEvent,
}
