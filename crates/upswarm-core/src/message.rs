// ABOUTME: Message envelope exchanged between the supervisor and its services.
// ABOUTME: Closed instruction set, receipt/sender addressing, reply chaining, and line codec.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Payload carried by a [`Message`].
///
/// The first three variants are instructions the supervisor executes when a
/// message is addressed to it. `Text` and `Custom` are application payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Start one more instance of `service`.
    SpawnService { service: String },
    /// Terminate every instance of `service`.
    KillService { service: String },
    /// Announce the sending connection as instance `service_id` of `service_name`.
    Identify {
        service_name: String,
        service_id: String,
    },
    /// Plain informational text, used for confirmations.
    Text { text: String },
    /// Arbitrary application payload.
    Custom {
        kind: String,
        #[serde(default)]
        body: serde_json::Value,
    },
}

impl Payload {
    /// Short name of the payload kind, for logs.
    pub fn kind(&self) -> &str {
        match self {
            Payload::SpawnService { .. } => "spawn_service",
            Payload::KillService { .. } => "kill_service",
            Payload::Identify { .. } => "identify",
            Payload::Text { .. } => "text",
            Payload::Custom { kind, .. } => kind,
        }
    }
}

/// Envelope routed by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    /// Service name or instance id to deliver to. Absent means the supervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    /// Instance id of the sender, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            receipt: None,
            sender: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Payload::Text { text: text.into() })
    }

    pub fn spawn_service(service: impl Into<String>) -> Self {
        Self::new(Payload::SpawnService {
            service: service.into(),
        })
    }

    pub fn kill_service(service: impl Into<String>) -> Self {
        Self::new(Payload::KillService {
            service: service.into(),
        })
    }

    pub fn identify(service_name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self::new(Payload::Identify {
            service_name: service_name.into(),
            service_id: service_id.into(),
        })
    }

    /// Set the receipt.
    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    /// Set the sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// The receipt, with an empty string treated as absent.
    pub fn receipt(&self) -> Option<&str> {
        self.receipt.as_deref().filter(|r| !r.is_empty())
    }

    /// The sender, with an empty string treated as absent.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref().filter(|s| !s.is_empty())
    }

    /// Serialize as one newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    /// Parse one line produced by [`Message::encode_line`].
    pub fn decode_line(line: &str) -> Result<Self> {
        Self::decode_bytes(line.as_bytes())
    }

    /// Parse one raw line as read off the socket. Invalid UTF-8 is a decode
    /// error like any other malformed input.
    pub fn decode_bytes(line: &[u8]) -> Result<Self> {
        let end = line
            .iter()
            .rposition(|b| !matches!(b, b'\r' | b'\n'))
            .map_or(0, |i| i + 1);
        Ok(serde_json::from_slice(&line[..end])?)
    }
}

/// Build a reply to `original` whose receipt is the original sender.
pub fn make_reply(original: &Message, payload: Payload) -> Message {
    Message {
        payload,
        receipt: original.sender().map(str::to_string),
        sender: None,
    }
}

/// Whether a receipt addresses an instance id rather than a service name.
///
/// This is a heuristic: any receipt made only of hex digits counts as an id.
/// A service named e.g. `cafe` or `42` is therefore unreachable by name.
/// Unidentified connections are keyed by decimal ordinals, which also look
/// like ids; identified instances take precedence when both match.
pub fn is_id_like(receipt: &str) -> bool {
    !receipt.is_empty() && receipt.chars().all(|c| c.is_ascii_hexdigit())
}
