//! Message domain types and the model-facing wire format.
//!
//! A session transcript is an append-only sequence of `Message` values.
//! Every message carries a kind; the kind decides how the message is
//! serialized for the model (role + tag wrapping).

use serde::{Deserialize, Serialize};

/// The kind of a transcript message.
///
/// This is an open set: kinds the runtime does not know about still
/// round-trip through serialization via `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    System,
    User,
    Assistant,
    Tool,
    ToolResponse,
    Error,
    End,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::System => "system",
            MessageKind::User => "user",
            MessageKind::Assistant => "assistant",
            MessageKind::Tool => "tool",
            MessageKind::ToolResponse => "tool_response",
            MessageKind::Error => "error",
            MessageKind::End => "end",
            MessageKind::Other(s) => s,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "system" => MessageKind::System,
            "user" => MessageKind::User,
            "assistant" => MessageKind::Assistant,
            "tool" => MessageKind::Tool,
            "tool_response" => MessageKind::ToolResponse,
            "error" => MessageKind::Error,
            "end" => MessageKind::End,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::from(s.as_str()))
    }
}

/// The role of a message on the model wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn/utterance in a session transcript. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub content: String,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Assistant, content)
    }

    pub fn tool_response(content: impl Into<String>) -> Self {
        Self::new(MessageKind::ToolResponse, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    pub fn end() -> Self {
        Self::new(MessageKind::End, "")
    }

    /// Serialize this message for the model.
    ///
    /// `system` goes out raw under the system role. Every other kind is
    /// wrapped in a same-named tag; the role is `user` only for `user`,
    /// `tool_response`, and `error`, otherwise `assistant`.
    pub fn to_wire(&self) -> WireMessage {
        if self.kind == MessageKind::System {
            return WireMessage {
                role: Role::System,
                content: self.content.clone(),
            };
        }

        let role = match self.kind {
            MessageKind::User | MessageKind::ToolResponse | MessageKind::Error => Role::User,
            _ => Role::Assistant,
        };
        WireMessage {
            role,
            content: format!(
                "<{kind}>{content}</{kind}>",
                kind = self.kind,
                content = self.content
            ),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.content)
    }
}

/// A `{role, content}` pair as sent to the completion API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}
