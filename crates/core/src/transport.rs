//! Transport events — the seam between the orchestrator and the client.
//!
//! Inbound events arrive as JSON frames with a `type` discriminator.
//! Outbound events are serialized by hand to keep the wire shapes exact:
//! status notices use `{"status": ...}`, everything else `{"type": ...}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::TransportError;

/// A structured event from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Establish (or replace) the session for this connection's identity.
    Auth,
    /// The wake word was heard; broadcast to all loaded modules.
    WakeWordDetected,
    /// A user utterance; starts a new run.
    Request { message: String },
    /// A module-scoped payload from the client.
    ToolClientMessage { tool: String, data: Value },
    /// Persist and discard the session.
    Clear,
}

/// A structured event to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Authenticated,
    SessionCleared,
    /// A tool call is about to execute.
    Tool {
        module: String,
        function: String,
        args: Value,
    },
    /// Assistant speech/text for the user.
    Assistant { content: String },
    /// The current run has terminated.
    End,
    /// A module-initiated, module-scoped signal.
    ToolMessage { tool: String, data: Value },
}

impl OutboundEvent {
    pub fn to_json(&self) -> Value {
        match self {
            OutboundEvent::Authenticated => json!({"status": "authenticated"}),
            OutboundEvent::SessionCleared => json!({"status": "session cleared"}),
            OutboundEvent::Tool {
                module,
                function,
                args,
            } => json!({
                "type": "tool",
                "data": {"module": module, "function": function, "args": args},
            }),
            OutboundEvent::Assistant { content } => {
                json!({"type": "assistant", "data": content})
            }
            OutboundEvent::End => json!({"type": "end"}),
            OutboundEvent::ToolMessage { tool, data } => {
                json!({"type": "tool_message", "tool": tool, "data": data})
            }
        }
    }
}

/// Delivery of outbound events to whatever the client is connected over.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, event: OutboundEvent) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_parse_by_type_tag() {
        let auth: InboundEvent = serde_json::from_str(r#"{"type": "auth"}"#).unwrap();
        assert_eq!(auth, InboundEvent::Auth);

        let req: InboundEvent =
            serde_json::from_str(r#"{"type": "request", "message": "hello"}"#).unwrap();
        assert_eq!(
            req,
            InboundEvent::Request {
                message: "hello".into()
            }
        );

        let tcm: InboundEvent = serde_json::from_str(
            r#"{"type": "tool_client_message", "tool": "player", "data": {"message": "PLAYER_READY"}}"#,
        )
        .unwrap();
        assert_eq!(
            tcm,
            InboundEvent::ToolClientMessage {
                tool: "player".into(),
                data: json!({"message": "PLAYER_READY"}),
            }
        );
    }

    #[test]
    fn unknown_inbound_type_is_rejected() {
        assert!(serde_json::from_str::<InboundEvent>(r#"{"type": "bogus"}"#).is_err());
    }

    #[test]
    fn outbound_wire_shapes() {
        assert_eq!(
            OutboundEvent::Authenticated.to_json(),
            json!({"status": "authenticated"})
        );
        assert_eq!(
            OutboundEvent::SessionCleared.to_json(),
            json!({"status": "session cleared"})
        );
        assert_eq!(OutboundEvent::End.to_json(), json!({"type": "end"}));
        assert_eq!(
            OutboundEvent::Assistant {
                content: "hi".into()
            }
            .to_json(),
            json!({"type": "assistant", "data": "hi"})
        );
        assert_eq!(
            OutboundEvent::Tool {
                module: "clock".into(),
                function: "create_timer".into(),
                args: json!({"duration": 1, "unit": "seconds"}),
            }
            .to_json(),
            json!({
                "type": "tool",
                "data": {
                    "module": "clock",
                    "function": "create_timer",
                    "args": {"duration": 1, "unit": "seconds"},
                },
            })
        );
        assert_eq!(
            OutboundEvent::ToolMessage {
                tool: "clock".into(),
                data: json!({"message": "START_TIMER_SOUND"}),
            }
            .to_json(),
            json!({"type": "tool_message", "tool": "clock", "data": {"message": "START_TIMER_SOUND"}})
        );
    }
}
