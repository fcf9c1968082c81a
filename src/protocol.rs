//! Wire envelopes exchanged over the gateway sockets.
//!
//! Every envelope is a JSON object discriminated by `type`. Inbound text is
//! decoded in exactly one place, [`decode`]; anything it rejects is a
//! `MalformedFrame` and never reaches dispatch.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::types::MessageRole;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message {
        role: MessageRole,
        content: String,
        #[serde(deserialize_with = "client_id")]
        id: String,
    },
    SessionClose,
    AdminJoin {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ManagerTakeover,
    /// Any client-supplied `role` is ignored; the server stamps `manager`.
    ManagerMessage {
        content: String,
        #[serde(deserialize_with = "client_id")]
        id: String,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Message { .. } => "message",
            InboundFrame::SessionClose => "session_close",
            InboundFrame::AdminJoin { .. } => "admin_join",
            InboundFrame::ManagerTakeover => "manager_takeover",
            InboundFrame::ManagerMessage { .. } => "manager_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        #[serde(rename = "tenantId")]
        tenant_id: Option<Uuid>,
    },
    AdminReady,
    AdminJoined {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Message {
        role: MessageRole,
        content: String,
        id: String,
    },
    TakeoverActive,
    Error {
        message: String,
    },
}

const KNOWN_TYPES: [&str; 5] = [
    "message",
    "session_close",
    "admin_join",
    "manager_takeover",
    "manager_message",
];

/// Clients send ids either as strings or as bare numbers.
fn client_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or number, got {other}"
        ))),
    }
}

pub fn decode(text: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(GatewayError::MalformedFrame(
            "envelope has no string `type`".to_string(),
        ));
    };
    if !KNOWN_TYPES.contains(&kind) {
        return Err(GatewayError::MalformedFrame(format!(
            "unknown frame type `{kind}`"
        )));
    }

    let frame: InboundFrame = serde_json::from_value(value)?;
    let empty_content = match &frame {
        InboundFrame::Message { content, .. } | InboundFrame::ManagerMessage { content, .. } => {
            content.trim().is_empty()
        }
        _ => false,
    };
    if empty_content {
        return Err(GatewayError::MalformedFrame(format!(
            "`{}` has empty content",
            frame.kind()
        )));
    }
    Ok(frame)
}

pub fn encode(frame: &OutboundFrame) -> Option<String> {
    serde_json::to_string(frame).ok()
}
