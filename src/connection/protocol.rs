//! JSON envelopes exchanged over the realtime socket.

use serde::{Deserialize, Serialize};
use sonic_rs::Value;

use crate::core::{LinkError, LinkResult};
use crate::events::DriverEvent;
use crate::location::LocationPayload;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Decoded inbound server message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Pong,
    ConnectionAck(Option<Value>),
    OrderAssigned(Value),
    OrderCancelled(Value),
    OrderUnassigned(Value),
    Unknown(String),
}

impl InboundMessage {
    /// Event to publish for this message, if any.
    pub fn into_event(self) -> Option<DriverEvent> {
        match self {
            InboundMessage::OrderAssigned(data) => Some(DriverEvent::OrderAssigned(data)),
            InboundMessage::OrderCancelled(data) => Some(DriverEvent::OrderCancelled(data)),
            InboundMessage::OrderUnassigned(data) => Some(DriverEvent::OrderUnassigned(data)),
            InboundMessage::Pong | InboundMessage::ConnectionAck(_) | InboundMessage::Unknown(_) => {
                None
            }
        }
    }
}

pub fn decode_inbound(bytes: &[u8]) -> LinkResult<InboundMessage> {
    let envelope: RawEnvelope =
        sonic_rs::from_slice(bytes).map_err(|err| LinkError::ParseFailed(err.to_string()))?;
    let data = envelope.data;
    Ok(match envelope.kind.as_str() {
        "pong" => InboundMessage::Pong,
        "connection_ack" => InboundMessage::ConnectionAck(data),
        "order_assigned" => InboundMessage::OrderAssigned(data.unwrap_or_else(Value::new)),
        "order_cancelled" => InboundMessage::OrderCancelled(data.unwrap_or_else(Value::new)),
        "order_unassigned" => InboundMessage::OrderUnassigned(data.unwrap_or_else(Value::new)),
        other => InboundMessage::Unknown(other.to_string()),
    })
}

/// Outbound envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage<'a> {
    LocationUpdate(LocationPayload<'a>),
    Ping,
}

impl OutboundMessage<'_> {
    pub fn encode(&self) -> LinkResult<String> {
        sonic_rs::to_string(self).map_err(|err| LinkError::EncodeFailed(err.to_string()))
    }
}
