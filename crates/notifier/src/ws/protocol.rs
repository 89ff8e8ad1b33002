//! Websocket messages. Every frame is an `{ "type", "payload" }` envelope.

use serde::{Deserialize, Serialize};

use mds_core::{Error, OpenIntelDeliverySummary, OperationId, Result};
use mds_events::EventEnvelope;

pub const SUBSCRIBE_OPEN_INTEL_DELIVERIES: &str = "subscribe-open-intel-deliveries";
pub const UNSUBSCRIBE_OPEN_INTEL_DELIVERIES: &str = "unsubscribe-open-intel-deliveries";
pub const SUBSCRIBED_OPEN_INTEL_DELIVERIES: &str = "subscribed-open-intel-deliveries";
pub const OPEN_INTEL_DELIVERIES: &str = "open-intel-deliveries";
pub const HEARTBEAT: &str = "heartbeat";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation: OperationId,
}

/// Peer to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SubscribeOpenIntelDeliveries(OperationRef),
    UnsubscribeOpenIntelDeliveries(OperationRef),
    Heartbeat,
}

impl ClientMessage {
    /// Unknown types and malformed payloads are `BadInput`.
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope = EventEnvelope::parse(raw)?;
        match envelope.event_type.as_str() {
            SUBSCRIBE_OPEN_INTEL_DELIVERIES => Ok(Self::SubscribeOpenIntelDeliveries(envelope.payload_as()?)),
            UNSUBSCRIBE_OPEN_INTEL_DELIVERIES => {
                Ok(Self::UnsubscribeOpenIntelDeliveries(envelope.payload_as()?))
            }
            HEARTBEAT => Ok(Self::Heartbeat),
            other => Err(Error::bad_input(format!("unknown message type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriptions {
    pub operations: Vec<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIntelDeliveries {
    pub operation: OperationId,
    pub entries: Vec<OpenIntelDeliverySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorReply {
    fn from(err: &Error) -> Self {
        Self {
            code: err.kind().code().to_string(),
            message: err.message().to_string(),
        }
    }
}

/// Server to peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    SubscribedOpenIntelDeliveries(Subscriptions),
    OpenIntelDeliveries(OpenIntelDeliveries),
    Heartbeat,
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SubscribedOpenIntelDeliveries(_) => SUBSCRIBED_OPEN_INTEL_DELIVERIES,
            Self::OpenIntelDeliveries(_) => OPEN_INTEL_DELIVERIES,
            Self::Heartbeat => HEARTBEAT,
            Self::Error(_) => ERROR,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let envelope = match self {
            Self::SubscribedOpenIntelDeliveries(p) => EventEnvelope::wrap(self.type_name(), p)?,
            Self::OpenIntelDeliveries(p) => EventEnvelope::wrap(self.type_name(), p)?,
            Self::Heartbeat => EventEnvelope::new(self.type_name(), serde_json::json!({})),
            Self::Error(p) => EventEnvelope::wrap(self.type_name(), p)?,
        };
        envelope.to_json()
    }

    /// Inverse of [`ServerMessage::to_json`]; used by clients and tests.
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope = EventEnvelope::parse(raw)?;
        match envelope.event_type.as_str() {
            SUBSCRIBED_OPEN_INTEL_DELIVERIES => Ok(Self::SubscribedOpenIntelDeliveries(envelope.payload_as()?)),
            OPEN_INTEL_DELIVERIES => Ok(Self::OpenIntelDeliveries(envelope.payload_as()?)),
            HEARTBEAT => Ok(Self::Heartbeat),
            ERROR => Ok(Self::Error(envelope.payload_as()?)),
            other => Err(Error::bad_input(format!("unknown message type '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn parses_subscribe() {
        let op = OperationId::new();
        let raw = json!({"type": "subscribe-open-intel-deliveries", "payload": {"operation": op}}).to_string();
        assert_eq!(
            ClientMessage::parse(&raw).unwrap(),
            ClientMessage::SubscribeOpenIntelDeliveries(OperationRef { operation: op })
        );
    }

    #[test]
    fn heartbeat_needs_no_payload() {
        assert_eq!(ClientMessage::parse(r#"{"type":"heartbeat"}"#).unwrap(), ClientMessage::Heartbeat);
    }

    #[test]
    fn unknown_type_and_bad_payload_are_bad_input() {
        assert!(ClientMessage::parse(r#"{"type":"nope","payload":{}}"#).unwrap_err().is_bad_input());
        let raw = r#"{"type":"subscribe-open-intel-deliveries","payload":{"operation":"x"}}"#;
        assert!(ClientMessage::parse(raw).unwrap_err().is_bad_input());
    }

    #[test]
    fn subscriptions_are_wrapped_in_an_envelope() {
        let op = OperationId::new();
        let raw = ServerMessage::SubscribedOpenIntelDeliveries(Subscriptions { operations: vec![op] })
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribed-open-intel-deliveries", "payload": {"operations": [op]}})
        );
    }

    #[test]
    fn error_reply_carries_kind_code() {
        let reply = ServerMessage::Error(ErrorReply::from(&Error::forbidden("nope")));
        let value: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "forbidden");
    }
}
