use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use mds_core::{Error, Result};

/// Envelope of every message on the bus and on the websocket.
///
/// `type` names the schema of `payload`; unknown types are skipped by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: JsonValue,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an envelope from a serializable payload.
    pub fn wrap<P: Serialize>(event_type: impl Into<String>, payload: &P) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::internal(format!("serialize payload: {e}")))?;
        Ok(Self::new(event_type, payload))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::bad_input(format!("malformed envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::internal(format!("serialize envelope: {e}")))
    }

    /// Deserialize the payload into the schema named by `type`.
    pub fn payload_as<P: serde::de::DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::bad_input(format!("malformed {} payload: {e}", self.event_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_reads_type_and_payload() {
        let env = EventEnvelope::parse(r#"{"type":"user-deleted","payload":{"id":"x"}}"#).unwrap();
        assert_eq!(env.event_type, "user-deleted");
        assert_eq!(env.payload, json!({"id": "x"}));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let env = EventEnvelope::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(env.payload.is_null());
    }

    #[test]
    fn malformed_envelope_is_bad_input() {
        assert!(EventEnvelope::parse("{").unwrap_err().is_bad_input());
        assert!(EventEnvelope::parse(r#"{"payload":{}}"#).unwrap_err().is_bad_input());
    }
}
