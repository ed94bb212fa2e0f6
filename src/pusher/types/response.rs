use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound protocol envelope.
///
/// All frames received from the server are deserialized into this struct. `data` is kept as
/// the raw inner document; use [`Envelope::data_as`] to decode it.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Envelope {
    /// Event name, never empty
    pub event: String,
    /// Inner JSON document, as a string
    #[serde(default, deserialize_with = "data_as_string")]
    pub data: String,
    /// Channel the event was published on, for channel events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Envelope {
    /// Decode a text frame, rejecting envelopes without an event name.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.event.is_empty() {
            return Err(serde_json::Error::custom("envelope event must not be empty"));
        }
        Ok(envelope)
    }

    /// Decode the inner `data` document.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Accept `data` both as the usual string-encoded document and as an inline JSON value, which
/// some server events (notably `pusher:error`) use. Inline values are re-encoded to a string.
fn data_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(data) => Ok(data),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// Payload of `pusher:connection_established`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionEstablished {
    /// Identifier the server assigned to this connection
    pub socket_id: String,
    /// Seconds of inactivity after which the server expects a ping
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Payload of `pusher:error`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerError {
    pub message: String,
    #[serde(default)]
    pub code: Option<u16>,
}
