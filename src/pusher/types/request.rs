use serde::Serialize;

use super::ProtocolEvent;

/// Outbound protocol envelope.
///
/// `data` carries its own JSON document encoded as a string, so `{"channel":"foo"}` travels as
/// `"{\"channel\":\"foo\"}"`.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Request {
    pub event: String,
    pub data: String,
}

#[derive(Serialize)]
struct ChannelData<'channel> {
    channel: &'channel str,
}

impl Request {
    /// Build an envelope for `event`, serializing `data` into the inner document.
    pub fn new<D: Serialize>(event: &str, data: &D) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.to_owned(),
            data: serde_json::to_string(data)?,
        })
    }

    /// Create a `pusher:subscribe` request.
    pub fn subscribe(channel: &str) -> Result<Self, serde_json::Error> {
        Self::new(ProtocolEvent::Subscribe.as_ref(), &ChannelData { channel })
    }

    /// Create a `pusher:unsubscribe` request.
    pub fn unsubscribe(channel: &str) -> Result<Self, serde_json::Error> {
        Self::new(ProtocolEvent::Unsubscribe.as_ref(), &ChannelData { channel })
    }

    /// Create the `pusher:pong` reply to a protocol-level `pusher:ping`.
    #[must_use]
    pub fn pong() -> Self {
        Self {
            event: ProtocolEvent::Pong.to_string(),
            data: "{}".to_owned(),
        }
    }
}
