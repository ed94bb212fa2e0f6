#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use tokio_tungstenite::tungstenite;

/// WebSocket error variants.
///
/// Background loops report these on the fault channel; public operations wrap them in
/// [`crate::error::Error`].
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Handshake or dial failure while opening a connection
    Connect(tungstenite::Error),
    /// Reading from the connection failed; that connection's read loop has stopped
    Read(tungstenite::Error),
    /// Writing a queued frame failed; the frame was discarded
    Write(tungstenite::Error),
    /// Writing a queued frame did not finish before the write deadline
    WriteTimeout,
    /// Sending a liveness PING failed
    Ping(tungstenite::Error),
    /// Sending a liveness PING did not finish before the write deadline
    PingTimeout,
    /// An inbound frame could not be decoded and was dropped
    Decode(serde_json::Error),
    /// An outbound message could not be serialized
    Encode(serde_json::Error),
    /// The server closed the connection
    ConnectionClosed,
    /// The outbound queue is closed because the client has shut down
    QueueClosed,
    /// The outbound queue is full and a non-blocking send was refused
    QueueFull,
    /// A delivery channel was full and the frame for `event` was dropped
    DeliveryDropped {
        /// Event whose frame was dropped
        event: String,
    },
    /// The server reported a protocol error
    Server {
        /// Pusher error code, when present
        code: Option<u16>,
        /// Human readable reason
        message: String,
    },
    /// Reconnection was abandoned after the configured number of attempts
    ReconnectExhausted {
        /// Number of consecutive failed attempts
        attempts: u32,
    },
    /// Fault subscriber lagged and missed reports
    Lagged {
        /// Number of reports that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Read(e) => write!(f, "WebSocket read error: {e}"),
            Self::Write(e) => write!(f, "WebSocket write error: {e}"),
            Self::WriteTimeout => write!(f, "WebSocket write timed out"),
            Self::Ping(e) => write!(f, "Failed to send PING: {e}"),
            Self::PingTimeout => write!(f, "Sending PING timed out"),
            Self::Decode(e) => write!(f, "Failed to decode WebSocket message: {e}"),
            Self::Encode(e) => write!(f, "Failed to encode WebSocket message: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::QueueClosed => write!(f, "Outbound queue closed"),
            Self::QueueFull => write!(f, "Outbound queue full"),
            Self::DeliveryDropped { event } => {
                write!(f, "Delivery channel for `{event}` is full, message dropped")
            }
            Self::Server {
                code: Some(code),
                message,
            } => write!(f, "Server error {code}: {message}"),
            Self::Server {
                code: None,
                message,
            } => write!(f, "Server error: {message}"),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "Gave up reconnecting after {attempts} attempts")
            }
            Self::Lagged { count } => write!(f, "Fault receiver lagged, missed {count} reports"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connect(e) | Self::Read(e) | Self::Write(e) | Self::Ping(e) => Some(e),
            Self::Decode(e) | Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tungstenite::Error> for crate::error::Error {
    fn from(e: tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connect(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn server_error_display_includes_code() {
        let error = WsError::Server {
            code: Some(4001),
            message: "App key abc123 not in this cluster".to_owned(),
        };

        assert_eq!(
            error.to_string(),
            "Server error 4001: App key abc123 not in this cluster"
        );
    }

    #[test]
    fn converts_into_websocket_kind() {
        let error: crate::error::Error = WsError::QueueClosed.into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::QueueClosed)
        ));
    }
}
