//! Core traits for generic WebSocket infrastructure.

use super::connection::Session;

/// Message parser trait for converting raw text frames to messages.
///
/// A parse failure is reported as a decode fault and the frame is dropped; the read loop
/// keeps going.
///
/// # Example
///
/// ```ignore
/// pub struct EnvelopeParser;
///
/// impl MessageParser<Envelope> for EnvelopeParser {
///     fn parse(&self, bytes: &[u8]) -> Result<Envelope, serde_json::Error> {
///         serde_json::from_slice(bytes)
///     }
/// }
/// ```
pub trait MessageParser<M>: Send + Sync + 'static {
    /// Parse incoming bytes into a message.
    fn parse(&self, bytes: &[u8]) -> Result<M, serde_json::Error>;
}

/// Receives every successfully parsed inbound message, in arrival order.
///
/// Called from the read loop, so implementations must not block: hand the message off to
/// another task and return. The [`Session`] can be used to enqueue replies or report faults.
pub trait MessageRouter<M>: Send + Sync + 'static {
    fn route(&self, message: M, session: &Session);

    /// Called once per connection, after it opens and before it is announced as connected or
    /// any of its frames are routed. Per-connection state should be reset here.
    fn on_connected(&self, generation: u64, session: &Session) {
        _ = (generation, session);
    }
}
