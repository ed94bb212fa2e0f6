//! Core WebSocket infrastructure.
//!
//! This module provides a persistent connection that survives failures: it is probed when it
//! goes quiet and replaced when it stops answering or errors. Protocol specifics plug in
//! through traits.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: connection controller, writer, reader and liveness monitor
//! - [`Session`]: handle for enqueueing outbound frames and reporting faults
//! - [`ActivityClock`]: timestamp of the last inbound frame or PONG
//! - [`MessageParser`] / [`MessageRouter`]: decode and dispatch inbound frames
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionManager::connect(url, config, EnvelopeParser, router).await?;
//! connection.send(&Request::subscribe("my-channel")?).await?;
//! ```

pub mod activity;
pub mod config;
pub mod connection;
pub mod error;
pub mod traits;

pub use activity::ActivityClock;
pub use connection::{ConnectionManager, Session};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
