//! Pusher Channels client.
//!
//! Subscribes to public channels and routes incoming events to per-event callbacks over one
//! long-lived WebSocket connection.
//!
//! # Example
//!
//! ```rust, no_run
//! use pusher_client::pusher::Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::connect("de504dc5763aeef9ff52").await?;
//!
//!     client.on("price-update", |data| println!("{data}"))?;
//!     client.subscribe("prices").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod handler;
pub mod subscription;
pub mod types;

// Re-export commonly used types
pub use client::{Client, handshake_url};
pub use handler::{Delivery, HandlerRegistry};
pub use subscription::SubscriptionInfo;
pub use types::ProtocolEvent;
pub use types::request::Request;
pub use types::response::{ConnectionEstablished, Envelope, ServerError};
