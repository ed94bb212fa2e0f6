//! Subscribes to a channel and prints every event it receives.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug PUSHER_KEY=<app key> PUSHER_CHANNEL=my-channel PUSHER_EVENT=my-event \
//!     cargo run --example subscribe --features tracing
//! ```

use std::env;

use futures::StreamExt as _;
use pusher_client::pusher::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let key = env::var("PUSHER_KEY")?;
    let channel = env::var("PUSHER_CHANNEL").unwrap_or_else(|_| "my-channel".to_owned());
    let event = env::var("PUSHER_EVENT").unwrap_or_else(|_| "my-event".to_owned());
    let endpoint =
        env::var("PUSHER_ENDPOINT").unwrap_or_else(|_| "ws://ws.pusherapp.com".to_owned());

    let client =
        Client::connect_with(&endpoint, &key, pusher_client::ws::config::Config::default())
            .await?;
    info!(state = ?client.connection_state(), "connected");

    let name = event.clone();
    client.on(&event, move |data| info!(event = %name, %data, "event received"))?;
    client.on("pusher_internal:subscription_succeeded", |data| {
        info!(%data, "subscription succeeded");
    })?;
    client.subscribe(&channel).await?;
    info!(%channel, subscriptions = client.subscription_count(), "subscribed");

    let mut faults = Box::pin(client.faults());
    loop {
        tokio::select! {
            Some(fault) = faults.next() => warn!(%fault, "connection fault"),
            _ = tokio::time::sleep(std::time::Duration::from_secs(300)) => break,
        }
    }

    info!(socket_id = ?client.socket_id(), "closing");
    client.unsubscribe(&channel).await?;
    client.close().await;

    Ok(())
}
