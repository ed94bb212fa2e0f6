#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};

use super::types::request::Request;
use crate::Result;
use crate::error::Error;
use crate::ws::Session;
use crate::ws::connection::ConnectionState;

/// Information about an active channel subscription.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    /// Channel name
    pub channel: String,
    /// When the subscription was first requested
    pub created_at: Instant,
}

/// Tracked channel together with the connection generation its subscribe frame was last
/// queued for.
#[derive(Debug, Clone)]
struct Tracked {
    info: SubscriptionInfo,
    sent_on: Option<u64>,
}

/// Tracks subscribed channels and replays them onto every new connection.
///
/// Each channel's subscribe frame is queued at most once per connection generation, and only
/// for the generation that is current when it is queued. A frame still queued when its
/// connection is replaced is discarded by the writer and covered by the replay instead.
#[derive(Debug)]
pub struct SubscriptionManager {
    session: Session,
    state_rx: watch::Receiver<ConnectionState>,
    channels: DashMap<String, Tracked>,
    /// Serializes subscribe, unsubscribe and replay so each sees the others' bookkeeping
    updates: Mutex<()>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(session: Session, state_rx: watch::Receiver<ConnectionState>) -> Self {
        Self {
            session,
            state_rx,
            channels: DashMap::new(),
            updates: Mutex::new(()),
        }
    }

    /// Start the reconnection handler that re-subscribes on connection recovery.
    ///
    /// The server forgets subscriptions when a connection drops, so every channel is requested
    /// again once a later connection generation is up.
    pub fn start_reconnection_handler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut state_rx = self.state_rx.clone();

        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();

                match state {
                    ConnectionState::Connected { generation, .. } => {
                        this.resubscribe_all(generation).await;
                    }
                    ConnectionState::Disconnected => break,
                    _ => {}
                }

                if state_rx.changed().await.is_err() {
                    // Channel closed, connection manager is gone
                    break;
                }
            }
        });
    }

    /// Queue subscription requests for every tracked channel not yet sent on `generation`.
    async fn resubscribe_all(&self, generation: u64) {
        let _updates = self.updates.lock().await;

        let pending: Vec<String> = self
            .channels
            .iter_mut()
            .filter_map(|mut entry| {
                (entry.sent_on != Some(generation)).then(|| {
                    entry.sent_on = Some(generation);
                    entry.key().clone()
                })
            })
            .collect();

        if pending.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(generation, count = pending.len(), "Re-subscribing to channels");

        for channel in pending {
            let result = match Request::subscribe(&channel) {
                Ok(request) => self.session.send_on(generation, &request).await,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                #[cfg(feature = "tracing")]
                tracing::warn!(%channel, error = %e, "Failed to re-subscribe to channel");
                #[cfg(not(feature = "tracing"))]
                let _: &Error = &e;
            }
        }
    }

    /// Request a subscription to `channel` and track it for replay after reconnects.
    ///
    /// While no connection is up the channel is only recorded; the request goes out when the
    /// next connection is established. Waits while the outbound queue is full. Delivery of
    /// the request itself is at most once per connection.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        validate(channel)?;
        let request = Request::subscribe(channel)?;

        let _updates = self.updates.lock().await;
        let generation = self.state_rx.borrow().generation();

        let previous = self.channels.get(channel).map(|entry| entry.value().clone());
        let created_at = previous
            .as_ref()
            .map_or_else(Instant::now, |tracked| tracked.info.created_at);
        self.channels.insert(
            channel.to_owned(),
            Tracked {
                info: SubscriptionInfo {
                    channel: channel.to_owned(),
                    created_at,
                },
                sent_on: generation,
            },
        );

        let Some(generation) = generation else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%channel, "Not connected, subscription deferred until reconnect");
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%channel, generation, "Subscribing to channel");

        if let Err(e) = self.session.send_on(generation, &request).await {
            // Leave the bookkeeping as it was before this call
            if let Some(previous) = previous {
                self.channels.insert(channel.to_owned(), previous);
            } else {
                self.channels.remove(channel);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Request removal of `channel` and stop tracking it.
    ///
    /// While no connection is up there is nothing to tell the server: the next connection
    /// simply does not subscribe to it.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        validate(channel)?;
        let request = Request::unsubscribe(channel)?;

        let _updates = self.updates.lock().await;
        self.channels.remove(channel);

        let Some(generation) = self.state_rx.borrow().generation() else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%channel, generation, "Unsubscribing from channel");

        self.session.send_on(generation, &request).await
    }

    /// Get information about all active subscriptions.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.channels
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.channels.len()
    }
}

fn validate(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(Error::validation("channel name must not be empty"));
    }
    Ok(())
}
