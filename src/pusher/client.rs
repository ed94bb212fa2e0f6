use std::sync::{Arc, PoisonError, RwLock};

use async_stream::stream;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use url::Url;

use super::handler::{Delivery, HandlerRegistry};
use super::subscription::{SubscriptionInfo, SubscriptionManager};
use super::types::ProtocolEvent;
use super::types::request::Request;
use super::types::response::{ConnectionEstablished, Envelope, ServerError};
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::connection::ConnectionState;
use crate::ws::{ConnectionManager, MessageParser, MessageRouter, Session, WsError};

/// Default Pusher WebSocket host.
pub const DEFAULT_ENDPOINT: &str = "ws://ws.pusherapp.com";
/// Client name announced in the handshake.
pub const CLIENT_NAME: &str = "pusher-client-rs";
/// Client version announced in the handshake.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Pusher protocol version spoken by this client.
pub const PROTOCOL_VERSION: u8 = 7;

/// Build the handshake URL `<endpoint>/app/<key>?client=..&version=..&protocol=..`.
pub fn handshake_url(endpoint: &str, key: &str) -> Result<Url> {
    if key.is_empty() {
        return Err(Error::validation("application key must not be empty"));
    }

    let mut url = Url::parse(endpoint)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::validation(format!(
            "unsupported endpoint scheme `{}`, expected ws or wss",
            url.scheme()
        )));
    }

    url.path_segments_mut()
        .map_err(|()| Error::validation("endpoint cannot be a base URL"))?
        .pop_if_empty()
        .extend(["app", key]);
    url.query_pairs_mut()
        .clear()
        .append_pair("client", CLIENT_NAME)
        .append_pair("version", CLIENT_VERSION)
        .append_pair("protocol", &PROTOCOL_VERSION.to_string());

    Ok(url)
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct EnvelopeParser;

impl MessageParser<Envelope> for EnvelopeParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<Envelope, serde_json::Error> {
        Envelope::from_slice(bytes)
    }
}

/// Routes inbound envelopes: answers protocol pings, records connection details, reports
/// server errors, then hands the data to whichever callback is registered for the event.
#[derive(Debug)]
struct Router {
    handlers: HandlerRegistry,
    socket_id: RwLock<Option<String>>,
}

impl Router {
    fn handle_protocol(&self, event: ProtocolEvent, envelope: &Envelope, session: &Session) {
        match event {
            ProtocolEvent::Ping => {
                if let Err(e) = session.try_send(&Request::pong()) {
                    session.report(e);
                }
            }
            ProtocolEvent::ConnectionEstablished => {
                match envelope.data_as::<ConnectionEstablished>() {
                    Ok(established) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(socket_id = %established.socket_id, "Connection established");

                        // Option<String> has no inconsistent intermediate state, so a poisoned
                        // lock is still usable
                        *self
                            .socket_id
                            .write()
                            .unwrap_or_else(PoisonError::into_inner) = Some(established.socket_id);
                    }
                    Err(e) => session.report(WsError::Decode(e)),
                }
            }
            ProtocolEvent::Error => {
                let error = envelope
                    .data_as::<ServerError>()
                    .unwrap_or_else(|_e| ServerError {
                        message: envelope.data.clone(),
                        code: None,
                    });
                session.report(WsError::Server {
                    code: error.code,
                    message: error.message,
                });
            }
            _ => {}
        }
    }
}

impl MessageRouter<Envelope> for Router {
    fn on_connected(&self, generation: u64, session: &Session) {
        #[cfg(feature = "tracing")]
        tracing::trace!(generation, "Clearing socket id for new connection");
        _ = (generation, session);

        // The server assigns a fresh id to every connection
        *self
            .socket_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn route(&self, envelope: Envelope, session: &Session) {
        if let Some(event) = ProtocolEvent::from_name(&envelope.event) {
            self.handle_protocol(event, &envelope, session);
        }

        let Envelope { event, data, .. } = envelope;
        match self.handlers.deliver(&event, data) {
            Delivery::Dropped => session.report(WsError::DeliveryDropped { event }),
            Delivery::Delivered | Delivery::Unhandled => {}
        }
    }
}

/// Pusher Channels client over a single persistent WebSocket connection.
///
/// Cloning is cheap and every clone shares the connection. The connection is kept alive with
/// PING probes and replaced automatically when it goes silent or fails; subscriptions are
/// replayed onto each replacement. Dropping the last clone shuts everything down.
///
/// # Example
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use pusher_client::pusher::Client;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::connect("de504dc5763aeef9ff52").await?;
///
///     client.on("my-event", |data| println!("my-event: {data}"))?;
///     client.subscribe("my-channel").await?;
///
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     client.close().await;
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Application key used in the handshake
    key: String,
    /// Connection manager for the WebSocket
    connection: ConnectionManager,
    /// Inbound routing and handler registry
    router: Arc<Router>,
    /// Subscription manager for handling subscriptions
    subscriptions: Arc<SubscriptionManager>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.router.handlers.shutdown();
    }
}

impl Client {
    /// Connect to the default Pusher host with the default [`Config`].
    pub async fn connect(key: &str) -> Result<Self> {
        Self::connect_with(DEFAULT_ENDPOINT, key, Config::default()).await
    }

    /// Connect to `endpoint` (e.g. `wss://ws-eu.pusher.com`) with a custom configuration.
    ///
    /// Fails if the first connection cannot be opened.
    pub async fn connect_with(endpoint: &str, key: &str, config: Config) -> Result<Self> {
        let url = handshake_url(endpoint, key)?;

        let router = Arc::new(Router {
            handlers: HandlerRegistry::new(config.delivery_capacity, Handle::current())?,
            socket_id: RwLock::new(None),
        });

        let connection =
            ConnectionManager::connect(url, config, EnvelopeParser, Arc::clone(&router)).await?;

        let subscriptions = Arc::new(SubscriptionManager::new(
            connection.session().clone(),
            connection.state_receiver(),
        ));
        subscriptions.start_reconnection_handler();

        Ok(Self {
            inner: Arc::new(ClientInner {
                key: key.to_owned(),
                connection,
                router,
                subscriptions,
            }),
        })
    }

    /// Subscribe to a public channel.
    ///
    /// Waits while the outbound queue is full. The request is sent at most once per
    /// connection: if the connection is replaced, the subscription is requested again
    /// automatically, and a call made while reconnecting is sent once the new connection is up.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.inner.subscriptions.subscribe(channel).await
    }

    /// Unsubscribe from a channel.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.inner.subscriptions.unsubscribe(channel).await
    }

    /// Register `callback` for every event named `event`.
    ///
    /// The callback receives the event's inner data document as a string and runs on a
    /// blocking-pool thread of its own, one call at a time, in the order events arrive. It may
    /// block: a slow callback only delays further deliveries of the same event, and once its
    /// delivery channel is full new ones are dropped and reported on [`Self::faults`]. Other
    /// events and the connection itself are unaffected.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a callback is already registered for `event`.
    pub fn on<F>(&self, event: &str, callback: F) -> Result<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        self.inner.router.handlers.register(event, callback)
    }

    /// Stream of faults reported by the background tasks: write and ping failures, dropped
    /// frames, server errors and failed reconnects.
    ///
    /// Only faults reported after this call are observed.
    pub fn faults(&self) -> impl Stream<Item = Arc<WsError>> + use<> {
        let mut rx = self.inner.connection.faults();

        stream! {
            loop {
                match rx.recv().await {
                    Ok(fault) => yield fault,
                    Err(RecvError::Lagged(count)) => yield Arc::new(WsError::Lagged { count }),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Close the current connection and open a new one.
    ///
    /// Resolves once the replacement connection is up.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.connection.reconnect().await
    }

    /// Shut the client down: stop the liveness monitor, the writer, the reader and every
    /// delivery loop, and close the socket.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        self.inner.router.handlers.shutdown();
    }

    /// The application key this client connected with.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Socket id assigned by the server for the current connection, once announced.
    ///
    /// `None` from the moment a replacement connection opens until the server announces its
    /// id.
    #[must_use]
    pub fn socket_id(&self) -> Option<String> {
        self.inner
            .router
            .socket_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Get information about all active subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.active_subscriptions()
    }

    /// Get the number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.subscription_count()
    }
}
