#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use super::activity::ActivityClock;
use super::config::Config;
use super::error::WsError;
use super::traits::{MessageParser, MessageRouter};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, and no further attempts will be made
    Disconnected,
    /// Opening the first connection
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
        /// Incremented on every successful (re)connect, starting at 1
        generation: u64,
    },
    /// Reconnecting after failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Generation of the live connection, if there is one.
    #[must_use]
    pub const fn generation(self) -> Option<u64> {
        match self {
            Self::Connected { generation, .. } => Some(generation),
            _ => None,
        }
    }
}

/// Requests handled by the controller task, which is the only owner of the write half.
#[derive(Debug)]
enum Control {
    /// Send a liveness PING on the current connection
    Ping,
    /// Replace the connection of the given generation. Requests naming an older generation
    /// have already been satisfied and are ignored.
    Reconnect { generation: u64 },
}

/// How a connection's write loop ended.
enum Exit {
    Reconnect,
    Shutdown,
}

/// A serialized frame waiting for the writer.
#[derive(Debug)]
pub(crate) struct Outbound {
    text: String,
    /// Connection generation the frame is meant for. The writer discards it once that
    /// connection has been replaced. `None` goes out on whichever connection is current.
    generation: Option<u64>,
}

#[cfg(test)]
impl Outbound {
    pub(crate) fn generation(&self) -> Option<u64> {
        self.generation
    }
}

/// Producer side of the outbound queue together with the fault reporter.
///
/// Cheap to clone. Everything that needs to put frames on the wire or report a failure holds
/// one of these rather than the connection itself, so a reconnect never invalidates it.
#[derive(Debug, Clone)]
pub struct Session {
    outbound_tx: mpsc::Sender<Outbound>,
    fault_tx: broadcast::Sender<Arc<WsError>>,
}

impl Session {
    /// Create a session along with the receiving end of its outbound queue.
    pub(crate) fn channel(
        queue_capacity: usize,
        fault_capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        let (fault_tx, _) = broadcast::channel(fault_capacity);

        (
            Self {
                outbound_tx,
                fault_tx,
            },
            outbound_rx,
        )
    }

    /// Serialize `request` and enqueue it, waiting while the queue is full.
    pub async fn send<R: Serialize>(&self, request: &R) -> Result<()> {
        self.enqueue(request, None).await
    }

    /// Like [`Self::send`], but the frame is only written on connection `generation`.
    ///
    /// If that connection is replaced before the writer gets to the frame, it is discarded.
    /// Callers that replay state onto every new connection use this to avoid sending the same
    /// request twice.
    pub async fn send_on<R: Serialize>(&self, generation: u64, request: &R) -> Result<()> {
        self.enqueue(request, Some(generation)).await
    }

    async fn enqueue<R: Serialize>(&self, request: &R, generation: Option<u64>) -> Result<()> {
        let text = serde_json::to_string(request)?;
        self.outbound_tx
            .send(Outbound { text, generation })
            .await
            .map_err(|_e| WsError::QueueClosed)?;
        Ok(())
    }

    /// Serialize `request` and enqueue it without waiting.
    pub fn try_send<R: Serialize>(&self, request: &R) -> std::result::Result<(), WsError> {
        let text = serde_json::to_string(request).map_err(WsError::Encode)?;
        self.outbound_tx
            .try_send(Outbound {
                text,
                generation: None,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => WsError::QueueFull,
                TrySendError::Closed(_) => WsError::QueueClosed,
            })
    }

    /// Log `error` and publish it to fault subscribers.
    pub fn report(&self, error: WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "WebSocket fault");

        // No subscribers is fine
        _ = self.fault_tx.send(Arc::new(error));
    }

    /// Subscribe to reported faults.
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<Arc<WsError>> {
        self.fault_tx.subscribe()
    }
}

/// Manages the WebSocket connection lifecycle: establishment, liveness monitoring, and
/// reconnection, along with the outbound queue and the inbound read loop.
///
/// Three kinds of background tasks run for the life of the manager:
/// - the controller, which owns the write half of the current connection, drains the outbound
///   queue in FIFO order, sends PINGs and replaces the connection when asked to
/// - one reader per connection, which touches the [`ActivityClock`] on every frame and hands
///   parsed messages to the [`MessageRouter`]
/// - the liveness monitor, which probes a silent connection and requests a reconnect when the
///   probe goes unanswered
///
/// Cloning shares the same connection. The background tasks are cancelled by [`Self::close`]
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    session: Session,
    control_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<ConnectionState>,
    activity: ActivityClock,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl ConnectionManager {
    /// Open the connection and start the background tasks.
    ///
    /// A failure to open the first connection is returned to the caller and nothing is left
    /// running. Later failures are handled by reconnecting.
    pub async fn connect<M, P, R>(
        endpoint: Url,
        config: Config,
        parser: P,
        router: Arc<R>,
    ) -> Result<Self>
    where
        M: Send + 'static,
        P: MessageParser<M>,
        R: MessageRouter<M>,
    {
        if config.queue_capacity == 0 || config.fault_capacity == 0 {
            return Err(Error::validation(
                "queue_capacity and fault_capacity must be greater than zero",
            ));
        }

        let (session, outbound_rx) =
            Session::channel(config.queue_capacity, config.fault_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let activity = ActivityClock::new();
        let cancel = CancellationToken::new();

        let ws_stream = open(&endpoint).await.map_err(WsError::Connect)?;
        activity.touch();
        router.on_connected(1, &session);
        state_tx.send_replace(ConnectionState::Connected {
            since: Instant::now(),
            generation: 1,
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, "WebSocket connected");

        let controller = Controller {
            endpoint,
            config: config.clone(),
            parser: Arc::new(parser),
            router,
            session: session.clone(),
            control_tx: control_tx.clone(),
            state_tx,
            activity: activity.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(controller.run::<M>(ws_stream, outbound_rx, control_rx));

        tokio::spawn(monitor_loop(
            config,
            activity.clone(),
            state_rx.clone(),
            control_tx.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            session,
            control_tx,
            state_rx,
            activity,
            _guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
        })
    }

    /// Handle for enqueueing frames and reporting faults.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Serialize `request` and enqueue it for the writer, waiting while the queue is full.
    pub async fn send<R: Serialize>(&self, request: &R) -> Result<()> {
        self.session.send(request).await
    }

    /// Close the current connection and open a new one.
    ///
    /// Resolves once the replacement is connected. Fails if the manager shuts down or gives up
    /// before that happens; individual failed attempts are reported on the fault channel.
    pub async fn reconnect(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        let Some(current) = state_rx.borrow_and_update().generation() else {
            return Err(Error::validation("no live connection to replace"));
        };

        self.control_tx
            .send(Control::Reconnect {
                generation: current,
            })
            .map_err(|_e| WsError::QueueClosed)?;

        let state = state_rx
            .wait_for(|state| match state {
                ConnectionState::Connected { generation, .. } => *generation > current,
                ConnectionState::Disconnected => true,
                _ => false,
            })
            .await
            .map_err(|_e| WsError::QueueClosed)?;

        if state.is_connected() {
            Ok(())
        } else {
            Err(WsError::ConnectionClosed.into())
        }
    }

    /// Stop all background tasks and close the socket.
    ///
    /// Waits until the controller has sent the close frame.
    pub async fn close(&self) {
        self.cancel.cancel();

        let mut state_rx = self.state_rx.clone();
        _ = state_rx
            .wait_for(|state| matches!(state, ConnectionState::Disconnected))
            .await;
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// This is useful for detecting reconnections and re-establishing subscriptions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to reported faults.
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<Arc<WsError>> {
        self.session.faults()
    }

    /// Clock of the last inbound activity.
    #[must_use]
    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }
}

struct Controller<P, R> {
    endpoint: Url,
    config: Config,
    parser: Arc<P>,
    router: Arc<R>,
    session: Session,
    control_tx: mpsc::UnboundedSender<Control>,
    state_tx: watch::Sender<ConnectionState>,
    activity: ActivityClock,
    cancel: CancellationToken,
}

impl<P, R> Controller<P, R> {
    /// Drive connections until shutdown or until reconnection is abandoned.
    async fn run<M>(
        self,
        first: WsStream,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) where
        M: Send + 'static,
        P: MessageParser<M>,
        R: MessageRouter<M>,
    {
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();
        let mut ws_stream = first;
        let mut generation = 1_u64;

        loop {
            let (mut sink, source) = ws_stream.split();

            let reader = tokio::spawn(read_loop::<M, P, R>(
                source,
                generation,
                Arc::clone(&self.parser),
                Arc::clone(&self.router),
                self.session.clone(),
                self.activity.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            ));

            let exit = self
                .write_loop(&mut sink, &mut outbound_rx, &mut control_rx, generation)
                .await;

            // Close the old handle best-effort; its errors are irrelevant once it is replaced
            reader.abort();
            _ = timeout(self.config.write_timeout, sink.close()).await;

            if matches!(exit, Exit::Shutdown) {
                break;
            }

            match self.reconnect(&mut backoff).await {
                Some(replacement) => {
                    generation = generation.saturating_add(1);
                    ws_stream = replacement;
                    self.router.on_connected(generation, &self.session);
                    self.state_tx.send_replace(ConnectionState::Connected {
                        since: Instant::now(),
                        generation,
                    });

                    #[cfg(feature = "tracing")]
                    tracing::debug!(generation, "WebSocket reconnected");
                }
                None => break,
            }
        }

        // Stop the monitor and delivery loops if we gave up on our own, and refuse new frames
        // before anyone can observe the disconnect
        self.cancel.cancel();
        outbound_rx.close();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    async fn write_loop(
        &self,
        sink: &mut WsSink,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
        generation: u64,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Exit::Shutdown,

                Some(control) = control_rx.recv() => match control {
                    Control::Ping => self.ping(sink).await,
                    Control::Reconnect { generation: requested } if requested == generation => {
                        return Exit::Reconnect;
                    }
                    Control::Reconnect { .. } => {
                        // Stale request for a connection that has already been replaced
                    }
                },

                message = outbound_rx.recv() => match message {
                    Some(Outbound { generation: Some(queued_for), .. }) if queued_for != generation => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(
                            queued_for,
                            generation,
                            "Discarding frame queued for a replaced connection"
                        );
                    }
                    Some(Outbound { text, .. }) => self.write(sink, text).await,
                    None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Write one queued frame. Failures are reported and the frame is discarded.
    async fn write(&self, sink: &mut WsSink, text: String) {
        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Sending WebSocket text message");

        match timeout(self.config.write_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.session.report(WsError::Write(e)),
            Err(_elapsed) => self.session.report(WsError::WriteTimeout),
        }
    }

    async fn ping(&self, sink: &mut WsSink) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection idle, sending PING");

        match timeout(self.config.write_timeout, sink.send(Message::Ping(Bytes::new()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.session.report(WsError::Ping(e)),
            Err(_elapsed) => self.session.report(WsError::PingTimeout),
        }
    }

    /// Open a replacement connection, retrying with exponential backoff.
    ///
    /// Returns `None` on shutdown or once `max_attempts` consecutive attempts have failed.
    async fn reconnect(&self, backoff: &mut ExponentialBackoff) -> Option<WsStream> {
        backoff.reset();
        let mut attempt = 0_u32;

        loop {
            attempt = attempt.saturating_add(1);
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt });

            let result = tokio::select! {
                () = self.cancel.cancelled() => return None,
                result = open(&self.endpoint) => result,
            };

            match result {
                Ok(ws_stream) => {
                    self.activity.touch();
                    return Some(ws_stream);
                }
                Err(e) => self.session.report(WsError::Connect(e)),
            }

            if let Some(max) = self.config.reconnect.max_attempts
                && attempt >= max
            {
                self.session
                    .report(WsError::ReconnectExhausted { attempts: attempt });
                return None;
            }

            if let Some(duration) = backoff.next_backoff() {
                tokio::select! {
                    () = self.cancel.cancelled() => return None,
                    () = sleep(duration) => {}
                }
            }
        }
    }
}

/// Read frames from one connection until it fails, closes, or the manager shuts down.
///
/// Any frame counts as activity, PONGs included. A read failure ends this loop and asks the
/// controller to replace the connection straight away.
#[expect(
    clippy::too_many_arguments,
    reason = "Each argument is an independent handle the spawned task must own"
)]
async fn read_loop<M, P, R>(
    mut source: WsSource,
    generation: u64,
    parser: Arc<P>,
    router: Arc<R>,
    session: Session,
    activity: ActivityClock,
    control_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
) where
    M: Send + 'static,
    P: MessageParser<M>,
    R: MessageRouter<M>,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = source.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(generation, error = %e, "WebSocket read failed");
                session.report(WsError::Read(e));
                break;
            }
            None => {
                session.report(WsError::ConnectionClosed);
                break;
            }
        };

        activity.touch();

        let parsed = match message {
            Message::Text(text) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(text = %text.as_str(), "Received WebSocket text message");
                parser.parse(text.as_bytes())
            }
            Message::Binary(bytes) => parser.parse(&bytes),
            Message::Close(_) => {
                session.report(WsError::ConnectionClosed);
                break;
            }
            Message::Pong(_) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(generation, "Received PONG");
                continue;
            }
            // Replies to server PINGs are queued by tungstenite itself
            Message::Ping(_) | Message::Frame(_) => continue,
        };

        match parsed {
            Ok(message) => router.route(message, &session),
            Err(e) => session.report(WsError::Decode(e)),
        }
    }

    // The controller ignores this if the connection was already replaced
    _ = control_tx.send(Control::Reconnect { generation });
}

/// Check the connection regularly and, if it has been silent for a whole check interval,
/// probe it with a PING. If it is still silent after the grace period, replace it.
async fn monitor_loop(
    config: Config,
    activity: ActivityClock,
    state_rx: watch::Receiver<ConnectionState>,
    control_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(config.check_interval) => {}
        }

        if activity.is_active(config.check_interval) {
            continue;
        }

        // A connection that is already being replaced needs no probe
        let Some(generation) = state_rx.borrow().generation() else {
            continue;
        };

        if control_tx.send(Control::Ping).is_err() {
            break;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(config.pong_timeout) => {}
        }

        // Anything received since the PING went out counts as an answer
        if !activity.is_active(config.pong_timeout) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                idle = ?activity.idle_for(),
                "No PONG received within {:?}, reconnecting",
                config.pong_timeout
            );

            if control_tx.send(Control::Reconnect { generation }).is_err() {
                break;
            }
        }
    }
}

async fn open(endpoint: &Url) -> std::result::Result<WsStream, tungstenite::Error> {
    let (ws_stream, _response) = connect_async(endpoint.as_str()).await?;
    Ok(ws_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_send_reports_full_and_closed_queues() {
        let (session, outbound_rx) = Session::channel(1, 4);

        session.try_send(&"first").unwrap();
        assert!(matches!(
            session.try_send(&"second"),
            Err(WsError::QueueFull)
        ));

        drop(outbound_rx);
        assert!(matches!(
            session.try_send(&"third"),
            Err(WsError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn send_on_tags_frames_with_generation() {
        let (session, mut outbound_rx) = Session::channel(4, 4);

        session.send(&"any").await.unwrap();
        session.send_on(3, &"third").await.unwrap();

        let any = outbound_rx.recv().await.unwrap();
        assert_eq!(any.text, r#""any""#);
        assert_eq!(any.generation, None);

        let scoped = outbound_rx.recv().await.unwrap();
        assert_eq!(scoped.text, r#""third""#);
        assert_eq!(scoped.generation, Some(3));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_websocket_error() {
        let (session, outbound_rx) = Session::channel(4, 4);
        drop(outbound_rx);

        let err = session.send(&"late").await.unwrap_err();

        assert_eq!(err.kind(), crate::error::Kind::WebSocket);
    }
}
