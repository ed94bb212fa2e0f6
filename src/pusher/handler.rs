use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::Error;

/// Outcome of handing an event's data to the registry.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the event's callback
    Delivered,
    /// No callback is registered for the event
    Unhandled,
    /// The event's delivery channel was full (or its loop has stopped), data discarded
    Dropped,
}

/// Maps event names to the delivery channel of a dedicated callback loop.
///
/// Each registered event gets its own bounded channel and its own loop on the runtime's
/// blocking pool, which invokes the callback for one value at a time in arrival order.
/// Callbacks may block: a slow one only holds back its own event, never the reader, the
/// liveness monitor or other events. Registering an event twice is rejected; entries are
/// removed only by [`Self::shutdown`].
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: DashMap<String, mpsc::Sender<String>>,
    capacity: usize,
    runtime: Handle,
    cancel: CancellationToken,
}

impl HandlerRegistry {
    /// Create an empty registry whose delivery loops run on `runtime`.
    pub fn new(capacity: usize, runtime: Handle) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::validation(
                "delivery_capacity must be greater than zero",
            ));
        }

        Ok(Self {
            handlers: DashMap::new(),
            capacity,
            runtime,
            cancel: CancellationToken::new(),
        })
    }

    /// Register `callback` for `event` and start its delivery loop.
    pub fn register<F>(&self, event: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        if event.is_empty() {
            return Err(Error::validation("event name must not be empty"));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::validation("client has been shut down"));
        }

        match self.handlers.entry(event.to_owned()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "a handler is already registered for event `{event}`"
            ))),
            Entry::Vacant(entry) => {
                let (tx, mut rx) = mpsc::channel::<String>(self.capacity);
                let cancel = self.cancel.clone();

                #[cfg(feature = "tracing")]
                let event_name = event.to_owned();

                // Ends once every sender is dropped, which `shutdown` guarantees
                self.runtime.spawn_blocking(move || {
                    while let Some(data) = rx.blocking_recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        callback(data);
                    }

                    #[cfg(feature = "tracing")]
                    tracing::debug!(event = %event_name, "Delivery loop stopped");
                });

                entry.insert(tx);

                #[cfg(feature = "tracing")]
                tracing::debug!(%event, "Registered event handler");

                Ok(())
            }
        }
    }

    /// Hand `data` to the delivery loop for `event` without waiting.
    pub fn deliver(&self, event: &str, data: String) -> Delivery {
        let Some(tx) = self.handlers.get(event) else {
            return Delivery::Unhandled;
        };

        match tx.try_send(data) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    #[must_use]
    pub fn is_registered(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Stop every delivery loop and forget all registrations. Values still queued are
    /// discarded; a callback that is running finishes first.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.handlers.clear();
    }
}

impl Drop for HandlerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;

    fn registry(capacity: usize) -> HandlerRegistry {
        HandlerRegistry::new(capacity, Handle::current()).unwrap()
    }

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let registry = registry(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register("test", move |data| drop(tx.send(data)))
            .unwrap();

        for i in 0..10 {
            assert_eq!(registry.deliver("test", i.to_string()), Delivery::Delivered);
        }

        for i in 0..10 {
            let data = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(data, i.to_string());
        }
    }

    #[tokio::test]
    async fn unregistered_event_is_unhandled() {
        let registry = registry(16);

        assert_eq!(registry.deliver("nobody", "{}".to_owned()), Delivery::Unhandled);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = registry(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first_tx = tx.clone();
        registry
            .register("test", move |data| drop(first_tx.send(("first", data))))
            .unwrap();

        let err = registry
            .register("test", move |data| drop(tx.send(("second", data))))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Validation);

        registry.deliver("test", "payload".to_owned());
        let (which, data) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(which, "first");
        assert_eq!(data, "payload");
        assert_eq!(registry.len(), 1);
    }

    /// Register a callback for `event` that signals when it starts and then blocks the
    /// delivery loop's thread until `release` is dropped or sent to.
    fn register_blocking(
        registry: &HandlerRegistry,
        event: &str,
    ) -> (oneshot::Receiver<()>, std_mpsc::Sender<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let mut started_tx = Some(started_tx);

        registry
            .register(event, move |_data| {
                if let Some(started) = started_tx.take() {
                    drop(started.send(()));
                }
                _ = release_rx.recv();
            })
            .unwrap();

        (started_rx, release_tx)
    }

    #[tokio::test]
    async fn blocking_callback_only_blocks_its_own_event() {
        let registry = registry(16);
        let (started_rx, release) = register_blocking(&registry, "slow");

        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();
        registry
            .register("fast", move |data| drop(fast_tx.send(data)))
            .unwrap();

        registry.deliver("slow", "1".to_owned());
        timeout(Duration::from_secs(1), started_rx)
            .await
            .unwrap()
            .unwrap();

        // The slow callback is parked on a thread; this runtime has only one worker
        registry.deliver("fast", "quick".to_owned());
        let data = timeout(Duration::from_secs(1), fast_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, "quick");

        drop(release);
    }

    #[tokio::test]
    async fn full_channel_drops() {
        let registry = registry(1);
        let (started_rx, release) = register_blocking(&registry, "test");

        assert_eq!(registry.deliver("test", "a".to_owned()), Delivery::Delivered);
        timeout(Duration::from_secs(1), started_rx)
            .await
            .unwrap()
            .unwrap();

        // "a" is being handled, "b" fills the channel
        assert_eq!(registry.deliver("test", "b".to_owned()), Delivery::Delivered);
        assert_eq!(registry.deliver("test", "c".to_owned()), Delivery::Dropped);

        drop(release);
    }

    #[tokio::test]
    async fn shutdown_stops_delivery_and_registration() {
        let registry = registry(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register("test", move |data| drop(tx.send(data)))
            .unwrap();

        registry.shutdown();

        assert_eq!(registry.deliver("test", "late".to_owned()), Delivery::Unhandled);
        registry.register("other", |_data| {}).unwrap_err();
        // The loop exits and drops its callback, closing the channel
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn rejects_empty_event_name() {
        let registry = registry(16);

        registry.register("", |_data| {}).unwrap_err();
    }

    #[test]
    fn rejects_zero_capacity() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        HandlerRegistry::new(0, runtime.handle().clone()).unwrap_err();
    }
}
