//! Connection layer: one transport per broker host.
//!
//! A [`Connection`] wraps a single TCP/TLS transport to an AMQP or MQTT
//! broker, drives its reconnection state machine on a supervisor task,
//! and fans status changes out to registered handlers and to the queues
//! layered on top of it.

pub mod amqp;
pub mod mqtt;

pub use amqp::{AmqpConnection, AmqpConnectionOptions};
pub use mqtt::{MqttConnection, MqttConnectionOptions, PacketSink};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::error::MqError;
use crate::naming::random_id;

/// Connection/queue lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Tear-down in progress.
    Closing,
    /// Not connected; the terminal state.
    Closed,
    /// Dialing or waiting for the next retry.
    Connecting,
    /// Transport (or channel/subscription) is usable.
    Connected,
    /// Transport reported loss; recovery not yet started.
    Disconnected,
}

impl Status {
    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Closing => "closing",
            Status::Closed => "closed",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of connection lifecycle events.
///
/// Status events arrive in transition order; both methods default to
/// no-ops so implementors override only what they need.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Called after every state transition.
    async fn on_status(&self, host_uri: &str, status: Status) {
        let _ = (host_uri, status);
    }

    /// Called when the transport reports an error that does not by itself
    /// change the state machine.
    async fn on_error(&self, host_uri: &str, err: MqError) {
        let _ = (host_uri, err);
    }
}

/// A connection to one broker host, dispatching on the protocol family.
#[derive(Clone)]
pub enum Connection {
    /// AMQP 0-9-1 transport.
    Amqp(AmqpConnection),
    /// MQTT transport.
    Mqtt(MqttConnection),
}

impl Connection {
    /// Current state.
    pub fn status(&self) -> Status {
        match self {
            Connection::Amqp(conn) => conn.status(),
            Connection::Mqtt(conn) => conn.status(),
        }
    }

    /// Start the connect state machine. Idempotent: a no-op while already
    /// `Connecting` or `Connected`.
    pub async fn connect(&self) -> crate::Result<()> {
        match self {
            Connection::Amqp(conn) => conn.connect().await,
            Connection::Mqtt(conn) => conn.connect().await,
        }
    }

    /// Drive the state machine to `Closed`, stopping any pending retries.
    pub async fn close(&self) -> crate::Result<()> {
        match self {
            Connection::Amqp(conn) => conn.close().await,
            Connection::Mqtt(conn) => conn.close().await,
        }
    }

    /// Register a lifecycle handler; the returned id removes it again.
    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) -> String {
        match self {
            Connection::Amqp(conn) => conn.add_handler(handler),
            Connection::Mqtt(conn) => conn.add_handler(handler),
        }
    }

    /// Remove a handler by the id returned from [`Connection::add_handler`].
    pub fn remove_handler(&self, id: &str) {
        match self {
            Connection::Amqp(conn) => conn.remove_handler(id),
            Connection::Mqtt(conn) => conn.remove_handler(id),
        }
    }

    /// Remove every registered handler.
    pub fn clear_handlers(&self) {
        match self {
            Connection::Amqp(conn) => conn.clear_handlers(),
            Connection::Mqtt(conn) => conn.clear_handlers(),
        }
    }

    /// Canonical host URI this connection dials.
    pub fn host_uri(&self) -> &str {
        match self {
            Connection::Amqp(conn) => conn.host_uri(),
            Connection::Mqtt(conn) => conn.host_uri(),
        }
    }

    /// Watch stream of state changes, for the queues layered on top.
    pub(crate) fn status_rx(&self) -> watch::Receiver<Status> {
        match self {
            Connection::Amqp(conn) => conn.status_rx(),
            Connection::Mqtt(conn) => conn.status_rx(),
        }
    }
}

/// Sleep that aborts early when the shutdown watch flips to `true`.
/// Returns `false` when shutdown was requested.
pub(crate) async fn interruptible_sleep(
    shutdown_rx: &mut watch::Receiver<bool>,
    millis: u64,
) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => match changed {
            Ok(()) => !*shutdown_rx.borrow(),
            // Sender gone: the owner was dropped, stop retrying.
            Err(_) => false,
        },
        _ = tokio::time::sleep(Duration::from_millis(millis)) => true,
    }
}

/// Lifecycle event queued for the notifier task.
pub(crate) enum ConnEvent {
    Status(Status),
    Error(MqError),
}

/// Shared status cell plus handler fan-out for a connection driver.
///
/// Transitions mutate the watch channel (the single source of truth) and
/// enqueue an event for the notifier task, which invokes user handlers
/// sequentially so they observe transitions in order without ever running
/// on a supervisor task.
pub(crate) struct StatusBus {
    host_uri: String,
    status_tx: watch::Sender<Status>,
    handlers: Arc<Mutex<HashMap<String, Arc<dyn ConnectionHandler>>>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<ConnEvent>>>,
}

impl StatusBus {
    pub(crate) fn new(host_uri: String) -> Self {
        Self {
            host_uri,
            status_tx: watch::channel(Status::Closed).0,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            event_tx: Mutex::new(None),
        }
    }

    pub(crate) fn host_uri(&self) -> &str {
        &self.host_uri
    }

    pub(crate) fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub(crate) fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) -> String {
        let id = random_id(16);
        self.handlers
            .lock()
            .unwrap()
            .insert(id.clone(), handler);
        id
    }

    pub(crate) fn remove_handler(&self, id: &str) {
        self.handlers.lock().unwrap().remove(id);
    }

    pub(crate) fn clear_handlers(&self) {
        self.handlers.lock().unwrap().clear();
    }

    /// Spawn the notifier task if it is not running yet. Must be called
    /// from an async context before the first transition.
    pub(crate) fn ensure_notifier(&self) {
        let mut guard = self.event_tx.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnEvent>();
        *guard = Some(tx);

        let handlers = self.handlers.clone();
        let host_uri = self.host_uri.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<Arc<dyn ConnectionHandler>> =
                    handlers.lock().unwrap().values().cloned().collect();
                for handler in snapshot {
                    match &event {
                        ConnEvent::Status(status) => {
                            handler.on_status(&host_uri, *status).await;
                        }
                        ConnEvent::Error(err) => {
                            handler.on_error(&host_uri, err.clone()).await;
                        }
                    }
                }
            }
        });
    }

    /// Move to `status`; returns whether the state actually changed and,
    /// when it did, queues the event for the handlers.
    pub(crate) fn transition(&self, status: Status) -> bool {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.publish(ConnEvent::Status(status));
        }
        changed
    }

    /// Atomically claim the `Connecting` state for a new supervisor.
    /// Returns `false` when already `Connecting` or `Connected`, so only
    /// one of several concurrent `connect()` calls spawns a supervisor.
    pub(crate) fn claim_connecting(&self) -> bool {
        let mut claimed = false;
        self.status_tx.send_if_modified(|current| {
            if matches!(*current, Status::Connecting | Status::Connected) {
                false
            } else {
                *current = Status::Connecting;
                claimed = true;
                true
            }
        });
        if claimed {
            self.publish(ConnEvent::Status(Status::Connecting));
        }
        claimed
    }

    /// Like [`StatusBus::transition`], but refuses to leave `Closing`/
    /// `Closed`. Supervisor tasks use this so a recovery transition can
    /// never race a concurrent `close()` into emitting after it.
    pub(crate) fn transition_active(&self, status: Status) -> bool {
        let mut emitted = false;
        self.status_tx.send_if_modified(|current| {
            if matches!(*current, Status::Closing | Status::Closed) || *current == status {
                false
            } else {
                *current = status;
                emitted = true;
                true
            }
        });
        if emitted {
            self.publish(ConnEvent::Status(status));
        }
        emitted
    }

    /// Queue an error event for the handlers.
    pub(crate) fn emit_error(&self, err: MqError) {
        warn!(host = %self.host_uri, error = %err, "connection error");
        self.publish(ConnEvent::Error(err));
    }

    fn publish(&self, event: ConnEvent) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Closing.to_string(), "closing");
        assert_eq!(Status::Closed.to_string(), "closed");
        assert_eq!(Status::Connecting.to_string(), "connecting");
        assert_eq!(Status::Connected.to_string(), "connected");
        assert_eq!(Status::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn test_status_bus_transitions() {
        let bus = StatusBus::new("amqp://localhost".to_string());
        assert_eq!(bus.status(), Status::Closed);

        assert!(bus.transition(Status::Connecting));
        assert_eq!(bus.status(), Status::Connecting);

        // Same-state transition is suppressed.
        assert!(!bus.transition(Status::Connecting));

        let rx = bus.subscribe();
        assert!(bus.transition(Status::Connected));
        assert_eq!(*rx.borrow(), Status::Connected);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, 5).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        assert!(!interruptible_sleep(&mut rx, 5_000).await);
    }

    #[tokio::test]
    async fn test_handler_registration() {
        struct Noop;
        #[async_trait]
        impl ConnectionHandler for Noop {}

        let bus = StatusBus::new("mqtt://localhost".to_string());
        let id = bus.add_handler(Arc::new(Noop));
        assert_eq!(bus.handlers.lock().unwrap().len(), 1);
        bus.remove_handler(&id);
        assert!(bus.handlers.lock().unwrap().is_empty());
    }
}
