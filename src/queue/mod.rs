//! Queue layer: one logical messaging endpoint per queue.
//!
//! A [`Queue`] makes the delivery patterns (unicast vs. broadcast,
//! reliable vs. best-effort) behave the same over both broker families.
//! On AMQP that means exchanges, durable queues, confirm channels,
//! prefetch and ack/nack; on MQTT it means topics, shared subscriptions
//! and QoS. Each queue runs its own small state machine layered on the
//! connection it borrows.

pub mod amqp;
pub mod mqtt;

pub use amqp::AmqpQueue;
pub use mqtt::MqttQueue;

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::connection::{Connection, Status};
use crate::error::{MqError, Result};
use crate::naming::validate_queue_name;

/// Options shared by both queue families.
///
/// `prefetch` and `persistent` only apply to AMQP queues, `shared_prefix`
/// only to MQTT unicast receivers; the other family ignores them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Queue/exchange/topic leaf name. Must match
    /// `^[a-z0-9_-]+(\.[a-z0-9_-]+)*$`.
    pub name: String,
    /// Receive direction. A queue is a sender or a receiver for its whole
    /// lifetime.
    pub is_recv: bool,
    /// Confirm channel (AMQP) or QoS 1 (MQTT).
    pub reliable: bool,
    /// Fan out to every receiver instead of load-balancing across them.
    pub broadcast: bool,
    /// Delay between inner connect retries in milliseconds.
    pub reconnect_millis: u64,
    /// AMQP receivers: unacknowledged-delivery window, 1 to 65535.
    pub prefetch: u16,
    /// AMQP senders: publish with the persistent delivery mode.
    pub persistent: bool,
    /// MQTT unicast receivers: shared-subscription prefix such as
    /// `$share/unimq/`. Non-empty when given.
    pub shared_prefix: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            is_recv: false,
            reliable: false,
            broadcast: false,
            reconnect_millis: 1000,
            prefetch: 100,
            persistent: false,
            shared_prefix: None,
        }
    }
}

impl QueueOptions {
    /// Family-independent validation, used by both constructors.
    pub(crate) fn validate(&self) -> Result<()> {
        validate_queue_name(&self.name)?;
        if let Some(prefix) = &self.shared_prefix {
            if prefix.is_empty() {
                return Err(MqError::invalid_argument(
                    "shared_prefix must be a non-empty string when given",
                ));
            }
        }
        Ok(())
    }
}

/// One received message with its settlement token.
///
/// AMQP messages settle through the channel; MQTT `ack`/`nack` complete
/// successfully without doing anything, because at-least-once settlement
/// happens at the protocol layer and `nack` cannot cause redelivery.
#[async_trait]
pub trait Message: Send + Sync {
    /// Raw payload bytes as published.
    fn payload(&self) -> &[u8];

    /// Settle positively. Must be called exactly once per message.
    async fn ack(&self) -> Result<()>;

    /// Settle negatively, asking for redelivery where the broker
    /// supports it.
    async fn nack(&self) -> Result<()>;
}

/// Receiver callback for inbound messages.
///
/// Messages of one queue are delivered in broker order, one at a time;
/// settle each message through its [`Message`] token after processing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message from `queue_name`.
    async fn on_message(&self, queue_name: &str, msg: Box<dyn Message>);
}

/// Observer of queue lifecycle events. Both methods default to no-ops.
#[async_trait]
pub trait QueueEventHandler: Send + Sync {
    /// Called after every state transition, in transition order.
    async fn on_status(&self, queue_name: &str, status: Status) {
        let _ = (queue_name, status);
    }

    /// Called when the channel/subscription reports an error that the
    /// state machine will recover from on its own.
    async fn on_error(&self, queue_name: &str, err: MqError) {
        let _ = (queue_name, err);
    }
}

/// A logical messaging endpoint, dispatching on the protocol family of
/// the connection it was built on.
#[derive(Clone)]
pub enum Queue {
    /// Queue on an AMQP connection.
    Amqp(AmqpQueue),
    /// Queue on an MQTT connection.
    Mqtt(MqttQueue),
}

impl Queue {
    /// Build the queue variant matching the connection's family.
    pub fn new(conn: &Connection, opts: QueueOptions) -> Result<Self> {
        match conn {
            Connection::Amqp(conn) => Ok(Queue::Amqp(AmqpQueue::new(conn.clone(), opts)?)),
            Connection::Mqtt(conn) => Ok(Queue::Mqtt(MqttQueue::new(conn.clone(), opts)?)),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        match self {
            Queue::Amqp(queue) => queue.name(),
            Queue::Mqtt(queue) => queue.name(),
        }
    }

    /// Receive direction.
    pub fn is_recv(&self) -> bool {
        match self {
            Queue::Amqp(queue) => queue.is_recv(),
            Queue::Mqtt(queue) => queue.is_recv(),
        }
    }

    /// Current state.
    pub fn status(&self) -> Status {
        match self {
            Queue::Amqp(queue) => queue.status(),
            Queue::Mqtt(queue) => queue.status(),
        }
    }

    /// Install the lifecycle handler, replacing any previous one.
    pub fn set_handler(&self, handler: Arc<dyn QueueEventHandler>) {
        match self {
            Queue::Amqp(queue) => queue.set_handler(handler),
            Queue::Mqtt(queue) => queue.set_handler(handler),
        }
    }

    /// Remove the lifecycle handler.
    pub fn clear_handler(&self) {
        match self {
            Queue::Amqp(queue) => queue.clear_handler(),
            Queue::Mqtt(queue) => queue.clear_handler(),
        }
    }

    /// Install the message handler, replacing any previous one. Receivers
    /// must do this before [`Queue::connect`].
    pub fn set_msg_handler(&self, handler: Arc<dyn MessageHandler>) {
        match self {
            Queue::Amqp(queue) => queue.set_msg_handler(handler),
            Queue::Mqtt(queue) => queue.set_msg_handler(handler),
        }
    }

    /// Start the queue state machine. Fails with
    /// [`MqError::NoMsgHandler`] for a receiver without a handler.
    pub async fn connect(&self) -> Result<()> {
        match self {
            Queue::Amqp(queue) => queue.connect().await,
            Queue::Mqtt(queue) => queue.connect().await,
        }
    }

    /// Tear down the channel/subscription and settle in `Closed`.
    /// Idempotent; a second call returns without emitting events.
    pub async fn close(&self) -> Result<()> {
        match self {
            Queue::Amqp(queue) => queue.close().await,
            Queue::Mqtt(queue) => queue.close().await,
        }
    }

    /// Publish one message. Senders only; requires `Connected`.
    pub async fn send_msg(&self, payload: Vec<u8>) -> Result<()> {
        match self {
            Queue::Amqp(queue) => queue.send_msg(payload).await,
            Queue::Mqtt(queue) => queue.send_msg(payload).await,
        }
    }

    /// Watch stream of state changes, for status aggregation.
    pub(crate) fn status_rx(&self) -> watch::Receiver<Status> {
        match self {
            Queue::Amqp(queue) => queue.status_rx(),
            Queue::Mqtt(queue) => queue.status_rx(),
        }
    }
}

/// Lifecycle event queued for the notifier task.
pub(crate) enum QueueEvent {
    Status(Status),
    Error(MqError),
}

/// Queue-side status cell plus handler fan-out; same discipline as the
/// connection-side bus, with a single handler slot instead of a map.
pub(crate) struct QueueStatusBus {
    name: String,
    status_tx: watch::Sender<Status>,
    handler: Arc<StdMutex<Option<Arc<dyn QueueEventHandler>>>>,
    event_tx: StdMutex<Option<mpsc::UnboundedSender<QueueEvent>>>,
}

impl QueueStatusBus {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            status_tx: watch::channel(Status::Closed).0,
            handler: Arc::new(StdMutex::new(None)),
            event_tx: StdMutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn QueueEventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub(crate) fn clear_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Spawn the notifier task if it is not running yet. Must be called
    /// from an async context before the first transition.
    pub(crate) fn ensure_notifier(&self) {
        let mut guard = self.event_tx.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueEvent>();
        *guard = Some(tx);

        let handler_slot = self.handler.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let handler = handler_slot.lock().unwrap().clone();
                if let Some(handler) = handler {
                    match &event {
                        QueueEvent::Status(status) => handler.on_status(&name, *status).await,
                        QueueEvent::Error(err) => handler.on_error(&name, err.clone()).await,
                    }
                }
            }
        });
    }

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
            self.publish(QueueEvent::Status(status));
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
            self.publish(QueueEvent::Status(Status::Connecting));
        }
        claimed
    }

    /// Like [`QueueStatusBus::transition`], but refuses to leave
    /// `Closing`/`Closed`. Supervisor tasks use this so a recovery
    /// transition can never race a concurrent `close()` into emitting
    /// after it.
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
            self.publish(QueueEvent::Status(status));
        }
        emitted
    }

    pub(crate) fn emit_error(&self, err: MqError) {
        warn!(queue = %self.name, error = %err, "queue error");
        self.publish(QueueEvent::Error(err));
    }

    fn publish(&self, event: QueueEvent) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}
