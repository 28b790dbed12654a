//! MQTT queue: topics, shared subscriptions and QoS.
//!
//! Unicast receivers subscribe through a shared-subscription prefix so
//! the broker load-balances the group; broadcast receivers subscribe to
//! the plain topic. Senders publish on the shared client as soon as the
//! connection is up. `ack`/`nack` are no-ops because settlement happens
//! at the protocol layer.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{Message, MessageHandler, QueueEventHandler, QueueOptions, QueueStatusBus};
use crate::connection::{interruptible_sleep, MqttConnection, PacketSink, Status};
use crate::error::{MqError, Result};

/// One received MQTT publish. Settlement is a successful no-op: QoS-1
/// acknowledgement happens at the protocol layer, and `nack` cannot
/// cause redelivery.
struct MqttMessage {
    payload: Vec<u8>,
}

#[async_trait]
impl Message for MqttMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        Ok(())
    }
}

type MsgHandlerSlot = Arc<StdMutex<Option<Arc<dyn MessageHandler>>>>;

/// Inbound route target registered with the connection: wraps the
/// message-handler slot so replacing the handler takes effect without
/// resubscribing.
struct QueueSink {
    queue_name: String,
    msg_handler: MsgHandlerSlot,
}

#[async_trait]
impl PacketSink for QueueSink {
    async fn deliver(&self, payload: Vec<u8>) {
        let handler = self.msg_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                let msg = MqttMessage { payload };
                handler.on_message(&self.queue_name, Box::new(msg)).await;
            }
            None => debug!(queue = %self.queue_name, "message dropped, no handler installed"),
        }
    }
}

/// Queue on an MQTT connection.
///
/// Cloning shares the underlying state machine.
#[derive(Clone)]
pub struct MqttQueue {
    opts: Arc<QueueOptions>,
    conn: MqttConnection,
    bus: Arc<QueueStatusBus>,
    msg_handler: MsgHandlerSlot,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl MqttQueue {
    /// Validate the options and build an unconnected queue.
    pub fn new(conn: MqttConnection, opts: QueueOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            bus: Arc::new(QueueStatusBus::new(opts.name.clone())),
            opts: Arc::new(opts),
            conn,
            msg_handler: Arc::new(StdMutex::new(None)),
            shutdown_tx: Arc::new(StdMutex::new(None)),
            task: Arc::new(StdMutex::new(None)),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        self.bus.name()
    }

    /// Receive direction.
    pub fn is_recv(&self) -> bool {
        self.opts.is_recv
    }

    /// Current state.
    pub fn status(&self) -> Status {
        self.bus.status()
    }

    /// Install the lifecycle handler, replacing any previous one.
    pub fn set_handler(&self, handler: Arc<dyn QueueEventHandler>) {
        self.bus.set_handler(handler);
    }

    /// Remove the lifecycle handler.
    pub fn clear_handler(&self) {
        self.bus.clear_handler();
    }

    /// Install the message handler, replacing any previous one.
    pub fn set_msg_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.msg_handler.lock().unwrap() = Some(handler);
    }

    pub(crate) fn status_rx(&self) -> watch::Receiver<Status> {
        self.bus.subscribe()
    }

    /// Topic this queue subscribes to or publishes on. Unicast receivers
    /// prepend the shared-subscription prefix; everything else uses the
    /// plain name.
    fn topic(&self) -> String {
        if self.opts.is_recv && !self.opts.broadcast {
            if let Some(prefix) = &self.opts.shared_prefix {
                return format!("{prefix}{}", self.opts.name);
            }
        }
        self.opts.name.clone()
    }

    /// Start the queue state machine. No-op while `Connecting` or
    /// `Connected`; fails for a receiver without a message handler.
    pub async fn connect(&self) -> Result<()> {
        if self.opts.is_recv && self.msg_handler.lock().unwrap().is_none() {
            return Err(MqError::NoMsgHandler);
        }
        self.bus.ensure_notifier();
        if !self.bus.claim_connecting() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_supervisor(shutdown_rx).await });
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Drop the subscription and settle in `Closed`. Idempotent; a second
    /// call returns without emitting events.
    pub async fn close(&self) -> Result<()> {
        self.bus.ensure_notifier();
        if self.status() == Status::Closed {
            return Ok(());
        }
        self.bus.transition(Status::Closing);

        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            if time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!(queue = %self.name(), "queue supervisor did not stop in time, aborting");
                task.abort();
            }
        }

        if self.opts.is_recv {
            self.conn.remove_packet_handler(&self.opts.name);
            if let Some(client) = self.conn.client() {
                if let Err(e) = client.unsubscribe(self.topic()).await {
                    debug!(queue = %self.name(), error = %e, "unsubscribe reported an error");
                }
            }
        }

        self.bus.transition(Status::Closed);
        Ok(())
    }

    /// Publish one message. Senders only; requires `Connected`.
    pub async fn send_msg(&self, payload: Vec<u8>) -> Result<()> {
        if self.opts.is_recv {
            return Err(MqError::QueueIsReceiver);
        }
        if self.status() != Status::Connected {
            return Err(MqError::NotConnected);
        }
        let client = self.conn.client().ok_or(MqError::NotConnected)?;
        client
            .publish(self.opts.name.clone(), self.qos(), false, payload)
            .await?;
        Ok(())
    }

    fn qos(&self) -> QoS {
        if self.opts.reliable {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        }
    }

    async fn run_supervisor(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(queue = %self.name(), "queue supervisor started");
        let mut conn_rx = self.conn.status_rx();
        loop {
            if *shutdown_rx.borrow() || matches!(self.status(), Status::Closing | Status::Closed) {
                break;
            }
            if self.conn.status() != Status::Connected {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    changed = conn_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = time::sleep(Duration::from_millis(self.opts.reconnect_millis)) => {}
                }
                continue;
            }

            if self.opts.is_recv {
                if let Err(e) = self.subscribe().await {
                    self.bus.emit_error(e);
                    if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                        break;
                    }
                    continue;
                }
            }
            self.bus.transition_active(Status::Connected);
            info!(queue = %self.name(), "queue connected");

            // Hold until the connection drops out. The subscription dies
            // with the session, so recovery resubscribes.
            let recover = loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break false;
                        }
                    }
                    changed = conn_rx.changed() => {
                        if changed.is_err() {
                            break false;
                        }
                        if *conn_rx.borrow() != Status::Connected {
                            break true;
                        }
                    }
                }
            };
            if !recover || matches!(self.status(), Status::Closing | Status::Closed) {
                break;
            }
            self.bus.transition_active(Status::Connecting);
        }
        debug!(queue = %self.name(), "queue supervisor stopped");
    }

    /// Register the inbound route and subscribe at the queue's QoS.
    async fn subscribe(&self) -> Result<()> {
        let sink = Arc::new(QueueSink {
            queue_name: self.opts.name.clone(),
            msg_handler: self.msg_handler.clone(),
        });
        self.conn
            .add_packet_handler(&self.opts.name, &self.topic(), self.opts.reliable, sink)?;
        self.conn.subscribe_packet_route(&self.opts.name).await
    }
}
