//! AMQP queue: channels, exchanges, consumers and settlement.
//!
//! Broadcast maps to a non-durable fanout exchange with an exclusive
//! server-named queue per receiver; unicast maps to one durable queue.
//! Reliable senders publish on a confirm channel and wait for the broker
//! confirmation; receivers settle deliveries through ack/nack.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{Message, MessageHandler, QueueEventHandler, QueueOptions, QueueStatusBus};
use crate::connection::{interruptible_sleep, AmqpConnection, Status};
use crate::error::{MqError, Result};

/// One received AMQP delivery with its settlement token.
struct AmqpMessage {
    payload: Vec<u8>,
    acker: Acker,
}

#[async_trait]
impl Message for AmqpMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

type MsgHandlerSlot = Arc<StdMutex<Option<Arc<dyn MessageHandler>>>>;

/// Queue on an AMQP connection.
///
/// Cloning shares the underlying state machine and channel.
#[derive(Clone)]
pub struct AmqpQueue {
    opts: Arc<QueueOptions>,
    conn: AmqpConnection,
    bus: Arc<QueueStatusBus>,
    channel: Arc<Mutex<Option<Channel>>>,
    msg_handler: MsgHandlerSlot,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl AmqpQueue {
    /// Validate the options and build an unconnected queue.
    pub fn new(conn: AmqpConnection, opts: QueueOptions) -> Result<Self> {
        opts.validate()?;
        if opts.is_recv && opts.prefetch == 0 {
            return Err(MqError::invalid_argument(
                "prefetch must be between 1 and 65535 for receivers",
            ));
        }
        Ok(Self {
            bus: Arc::new(QueueStatusBus::new(opts.name.clone())),
            opts: Arc::new(opts),
            conn,
            channel: Arc::new(Mutex::new(None)),
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

    /// Tear down the channel and settle in `Closed`. Idempotent; a second
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

        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close(200, "client shutdown").await {
                debug!(queue = %self.name(), error = %e, "channel close reported an error");
            }
        }

        self.bus.transition(Status::Closed);
        Ok(())
    }

    /// Publish one message. Senders only; requires `Connected`.
    ///
    /// Reliable queues resolve once the broker confirms; best-effort
    /// queues resolve after yielding back to the scheduler so bulk
    /// publishing cannot starve I/O.
    pub async fn send_msg(&self, payload: Vec<u8>) -> Result<()> {
        if self.opts.is_recv {
            return Err(MqError::QueueIsReceiver);
        }
        if self.status() != Status::Connected {
            return Err(MqError::NotConnected);
        }
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(MqError::NotConnected)?;

        let (exchange, routing_key) = if self.opts.broadcast {
            (self.opts.name.as_str(), "")
        } else {
            ("", self.opts.name.as_str())
        };
        let properties = if self.opts.persistent {
            BasicProperties::default().with_delivery_mode(2)
        } else {
            BasicProperties::default()
        };
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: self.opts.reliable,
                    ..Default::default()
                },
                &payload,
                properties,
            )
            .await?;

        if self.opts.reliable {
            match confirm.await? {
                Confirmation::Nack(_) => {
                    Err(MqError::transport("broker did not confirm the publish"))
                }
                _ => Ok(()),
            }
        } else {
            tokio::task::yield_now().await;
            Ok(())
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
                // Wait for the connection, rechecking every reconnect tick.
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

            match self.setup_channel().await {
                Ok((channel, mut chan_err_rx, consumer_task)) => {
                    *self.channel.lock().await = Some(channel);
                    self.bus.transition_active(Status::Connected);
                    info!(queue = %self.name(), "queue connected");

                    // Hold until the channel or the connection drops out.
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
                            changed = chan_err_rx.changed() => {
                                if changed.is_err() || *chan_err_rx.borrow() {
                                    self.bus.emit_error(MqError::transport("channel closed"));
                                    break true;
                                }
                            }
                        }
                    };

                    if let Some(task) = consumer_task {
                        task.abort();
                    }
                    *self.channel.lock().await = None;
                    if !recover || matches!(self.status(), Status::Closing | Status::Closed) {
                        break;
                    }
                    self.bus.transition_active(Status::Connecting);
                    if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                        break;
                    }
                }
                Err(e) => {
                    self.bus.emit_error(e);
                    if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                        break;
                    }
                }
            }
        }
        debug!(queue = %self.name(), "queue supervisor stopped");
    }

    /// Declare the broker resources for this queue and start consuming
    /// when it is a receiver.
    async fn setup_channel(
        &self,
    ) -> Result<(Channel, watch::Receiver<bool>, Option<JoinHandle<()>>)> {
        let name = self.opts.name.as_str();
        let channel = self.conn.create_channel().await?;
        if self.opts.reliable {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        let consume_target = if self.opts.broadcast {
            channel
                .exchange_declare(
                    name,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            if self.opts.is_recv {
                // Exclusive server-named queue bound to the fanout.
                let queue = channel
                    .queue_declare(
                        "",
                        QueueDeclareOptions {
                            exclusive: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                channel
                    .queue_bind(
                        queue.name().as_str(),
                        name,
                        "",
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                Some(queue.name().as_str().to_string())
            } else {
                None
            }
        } else {
            channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Some(name.to_string())
        };

        let mut consumer_task = None;
        if self.opts.is_recv {
            channel
                .basic_qos(self.opts.prefetch, BasicQosOptions::default())
                .await?;
            let target = consume_target.as_deref().unwrap_or(name);
            let mut consumer = channel
                .basic_consume(
                    target,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let handler_slot = self.msg_handler.clone();
            let queue_name = self.opts.name.clone();
            consumer_task = Some(tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            // Re-read the slot so a replaced handler takes
                            // effect without resubscribing.
                            let handler = handler_slot.lock().unwrap().clone();
                            if let Some(handler) = handler {
                                let msg = AmqpMessage {
                                    payload: delivery.data,
                                    acker: delivery.acker,
                                };
                                handler.on_message(&queue_name, Box::new(msg)).await;
                            }
                        }
                        Err(e) => {
                            debug!(queue = %queue_name, error = %e, "consumer stream ended");
                            break;
                        }
                    }
                }
            }));
        }

        let (err_tx, err_rx) = watch::channel(false);
        channel.on_error(move |_err| {
            let _ = err_tx.send(true);
        });
        Ok((channel, err_rx, consumer_task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AmqpConnectionOptions;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn on_message(&self, _queue_name: &str, msg: Box<dyn Message>) {
            let _ = msg.ack().await;
        }
    }

    fn test_conn() -> AmqpConnection {
        AmqpConnection::new(AmqpConnectionOptions {
            uri: "amqp://localhost:1".to_string(),
            reconnect_millis: 20,
            connect_timeout_millis: 100,
            ..Default::default()
        })
        .unwrap()
    }

    fn recv_opts() -> QueueOptions {
        QueueOptions {
            name: "name".to_string(),
            is_recv: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_invalid_options() {
        let conn = test_conn();
        assert!(AmqpQueue::new(
            conn.clone(),
            QueueOptions {
                name: "Bad Name".to_string(),
                ..Default::default()
            }
        )
        .is_err());

        // Receivers need a prefetch window.
        assert!(AmqpQueue::new(
            conn.clone(),
            QueueOptions {
                prefetch: 0,
                ..recv_opts()
            }
        )
        .is_err());

        // Senders ignore prefetch.
        assert!(AmqpQueue::new(
            conn,
            QueueOptions {
                name: "name".to_string(),
                prefetch: 0,
                ..Default::default()
            }
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_receiver_requires_msg_handler() {
        let queue = AmqpQueue::new(test_conn(), recv_opts()).unwrap();
        assert_eq!(queue.connect().await, Err(MqError::NoMsgHandler));

        queue.set_msg_handler(Arc::new(NoopHandler));
        assert!(queue.connect().await.is_ok());
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_direction_and_state_checks() {
        let recv = AmqpQueue::new(test_conn(), recv_opts()).unwrap();
        assert_eq!(
            recv.send_msg(b"x".to_vec()).await,
            Err(MqError::QueueIsReceiver)
        );

        let send = AmqpQueue::new(
            test_conn(),
            QueueOptions {
                name: "name".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(send.send_msg(b"x".to_vec()).await, Err(MqError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = AmqpQueue::new(
            test_conn(),
            QueueOptions {
                name: "name".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(queue.close().await.is_ok());
        assert_eq!(queue.status(), Status::Closed);
        assert!(queue.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_sender_waits_for_connection() {
        let conn = test_conn();
        conn.connect().await.unwrap();
        let queue = AmqpQueue::new(
            conn.clone(),
            QueueOptions {
                name: "name".to_string(),
                reconnect_millis: 20,
                ..Default::default()
            },
        )
        .unwrap();
        queue.connect().await.unwrap();

        // No broker on port 1: both stay in Connecting.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.status(), Status::Connecting);

        queue.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(queue.status(), Status::Closed);
    }
}
