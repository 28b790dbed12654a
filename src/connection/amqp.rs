//! AMQP 0-9-1 connection driver built on lapin.
//!
//! The driver owns one transport and a supervisor task that dials the
//! broker, watches for transport errors, and redials forever until
//! [`AmqpConnection::close`] is called. Channel-level resources belong to
//! the queue layer; this type only hands out fresh channels.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lapin::{Connection as LapinConnection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;

use super::{interruptible_sleep, ConnectionHandler, Status, StatusBus};
use crate::error::{MqError, Result};

/// Options for an [`AmqpConnection`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AmqpConnectionOptions {
    /// Broker URI, scheme `amqp` or `amqps`. Credentials and vhost are
    /// carried in the URI.
    pub uri: String,
    /// Dial timeout in milliseconds.
    pub connect_timeout_millis: u64,
    /// Delay between redial attempts in milliseconds.
    pub reconnect_millis: u64,
    /// Accept broker certificates that do not verify. Only honored where
    /// the TLS backend exposes relaxed verification; the default backend
    /// keeps full verification and logs a warning instead.
    pub insecure: bool,
}

impl Default for AmqpConnectionOptions {
    fn default() -> Self {
        Self {
            uri: "amqp://localhost".to_string(),
            connect_timeout_millis: 3000,
            reconnect_millis: 1000,
            insecure: false,
        }
    }
}

/// Connection to one AMQP broker host.
///
/// Cloning shares the underlying transport and state machine.
#[derive(Clone)]
pub struct AmqpConnection {
    opts: Arc<AmqpConnectionOptions>,
    bus: Arc<StatusBus>,
    raw: Arc<Mutex<Option<LapinConnection>>>,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl AmqpConnection {
    /// Validate the options and build an unconnected instance.
    pub fn new(opts: AmqpConnectionOptions) -> Result<Self> {
        let url = Url::parse(&opts.uri).map_err(|e| {
            MqError::invalid_argument(format!("invalid host uri `{}`: {e}", opts.uri))
        })?;
        match url.scheme() {
            "amqp" | "amqps" => {}
            scheme => {
                return Err(MqError::invalid_argument(format!(
                    "unsupported scheme `{scheme}` for an AMQP connection"
                )))
            }
        }
        if opts.insecure {
            warn!(host = %opts.uri, "insecure TLS requested; default trust roots still apply");
        }
        Ok(Self {
            bus: Arc::new(StatusBus::new(opts.uri.clone())),
            opts: Arc::new(opts),
            raw: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(StdMutex::new(None)),
            task: Arc::new(StdMutex::new(None)),
        })
    }

    /// Current state.
    pub fn status(&self) -> Status {
        self.bus.status()
    }

    /// Canonical host URI.
    pub fn host_uri(&self) -> &str {
        self.bus.host_uri()
    }

    /// Register a lifecycle handler; the returned id removes it again.
    pub fn add_handler(&self, handler: Arc<dyn ConnectionHandler>) -> String {
        self.bus.add_handler(handler)
    }

    /// Remove a handler by id.
    pub fn remove_handler(&self, id: &str) {
        self.bus.remove_handler(id);
    }

    /// Remove every registered handler.
    pub fn clear_handlers(&self) {
        self.bus.clear_handlers();
    }

    pub(crate) fn status_rx(&self) -> watch::Receiver<Status> {
        self.bus.subscribe()
    }

    /// Open a fresh channel on the live transport.
    pub(crate) async fn create_channel(&self) -> Result<lapin::Channel> {
        let guard = self.raw.lock().await;
        match guard.as_ref() {
            Some(raw) => Ok(raw.create_channel().await?),
            None => Err(MqError::NotConnected),
        }
    }

    /// Start the connect state machine. No-op while `Connecting` or
    /// `Connected`.
    pub async fn connect(&self) -> Result<()> {
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

    /// Stop retries, close the transport, and settle in `Closed`.
    /// Idempotent; a second call returns without emitting events.
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
                warn!(host = %self.host_uri(), "amqp supervisor did not stop in time, aborting");
                task.abort();
            }
        }

        let raw = self.raw.lock().await.take();
        if let Some(raw) = raw {
            if let Err(e) = raw.close(200, "client shutdown").await {
                debug!(host = %self.host_uri(), error = %e, "transport close reported an error");
            }
        }

        self.bus.transition(Status::Closed);
        Ok(())
    }

    async fn run_supervisor(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(host = %self.host_uri(), "amqp supervisor started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if matches!(self.status(), Status::Closing | Status::Closed) {
                break;
            }

            let dial = LapinConnection::connect(&self.opts.uri, ConnectionProperties::default());
            match time::timeout(Duration::from_millis(self.opts.connect_timeout_millis), dial).await
            {
                Ok(Ok(raw)) => {
                    let (err_tx, mut err_rx) = watch::channel(false);
                    raw.on_error(move |_err| {
                        let _ = err_tx.send(true);
                    });
                    *self.raw.lock().await = Some(raw);
                    self.bus.transition_active(Status::Connected);
                    info!(host = %self.host_uri(), "amqp transport connected");

                    // Hold until the transport errors out or we shut down.
                    let lost = loop {
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break false;
                                }
                            }
                            changed = err_rx.changed() => {
                                if changed.is_err() || *err_rx.borrow() {
                                    break true;
                                }
                            }
                        }
                    };
                    if !lost {
                        break;
                    }

                    *self.raw.lock().await = None;
                    if matches!(self.status(), Status::Closing | Status::Closed) {
                        break;
                    }
                    self.bus
                        .emit_error(MqError::transport("transport closed by peer"));
                    self.bus.transition_active(Status::Connecting);
                }
                Ok(Err(e)) => {
                    self.bus.emit_error(e.into());
                    if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                        break;
                    }
                }
                Err(_) => {
                    self.bus.emit_error(MqError::transport(format!(
                        "dial timed out after {}ms",
                        self.opts.connect_timeout_millis
                    )));
                    if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                        break;
                    }
                }
            }
        }
        debug!(host = %self.host_uri(), "amqp supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = AmqpConnectionOptions::default();
        assert_eq!(opts.uri, "amqp://localhost");
        assert_eq!(opts.connect_timeout_millis, 3000);
        assert_eq!(opts.reconnect_millis, 1000);
        assert!(!opts.insecure);
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let result = AmqpConnection::new(AmqpConnectionOptions {
            uri: "mqtt://localhost".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));

        let result = AmqpConnection::new(AmqpConnectionOptions {
            uri: "not a uri".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));
    }

    #[test]
    fn test_new_starts_closed() {
        let conn = AmqpConnection::new(AmqpConnectionOptions::default()).unwrap();
        assert_eq!(conn.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_close_before_connect_is_ok() {
        let conn = AmqpConnection::new(AmqpConnectionOptions::default()).unwrap();
        assert!(conn.close().await.is_ok());
        assert_eq!(conn.status(), Status::Closed);
        // Idempotent.
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_broker_keeps_retrying() {
        // Port 1 is never a broker; the machine stays in Connecting.
        let conn = AmqpConnection::new(AmqpConnectionOptions {
            uri: "amqp://localhost:1".to_string(),
            reconnect_millis: 20,
            connect_timeout_millis: 100,
            ..Default::default()
        })
        .unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.status(), Status::Connecting);

        // A second connect is a no-op while connecting.
        conn.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(conn.status(), Status::Connecting);

        conn.close().await.unwrap();
        assert_eq!(conn.status(), Status::Closed);
    }
}
