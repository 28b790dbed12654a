//! MQTT connection driver built on rumqttc.
//!
//! One driver owns one client/event-loop pair plus the packet-handler
//! registry that routes inbound publishes to the queue that subscribed to
//! the topic. Reconnection is largely delegated to the client: the
//! supervisor keeps polling the event loop, pacing retries with the
//! configured reconnect interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;

use super::{interruptible_sleep, ConnectionHandler, Status, StatusBus};
use crate::error::{MqError, Result};
use crate::naming::{random_id, validate_queue_name};

/// Options for an [`MqttConnection`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttConnectionOptions {
    /// Broker URI, scheme `mqtt` or `mqtts`. Credentials are carried in
    /// the URI.
    pub uri: String,
    /// Dial timeout in milliseconds. The MQTT client owns the dial, so
    /// this is advisory where the client does not expose it.
    pub connect_timeout_millis: u64,
    /// Delay between poll retries after a transport error.
    pub reconnect_millis: u64,
    /// Accept broker certificates that do not verify. Only honored where
    /// the TLS backend exposes relaxed verification; the default backend
    /// keeps full verification and logs a warning instead.
    pub insecure: bool,
    /// Client identifier, 1 to 23 characters. A random `unimq-` id is
    /// generated when unset.
    pub client_id: Option<String>,
    /// Ask the broker to discard session state between connections.
    pub clean_session: bool,
}

impl Default for MqttConnectionOptions {
    fn default() -> Self {
        Self {
            uri: "mqtt://localhost".to_string(),
            connect_timeout_millis: 3000,
            reconnect_millis: 1000,
            insecure: false,
            client_id: None,
            clean_session: true,
        }
    }
}

/// Receiver half of a packet-handler registration: the queue-side sink
/// inbound payloads are delivered into.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Handle one inbound publish addressed to the registered topic.
    async fn deliver(&self, payload: Vec<u8>);
}

/// Registered route for one queue name.
struct PacketHandler {
    topic: String,
    qos: QoS,
    sink: Arc<dyn PacketSink>,
}

/// Connection to one MQTT broker host.
///
/// Cloning shares the underlying client and state machine.
#[derive(Clone)]
pub struct MqttConnection {
    opts: Arc<MqttConnectionOptions>,
    client_id: String,
    bus: Arc<StatusBus>,
    packet_handlers: Arc<StdMutex<HashMap<String, PacketHandler>>>,
    client: Arc<StdMutex<Option<AsyncClient>>>,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl MqttConnection {
    /// Validate the options and build an unconnected instance.
    pub fn new(opts: MqttConnectionOptions) -> Result<Self> {
        let url = Url::parse(&opts.uri).map_err(|e| {
            MqError::invalid_argument(format!("invalid host uri `{}`: {e}", opts.uri))
        })?;
        match url.scheme() {
            "mqtt" | "mqtts" => {}
            scheme => {
                return Err(MqError::invalid_argument(format!(
                    "unsupported scheme `{scheme}` for an MQTT connection"
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(MqError::invalid_argument(format!(
                "host uri `{}` has no host",
                opts.uri
            )));
        }
        let client_id = match &opts.client_id {
            Some(id) => {
                if id.is_empty() || id.len() > 23 {
                    return Err(MqError::invalid_argument(
                        "client_id must be 1 to 23 characters",
                    ));
                }
                id.clone()
            }
            None => format!("unimq-{}", random_id(12)),
        };
        if opts.insecure {
            warn!(host = %opts.uri, "insecure TLS requested; default trust roots still apply");
        }
        Ok(Self {
            bus: Arc::new(StatusBus::new(opts.uri.clone())),
            opts: Arc::new(opts),
            client_id,
            packet_handlers: Arc::new(StdMutex::new(HashMap::new())),
            client: Arc::new(StdMutex::new(None)),
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

    pub(crate) fn client(&self) -> Option<AsyncClient> {
        self.client.lock().unwrap().clone()
    }

    /// Register the inbound route for a queue.
    ///
    /// `topic` must end with `name` (a shared-subscription prefix is the
    /// only allowed difference) and `name` must be a valid queue name.
    /// Registering the same name again replaces the previous route.
    pub fn add_packet_handler(
        &self,
        name: &str,
        topic: &str,
        reliable: bool,
        sink: Arc<dyn PacketSink>,
    ) -> Result<()> {
        validate_queue_name(name)?;
        if !topic.ends_with(name) {
            return Err(MqError::invalid_argument(format!(
                "topic `{topic}` does not end with queue name `{name}`"
            )));
        }
        let handler = PacketHandler {
            topic: topic.to_string(),
            qos: if reliable {
                QoS::AtLeastOnce
            } else {
                QoS::AtMostOnce
            },
            sink,
        };
        self.packet_handlers
            .lock()
            .unwrap()
            .insert(name.to_string(), handler);
        Ok(())
    }

    /// Remove the inbound route for a queue name.
    pub fn remove_packet_handler(&self, name: &str) {
        self.packet_handlers.lock().unwrap().remove(name);
    }

    /// Subscribe using the QoS recorded for the queue's route.
    pub(crate) async fn subscribe_packet_route(&self, name: &str) -> Result<()> {
        let (topic, qos) = {
            let handlers = self.packet_handlers.lock().unwrap();
            let handler = handlers
                .get(name)
                .ok_or(MqError::NoMsgHandler)?;
            (handler.topic.clone(), handler.qos)
        };
        let client = self.client().ok_or(MqError::NotConnected)?;
        client.subscribe(topic, qos).await?;
        Ok(())
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

    /// Stop polling, disconnect the client, and settle in `Closed`.
    /// Idempotent; a second call returns without emitting events.
    pub async fn close(&self) -> Result<()> {
        self.bus.ensure_notifier();
        if self.status() == Status::Closed {
            return Ok(());
        }
        self.bus.transition(Status::Closing);

        if let Some(client) = self.client() {
            if let Err(e) = client.disconnect().await {
                debug!(host = %self.host_uri(), error = %e, "disconnect reported an error");
            }
        }
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            if time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!(host = %self.host_uri(), "mqtt supervisor did not stop in time, aborting");
                task.abort();
            }
        }
        *self.client.lock().unwrap() = None;

        self.bus.transition(Status::Closed);
        Ok(())
    }

    fn build_mqtt_options(&self) -> Result<MqttOptions> {
        let url = Url::parse(&self.opts.uri).map_err(|e| {
            MqError::invalid_argument(format!("invalid host uri `{}`: {e}", self.opts.uri))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| MqError::invalid_argument("host uri has no host"))?;
        let secure = url.scheme() == "mqtts";
        let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

        let mut options = MqttOptions::new(&self.client_id, host, port);
        if secure {
            options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        if !url.username().is_empty() {
            options.set_credentials(url.username(), url.password().unwrap_or_default());
        }
        options.set_clean_start(self.opts.clean_session);
        options.set_keep_alive(Duration::from_secs(30));
        Ok(options)
    }

    async fn run_supervisor(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(host = %self.host_uri(), client_id = %self.client_id, "mqtt supervisor started");
        let options = match self.build_mqtt_options() {
            Ok(options) => options,
            Err(e) => {
                self.bus.emit_error(e);
                return;
            }
        };
        let (client, mut event_loop) = AsyncClient::new(options, 10);
        *self.client.lock().unwrap() = Some(client);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(host = %self.host_uri(), "mqtt transport connected");
                        self.bus.transition_active(Status::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        self.dispatch(&topic, publish.payload.to_vec()).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        self.bus.transition_active(Status::Connecting);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.status() != Status::Closed {
                            self.bus.emit_error(e.into());
                        }
                        if matches!(self.status(), Status::Closing | Status::Closed) {
                            break;
                        }
                        self.bus.transition_active(Status::Connecting);
                        if !interruptible_sleep(&mut shutdown_rx, self.opts.reconnect_millis).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!(host = %self.host_uri(), "mqtt supervisor stopped");
    }

    /// Route one inbound publish to the registered sink. Inbound topics
    /// equal leaf queue names because every subscription is a literal
    /// leaf filter and brokers strip shared-subscription prefixes.
    async fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        let sink = self
            .packet_handlers
            .lock()
            .unwrap()
            .get(topic)
            .map(|handler| handler.sink.clone());
        match sink {
            Some(sink) => sink.deliver(payload).await,
            None => debug!(host = %self.host_uri(), topic, "no packet handler for inbound topic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        payloads: Arc<AsyncMutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn deliver(&self, payload: Vec<u8>) {
            self.payloads.lock().await.push(payload);
        }
    }

    fn test_conn() -> MqttConnection {
        MqttConnection::new(MqttConnectionOptions::default()).unwrap()
    }

    #[test]
    fn test_default_options() {
        let opts = MqttConnectionOptions::default();
        assert_eq!(opts.uri, "mqtt://localhost");
        assert!(opts.clean_session);
        assert!(opts.client_id.is_none());
    }

    #[test]
    fn test_generated_client_id() {
        let conn = test_conn();
        assert!(conn.client_id.starts_with("unimq-"));
        assert_eq!(conn.client_id.len(), 18);
    }

    #[test]
    fn test_rejects_wrong_scheme_and_bad_client_id() {
        let result = MqttConnection::new(MqttConnectionOptions {
            uri: "amqp://localhost".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));

        let result = MqttConnection::new(MqttConnectionOptions {
            client_id: Some(String::new()),
            ..Default::default()
        });
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));

        let result = MqttConnection::new(MqttConnectionOptions {
            client_id: Some("x".repeat(24)),
            ..Default::default()
        });
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));
    }

    #[test]
    fn test_packet_handler_validation() {
        let conn = test_conn();
        let sink = Arc::new(RecordingSink {
            payloads: Arc::new(AsyncMutex::new(vec![])),
        });

        // Name must match the queue-name pattern.
        assert!(conn
            .add_packet_handler("Bad Name", "Bad Name", false, sink.clone())
            .is_err());
        // Topic must end with the name.
        assert!(conn
            .add_packet_handler("name", "$share/unimq/other", true, sink.clone())
            .is_err());
        // Shared-subscription prefix is fine.
        assert!(conn
            .add_packet_handler("name", "$share/unimq/name", true, sink.clone())
            .is_ok());
        assert!(conn
            .add_packet_handler("plain", "plain", false, sink)
            .is_ok());

        conn.remove_packet_handler("name");
        assert!(conn.packet_handlers.lock().unwrap().get("name").is_none());
        assert!(conn.packet_handlers.lock().unwrap().get("plain").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_topic() {
        let conn = test_conn();
        let payloads = Arc::new(AsyncMutex::new(vec![]));
        let sink = Arc::new(RecordingSink {
            payloads: payloads.clone(),
        });
        conn.add_packet_handler("name", "$share/unimq/name", true, sink)
            .unwrap();

        // Broker strips the shared prefix, so the inbound topic is the name.
        conn.dispatch("name", b"1".to_vec()).await;
        conn.dispatch("other", b"2".to_vec()).await;

        let seen = payloads.lock().await.clone();
        assert_eq!(seen, vec![b"1".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_before_connect_is_ok() {
        let conn = test_conn();
        assert!(conn.close().await.is_ok());
        assert_eq!(conn.status(), Status::Closed);
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_broker_keeps_retrying() {
        let conn = MqttConnection::new(MqttConnectionOptions {
            uri: "mqtt://localhost:1".to_string(),
            reconnect_millis: 20,
            ..Default::default()
        })
        .unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.status(), Status::Connecting);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(conn.status(), Status::Connecting);

        conn.close().await.unwrap();
        assert_eq!(conn.status(), Status::Closed);
    }
}
