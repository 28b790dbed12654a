//! IoT manager layer.
//!
//! A manager composes a fixed set of logical queues on one pooled
//! connection into the Application or Network role of the IoT broker:
//! typed payloads in and out, ack/nack policy, and one readiness signal
//! aggregated from the owned queues.

pub mod application;
pub mod messages;
pub mod network;

pub use application::{ApplicationMgr, ApplicationMgrHandler};
pub use network::{NetworkMgr, NetworkMgrHandler};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, Status};
use crate::error::{MqError, Result};
use crate::queue::{Queue, QueueOptions};

/// Queues a manager owns; pool reference counts move in steps of this.
pub(crate) const DATA_QUEUE_COUNT: usize = 4;

/// Name prefix of application-side queues.
pub(crate) const APP_QUEUE_PREFIX: &str = "broker.application";

/// Name prefix of network-side queues.
pub(crate) const NET_QUEUE_PREFIX: &str = "broker.network";

const DEF_PREFETCH: u16 = 100;

/// Options of a manager.
///
/// `unit_id` and `unit_code` are either both set or both empty; empty
/// means the public network. `id` and `name` identify the manager; `name`
/// becomes the code segment of the queue names.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    pub unit_id: String,
    pub unit_code: String,
    pub id: String,
    pub name: String,
    /// Unacknowledged-delivery window of the receive queues (AMQP).
    /// Defaults to 100; zero is rejected.
    pub prefetch: Option<u16>,
    /// Publish with the persistent delivery mode (AMQP).
    pub persistent: bool,
    /// Shared-subscription prefix of the receive queues (MQTT).
    pub shared_prefix: Option<String>,
}

/// Readiness of a manager: `Ready` iff every owned queue is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgrStatus {
    NotReady,
    Ready,
}

impl MgrStatus {
    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            MgrStatus::NotReady => "not ready",
            MgrStatus::Ready => "ready",
        }
    }
}

impl fmt::Display for MgrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed queue set of one manager role.
pub(crate) struct DataQueues {
    pub uldata: Queue,
    pub dldata: Queue,
    /// Application role only.
    pub dldata_resp: Option<Queue>,
    pub dldata_result: Queue,
    /// Network role only.
    pub ctrl: Option<Queue>,
}

/// Validate manager options shared by both roles.
fn validate_options(opts: &Options) -> Result<()> {
    if opts.id.is_empty() {
        return Err(MqError::invalid_argument("`id` must not be empty"));
    }
    if opts.name.is_empty() {
        return Err(MqError::invalid_argument("`name` must not be empty"));
    }
    if opts.unit_id.is_empty() != opts.unit_code.is_empty() {
        return Err(MqError::invalid_argument(
            "`unit_id` and `unit_code` must be both set or both empty",
        ));
    }
    if opts.prefetch == Some(0) {
        return Err(MqError::invalid_argument(
            "`prefetch` must be between 1 and 65535",
        ));
    }
    Ok(())
}

/// Build the queue set for one manager role.
///
/// Names follow `[prefix].[unit_code | "_"].[name].<role>`; every queue
/// is reliable unicast with the options' prefetch/persistence forwarded.
pub(crate) fn new_data_queues(
    conn: &Connection,
    opts: &Options,
    prefix: &str,
    is_network: bool,
) -> Result<DataQueues> {
    validate_options(opts)?;
    let unit = if opts.unit_code.is_empty() {
        "_"
    } else {
        opts.unit_code.as_str()
    };
    let base = format!("{prefix}.{unit}.{}", opts.name);

    let queue = |role: &str, is_recv: bool| -> Result<Queue> {
        Queue::new(
            conn,
            QueueOptions {
                name: format!("{base}.{role}"),
                is_recv,
                reliable: true,
                broadcast: false,
                prefetch: opts.prefetch.unwrap_or(DEF_PREFETCH),
                persistent: opts.persistent,
                shared_prefix: opts.shared_prefix.clone(),
                ..Default::default()
            },
        )
    };

    if is_network {
        Ok(DataQueues {
            uldata: queue("uldata", false)?,
            dldata: queue("dldata", true)?,
            dldata_resp: None,
            dldata_result: queue("dldata-result", false)?,
            ctrl: Some(queue("ctrl", true)?),
        })
    } else {
        Ok(DataQueues {
            uldata: queue("uldata", true)?,
            dldata: queue("dldata", false)?,
            dldata_resp: Some(queue("dldata-resp", true)?),
            dldata_result: queue("dldata-result", true)?,
            ctrl: None,
        })
    }
}

/// Spawn the readiness aggregator of a manager.
///
/// Recomputes `Ready ⇔ every queue Connected` whenever any queue's
/// status changes and invokes `on_change` only on real transitions.
pub(crate) fn spawn_status_aggregator<F, Fut>(
    queues: &[&Queue],
    status_tx: Arc<watch::Sender<MgrStatus>>,
    mut shutdown_rx: watch::Receiver<bool>,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(MgrStatus) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let readers: Vec<watch::Receiver<Status>> =
        queues.iter().map(|queue| queue.status_rx()).collect();

    // One forwarder per queue funnels change ticks into a single channel
    // so the aggregator can wait on any of them.
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(DATA_QUEUE_COUNT);
    for queue in queues {
        let mut rx = queue.status_rx();
        let tick = tick_tx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if tick.send(()).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tick_tx);

    tokio::spawn(async move {
        loop {
            let ready = readers
                .iter()
                .all(|rx| *rx.borrow() == Status::Connected);
            let next = if ready {
                MgrStatus::Ready
            } else {
                MgrStatus::NotReady
            };
            let changed = status_tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
            if changed {
                on_change(next).await;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                tick = tick_rx.recv() => {
                    if tick.is_none() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AmqpConnection, AmqpConnectionOptions};

    fn test_conn() -> Connection {
        Connection::Amqp(AmqpConnection::new(AmqpConnectionOptions::default()).unwrap())
    }

    fn test_opts() -> Options {
        Options {
            unit_id: "unit1".to_string(),
            unit_code: "code1".to_string(),
            id: "id1".to_string(),
            name: "lora".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_mgr_status_display() {
        assert_eq!(MgrStatus::NotReady.to_string(), "not ready");
        assert_eq!(MgrStatus::Ready.to_string(), "ready");
    }

    #[test]
    fn test_application_queue_set() {
        let queues =
            new_data_queues(&test_conn(), &test_opts(), APP_QUEUE_PREFIX, false).unwrap();

        assert_eq!(queues.uldata.name(), "broker.application.code1.lora.uldata");
        assert!(queues.uldata.is_recv());
        assert_eq!(queues.dldata.name(), "broker.application.code1.lora.dldata");
        assert!(!queues.dldata.is_recv());
        let resp = queues.dldata_resp.unwrap();
        assert_eq!(resp.name(), "broker.application.code1.lora.dldata-resp");
        assert!(resp.is_recv());
        assert_eq!(
            queues.dldata_result.name(),
            "broker.application.code1.lora.dldata-result"
        );
        assert!(queues.dldata_result.is_recv());
        assert!(queues.ctrl.is_none());
    }

    #[test]
    fn test_network_queue_set() {
        let queues = new_data_queues(&test_conn(), &test_opts(), NET_QUEUE_PREFIX, true).unwrap();

        assert_eq!(queues.uldata.name(), "broker.network.code1.lora.uldata");
        assert!(!queues.uldata.is_recv());
        assert_eq!(queues.dldata.name(), "broker.network.code1.lora.dldata");
        assert!(queues.dldata.is_recv());
        assert!(queues.dldata_resp.is_none());
        assert!(!queues.dldata_result.is_recv());
        let ctrl = queues.ctrl.unwrap();
        assert_eq!(ctrl.name(), "broker.network.code1.lora.ctrl");
        assert!(ctrl.is_recv());
    }

    #[test]
    fn test_public_network_uses_underscore_unit() {
        let opts = Options {
            id: "id1".to_string(),
            name: "lora".to_string(),
            ..Default::default()
        };
        let queues = new_data_queues(&test_conn(), &opts, NET_QUEUE_PREFIX, true).unwrap();
        assert_eq!(queues.uldata.name(), "broker.network._.lora.uldata");
    }

    #[test]
    fn test_options_validation() {
        let conn = test_conn();

        let opts = Options {
            id: String::new(),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_err());

        let opts = Options {
            name: String::new(),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_err());

        // Mixed unit emptiness, both directions.
        let opts = Options {
            unit_code: String::new(),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_err());
        let opts = Options {
            unit_id: String::new(),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_err());

        // Zero prefetch is rejected here, not coerced.
        let opts = Options {
            prefetch: Some(0),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_err());
        let opts = Options {
            prefetch: Some(1),
            ..test_opts()
        };
        assert!(new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false).is_ok());
    }
}
