//! Network-side manager: the queue set and typed message surface a
//! network adapter uses to report uplinks and execute downlinks.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;

use super::messages::{NetCtrlMsg, NetDlData, NetDlDataResult, NetUlData};
use super::{
    new_data_queues, spawn_status_aggregator, MgrStatus, Options, DATA_QUEUE_COUNT,
    NET_QUEUE_PREFIX,
};
use crate::connection::Status;
use crate::error::{MqError, Result};
use crate::pool::ConnectionPool;
use crate::queue::{Message, MessageHandler, Queue};

/// Callbacks of a network manager.
///
/// The data methods return `Ok` to acknowledge the message and `Err` to
/// negative-acknowledge it. `on_status_change` defaults to a no-op.
#[async_trait]
pub trait NetworkMgrHandler: Send + Sync {
    /// Called when the aggregated readiness changes.
    async fn on_status_change(&self, status: MgrStatus) {
        let _ = status;
    }

    /// One downlink to deliver to a device.
    async fn on_dldata(&self, data: NetDlData) -> std::result::Result<(), ()>;

    /// One control operation on the device table.
    async fn on_ctrl(&self, msg: NetCtrlMsg) -> std::result::Result<(), ()>;
}

/// Per-queue statuses of a network manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetMqStatus {
    pub uldata: Status,
    pub dldata: Status,
    pub dldata_result: Status,
    pub ctrl: Status,
}

/// Manager of the network role: four reliable unicast queues on one
/// pooled connection. Both unit fields empty means the public network.
///
/// Cloning shares the underlying queues and state.
#[derive(Clone)]
pub struct NetworkMgr {
    opts: Arc<Options>,
    host_uri: Url,
    pool: ConnectionPool,
    uldata: Queue,
    dldata: Queue,
    dldata_result: Queue,
    ctrl: Queue,
    status_tx: Arc<watch::Sender<MgrStatus>>,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl NetworkMgr {
    /// Build the queue set on the pooled connection for `host_uri`,
    /// install routing and readiness aggregation, and start connecting.
    pub async fn new(
        pool: &ConnectionPool,
        host_uri: &Url,
        opts: Options,
        handler: Arc<dyn NetworkMgrHandler>,
    ) -> Result<Self> {
        let conn = pool.get(host_uri, DATA_QUEUE_COUNT).await?;
        let queues = match new_data_queues(&conn, &opts, NET_QUEUE_PREFIX, true) {
            Ok(queues) => queues,
            Err(e) => {
                let _ = pool.release(host_uri, DATA_QUEUE_COUNT).await;
                return Err(e);
            }
        };
        let ctrl = match queues.ctrl {
            Some(queue) => queue,
            None => {
                let _ = pool.release(host_uri, DATA_QUEUE_COUNT).await;
                return Err(MqError::invalid_argument(
                    "network manager requires a ctrl queue",
                ));
            }
        };
        conn.connect().await?;

        let router = Arc::new(NetRouter {
            handler: handler.clone(),
        });
        for queue in [&queues.dldata, &ctrl] {
            queue.set_msg_handler(router.clone());
        }

        let status_tx = Arc::new(watch::channel(MgrStatus::NotReady).0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_status_aggregator(
            &[
                &queues.uldata,
                &queues.dldata,
                &queues.dldata_result,
                &ctrl,
            ],
            status_tx.clone(),
            shutdown_rx,
            move |status| {
                let handler = handler.clone();
                async move { handler.on_status_change(status).await }
            },
        );

        let mgr = Self {
            opts: Arc::new(opts),
            host_uri: host_uri.clone(),
            pool: pool.clone(),
            uldata: queues.uldata,
            dldata: queues.dldata,
            dldata_result: queues.dldata_result,
            ctrl,
            status_tx,
            shutdown_tx: Arc::new(StdMutex::new(Some(shutdown_tx))),
            task: Arc::new(StdMutex::new(Some(task))),
        };

        let connected = async {
            mgr.uldata.connect().await?;
            mgr.dldata.connect().await?;
            mgr.dldata_result.connect().await?;
            mgr.ctrl.connect().await?;
            Ok::<(), MqError>(())
        }
        .await;
        if let Err(e) = connected {
            let _ = mgr.close().await;
            return Err(e);
        }

        info!(unit = %mgr.opts.unit_code, name = %mgr.opts.name, "network manager created");
        Ok(mgr)
    }

    /// Unit id this manager belongs to; empty for the public network.
    pub fn unit_id(&self) -> &str {
        &self.opts.unit_id
    }

    /// Unit code used in the queue names; empty for the public network.
    pub fn unit_code(&self) -> &str {
        &self.opts.unit_code
    }

    /// Network id.
    pub fn id(&self) -> &str {
        &self.opts.id
    }

    /// Network code used in the queue names.
    pub fn name(&self) -> &str {
        &self.opts.name
    }

    /// Aggregated readiness.
    pub fn status(&self) -> MgrStatus {
        *self.status_tx.borrow()
    }

    /// Per-queue statuses.
    pub fn mq_status(&self) -> NetMqStatus {
        NetMqStatus {
            uldata: self.uldata.status(),
            dldata: self.dldata.status(),
            dldata_result: self.dldata_result.status(),
            ctrl: self.ctrl.status(),
        }
    }

    /// Publish one uplink report.
    pub async fn send_uldata(&self, data: &NetUlData) -> Result<()> {
        if data.network_addr.is_empty() {
            return Err(MqError::invalid_argument(
                "`network_addr` must not be empty",
            ));
        }
        let payload = serde_json::to_vec(data)
            .map_err(|e| MqError::invalid_argument(format!("encode uldata: {e}")))?;
        self.uldata.send_msg(payload).await
    }

    /// Publish one downlink delivery report.
    pub async fn send_dldata_result(&self, data: &NetDlDataResult) -> Result<()> {
        if data.data_id.is_empty() {
            return Err(MqError::invalid_argument("`data_id` must not be empty"));
        }
        let payload = serde_json::to_vec(data)
            .map_err(|e| MqError::invalid_argument(format!("encode dldata-result: {e}")))?;
        self.dldata_result.send_msg(payload).await
    }

    /// Close every owned queue, then release the pooled connection.
    /// Returns the first error met while closing.
    pub async fn close(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            if time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                task.abort();
            }
        }

        let mut first_err = None;
        for queue in [
            &self.uldata,
            &self.dldata,
            &self.dldata_result,
            &self.ctrl,
        ] {
            if let Err(e) = queue.close().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Err(e) = self.pool.release(&self.host_uri, DATA_QUEUE_COUNT).await {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One message handler for both receive queues, dispatching on the role
/// suffix of the source queue name.
struct NetRouter {
    handler: Arc<dyn NetworkMgrHandler>,
}

impl NetRouter {
    async fn settle(msg: Box<dyn Message>, handled: std::result::Result<(), ()>) {
        let settled = match handled {
            Ok(()) => msg.ack().await,
            Err(()) => msg.nack().await,
        };
        if let Err(e) = settled {
            warn!(error = %e, "settlement failed");
        }
    }
}

#[async_trait]
impl MessageHandler for NetRouter {
    async fn on_message(&self, queue_name: &str, msg: Box<dyn Message>) {
        let role = queue_name.rsplit('.').next().unwrap_or("");
        let handled = match role {
            "dldata" => match serde_json::from_slice::<NetDlData>(msg.payload()) {
                Ok(data) => self.handler.on_dldata(data).await,
                Err(e) => {
                    // Malformed payloads are dropped, not retried.
                    debug!(queue = queue_name, error = %e, "dropping malformed payload");
                    Ok(())
                }
            },
            "ctrl" => match serde_json::from_slice::<NetCtrlMsg>(msg.payload()) {
                Ok(msg) => self.handler.on_ctrl(msg).await,
                Err(e) => {
                    debug!(queue = queue_name, error = %e, "dropping malformed payload");
                    Ok(())
                }
            },
            _ => {
                debug!(queue = queue_name, "message from unexpected queue");
                Ok(())
            }
        };
        Self::settle(msg, handled).await;
    }
}
