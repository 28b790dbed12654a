//! Application-side manager: the queue set and typed message surface an
//! application uses to consume uplinks and issue downlinks.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use url::Url;

use super::messages::{AppDlData, AppDlDataResp, AppDlDataResult, AppUlData};
use super::{
    new_data_queues, spawn_status_aggregator, MgrStatus, Options, APP_QUEUE_PREFIX,
    DATA_QUEUE_COUNT,
};
use crate::connection::Status;
use crate::error::{MqError, Result};
use crate::pool::ConnectionPool;
use crate::queue::{Message, MessageHandler, Queue};

/// Callbacks of an application manager.
///
/// The data methods return `Ok` to acknowledge the message and `Err` to
/// negative-acknowledge it (asking for redelivery where the broker
/// supports it). `on_status_change` defaults to a no-op.
#[async_trait]
pub trait ApplicationMgrHandler: Send + Sync {
    /// Called when the aggregated readiness changes.
    async fn on_status_change(&self, status: MgrStatus) {
        let _ = status;
    }

    /// One uplink from a device.
    async fn on_uldata(&self, data: AppUlData) -> std::result::Result<(), ()>;

    /// Immediate broker answer to a downlink request.
    async fn on_dldata_resp(&self, data: AppDlDataResp) -> std::result::Result<(), ()>;

    /// Final delivery report of a downlink.
    async fn on_dldata_result(&self, data: AppDlDataResult) -> std::result::Result<(), ()>;
}

/// Per-queue statuses of an application manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMqStatus {
    pub uldata: Status,
    pub dldata: Status,
    pub dldata_resp: Status,
    pub dldata_result: Status,
}

/// Manager of the application role: four reliable unicast queues on one
/// pooled connection, typed routing in, typed publishing out.
///
/// Cloning shares the underlying queues and state.
#[derive(Clone)]
pub struct ApplicationMgr {
    opts: Arc<Options>,
    host_uri: Url,
    pool: ConnectionPool,
    uldata: Queue,
    dldata: Queue,
    dldata_resp: Queue,
    dldata_result: Queue,
    status_tx: Arc<watch::Sender<MgrStatus>>,
    shutdown_tx: Arc<StdMutex<Option<watch::Sender<bool>>>>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl ApplicationMgr {
    /// Build the queue set on the pooled connection for `host_uri`,
    /// install routing and readiness aggregation, and start connecting.
    pub async fn new(
        pool: &ConnectionPool,
        host_uri: &Url,
        opts: Options,
        handler: Arc<dyn ApplicationMgrHandler>,
    ) -> Result<Self> {
        if opts.unit_id.is_empty() {
            return Err(MqError::invalid_argument(
                "`unit_id` must not be empty for an application manager",
            ));
        }

        let conn = pool.get(host_uri, DATA_QUEUE_COUNT).await?;
        let queues = match new_data_queues(&conn, &opts, APP_QUEUE_PREFIX, false) {
            Ok(queues) => queues,
            Err(e) => {
                let _ = pool.release(host_uri, DATA_QUEUE_COUNT).await;
                return Err(e);
            }
        };
        let dldata_resp = match queues.dldata_resp {
            Some(queue) => queue,
            None => {
                let _ = pool.release(host_uri, DATA_QUEUE_COUNT).await;
                return Err(MqError::invalid_argument(
                    "application manager requires a dldata-resp queue",
                ));
            }
        };
        conn.connect().await?;

        let router = Arc::new(AppRouter {
            handler: handler.clone(),
        });
        for queue in [&queues.uldata, &dldata_resp, &queues.dldata_result] {
            queue.set_msg_handler(router.clone());
        }

        let status_tx = Arc::new(watch::channel(MgrStatus::NotReady).0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_status_aggregator(
            &[
                &queues.uldata,
                &queues.dldata,
                &dldata_resp,
                &queues.dldata_result,
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
            dldata_resp,
            dldata_result: queues.dldata_result,
            status_tx,
            shutdown_tx: Arc::new(StdMutex::new(Some(shutdown_tx))),
            task: Arc::new(StdMutex::new(Some(task))),
        };

        let connected = async {
            mgr.uldata.connect().await?;
            mgr.dldata.connect().await?;
            mgr.dldata_resp.connect().await?;
            mgr.dldata_result.connect().await?;
            Ok::<(), MqError>(())
        }
        .await;
        if let Err(e) = connected {
            let _ = mgr.close().await;
            return Err(e);
        }

        info!(unit = %mgr.opts.unit_code, name = %mgr.opts.name, "application manager created");
        Ok(mgr)
    }

    /// Unit id this manager belongs to.
    pub fn unit_id(&self) -> &str {
        &self.opts.unit_id
    }

    /// Unit code used in the queue names.
    pub fn unit_code(&self) -> &str {
        &self.opts.unit_code
    }

    /// Application id.
    pub fn id(&self) -> &str {
        &self.opts.id
    }

    /// Application code used in the queue names.
    pub fn name(&self) -> &str {
        &self.opts.name
    }

    /// Aggregated readiness.
    pub fn status(&self) -> MgrStatus {
        *self.status_tx.borrow()
    }

    /// Per-queue statuses.
    pub fn mq_status(&self) -> AppMqStatus {
        AppMqStatus {
            uldata: self.uldata.status(),
            dldata: self.dldata.status(),
            dldata_resp: self.dldata_resp.status(),
            dldata_result: self.dldata_result.status(),
        }
    }

    /// Publish one downlink request.
    ///
    /// The record must address either a device id or a network
    /// code/address pair; anything else fails with `InvalidArgument`
    /// before touching the queue.
    pub async fn send_dldata(&self, data: &AppDlData) -> Result<()> {
        validate_dldata(data)?;
        let payload = serde_json::to_vec(data)
            .map_err(|e| MqError::invalid_argument(format!("encode dldata: {e}")))?;
        self.dldata.send_msg(payload).await
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
            &self.dldata_resp,
            &self.dldata_result,
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

/// Check the downlink addressing disjunction: exactly one of `device_id`
/// or the `network_code`/`network_addr` pair.
fn validate_dldata(data: &AppDlData) -> Result<()> {
    if data.correlation_id.is_empty() {
        return Err(MqError::invalid_argument(
            "`correlation_id` must not be empty",
        ));
    }
    let by_device = data.device_id.as_deref().is_some_and(|v| !v.is_empty());
    let has_code = data.network_code.as_deref().is_some_and(|v| !v.is_empty());
    let has_addr = data.network_addr.as_deref().is_some_and(|v| !v.is_empty());
    let valid = if by_device {
        !has_code && !has_addr
    } else {
        has_code && has_addr
    };
    if !valid {
        return Err(MqError::invalid_argument(
            "address either `device_id` or both `network_code` and `network_addr`",
        ));
    }
    Ok(())
}

/// One message handler for all receive queues, dispatching on the role
/// suffix of the source queue name.
struct AppRouter {
    handler: Arc<dyn ApplicationMgrHandler>,
}

impl AppRouter {
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
impl MessageHandler for AppRouter {
    async fn on_message(&self, queue_name: &str, msg: Box<dyn Message>) {
        let role = queue_name.rsplit('.').next().unwrap_or("");
        let handled = match role {
            "uldata" => match serde_json::from_slice::<AppUlData>(msg.payload()) {
                Ok(data) => self.handler.on_uldata(data).await,
                Err(e) => {
                    // Malformed payloads are dropped, not retried.
                    debug!(queue = queue_name, error = %e, "dropping malformed payload");
                    Ok(())
                }
            },
            "dldata-resp" => match serde_json::from_slice::<AppDlDataResp>(msg.payload()) {
                Ok(data) => self.handler.on_dldata_resp(data).await,
                Err(e) => {
                    debug!(queue = queue_name, error = %e, "dropping malformed payload");
                    Ok(())
                }
            },
            "dldata-result" => match serde_json::from_slice::<AppDlDataResult>(msg.payload()) {
                Ok(data) => self.handler.on_dldata_result(data).await,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockMessage;
    use tokio::sync::Mutex as AsyncMutex;

    struct TestHandler {
        uldata: Arc<AsyncMutex<Vec<AppUlData>>>,
        reject: bool,
    }

    #[async_trait]
    impl ApplicationMgrHandler for TestHandler {
        async fn on_uldata(&self, data: AppUlData) -> std::result::Result<(), ()> {
            self.uldata.lock().await.push(data);
            if self.reject {
                Err(())
            } else {
                Ok(())
            }
        }
        async fn on_dldata_resp(&self, _data: AppDlDataResp) -> std::result::Result<(), ()> {
            Ok(())
        }
        async fn on_dldata_result(&self, _data: AppDlDataResult) -> std::result::Result<(), ()> {
            Ok(())
        }
    }

    fn uldata_json() -> Vec<u8> {
        br#"{"dataId":"id1","time":"2024-05-06T07:08:09.123Z","pub":"2024-05-06T07:08:09.456Z","deviceId":"dev1","networkId":"net1","networkCode":"code","networkAddr":"addr1","isPublic":false,"data":"01"}"#
            .to_vec()
    }

    #[tokio::test]
    async fn test_router_acks_on_success() {
        let received = Arc::new(AsyncMutex::new(vec![]));
        let router = AppRouter {
            handler: Arc::new(TestHandler {
                uldata: received.clone(),
                reject: false,
            }),
        };
        let (msg, record) = MockMessage::new(uldata_json());

        router
            .on_message("broker.application.code1.app.uldata", Box::new(msg))
            .await;

        assert_eq!(received.lock().await.len(), 1);
        assert_eq!(received.lock().await[0].data, vec![0x01]);
        assert_eq!(record.acks(), 1);
        assert_eq!(record.nacks(), 0);
    }

    #[tokio::test]
    async fn test_router_nacks_on_handler_error() {
        let router = AppRouter {
            handler: Arc::new(TestHandler {
                uldata: Arc::new(AsyncMutex::new(vec![])),
                reject: true,
            }),
        };
        let (msg, record) = MockMessage::new(uldata_json());

        router
            .on_message("broker.application.code1.app.uldata", Box::new(msg))
            .await;

        assert_eq!(record.acks(), 0);
        assert_eq!(record.nacks(), 1);
    }

    #[tokio::test]
    async fn test_router_acks_malformed_payloads() {
        let received = Arc::new(AsyncMutex::new(vec![]));
        let router = AppRouter {
            handler: Arc::new(TestHandler {
                uldata: received.clone(),
                reject: true,
            }),
        };
        let (msg, record) = MockMessage::new(b"not json".to_vec());

        router
            .on_message("broker.application.code1.app.uldata", Box::new(msg))
            .await;

        assert!(received.lock().await.is_empty());
        assert_eq!(record.acks(), 1);
        assert_eq!(record.nacks(), 0);
    }

    #[test]
    fn test_dldata_addressing_validation() {
        let valid_device = AppDlData {
            correlation_id: "1".to_string(),
            device_id: Some("device1".to_string()),
            data: vec![0x01],
            ..Default::default()
        };
        assert!(validate_dldata(&valid_device).is_ok());

        let valid_addr = AppDlData {
            correlation_id: "2".to_string(),
            network_code: Some("code".to_string()),
            network_addr: Some("addr2".to_string()),
            data: vec![0x02],
            ..Default::default()
        };
        assert!(validate_dldata(&valid_addr).is_ok());

        // Missing correlation id.
        let missing_corr = AppDlData {
            device_id: Some("device1".to_string()),
            ..Default::default()
        };
        assert!(validate_dldata(&missing_corr).is_err());

        // Code without address.
        let half_pair = AppDlData {
            correlation_id: "1".to_string(),
            network_code: Some("code".to_string()),
            ..Default::default()
        };
        assert!(validate_dldata(&half_pair).is_err());

        // Both addressing modes at once.
        let both = AppDlData {
            correlation_id: "1".to_string(),
            device_id: Some("device1".to_string()),
            network_code: Some("code".to_string()),
            network_addr: Some("addr".to_string()),
            ..Default::default()
        };
        assert!(validate_dldata(&both).is_err());

        // No addressing at all.
        let neither = AppDlData {
            correlation_id: "1".to_string(),
            ..Default::default()
        };
        assert!(validate_dldata(&neither).is_err());
    }
}
