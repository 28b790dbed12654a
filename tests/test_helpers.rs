//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use unimq::connection::Status;
use unimq::iot::messages::{
    AppDlDataResp, AppDlDataResult, AppUlData, NetCtrlMsg, NetDlData,
};
use unimq::iot::{ApplicationMgrHandler, MgrStatus, NetworkMgrHandler, Options};
use unimq::{Message, MessageHandler, QueueEventHandler};

/// Queue event handler recording every status transition.
#[derive(Default)]
pub struct StatusRecorder {
    pub statuses: Arc<Mutex<Vec<Status>>>,
}

#[async_trait]
impl QueueEventHandler for StatusRecorder {
    async fn on_status(&self, _queue_name: &str, status: Status) {
        self.statuses.lock().await.push(status);
    }
}

/// Message handler collecting payloads and acking everything.
#[derive(Default)]
pub struct PayloadCollector {
    pub payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl MessageHandler for PayloadCollector {
    async fn on_message(&self, _queue_name: &str, msg: Box<dyn Message>) {
        self.payloads.lock().await.push(msg.payload().to_vec());
        let _ = msg.ack().await;
    }
}

/// Application handler collecting uplinks and manager status changes.
#[derive(Default)]
pub struct AppRecorder {
    pub statuses: Arc<Mutex<Vec<MgrStatus>>>,
    pub uldata: Arc<Mutex<Vec<AppUlData>>>,
    pub dldata_resp: Arc<Mutex<Vec<AppDlDataResp>>>,
    pub dldata_result: Arc<Mutex<Vec<AppDlDataResult>>>,
}

#[async_trait]
impl ApplicationMgrHandler for AppRecorder {
    async fn on_status_change(&self, status: MgrStatus) {
        self.statuses.lock().await.push(status);
    }
    async fn on_uldata(&self, data: AppUlData) -> Result<(), ()> {
        self.uldata.lock().await.push(data);
        Ok(())
    }
    async fn on_dldata_resp(&self, data: AppDlDataResp) -> Result<(), ()> {
        self.dldata_resp.lock().await.push(data);
        Ok(())
    }
    async fn on_dldata_result(&self, data: AppDlDataResult) -> Result<(), ()> {
        self.dldata_result.lock().await.push(data);
        Ok(())
    }
}

/// Network handler collecting downlinks and control messages.
#[derive(Default)]
pub struct NetRecorder {
    pub statuses: Arc<Mutex<Vec<MgrStatus>>>,
    pub dldata: Arc<Mutex<Vec<NetDlData>>>,
    pub ctrl: Arc<Mutex<Vec<NetCtrlMsg>>>,
}

#[async_trait]
impl NetworkMgrHandler for NetRecorder {
    async fn on_status_change(&self, status: MgrStatus) {
        self.statuses.lock().await.push(status);
    }
    async fn on_dldata(&self, data: NetDlData) -> Result<(), ()> {
        self.dldata.lock().await.push(data);
        Ok(())
    }
    async fn on_ctrl(&self, msg: NetCtrlMsg) -> Result<(), ()> {
        self.ctrl.lock().await.push(msg);
        Ok(())
    }
}

/// Manager options for one unit/name pair.
#[allow(dead_code)]
pub fn mgr_options(unit: &str, name: &str) -> Options {
    Options {
        unit_id: if unit.is_empty() {
            String::new()
        } else {
            format!("{unit}-id")
        },
        unit_code: unit.to_string(),
        id: format!("{name}-id"),
        name: name.to_string(),
        shared_prefix: Some("$share/unimq/".to_string()),
        ..Default::default()
    }
}
