//! Mock messages and handlers.
//!
//! [`MockMessage`] carries an in-memory settlement record instead of a
//! broker token, so routing and ack/nack policy can be asserted in plain
//! unit tests. [`MockMessageHandler`] is the receiver-side counterpart,
//! collecting payloads and settling each message according to its
//! configured outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::queue::{Message, MessageHandler};

/// Shared settlement counters of one or more [`MockMessage`]s.
#[derive(Clone, Default)]
pub struct SettlementRecord {
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

impl SettlementRecord {
    /// Number of `ack` calls recorded.
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Number of `nack` calls recorded.
    pub fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

/// Message whose settlement lands in a [`SettlementRecord`].
pub struct MockMessage {
    payload: Vec<u8>,
    record: SettlementRecord,
}

impl MockMessage {
    /// Build a message and the record observing its settlement.
    pub fn new(payload: Vec<u8>) -> (Self, SettlementRecord) {
        let record = SettlementRecord::default();
        (
            Self {
                payload,
                record: record.clone(),
            },
            record,
        )
    }
}

#[async_trait]
impl Message for MockMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.record.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        self.record.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler collecting `(queue name, payload)` pairs and acking each
/// message, or nacking everything when built with
/// [`MockMessageHandler::rejecting`].
#[derive(Default)]
pub struct MockMessageHandler {
    received: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    reject: bool,
}

impl MockMessageHandler {
    /// Handler that acks every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that nacks every message.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    /// Everything received so far.
    pub async fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn on_message(&self, queue_name: &str, msg: Box<dyn Message>) {
        self.received
            .lock()
            .await
            .push((queue_name.to_string(), msg.payload().to_vec()));
        let _ = if self.reject {
            msg.nack().await
        } else {
            msg.ack().await
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_message_records_settlement() {
        let (msg, record) = MockMessage::new(b"data".to_vec());
        assert_eq!(msg.payload(), b"data");
        assert_eq!(record.acks(), 0);

        msg.ack().await.unwrap();
        msg.nack().await.unwrap();
        assert_eq!(record.acks(), 1);
        assert_eq!(record.nacks(), 1);
    }

    #[tokio::test]
    async fn test_mock_handler_settles_by_policy() {
        let handler = MockMessageHandler::new();
        let (msg, record) = MockMessage::new(b"1".to_vec());
        handler.on_message("name", Box::new(msg)).await;
        assert_eq!(handler.received().await, vec![("name".to_string(), b"1".to_vec())]);
        assert_eq!(record.acks(), 1);

        let handler = MockMessageHandler::rejecting();
        let (msg, record) = MockMessage::new(b"2".to_vec());
        handler.on_message("name", Box::new(msg)).await;
        assert_eq!(record.nacks(), 1);
    }
}
