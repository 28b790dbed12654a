//! Reference-counted registry of shared connections, keyed by host URI.
//!
//! Several managers on the same broker host share one transport. The
//! pool is a parameter of the managers, never a global; all mutation
//! goes through [`ConnectionPool::get`] and [`ConnectionPool::release`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::connection::{
    AmqpConnection, AmqpConnectionOptions, Connection, MqttConnection, MqttConnectionOptions,
};
use crate::error::{MqError, Result};

struct PoolEntry {
    conn: Connection,
    refs: usize,
}

/// Keyed, reference-counted pool of [`Connection`]s.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<Mutex<HashMap<String, PoolEntry>>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection for `host_uri`, creating it when absent, and
    /// add `refs` to its reference count. The connection is not dialed;
    /// callers trigger [`Connection::connect`] themselves.
    pub async fn get(&self, host_uri: &Url, refs: usize) -> Result<Connection> {
        let key = host_uri.as_str().to_string();
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(&key) {
            entry.refs += refs;
            return Ok(entry.conn.clone());
        }

        let conn = match host_uri.scheme() {
            "amqp" | "amqps" => Connection::Amqp(AmqpConnection::new(AmqpConnectionOptions {
                uri: key.clone(),
                ..Default::default()
            })?),
            "mqtt" | "mqtts" => Connection::Mqtt(MqttConnection::new(MqttConnectionOptions {
                uri: key.clone(),
                ..Default::default()
            })?),
            scheme => {
                return Err(MqError::invalid_argument(format!(
                    "unsupported host scheme `{scheme}`"
                )))
            }
        };
        debug!(host = %key, "pool created connection");
        map.insert(
            key,
            PoolEntry {
                conn: conn.clone(),
                refs,
            },
        );
        Ok(conn)
    }

    /// Subtract `refs` from the entry's reference count; at zero the
    /// entry is removed, its handlers cleared, and the connection closed.
    pub async fn release(&self, host_uri: &Url, refs: usize) -> Result<()> {
        let key = host_uri.as_str();
        let mut map = self.inner.lock().await;
        let drained = match map.get_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(refs);
                entry.refs == 0
            }
            None => return Ok(()),
        };
        if drained {
            if let Some(entry) = map.remove(key) {
                debug!(host = %key, "pool closing drained connection");
                entry.conn.clear_handlers();
                entry.conn.close().await?;
            }
        }
        Ok(())
    }

    /// Number of pooled connections.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the pool holds no connection.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Status;

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_get_shares_one_connection_per_host() {
        let pool = ConnectionPool::new();
        let first = pool.get(&uri("amqp://localhost"), 4).await.unwrap();
        let second = pool.get(&uri("amqp://localhost"), 4).await.unwrap();
        assert_eq!(pool.len().await, 1);
        assert!(matches!(first, Connection::Amqp(_)));
        assert!(matches!(second, Connection::Amqp(_)));

        // A different host gets its own entry.
        pool.get(&uri("mqtt://localhost"), 4).await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_release_closes_at_zero() {
        let pool = ConnectionPool::new();
        let conn = pool.get(&uri("mqtt://localhost"), 8).await.unwrap();

        pool.release(&uri("mqtt://localhost"), 4).await.unwrap();
        assert_eq!(pool.len().await, 1);

        pool.release(&uri("mqtt://localhost"), 4).await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(conn.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_release_unknown_host_is_ok() {
        let pool = ConnectionPool::new();
        assert!(pool.release(&uri("amqp://nowhere"), 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        let pool = ConnectionPool::new();
        let result = pool.get(&uri("http://localhost"), 1).await;
        assert!(matches!(result, Err(MqError::InvalidArgument(_))));
    }
}
