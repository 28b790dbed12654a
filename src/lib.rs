//! Unified unicast/broadcast messaging over AMQP 0-9-1 and MQTT, with an
//! IoT application/network manager SDK on top.
//!
//! # Overview
//!
//! The crate is layered, leaves first:
//! - [`connection`]: one transport per broker host with automatic
//!   reconnection and status fan-out.
//! - [`queue`]: one logical endpoint that makes unicast/broadcast and
//!   reliable/best-effort behave the same on both broker families.
//! - [`pool`]: a reference-counted registry so managers on the same host
//!   share one transport.
//! - [`iot`]: the Application and Network managers with typed payloads,
//!   ack/nack policy, and an aggregated readiness signal.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unimq::connection::{AmqpConnection, AmqpConnectionOptions, Connection};
//! use unimq::queue::{Queue, QueueOptions};
//!
//! #[tokio::main]
//! async fn main() -> unimq::Result<()> {
//!     let conn = Connection::Amqp(AmqpConnection::new(AmqpConnectionOptions {
//!         uri: "amqp://localhost".to_string(),
//!         ..Default::default()
//!     })?);
//!     conn.connect().await?;
//!
//!     let queue = Queue::new(
//!         &conn,
//!         QueueOptions {
//!             name: "name".to_string(),
//!             reliable: true,
//!             ..Default::default()
//!         },
//!     )?;
//!     queue.connect().await?;
//!
//!     // ... once the queue reports Connected:
//!     queue.send_msg(b"payload".to_vec()).await?;
//!
//!     queue.close().await?;
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod iot;
mod naming;
pub mod pool;
pub mod queue;
pub mod testing;

pub use connection::{Connection, ConnectionHandler, Status};
pub use error::{MqError, Result};
pub use pool::ConnectionPool;
pub use queue::{Message, MessageHandler, Queue, QueueEventHandler, QueueOptions};
