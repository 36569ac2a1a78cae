//! # RKV Blocking Client
//!
//! Purpose: Provide a synchronous RESP client with a fair connection pool,
//! pub/sub dispatch and a parsed `MONITOR` feed.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections; checkout is exclusive.
//! 2. **Composition**: Command, pub/sub and monitor connections each wrap a
//!    plain `Connection` rather than sharing one type with modes.
//! 3. **One Reader per Feed**: Push connections move the read half onto a
//!    single named thread; closing the socket is what stops it.
//! 4. **Protocol Clarity**: Framing lives in `rkv-common`; this crate only
//!    maps replies to typed results.

mod client;
mod command;
mod connection;
mod dispatch;
mod endpoint;
mod monitor;
mod pool;
mod scan;
mod subscription;

pub use client::Client;
pub use command::{CommandConnection, KeyTtl};
pub use connection::{Connection, ConnectionId, ConnectionState, StreamReader};
pub use dispatch::ListenerId;
pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use monitor::{parse_monitor_line, MonitorConnection, MonitorEvent, MonitorListener};
pub use pool::{ConnectionPool, PooledConnection};
pub use scan::{Cursor, ScanIter, ScanOptions, ScanTarget};
pub use subscription::{PubSubEvent, SubscriptionConnection, SubscriptionListener};

pub use rkv_common::{RedisValue, RkvError, RkvResult, ValueKind};
