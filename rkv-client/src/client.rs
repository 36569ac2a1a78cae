//! # Client Facade
//!
//! Purpose: One entry point owning the endpoint and a connection pool, from
//! which command calls, pub/sub and monitor connections are made.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pool checkout and release.
//! 2. **Scoped Checkout**: `with_connection` holds a connection only for the
//!    duration of the closure, so it cannot leak out of the pool.
//! 3. **Shared Endpoint**: Every connection the client creates shares one
//!    `Arc<Endpoint>`.

use std::sync::Arc;

use bytes::Bytes;

use rkv_common::RkvResult;

use crate::command::CommandConnection;
use crate::endpoint::Endpoint;
use crate::monitor::MonitorConnection;
use crate::pool::ConnectionPool;
use crate::subscription::SubscriptionConnection;

/// Blocking client with connection pooling.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    /// Validates `endpoint` and opens a pool of `pool_size` connections.
    pub fn connect(endpoint: Endpoint, pool_size: usize) -> RkvResult<Self> {
        endpoint.validate()?;
        let pool = ConnectionPool::new(pool_size, endpoint)?;
        Ok(Client { pool })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        self.pool.endpoint()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs `f` with exclusive use of a pooled connection.
    ///
    /// Blocks while every connection is checked out.
    pub fn with_connection<T, F>(&self, f: F) -> RkvResult<T>
    where
        F: FnOnce(&mut CommandConnection) -> RkvResult<T>,
    {
        let mut conn = self.pool.get();
        f(&mut conn)
    }

    /// Opens a dedicated pub/sub connection.
    pub fn subscriber(&self) -> RkvResult<SubscriptionConnection> {
        SubscriptionConnection::open(Arc::clone(self.endpoint()))
    }

    /// Opens a dedicated monitor connection.
    pub fn monitor(&self) -> RkvResult<MonitorConnection> {
        MonitorConnection::open(Arc::clone(self.endpoint()))
    }

    pub fn ping(&self) -> RkvResult<String> {
        self.with_connection(|conn| conn.ping())
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> RkvResult<Option<Bytes>> {
        self.with_connection(|conn| conn.get(key))
    }

    pub fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> RkvResult<()> {
        self.with_connection(|conn| conn.set(key, value))
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> RkvResult<bool> {
        self.with_connection(|conn| Ok(conn.del(&[key])? > 0))
    }

    /// Publishes `message`; returns the number of receiving subscribers.
    pub fn publish<C: AsRef<[u8]>, M: AsRef<[u8]>>(
        &self,
        channel: C,
        message: M,
    ) -> RkvResult<i64> {
        self.with_connection(|conn| conn.publish(channel, message))
    }
}
