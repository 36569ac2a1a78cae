//! # Connection Pool
//!
//! Purpose: Hand out exclusive use of a fixed set of pre-opened connections.
//!
//! ## Design Principles
//! 1. **Fixed Size**: All connections are opened up front; construction fails
//!    as a whole if any of them cannot be opened.
//! 2. **Strict FIFO**: Released connections go to the longest-waiting
//!    acquirer, handed over directly. Each waiter parks on its own condvar so a
//!    release wakes exactly one thread.
//! 3. **Minimal Locking**: One mutex guards the queues; it is never held
//!    while talking to the network.
//! 4. **No Implicit Repair**: The pool never closes, checks or replaces a
//!    connection. A caller that breaks one reconnects or closes it itself.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool
//!   └── inner: Arc<PoolInner>
//!         └── state: Mutex<PoolState>
//!               ├── available: VecDeque<CommandConnection>   (FIFO)
//!               ├── checked_out: HashSet<ConnectionId>       (membership)
//!               ├── waiters: VecDeque<(ticket, Arc<Condvar>)>
//!               └── handoffs: HashMap<ticket, CommandConnection>
//! ```
//!
//! Invariant: `available.len() + checked_out.len() == size`. A connection
//! parked in `handoffs` already counts as checked out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use rkv_common::{RkvError, RkvResult};

use crate::command::CommandConnection;
use crate::connection::ConnectionId;
use crate::endpoint::Endpoint;

struct PoolState {
    available: VecDeque<CommandConnection>,
    checked_out: HashSet<ConnectionId>,
    waiters: VecDeque<(u64, Arc<Condvar>)>,
    handoffs: HashMap<u64, CommandConnection>,
    next_ticket: u64,
}

impl PoolState {
    fn checkout(&mut self, conn: CommandConnection) -> CommandConnection {
        self.checked_out.insert(conn.id());
        conn
    }

    fn enqueue_waiter(&mut self) -> (u64, Arc<Condvar>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let ready = Arc::new(Condvar::new());
        self.waiters.push_back((ticket, Arc::clone(&ready)));
        (ticket, ready)
    }
}

struct PoolInner {
    endpoint: Arc<Endpoint>,
    size: usize,
    state: Mutex<PoolState>,
}

/// Fixed-size pool of command connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Opens `size` connections against `endpoint`.
    ///
    /// If any connection fails to open, the ones already opened are closed
    /// and the error is returned.
    pub fn new(size: usize, endpoint: impl Into<Arc<Endpoint>>) -> RkvResult<Self> {
        if size == 0 {
            return Err(RkvError::Config("pool size must be at least 1".into()));
        }
        let endpoint = endpoint.into();

        let mut available = VecDeque::with_capacity(size);
        for _ in 0..size {
            available.push_back(CommandConnection::open(Arc::clone(&endpoint))?);
        }
        debug!(endpoint = %endpoint, size, "connection pool ready");

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                endpoint,
                size,
                state: Mutex::new(PoolState {
                    available,
                    checked_out: HashSet::with_capacity(size),
                    waiters: VecDeque::new(),
                    handoffs: HashMap::new(),
                    next_ticket: 0,
                }),
            }),
        })
    }

    /// Takes a connection, blocking until one is released if none is free.
    pub fn acquire(&self) -> CommandConnection {
        let mut state = self.inner.state.lock();
        if state.waiters.is_empty() {
            if let Some(conn) = state.available.pop_front() {
                return state.checkout(conn);
            }
        }

        let (ticket, ready) = state.enqueue_waiter();
        loop {
            if let Some(conn) = state.handoffs.remove(&ticket) {
                return conn;
            }
            ready.wait(&mut state);
        }
    }

    /// Takes a connection only if one is free and nobody is queued for it.
    pub fn try_acquire(&self) -> Option<CommandConnection> {
        let mut state = self.inner.state.lock();
        if !state.waiters.is_empty() {
            return None;
        }
        let conn = state.available.pop_front()?;
        Some(state.checkout(conn))
    }

    /// Like `acquire`, but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<CommandConnection> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        if state.waiters.is_empty() {
            if let Some(conn) = state.available.pop_front() {
                return Some(state.checkout(conn));
            }
        }

        let (ticket, ready) = state.enqueue_waiter();
        loop {
            if let Some(conn) = state.handoffs.remove(&ticket) {
                return Some(conn);
            }
            if ready.wait_until(&mut state, deadline).timed_out() {
                // A release may have raced the timeout.
                if let Some(conn) = state.handoffs.remove(&ticket) {
                    return Some(conn);
                }
                state.waiters.retain(|(queued, _)| *queued != ticket);
                return None;
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// Fails with `ConnectionState` if `conn` is not currently checked out
    /// from this pool (double release or a foreign connection); in that case
    /// the connection is dropped, which closes it.
    pub fn release(&self, conn: CommandConnection) -> RkvResult<()> {
        let mut state = self.inner.state.lock();
        if !state.checked_out.contains(&conn.id()) {
            return Err(RkvError::ConnectionState(format!(
                "connection {} is not checked out from this pool",
                conn.id()
            )));
        }

        match state.waiters.pop_front() {
            Some((ticket, ready)) => {
                state.handoffs.insert(ticket, conn);
                ready.notify_one();
            }
            None => {
                state.checked_out.remove(&conn.id());
                state.available.push_back(conn);
            }
        }
        Ok(())
    }

    /// Acquires a connection wrapped in a guard that releases it on drop.
    pub fn get(&self) -> PooledConnection {
        PooledConnection {
            pool: self.clone(),
            conn: Some(self.acquire()),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.inner.endpoint
    }

    /// Total number of connections owned by the pool.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn available_count(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.inner.state.lock().checked_out.len()
    }

    /// Number of threads blocked in `acquire`.
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<CommandConnection>,
}

impl Deref for PooledConnection {
    type Target = CommandConnection;

    fn deref(&self) -> &CommandConnection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut CommandConnection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.release(conn) {
                warn!(error = %err, "pooled connection could not be returned");
            }
        }
    }
}
