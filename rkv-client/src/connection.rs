//! # Connection
//!
//! Purpose: Own exactly one TCP socket with its RESP reader/writer pair and
//! run the connect + AUTH handshake.
//!
//! ## Design Principles
//! 1. **Composition over Inheritance**: Command, subscription and monitor
//!    connections all wrap this type; none of them re-implement the handshake.
//! 2. **Explicit Lifecycle**: `Disconnected -> Connected -> Closed`, with a
//!    hard error on double connect so an open socket is never leaked.
//! 3. **Poison on Desync**: Any framing or IO failure closes the socket; a
//!    half-read reply must never be mistaken for the next one.
//! 4. **Scoped Cleanup**: `Drop` closes the socket.

use std::fmt;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use rkv_common::{RedisValue, RespReader, RespWriter, RkvError, RkvResult};

use crate::endpoint::Endpoint;

/// Reader half handed to background dispatch threads.
pub type StreamReader = RespReader<BufReader<TcpStream>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a `Connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closed,
}

/// One socket plus its codec.
///
/// Not safe for two threads issuing commands at once; exclusive use is what
/// the pool hands out.
pub struct Connection {
    id: ConnectionId,
    endpoint: Arc<Endpoint>,
    state: ConnectionState,
    writer: Option<RespWriter<TcpStream>>,
    reader: Option<StreamReader>,
}

impl Connection {
    /// Creates a connection without touching the network.
    pub fn detached(endpoint: Arc<Endpoint>) -> Self {
        Connection {
            id: ConnectionId::next(),
            endpoint,
            state: ConnectionState::Disconnected,
            writer: None,
            reader: None,
        }
    }

    /// Connects and authenticates.
    pub fn open(endpoint: Arc<Endpoint>) -> RkvResult<Self> {
        let mut conn = Connection::detached(endpoint);
        conn.connect()?;
        Ok(conn)
    }

    /// Opens a fresh socket and runs the AUTH handshake.
    ///
    /// Fails with `ConnectionState` when already connected. After `close`
    /// (or before the first connect) this performs a full reconnect.
    pub fn connect(&mut self) -> RkvResult<()> {
        if self.state == ConnectionState::Connected {
            return Err(RkvError::ConnectionState(format!(
                "connection {} to {} is already connected",
                self.id, self.endpoint
            )));
        }

        let stream = open_stream(&self.endpoint)?;
        let read_half = stream.try_clone()?;
        self.writer = Some(RespWriter::new(stream));
        self.reader = Some(RespReader::new(BufReader::new(read_half)));
        self.state = ConnectionState::Connected;

        if let Some(password) = self.endpoint.password.clone() {
            if let Err(err) = self.authenticate(&password) {
                self.close();
                return Err(err);
            }
        }

        debug!(id = %self.id, endpoint = %self.endpoint, "connection established");
        Ok(())
    }

    fn authenticate(&mut self, password: &str) -> RkvResult<()> {
        match self.execute(&["AUTH", password])? {
            RedisValue::SimpleString(text) if text == "OK" => Ok(()),
            RedisValue::Error(message) => Err(RkvError::Authentication(message)),
            other => Err(RkvError::Authentication(format!(
                "unexpected {} reply to AUTH",
                other.kind()
            ))),
        }
    }

    /// Closes the socket. Repeated calls are no-ops.
    ///
    /// Shutting the socket down also unblocks any background thread reading
    /// from a clone of it.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
        self.reader = None;
        match self.state {
            ConnectionState::Connected => {
                debug!(id = %self.id, endpoint = %self.endpoint, "connection closed");
                self.state = ConnectionState::Closed;
            }
            // Never opened, nothing to release.
            ConnectionState::Disconnected | ConnectionState::Closed => {}
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Writes one command without waiting for the reply.
    pub fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> RkvResult<()> {
        let result = match self.writer.as_mut() {
            Some(writer) => writer.write_command(args),
            None => return Err(self.not_connected()),
        };
        self.check(result)
    }

    /// Reads the next reply.
    pub fn read_value(&mut self) -> RkvResult<RedisValue> {
        let result = match self.reader.as_mut() {
            Some(reader) => reader.read_value(),
            None => return Err(self.reader_unavailable()),
        };
        self.check(result)
    }

    /// Reads one raw text line.
    pub fn read_line(&mut self) -> RkvResult<String> {
        let result = match self.reader.as_mut() {
            Some(reader) => reader.read_line(),
            None => return Err(self.reader_unavailable()),
        };
        self.check(result)
    }

    /// Sends a command and reads exactly one reply.
    pub fn execute<A: AsRef<[u8]>>(&mut self, args: &[A]) -> RkvResult<RedisValue> {
        if let Some(name) = args.first() {
            trace!(id = %self.id, command = %String::from_utf8_lossy(name.as_ref()), "execute");
        }
        self.send(args)?;
        self.read_value()
    }

    /// Overrides the endpoint read timeout for this socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> RkvResult<()> {
        match self.writer.as_ref() {
            Some(writer) => Ok(writer.get_ref().set_read_timeout(timeout)?),
            None => Err(self.not_connected()),
        }
    }

    /// Moves the reader out so a background thread can own it.
    ///
    /// Afterwards this connection can still write and close, but not read.
    pub fn take_reader(&mut self) -> RkvResult<StreamReader> {
        match self.reader.take() {
            Some(reader) => Ok(reader),
            None => Err(self.reader_unavailable()),
        }
    }

    fn check<T>(&mut self, result: RkvResult<T>) -> RkvResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(
                    id = %self.id,
                    endpoint = %self.endpoint,
                    error = %err,
                    "closing connection after fatal error"
                );
                self.close();
            }
        }
        result
    }

    fn not_connected(&self) -> RkvError {
        RkvError::ConnectionState(format!(
            "connection {} to {} is {:?}",
            self.id, self.endpoint, self.state
        ))
    }

    fn reader_unavailable(&self) -> RkvError {
        if self.is_connected() {
            RkvError::ConnectionState(format!(
                "connection {} is read by a background thread",
                self.id
            ))
        } else {
            self.not_connected()
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(endpoint: &Endpoint) -> RkvResult<TcpStream> {
    let timeout = endpoint.timeout();
    let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .collect();
    if addrs.is_empty() {
        return Err(RkvError::Config(format!("{} did not resolve", endpoint)));
    }

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) => Err(RkvError::Io(err)),
        None => Err(RkvError::Config(format!("{} did not resolve", endpoint))),
    }
}
