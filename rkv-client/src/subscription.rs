//! # Subscription Connection
//!
//! Purpose: Dedicate one connection to pub/sub and deliver server pushes to
//! registered listeners from a single background thread.
//!
//! ## Design Principles
//! 1. **Fire-and-Observe**: `subscribe` and friends only write the command.
//!    The server's acknowledgement arrives as an ordinary event on the
//!    dispatch thread, in order with everything else.
//! 2. **Single Reader**: Exactly one thread owns the read half. Listener
//!    callbacks run synchronously on it, so a slow listener delays later
//!    events on this connection.
//! 3. **Forward Compatible**: Unknown push kinds are ignored.
//! 4. **Never Silent**: Errors the thread cannot recover from are reported
//!    through `on_error` before it exits.
//!
//! ## Push Format
//!
//! ```text
//! ["subscribe",    channel, count]
//! ["unsubscribe",  channel, count]
//! ["psubscribe",   pattern, count]
//! ["punsubscribe", pattern, count]
//! ["message",      channel, payload]
//! ["pmessage",     pattern, channel, payload]
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use rkv_common::{RedisValue, RkvError, RkvResult};

use crate::connection::{Connection, ConnectionId, StreamReader};
use crate::dispatch::{DispatchThread, ListenerId, ListenerRegistry};
use crate::endpoint::Endpoint;

/// Callbacks for pub/sub events. Every method defaults to a no-op.
///
/// Called on the dispatch thread; hand heavy work off to your own workers.
pub trait SubscriptionListener: Send + Sync {
    fn on_subscribe(&self, _channel: &str, _count: i64) {}

    fn on_unsubscribe(&self, _channel: &str, _count: i64) {}

    fn on_psubscribe(&self, _pattern: &str, _count: i64) {}

    fn on_punsubscribe(&self, _pattern: &str, _count: i64) {}

    fn on_message(&self, _channel: &str, _payload: &[u8]) {}

    fn on_pmessage(&self, _pattern: &str, _channel: &str, _payload: &[u8]) {}

    /// A server error reply or a feed failure.
    fn on_error(&self, _error: &RkvError) {}
}

/// Typed pub/sub push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    Subscribe { channel: String, count: i64 },
    Unsubscribe { channel: String, count: i64 },
    PSubscribe { pattern: String, count: i64 },
    PUnsubscribe { pattern: String, count: i64 },
    Message { channel: String, payload: Bytes },
    PMessage { pattern: String, channel: String, payload: Bytes },
}

impl PubSubEvent {
    /// Decodes the elements of a push array.
    ///
    /// Returns `Ok(None)` when element 0 is not one of the six known kinds,
    /// including when it is not a string at all.
    pub fn from_items(items: Vec<RedisValue>) -> RkvResult<Option<Self>> {
        let mut items = items.into_iter();
        let Some(kind) = items.next() else {
            return Ok(None);
        };
        let (kind, expected) = match kind.as_bytes() {
            Some(b"subscribe") => ("subscribe", 2),
            Some(b"unsubscribe") => ("unsubscribe", 2),
            Some(b"psubscribe") => ("psubscribe", 2),
            Some(b"punsubscribe") => ("punsubscribe", 2),
            Some(b"message") => ("message", 2),
            Some(b"pmessage") => ("pmessage", 3),
            _ => return Ok(None),
        };
        let mut rest: Vec<RedisValue> = items.collect();

        if rest.len() != expected {
            return Err(RkvError::protocol(format!(
                "{} push has {} elements, expected {}",
                kind,
                rest.len() + 1,
                expected + 1
            )));
        }

        let last = rest.pop().unwrap_or(RedisValue::BulkString(None));
        let mut rest = rest.into_iter();
        let mut next_name = || -> RkvResult<String> {
            match rest.next() {
                // `unsubscribe` with nothing subscribed carries a null name.
                Some(RedisValue::BulkString(None)) | None => Ok(String::new()),
                Some(value) => value.into_string(),
            }
        };

        let event = match kind {
            "subscribe" => PubSubEvent::Subscribe {
                channel: next_name()?,
                count: last.into_integer()?,
            },
            "unsubscribe" => PubSubEvent::Unsubscribe {
                channel: next_name()?,
                count: last.into_integer()?,
            },
            "psubscribe" => PubSubEvent::PSubscribe {
                pattern: next_name()?,
                count: last.into_integer()?,
            },
            "punsubscribe" => PubSubEvent::PUnsubscribe {
                pattern: next_name()?,
                count: last.into_integer()?,
            },
            "message" => PubSubEvent::Message {
                channel: next_name()?,
                payload: last.into_bulk()?.unwrap_or_default(),
            },
            _ => PubSubEvent::PMessage {
                pattern: next_name()?,
                channel: next_name()?,
                payload: last.into_bulk()?.unwrap_or_default(),
            },
        };
        Ok(Some(event))
    }

    /// Subscription count carried by acknowledgement events.
    pub fn subscription_count(&self) -> Option<i64> {
        match self {
            PubSubEvent::Subscribe { count, .. }
            | PubSubEvent::Unsubscribe { count, .. }
            | PubSubEvent::PSubscribe { count, .. }
            | PubSubEvent::PUnsubscribe { count, .. } => Some(*count),
            PubSubEvent::Message { .. } | PubSubEvent::PMessage { .. } => None,
        }
    }

    fn deliver(&self, listener: &dyn SubscriptionListener) {
        match self {
            PubSubEvent::Subscribe { channel, count } => listener.on_subscribe(channel, *count),
            PubSubEvent::Unsubscribe { channel, count } => listener.on_unsubscribe(channel, *count),
            PubSubEvent::PSubscribe { pattern, count } => listener.on_psubscribe(pattern, *count),
            PubSubEvent::PUnsubscribe { pattern, count } => {
                listener.on_punsubscribe(pattern, *count)
            }
            PubSubEvent::Message { channel, payload } => listener.on_message(channel, payload),
            PubSubEvent::PMessage {
                pattern,
                channel,
                payload,
            } => listener.on_pmessage(pattern, channel, payload),
        }
    }
}

type Listeners = ListenerRegistry<dyn SubscriptionListener>;

/// Connection dedicated to pub/sub with a background dispatch thread.
///
/// Only the subscription commands are available; the server rejects
/// ordinary commands on a subscribed connection anyway.
pub struct SubscriptionConnection {
    id: ConnectionId,
    conn: Mutex<Connection>,
    listeners: Arc<Listeners>,
    subscriptions: Arc<AtomicI64>,
    closing: Arc<AtomicBool>,
    thread: DispatchThread,
}

impl SubscriptionConnection {
    /// Opens the connection and starts its dispatch thread.
    pub fn open(endpoint: Arc<Endpoint>) -> RkvResult<Self> {
        let mut conn = Connection::open(endpoint)?;
        // Silence on a push feed is normal, so reads block indefinitely.
        conn.set_read_timeout(None)?;
        let reader = conn.take_reader()?;
        let id = conn.id();

        let listeners = Arc::new(Listeners::new());
        let subscriptions = Arc::new(AtomicI64::new(0));
        let closing = Arc::new(AtomicBool::new(false));

        let feed = SubscriptionFeed {
            id,
            reader,
            listeners: Arc::clone(&listeners),
            subscriptions: Arc::clone(&subscriptions),
            closing: Arc::clone(&closing),
        };
        let thread = DispatchThread::spawn(format!("rkv-pubsub-{}", id.as_u64()), move || {
            feed.run()
        })?;

        Ok(SubscriptionConnection {
            id,
            conn: Mutex::new(conn),
            listeners,
            subscriptions,
            closing,
            thread,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Returns true when the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn subscribe<C: AsRef<[u8]>>(&self, channels: &[C]) -> RkvResult<()> {
        self.send(b"SUBSCRIBE", channels)
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    pub fn unsubscribe<C: AsRef<[u8]>>(&self, channels: &[C]) -> RkvResult<()> {
        self.send(b"UNSUBSCRIBE", channels)
    }

    pub fn psubscribe<P: AsRef<[u8]>>(&self, patterns: &[P]) -> RkvResult<()> {
        self.send(b"PSUBSCRIBE", patterns)
    }

    /// Unsubscribes from `patterns`, or from every pattern when empty.
    pub fn punsubscribe<P: AsRef<[u8]>>(&self, patterns: &[P]) -> RkvResult<()> {
        self.send(b"PUNSUBSCRIBE", patterns)
    }

    /// Count from the most recent subscribe/unsubscribe acknowledgement.
    pub fn subscription_count(&self) -> i64 {
        self.subscriptions.load(Ordering::Acquire)
    }

    /// True while the dispatch thread is reading.
    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_closed()
    }

    /// Shuts the socket down and waits for the dispatch thread to exit.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.conn.lock().close();
        self.thread.join();
    }

    fn send<A: AsRef<[u8]>>(&self, command: &[u8], names: &[A]) -> RkvResult<()> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(1 + names.len());
        args.push(command);
        args.extend(names.iter().map(|name| name.as_ref()));
        debug!(
            id = %self.id,
            command = %String::from_utf8_lossy(command),
            count = names.len(),
            "pubsub request"
        );
        self.conn.lock().send(&args)
    }
}

impl Drop for SubscriptionConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// State moved onto the dispatch thread.
struct SubscriptionFeed {
    id: ConnectionId,
    reader: StreamReader,
    listeners: Arc<Listeners>,
    subscriptions: Arc<AtomicI64>,
    closing: Arc<AtomicBool>,
}

impl SubscriptionFeed {
    fn run(mut self) {
        loop {
            match self.reader.read_value() {
                Ok(RedisValue::Array(Some(items))) if items.is_empty() => {
                    debug!(id = %self.id, "empty push, stopping dispatch");
                    break;
                }
                Ok(RedisValue::Array(Some(items))) => self.handle_push(items),
                Ok(RedisValue::Error(message)) => {
                    let err = RkvError::Server(message);
                    warn!(id = %self.id, error = %err, "server error on subscription connection");
                    self.listeners.notify(|listener| listener.on_error(&err));
                }
                Ok(other) => {
                    debug!(id = %self.id, kind = %other.kind(), "ignoring non-array push");
                }
                Err(RkvError::Closed) => break,
                Err(err) => {
                    if !self.closing.load(Ordering::Acquire) {
                        error!(id = %self.id, error = %err, "subscription feed failed");
                        self.listeners.notify(|listener| listener.on_error(&err));
                    }
                    break;
                }
            }
        }
        debug!(id = %self.id, "subscription dispatch thread exiting");
    }

    fn handle_push(&self, items: Vec<RedisValue>) {
        match PubSubEvent::from_items(items) {
            Ok(Some(event)) => {
                if let Some(count) = event.subscription_count() {
                    self.subscriptions.store(count, Ordering::Release);
                }
                self.listeners.notify(|listener| event.deliver(listener));
            }
            Ok(None) => debug!(id = %self.id, "ignoring unknown push kind"),
            Err(err) => {
                warn!(id = %self.id, error = %err, "malformed pub/sub push");
                self.listeners.notify(|listener| listener.on_error(&err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(items: &[RedisValue]) -> Vec<RedisValue> {
        items.to_vec()
    }

    #[test]
    fn test_decodes_acknowledgements() {
        let event = PubSubEvent::from_items(push(&[
            "subscribe".into(),
            "news".into(),
            RedisValue::Integer(1),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            PubSubEvent::Subscribe {
                channel: "news".into(),
                count: 1
            }
        );
        assert_eq!(event.subscription_count(), Some(1));
    }

    #[test]
    fn test_decodes_null_unsubscribe_channel() {
        let event = PubSubEvent::from_items(push(&[
            "unsubscribe".into(),
            RedisValue::BulkString(None),
            RedisValue::Integer(0),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            PubSubEvent::Unsubscribe {
                channel: String::new(),
                count: 0
            }
        );
    }

    #[test]
    fn test_decodes_pattern_message() {
        let event = PubSubEvent::from_items(push(&[
            "pmessage".into(),
            "news.*".into(),
            "news.tech".into(),
            RedisValue::bulk(&b"a\r\nb"[..]),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            PubSubEvent::PMessage {
                pattern: "news.*".into(),
                channel: "news.tech".into(),
                payload: Bytes::from_static(b"a\r\nb"),
            }
        );
        assert_eq!(event.subscription_count(), None);
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let event = PubSubEvent::from_items(push(&["pong".into(), "".into()])).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_non_string_kind_is_ignored() {
        let integer = PubSubEvent::from_items(push(&[
            RedisValue::Integer(7),
            "x".into(),
            RedisValue::Integer(1),
        ]));
        assert_eq!(integer.unwrap(), None);

        let null = PubSubEvent::from_items(push(&[
            RedisValue::BulkString(None),
            "x".into(),
            RedisValue::Integer(1),
        ]));
        assert_eq!(null.unwrap(), None);

        let nested = PubSubEvent::from_items(push(&[RedisValue::array(vec![]), "x".into()]));
        assert_eq!(nested.unwrap(), None);
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let result = PubSubEvent::from_items(push(&["message".into(), "news".into()]));
        assert!(matches!(result, Err(RkvError::Protocol(_))));
    }
}
