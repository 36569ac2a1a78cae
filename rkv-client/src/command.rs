//! # Command Connection
//!
//! Purpose: Expose a compact, blocking request/reply API over one
//! `Connection`: every call writes one command and reads exactly one reply.
//!
//! ## Design Principles
//! 1. **Borrow-Friendly API**: Keys and values are `AsRef<[u8]>` so callers
//!    pass `&str`, `String`, `Vec<u8>` or `Bytes` without copies.
//! 2. **Typed Projections**: Each command maps its reply through the
//!    `RedisValue::into_*` helpers; shape mismatches name both sides.
//! 3. **Reconnect When Closed**: A connection closed by an earlier failure is
//!    reopened before the next command. Failed commands are never resent.
//! 4. **Server Errors**: Raised for commands that promise a result; `eval`
//!    hands them back as `RedisValue::Error` instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rkv_common::{RedisValue, RkvError, RkvResult, ValueKind};

use crate::connection::{Connection, ConnectionId};
use crate::endpoint::Endpoint;

/// TTL state returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Standard request/reply connection.
#[derive(Debug)]
pub struct CommandConnection {
    conn: Connection,
}

impl From<Connection> for CommandConnection {
    fn from(conn: Connection) -> Self {
        CommandConnection { conn }
    }
}

impl CommandConnection {
    /// Opens and authenticates a new connection.
    pub fn open(endpoint: Arc<Endpoint>) -> RkvResult<Self> {
        Ok(CommandConnection {
            conn: Connection::open(endpoint)?,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access to the underlying connection, e.g. to close it.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    /// Reconnects if the connection is not currently open.
    pub fn ensure_connected(&mut self) -> RkvResult<()> {
        if !self.conn.is_connected() {
            self.conn.connect()?;
        }
        Ok(())
    }

    /// Executes an arbitrary command and returns the raw reply.
    ///
    /// `-` replies come back as `RedisValue::Error`.
    pub fn execute<A: AsRef<[u8]>>(&mut self, args: &[A]) -> RkvResult<RedisValue> {
        self.ensure_connected()?;
        self.conn.execute(args)
    }

    /// Like `execute`, but a `-` reply becomes `RkvError::Server`.
    pub fn execute_checked<A: AsRef<[u8]>>(&mut self, args: &[A]) -> RkvResult<RedisValue> {
        self.execute(args)?.into_server_result()
    }

    // --- connection ---

    /// Pings the server. Returns the status text (normally `PONG`).
    pub fn ping(&mut self) -> RkvResult<String> {
        self.execute(&["PING"])?.into_string()
    }

    pub fn echo<M: AsRef<[u8]>>(&mut self, message: M) -> RkvResult<Bytes> {
        let reply = self.execute(&[b"ECHO".as_slice(), message.as_ref()])?;
        reply.into_bulk()?.ok_or(RkvError::UnexpectedReply {
            expected: ValueKind::BulkString,
            actual: ValueKind::NullBulkString,
        })
    }

    pub fn select(&mut self, db: i64) -> RkvResult<()> {
        let db = db.to_string();
        self.execute(&["SELECT", db.as_str()])?.into_ok()
    }

    /// Sends `QUIT` and closes the socket.
    pub fn quit(&mut self) -> RkvResult<()> {
        let reply = self.execute(&["QUIT"]);
        self.conn.close();
        reply?.into_ok()
    }

    // --- strings ---

    /// Fetches a value by key; `None` when the key is missing.
    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<Option<Bytes>> {
        self.execute(&[b"GET".as_slice(), key.as_ref()])?.into_bulk()
    }

    pub fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> RkvResult<()> {
        self.execute(&[b"SET".as_slice(), key.as_ref(), value.as_ref()])?
            .into_ok()
    }

    /// Sets a value with an expiration in whole seconds.
    pub fn set_ex<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
        ttl: Duration,
    ) -> RkvResult<()> {
        let seconds = ttl.as_secs().to_string();
        self.execute(&[
            b"SET".as_slice(),
            key.as_ref(),
            value.as_ref(),
            b"EX".as_slice(),
            seconds.as_bytes(),
        ])?
        .into_ok()
    }

    /// Sets only if the key does not exist. Returns true when set.
    pub fn setnx<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> RkvResult<bool> {
        let reply = self.execute(&[b"SETNX".as_slice(), key.as_ref(), value.as_ref()])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn getset<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
    ) -> RkvResult<Option<Bytes>> {
        self.execute(&[b"GETSET".as_slice(), key.as_ref(), value.as_ref()])?
            .into_bulk()
    }

    pub fn mget<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> RkvResult<Vec<Option<Bytes>>> {
        let args = with_prefix(b"MGET", keys);
        self.execute(&args)?.into_bulk_array()
    }

    pub fn mset<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, pairs: &[(K, V)]) -> RkvResult<()> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(1 + pairs.len() * 2);
        args.push(b"MSET");
        for (key, value) in pairs {
            args.push(key.as_ref());
            args.push(value.as_ref());
        }
        self.execute(&args)?.into_ok()
    }

    pub fn incr<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"INCR".as_slice(), key.as_ref()])?.into_integer()
    }

    pub fn incr_by<K: AsRef<[u8]>>(&mut self, key: K, delta: i64) -> RkvResult<i64> {
        let delta = delta.to_string();
        self.execute(&[b"INCRBY".as_slice(), key.as_ref(), delta.as_bytes()])?
            .into_integer()
    }

    pub fn decr<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"DECR".as_slice(), key.as_ref()])?.into_integer()
    }

    pub fn decr_by<K: AsRef<[u8]>>(&mut self, key: K, delta: i64) -> RkvResult<i64> {
        let delta = delta.to_string();
        self.execute(&[b"DECRBY".as_slice(), key.as_ref(), delta.as_bytes()])?
            .into_integer()
    }

    /// Appends to a string value. Returns the new length.
    pub fn append<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> RkvResult<i64> {
        self.execute(&[b"APPEND".as_slice(), key.as_ref(), value.as_ref()])?
            .into_integer()
    }

    pub fn strlen<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"STRLEN".as_slice(), key.as_ref()])?.into_integer()
    }

    // --- keys ---

    /// Deletes keys. Returns how many existed.
    pub fn del<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> RkvResult<i64> {
        let args = with_prefix(b"DEL", keys);
        self.execute(&args)?.into_integer()
    }

    pub fn exists<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<bool> {
        let reply = self.execute(&[b"EXISTS".as_slice(), key.as_ref()])?;
        Ok(reply.into_integer()? > 0)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire<K: AsRef<[u8]>>(&mut self, key: K, ttl: Duration) -> RkvResult<bool> {
        let seconds = ttl.as_secs().to_string();
        let reply = self.execute(&[b"EXPIRE".as_slice(), key.as_ref(), seconds.as_bytes()])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn ttl<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<KeyTtl> {
        match self.execute(&[b"TTL".as_slice(), key.as_ref()])?.into_integer()? {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::NoExpiry),
            secs if secs >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(secs as u64))),
            other => Err(RkvError::protocol(format!("invalid TTL reply {}", other))),
        }
    }

    /// Removes an expiration. Returns true when one was removed.
    pub fn persist<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<bool> {
        let reply = self.execute(&[b"PERSIST".as_slice(), key.as_ref()])?;
        Ok(reply.into_integer()? == 1)
    }

    /// Returns the value type name (`string`, `hash`, ... or `none`).
    pub fn key_type<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<String> {
        self.execute(&[b"TYPE".as_slice(), key.as_ref()])?.into_string()
    }

    pub fn rename<K: AsRef<[u8]>, N: AsRef<[u8]>>(&mut self, key: K, new_key: N) -> RkvResult<()> {
        self.execute(&[b"RENAME".as_slice(), key.as_ref(), new_key.as_ref()])?
            .into_ok()
    }

    /// Blocking full keyspace match; prefer `scan` on large databases.
    pub fn keys(&mut self, pattern: &str) -> RkvResult<Vec<String>> {
        self.execute(&["KEYS", pattern])?.into_string_array()
    }

    // --- hashes ---

    /// Returns true when the field is new.
    pub fn hset<K: AsRef<[u8]>, F: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        field: F,
        value: V,
    ) -> RkvResult<bool> {
        let reply = self.execute(&[
            b"HSET".as_slice(),
            key.as_ref(),
            field.as_ref(),
            value.as_ref(),
        ])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn hget<K: AsRef<[u8]>, F: AsRef<[u8]>>(
        &mut self,
        key: K,
        field: F,
    ) -> RkvResult<Option<Bytes>> {
        self.execute(&[b"HGET".as_slice(), key.as_ref(), field.as_ref()])?
            .into_bulk()
    }

    pub fn hdel<K: AsRef<[u8]>, F: AsRef<[u8]>>(&mut self, key: K, fields: &[F]) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"HDEL".as_slice(), key.as_ref()];
        args.extend(fields.iter().map(|field| field.as_ref()));
        self.execute(&args)?.into_integer()
    }

    /// All field/value pairs in server order.
    pub fn hgetall<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<Vec<(String, Bytes)>> {
        let items = self
            .execute(&[b"HGETALL".as_slice(), key.as_ref()])?
            .into_array()?
            .unwrap_or_default();
        if items.len() % 2 != 0 {
            return Err(RkvError::protocol("HGETALL returned an odd number of elements"));
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            let value = value.into_bulk()?.unwrap_or_default();
            pairs.push((field.into_string()?, value));
        }
        Ok(pairs)
    }

    pub fn hexists<K: AsRef<[u8]>, F: AsRef<[u8]>>(&mut self, key: K, field: F) -> RkvResult<bool> {
        let reply = self.execute(&[b"HEXISTS".as_slice(), key.as_ref(), field.as_ref()])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn hlen<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"HLEN".as_slice(), key.as_ref()])?.into_integer()
    }

    // --- lists ---

    pub fn lpush<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        values: &[V],
    ) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"LPUSH".as_slice(), key.as_ref()];
        args.extend(values.iter().map(|value| value.as_ref()));
        self.execute(&args)?.into_integer()
    }

    pub fn rpush<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        values: &[V],
    ) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"RPUSH".as_slice(), key.as_ref()];
        args.extend(values.iter().map(|value| value.as_ref()));
        self.execute(&args)?.into_integer()
    }

    pub fn lpop<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<Option<Bytes>> {
        self.execute(&[b"LPOP".as_slice(), key.as_ref()])?.into_bulk()
    }

    pub fn rpop<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<Option<Bytes>> {
        self.execute(&[b"RPOP".as_slice(), key.as_ref()])?.into_bulk()
    }

    pub fn llen<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"LLEN".as_slice(), key.as_ref()])?.into_integer()
    }

    pub fn lrange<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        start: i64,
        stop: i64,
    ) -> RkvResult<Vec<Bytes>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        let items = self
            .execute(&[b"LRANGE".as_slice(), key.as_ref(), start.as_bytes(), stop.as_bytes()])?
            .into_bulk_array()?;
        Ok(items.into_iter().flatten().collect())
    }

    // --- sets ---

    pub fn sadd<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        members: &[M],
    ) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"SADD".as_slice(), key.as_ref()];
        args.extend(members.iter().map(|member| member.as_ref()));
        self.execute(&args)?.into_integer()
    }

    pub fn srem<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        members: &[M],
    ) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"SREM".as_slice(), key.as_ref()];
        args.extend(members.iter().map(|member| member.as_ref()));
        self.execute(&args)?.into_integer()
    }

    pub fn smembers<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<Vec<String>> {
        self.execute(&[b"SMEMBERS".as_slice(), key.as_ref()])?
            .into_string_array()
    }

    pub fn sismember<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        member: M,
    ) -> RkvResult<bool> {
        let reply = self.execute(&[b"SISMEMBER".as_slice(), key.as_ref(), member.as_ref()])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn scard<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"SCARD".as_slice(), key.as_ref()])?.into_integer()
    }

    // --- sorted sets ---

    /// Returns true when the member is new.
    pub fn zadd<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        score: f64,
        member: M,
    ) -> RkvResult<bool> {
        let score = score.to_string();
        let reply = self.execute(&[
            b"ZADD".as_slice(),
            key.as_ref(),
            score.as_bytes(),
            member.as_ref(),
        ])?;
        Ok(reply.into_integer()? == 1)
    }

    pub fn zrem<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        members: &[M],
    ) -> RkvResult<i64> {
        let mut args: Vec<&[u8]> = vec![b"ZREM".as_slice(), key.as_ref()];
        args.extend(members.iter().map(|member| member.as_ref()));
        self.execute(&args)?.into_integer()
    }

    pub fn zscore<K: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        key: K,
        member: M,
    ) -> RkvResult<Option<f64>> {
        let reply = self.execute(&[b"ZSCORE".as_slice(), key.as_ref(), member.as_ref()])?;
        match reply.into_bulk()? {
            None => Ok(None),
            Some(raw) => parse_score(&raw).map(Some),
        }
    }

    pub fn zrange<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        start: i64,
        stop: i64,
    ) -> RkvResult<Vec<String>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.execute(&[b"ZRANGE".as_slice(), key.as_ref(), start.as_bytes(), stop.as_bytes()])?
            .into_string_array()
    }

    pub fn zcard<K: AsRef<[u8]>>(&mut self, key: K) -> RkvResult<i64> {
        self.execute(&[b"ZCARD".as_slice(), key.as_ref()])?.into_integer()
    }

    // --- pub/sub, scripting, server ---

    /// Publishes a message. Returns the number of receiving subscribers.
    pub fn publish<C: AsRef<[u8]>, M: AsRef<[u8]>>(
        &mut self,
        channel: C,
        message: M,
    ) -> RkvResult<i64> {
        self.execute(&[b"PUBLISH".as_slice(), channel.as_ref(), message.as_ref()])?
            .into_integer()
    }

    /// Evaluates a Lua script.
    ///
    /// Script failures are returned as `RedisValue::Error` rather than raised,
    /// since a failing script is an expected outcome for this call.
    pub fn eval<K: AsRef<[u8]>, A: AsRef<[u8]>>(
        &mut self,
        script: &str,
        keys: &[K],
        args: &[A],
    ) -> RkvResult<RedisValue> {
        let numkeys = keys.len().to_string();
        let mut command: Vec<&[u8]> = Vec::with_capacity(3 + keys.len() + args.len());
        command.push(b"EVAL");
        command.push(script.as_bytes());
        command.push(numkeys.as_bytes());
        command.extend(keys.iter().map(|key| key.as_ref()));
        command.extend(args.iter().map(|arg| arg.as_ref()));
        self.execute(&command)
    }

    pub fn dbsize(&mut self) -> RkvResult<i64> {
        self.execute(&["DBSIZE"])?.into_integer()
    }

    pub fn flushdb(&mut self) -> RkvResult<()> {
        self.execute(&["FLUSHDB"])?.into_ok()
    }

    /// Fetches server INFO output.
    pub fn info(&mut self) -> RkvResult<String> {
        self.execute(&["INFO"])?.into_string()
    }
}

fn with_prefix<'a, K: AsRef<[u8]>>(command: &'a [u8], rest: &'a [K]) -> Vec<&'a [u8]> {
    let mut args = Vec::with_capacity(1 + rest.len());
    args.push(command);
    args.extend(rest.iter().map(|item| item.as_ref()));
    args
}

fn parse_score(raw: &[u8]) -> RkvResult<f64> {
    let text = std::str::from_utf8(raw).map_err(|_| RkvError::protocol("score is not UTF-8"))?;
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse()
            .map_err(|_| RkvError::protocol(format!("invalid score {:?}", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_prefix() {
        let args = with_prefix(b"DEL", &["a", "b"]);
        assert_eq!(args, vec![&b"DEL"[..], &b"a"[..], &b"b"[..]]);
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score(b"1.5").unwrap(), 1.5);
        assert_eq!(parse_score(b"-inf").unwrap(), f64::NEG_INFINITY);
        assert!(parse_score(b"abc").is_err());
    }
}
