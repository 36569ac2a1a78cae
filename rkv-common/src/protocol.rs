//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and decode server replies byte-exactly,
//! over any `BufRead`/`Write` pair.
//!
//! ## Design Principles
//! 1. **Prefix Dispatch**: The first byte of a line selects the decode path;
//!    arrays recurse into the same entry point.
//! 2. **Binary-Safe**: Bulk payloads are read by declared length, never by
//!    scanning for CRLF, so they may contain any byte.
//! 3. **Bounded Allocation**: Lengths above `MAX_BULK_LEN` are rejected
//!    before any buffer is reserved.
//! 4. **Fail Fast**: Invalid framing returns `RkvError::Protocol`; the caller
//!    is expected to drop the connection afterwards.
//!
//! ## Wire Format
//!
//! ```text
//! request:  *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
//! replies:  +OK\r\n   -ERR msg\r\n   :42\r\n
//!           $5\r\nhello\r\n   $-1\r\n
//!           *2\r\n:1\r\n:2\r\n   *-1\r\n
//! ```

use std::io::{self, BufRead, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RkvError, RkvResult};
use crate::value::RedisValue;

/// Largest bulk string or array length accepted from the server (512 MiB).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Arrays nested deeper than this are treated as hostile input.
pub const MAX_NESTING_DEPTH: usize = 512;

const CRLF: &[u8; 2] = b"\r\n";

/// Upper bound for up-front buffer reservations; larger payloads grow as
/// bytes actually arrive.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Encodes a command as a RESP array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_i64(out, args.len() as i64);
    out.put_slice(CRLF);
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_i64(out, arg.len() as i64);
        out.put_slice(CRLF);
        out.put_slice(arg);
        out.put_slice(CRLF);
    }
}

/// Encodes any value in its own wire form (integers as `:<n>`).
pub fn encode_value(value: &RedisValue, out: &mut BytesMut) {
    match value {
        RedisValue::Integer(n) => {
            out.put_u8(b':');
            push_i64(out, *n);
            out.put_slice(CRLF);
        }
        RedisValue::SimpleString(text) => {
            out.put_u8(b'+');
            out.put_slice(text.as_bytes());
            out.put_slice(CRLF);
        }
        RedisValue::Error(text) => {
            out.put_u8(b'-');
            out.put_slice(text.as_bytes());
            out.put_slice(CRLF);
        }
        RedisValue::BulkString(None) => out.put_slice(b"$-1\r\n"),
        RedisValue::BulkString(Some(data)) => {
            out.put_u8(b'$');
            push_i64(out, data.len() as i64);
            out.put_slice(CRLF);
            out.put_slice(data);
            out.put_slice(CRLF);
        }
        RedisValue::Array(None) => out.put_slice(b"*-1\r\n"),
        RedisValue::Array(Some(items)) => {
            out.put_u8(b'*');
            push_i64(out, items.len() as i64);
            out.put_slice(CRLF);
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Buffered RESP writer that reuses its encode buffer across commands.
pub struct RespWriter<W: Write> {
    inner: W,
    buf: BytesMut,
}

impl<W: Write> RespWriter<W> {
    pub fn new(inner: W) -> Self {
        RespWriter {
            inner,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Encodes and flushes one command.
    pub fn write_command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> RkvResult<()> {
        self.buf.clear();
        encode_command(args, &mut self.buf);
        self.flush_buf()
    }

    /// Encodes and flushes one arbitrary value.
    pub fn write_value(&mut self, value: &RedisValue) -> RkvResult<()> {
        self.buf.clear();
        encode_value(value, &mut self.buf);
        self.flush_buf()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn flush_buf(&mut self) -> RkvResult<()> {
        self.inner.write_all(&self.buf)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// RESP reader with a reusable line buffer.
pub struct RespReader<R: BufRead> {
    inner: R,
    line: Vec<u8>,
    line_limit: u64,
}

impl<R: BufRead> RespReader<R> {
    pub fn new(inner: R) -> Self {
        RespReader {
            inner,
            line: Vec::with_capacity(128),
            line_limit: MAX_BULK_LEN as u64,
        }
    }

    /// Caps a single line, CRLF included. Defaults to `MAX_BULK_LEN`.
    pub fn with_line_limit(mut self, limit: u64) -> Self {
        self.line_limit = limit.max(2);
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads one complete reply.
    ///
    /// A clean end of stream before the first byte is `RkvError::Closed`;
    /// running out of bytes inside a frame is a protocol error.
    pub fn read_value(&mut self) -> RkvResult<RedisValue> {
        if !self.next_line()? {
            return Err(RkvError::Closed);
        }
        self.decode_line(0)
    }

    /// Reads one raw CRLF-terminated line, without the terminator.
    ///
    /// Used by feeds that are line oriented rather than RESP framed.
    pub fn read_line(&mut self) -> RkvResult<String> {
        if !self.next_line()? {
            return Err(RkvError::Closed);
        }
        Ok(String::from_utf8_lossy(&self.line).into_owned())
    }

    /// Expects a `+OK` status.
    pub fn read_ok(&mut self) -> RkvResult<()> {
        self.read_value()?.into_ok()
    }

    pub fn read_integer(&mut self) -> RkvResult<i64> {
        self.read_value()?.into_integer()
    }

    pub fn read_integer_or_null(&mut self) -> RkvResult<Option<i64>> {
        self.read_value()?.into_integer_or_null()
    }

    pub fn read_bulk(&mut self) -> RkvResult<Option<Bytes>> {
        self.read_value()?.into_bulk()
    }

    pub fn read_string_array(&mut self) -> RkvResult<Vec<String>> {
        self.read_value()?.into_string_array()
    }

    fn read_nested(&mut self, depth: usize) -> RkvResult<RedisValue> {
        if depth > MAX_NESTING_DEPTH {
            return Err(RkvError::protocol("array nesting too deep"));
        }
        if !self.next_line()? {
            return Err(unexpected_eof());
        }
        self.decode_line(depth)
    }

    fn decode_line(&mut self, depth: usize) -> RkvResult<RedisValue> {
        let Some(&prefix) = self.line.first() else {
            return Err(RkvError::protocol("empty reply line"));
        };
        let rest = &self.line[1..];

        match prefix {
            b'+' => Ok(RedisValue::SimpleString(
                String::from_utf8_lossy(rest).into_owned(),
            )),
            b'-' => Ok(RedisValue::Error(String::from_utf8_lossy(rest).into_owned())),
            b':' => Ok(RedisValue::Integer(parse_i64(rest)?)),
            b'$' => {
                let len = parse_length(rest)?;
                self.read_bulk_payload(len)
            }
            b'*' => {
                let len = parse_length(rest)?;
                let Some(len) = len else {
                    return Ok(RedisValue::Array(None));
                };
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_nested(depth + 1)?);
                }
                Ok(RedisValue::Array(Some(items)))
            }
            other => Err(RkvError::protocol(format!(
                "unknown reply prefix 0x{:02x}",
                other
            ))),
        }
    }

    fn read_bulk_payload(&mut self, len: Option<usize>) -> RkvResult<RedisValue> {
        let Some(len) = len else {
            return Ok(RedisValue::BulkString(None));
        };

        let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
        let read = self.inner.by_ref().take(len as u64).read_to_end(&mut data)?;
        if read < len {
            return Err(unexpected_eof());
        }

        let mut crlf = [0u8; 2];
        self.inner.read_exact(&mut crlf).map_err(eof_as_protocol)?;
        if &crlf != CRLF {
            return Err(RkvError::protocol("bulk payload not followed by CRLF"));
        }

        Ok(RedisValue::BulkString(Some(Bytes::from(data))))
    }

    /// Fills the line buffer. Returns `Ok(false)` on a clean end of stream.
    fn next_line(&mut self) -> RkvResult<bool> {
        self.line.clear();
        let limit = self.line_limit;
        let bytes = (&mut self.inner).take(limit).read_until(b'\n', &mut self.line)?;
        if bytes == 0 {
            return Ok(false);
        }
        if self.line.last() != Some(&b'\n') {
            if bytes as u64 >= limit {
                return Err(RkvError::protocol(format!(
                    "line exceeds {} bytes without a terminator",
                    limit
                )));
            }
            return Err(unexpected_eof());
        }
        if self.line.len() < 2 || self.line[self.line.len() - 2] != b'\r' {
            return Err(RkvError::protocol("line not terminated by CRLF"));
        }
        self.line.truncate(self.line.len() - 2);
        Ok(true)
    }
}

fn unexpected_eof() -> RkvError {
    RkvError::protocol("unexpected end of stream inside a reply")
}

fn eof_as_protocol(err: io::Error) -> RkvError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        unexpected_eof()
    } else {
        RkvError::Io(err)
    }
}

/// Parses a bulk/array length: `None` for `-1`, bounded by `MAX_BULK_LEN`.
fn parse_length(data: &[u8]) -> RkvResult<Option<usize>> {
    let len = parse_i64(data)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(RkvError::protocol(format!("invalid length {}", len)));
    }
    if len > MAX_BULK_LEN {
        return Err(RkvError::protocol(format!(
            "length {} exceeds limit of {} bytes",
            len, MAX_BULK_LEN
        )));
    }
    Ok(Some(len as usize))
}

fn parse_i64(data: &[u8]) -> RkvResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(RkvError::protocol("empty integer"));
    }

    // Accumulate negatively so i64::MIN stays representable.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RkvError::protocol(format!(
                "unexpected byte 0x{:02x} in integer",
                b
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RkvError::protocol("integer overflow"))?;
    }

    if negative {
        Ok(value)
    } else {
        value
            .checked_neg()
            .ok_or_else(|| RkvError::protocol("integer overflow"))
    }
}

fn push_i64(out: &mut BytesMut, value: i64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut rest = value.unsigned_abs();
    if rest == 0 {
        buf[0] = b'0';
        len = 1;
    }
    while rest > 0 {
        buf[len] = b'0' + (rest % 10) as u8;
        rest /= 10;
        len += 1;
    }
    if value < 0 {
        out.put_u8(b'-');
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
