#![allow(dead_code)]

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rkv_client::{Endpoint, RedisValue};
use rkv_common::RespReader;

/// Server side of one accepted mock connection.
pub struct ServerConn {
    stream: TcpStream,
    reader: RespReader<BufReader<TcpStream>>,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let reader = RespReader::new(BufReader::new(stream.try_clone().expect("clone")));
        ServerConn { stream, reader }
    }

    /// Next command from the client, `None` once it disconnects or sends
    /// something other than an array of bulk strings.
    pub fn read_command(&mut self) -> Option<Vec<Vec<u8>>> {
        let items = self.reader.read_value().ok()?.into_array().ok()??;
        items
            .into_iter()
            .map(|item| Some(item.into_bulk().ok()??.to_vec()))
            .collect()
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        let _ = self.stream.write_all(data);
        let _ = self.stream.flush();
    }

    pub fn write_value(&mut self, value: &RedisValue) {
        let mut buf = BytesMut::new();
        rkv_common::encode_value(value, &mut buf);
        self.write_raw(&buf);
    }

    pub fn write_simple(&mut self, msg: &str) {
        self.write_raw(format!("+{}\r\n", msg).as_bytes());
    }

    pub fn write_error(&mut self, msg: &str) {
        self.write_raw(format!("-{}\r\n", msg).as_bytes());
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_raw(format!(":{}\r\n", value).as_bytes());
    }

    pub fn write_bulk(&mut self, data: &[u8]) {
        self.write_value(&RedisValue::bulk(data.to_vec()));
    }

    pub fn write_null(&mut self) {
        self.write_raw(b"$-1\r\n");
    }

    /// Writes a push array whose elements are bulk strings or integers.
    pub fn write_push(&mut self, items: &[PushItem<'_>]) {
        let items = items
            .iter()
            .map(|item| match item {
                PushItem::Text(text) => RedisValue::bulk(text.as_bytes().to_vec()),
                PushItem::Count(count) => RedisValue::Integer(*count),
            })
            .collect();
        self.write_value(&RedisValue::array(items));
    }
}

pub enum PushItem<'a> {
    Text(&'a str),
    Count(i64),
}

/// Accepts connections forever; each runs `handler(index, conn)` on its own thread.
pub fn spawn_server<F>(handler: F) -> Endpoint
where
    F: Fn(usize, ServerConn) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handler = Arc::new(handler);

    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else {
                continue;
            };
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler(index, ServerConn::new(stream)));
        }
    });

    Endpoint::new("127.0.0.1", port).with_timeout_ms(2_000)
}

/// Answers every command of every connection with `respond`.
pub fn spawn_responder<F>(respond: F) -> Endpoint
where
    F: Fn(&[Vec<u8>], &mut ServerConn) + Send + Sync + 'static,
{
    spawn_server(move |_, mut conn| {
        while let Some(args) = conn.read_command() {
            respond(&args, &mut conn);
        }
    })
}

/// Endpoint for a port nothing listens on.
pub fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    Endpoint::new("127.0.0.1", port).with_timeout_ms(500)
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
