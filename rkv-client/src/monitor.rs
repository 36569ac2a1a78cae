//! # Monitor Connection
//!
//! Purpose: Stream the server's `MONITOR` feed to listeners as typed
//! `MonitorEvent`s, parsed on a background thread.
//!
//! ## Line Format
//!
//! ```text
//! 1339518083.107412 [0 127.0.0.1:60866] "keys" "*"
//! <secs>.<micros>   [<db> <addr>:<port>] "<command>" "<arg>"...
//! ```
//!
//! The parser is a single forward pass over the characters. Inside quotes a
//! backslash takes the next character literally.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use rkv_common::{RkvError, RkvResult};

use crate::connection::{Connection, ConnectionId, StreamReader};
use crate::dispatch::{DispatchThread, ListenerId, ListenerRegistry};
use crate::endpoint::Endpoint;

/// One command observed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    pub server_time: SystemTime,
    pub db_id: i32,
    pub source_addr: String,
    pub source_port: u16,
    pub command: String,
    pub arguments: Vec<String>,
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let since_epoch = self
            .server_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        write!(
            f,
            "{}.{:06} [{} {}:{}] {:?}",
            since_epoch.as_secs(),
            since_epoch.subsec_micros(),
            self.db_id,
            self.source_addr,
            self.source_port,
            self.command
        )?;
        for arg in &self.arguments {
            write!(f, " {:?}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Seconds,
    Micros,
    OpenBracket,
    Db,
    Addr,
    Port,
    BeforeCommand,
    Quoted,
    Escape,
    AfterQuote,
    BeforeArgument,
}

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Parses one monitor line (without the CRLF or the leading `+`).
pub fn parse_monitor_line(line: &str) -> RkvResult<MonitorEvent> {
    let mut state = ParseState::Seconds;
    let mut secs: u64 = 0;
    let mut micros: u64 = 0;
    let mut db: i32 = 0;
    let mut port: u16 = 0;
    let mut digits = 0usize;
    let mut addr = String::new();
    let mut current = String::new();
    let mut command: Option<String> = None;
    let mut arguments = Vec::new();

    for (index, ch) in line.chars().enumerate() {
        let column = index + 1;
        let fail = |reason: &str| RkvError::MonitorParse {
            column,
            reason: reason.to_string(),
        };

        state = match (state, ch) {
            (ParseState::Seconds, '0'..='9') => {
                secs = secs
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit(ch)))
                    .ok_or_else(|| fail("timestamp seconds overflow"))?;
                digits += 1;
                ParseState::Seconds
            }
            (ParseState::Seconds, '.') if digits > 0 => {
                digits = 0;
                ParseState::Micros
            }
            (ParseState::Micros, '0'..='9') => {
                micros = micros * 10 + digit(ch);
                digits += 1;
                if digits > 6 || micros >= MICROS_PER_SECOND {
                    return Err(fail("microseconds out of range"));
                }
                ParseState::Micros
            }
            (ParseState::Micros, ' ') if digits > 0 => ParseState::OpenBracket,
            (ParseState::OpenBracket, '[') => {
                digits = 0;
                ParseState::Db
            }
            (ParseState::Db, '0'..='9') => {
                db = db
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit(ch) as i32))
                    .ok_or_else(|| fail("database id overflow"))?;
                digits += 1;
                ParseState::Db
            }
            (ParseState::Db, ' ') if digits > 0 => ParseState::Addr,
            (ParseState::Addr, c) if c.is_ascii_alphanumeric() || c == '.' => {
                addr.push(c);
                ParseState::Addr
            }
            (ParseState::Addr, ':') if !addr.is_empty() => {
                digits = 0;
                ParseState::Port
            }
            (ParseState::Port, '0'..='9') => {
                port = port
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit(ch) as u16))
                    .ok_or_else(|| fail("port out of range"))?;
                digits += 1;
                ParseState::Port
            }
            (ParseState::Port, ']') if digits > 0 => ParseState::BeforeCommand,
            (ParseState::BeforeCommand, ' ') => ParseState::BeforeCommand,
            (ParseState::BeforeCommand, '"') => ParseState::Quoted,
            (ParseState::Quoted, '\\') => ParseState::Escape,
            (ParseState::Quoted, '"') => {
                let token = std::mem::take(&mut current);
                match command {
                    None => command = Some(token),
                    Some(_) => arguments.push(token),
                }
                ParseState::AfterQuote
            }
            (ParseState::Quoted, c) | (ParseState::Escape, c) => {
                current.push(c);
                ParseState::Quoted
            }
            (ParseState::AfterQuote, ' ') | (ParseState::BeforeArgument, ' ') => {
                ParseState::BeforeArgument
            }
            (ParseState::BeforeArgument, '"') => ParseState::Quoted,
            (state, _) => return Err(fail(unexpected_in(state))),
        };
    }

    if state != ParseState::AfterQuote {
        return Err(RkvError::MonitorParse {
            column: line.chars().count() + 1,
            reason: format!("line ends {}", ending_in(state)),
        });
    }

    Ok(MonitorEvent {
        server_time: UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros),
        db_id: db,
        source_addr: addr,
        source_port: port,
        command: command.unwrap_or_default(),
        arguments,
    })
}

fn digit(ch: char) -> u64 {
    u64::from(ch) - u64::from('0')
}

fn unexpected_in(state: ParseState) -> &'static str {
    match state {
        ParseState::Seconds => "expected digit or '.' in timestamp seconds",
        ParseState::Micros => "expected digit or ' ' in timestamp microseconds",
        ParseState::OpenBracket => "expected '['",
        ParseState::Db => "expected digit or ' ' in database id",
        ParseState::Addr => "expected alphanumeric, '.' or ':' in client address",
        ParseState::Port => "expected digit or ']' in client port",
        ParseState::BeforeCommand => "expected '\"' before command",
        ParseState::Quoted | ParseState::Escape => "unexpected character in quoted string",
        ParseState::AfterQuote => "expected ' ' after closing quote",
        ParseState::BeforeArgument => "expected '\"' before argument",
    }
}

fn ending_in(state: ParseState) -> &'static str {
    match state {
        ParseState::Quoted | ParseState::Escape => "inside an unterminated quote",
        ParseState::BeforeCommand => "before the command",
        ParseState::BeforeArgument => "with trailing whitespace",
        _ => "before the client section is complete",
    }
}

/// Receives monitor events on the dispatch thread.
pub trait MonitorListener: Send + Sync {
    fn on_event(&self, event: &MonitorEvent);

    /// A line that did not parse. Reading continues with the next line.
    fn on_parse_error(&self, _line: &str, _error: &RkvError) {}

    /// The feed failed and the dispatch thread is exiting.
    fn on_error(&self, _error: &RkvError) {}
}

type Listeners = ListenerRegistry<dyn MonitorListener>;

/// Connection switched into `MONITOR` mode.
pub struct MonitorConnection {
    id: ConnectionId,
    conn: Mutex<Connection>,
    listeners: Arc<Listeners>,
    closing: Arc<AtomicBool>,
    thread: DispatchThread,
}

impl MonitorConnection {
    /// Opens a connection, enters `MONITOR` mode and starts the reader thread.
    pub fn open(endpoint: Arc<Endpoint>) -> RkvResult<Self> {
        let mut conn = Connection::open(endpoint)?;
        conn.execute(&["MONITOR"])?.into_ok()?;
        conn.set_read_timeout(None)?;
        let reader = conn.take_reader()?;
        let id = conn.id();
        debug!(id = %id, endpoint = %conn.endpoint(), "monitor mode enabled");

        let listeners = Arc::new(Listeners::new());
        let closing = Arc::new(AtomicBool::new(false));
        let feed = MonitorFeed {
            id,
            reader,
            listeners: Arc::clone(&listeners),
            closing: Arc::clone(&closing),
        };
        let thread =
            DispatchThread::spawn(format!("rkv-monitor-{}", id.as_u64()), move || feed.run())?;

        Ok(MonitorConnection {
            id,
            conn: Mutex::new(conn),
            listeners,
            closing,
            thread,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn add_listener(&self, listener: Arc<dyn MonitorListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_closed()
    }

    /// Shuts the socket down and waits for the reader thread to exit.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.conn.lock().close();
        self.thread.join();
    }
}

impl Drop for MonitorConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct MonitorFeed {
    id: ConnectionId,
    reader: StreamReader,
    listeners: Arc<Listeners>,
    closing: Arc<AtomicBool>,
}

impl MonitorFeed {
    fn run(mut self) {
        loop {
            let line = match self.reader.read_line() {
                Ok(line) => line,
                Err(RkvError::Closed) => break,
                Err(err) => {
                    if !self.closing.load(Ordering::Acquire) {
                        error!(id = %self.id, error = %err, "monitor feed failed");
                        self.listeners.notify(|listener| listener.on_error(&err));
                    }
                    break;
                }
            };

            let text = line.strip_prefix('+').unwrap_or(&line);
            match parse_monitor_line(text) {
                Ok(event) => self.listeners.notify(|listener| listener.on_event(&event)),
                Err(err) => {
                    warn!(id = %self.id, line = %text, error = %err, "malformed monitor line");
                    self.listeners
                        .notify(|listener| listener.on_parse_error(text, &err));
                }
            }
        }
        debug!(id = %self.id, "monitor thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_of(err: RkvError) -> usize {
        match err {
            RkvError::MonitorParse { column, .. } => column,
            other => panic!("expected monitor parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_parses_documented_line() {
        let event =
            parse_monitor_line(r#"1339518083.107412 [0 127.0.0.1:60866] "keys" "*""#).unwrap();
        assert_eq!(
            event.server_time,
            UNIX_EPOCH + Duration::from_secs(1339518083) + Duration::from_micros(107412)
        );
        assert_eq!(event.db_id, 0);
        assert_eq!(event.source_addr, "127.0.0.1");
        assert_eq!(event.source_port, 60866);
        assert_eq!(event.command, "keys");
        assert_eq!(event.arguments, vec!["*"]);
    }

    #[test]
    fn test_parses_command_without_arguments() {
        let event = parse_monitor_line(r#"1.000001 [15 localhost:1]  "ping""#).unwrap();
        assert_eq!(event.db_id, 15);
        assert_eq!(event.source_addr, "localhost");
        assert_eq!(event.command, "ping");
        assert!(event.arguments.is_empty());
    }

    #[test]
    fn test_escapes_are_literal() {
        let event =
            parse_monitor_line(r#"1.5 [0 10.0.0.1:7000] "set" "a\"b" "c\\d" "x y""#).unwrap();
        assert_eq!(event.arguments, vec!["a\"b", "c\\d", "x y"]);
    }

    #[test]
    fn test_display_matches_wire_shape() {
        let line = r#"1339518083.107412 [0 127.0.0.1:60866] "keys" "*""#;
        assert_eq!(parse_monitor_line(line).unwrap().to_string(), line);
    }

    #[test]
    fn test_rejects_bad_address_character() {
        let err = parse_monitor_line(r#"1.0 [0 127.0.0.1/x:1] "get""#).unwrap_err();
        assert_eq!(column_of(err), 17);
    }

    #[test]
    fn test_rejects_unterminated_quote() {
        let line = r#"1.0 [0 h:1] "get" "ke"#;
        let err = parse_monitor_line(line).unwrap_err();
        assert_eq!(column_of(err), line.len() + 1);
    }

    #[test]
    fn test_rejects_out_of_range_micros() {
        assert!(parse_monitor_line(r#"1.1000000 [0 h:1] "get""#).is_err());
        assert!(parse_monitor_line(r#"1.999999 [0 h:1] "get""#).is_ok());
    }

    #[test]
    fn test_rejects_structural_errors() {
        for line in [
            "",
            ".5 [0 h:1] \"get\"",
            "1.5 0 h:1] \"get\"",
            "1.5 [0 h:] \"get\"",
            "1.5 [0 h:1] get",
            "1.5 [0 h:1] \"get\"\"x\"",
            "1.5 [0 h:1] \"get\" ",
            "1.5 [0 h:70000] \"get\"",
        ] {
            assert!(parse_monitor_line(line).is_err(), "accepted {:?}", line);
        }
    }
}
