//! # Scan Cursors
//!
//! Incremental iteration over the keyspace (`SCAN`) and over hash, set and
//! sorted-set members (`HSCAN`, `SSCAN`, `ZSCAN`).
//!
//! Iteration is complete only when the server returns cursor `0`. A batch may
//! be empty while the cursor is still non-zero, so loops must test the cursor
//! and never the batch size.

use rkv_common::{RedisValue, RkvError, RkvResult};

use crate::command::CommandConnection;

/// One step of a scan: the cursor to resume from and the batch it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub cursor: u64,
    pub keys: Vec<String>,
}

impl Cursor {
    /// True once the server signalled the end of the iteration.
    pub fn is_complete(&self) -> bool {
        self.cursor == 0
    }

    /// Parses a `[cursor, [items...]]` scan reply.
    pub fn from_reply(reply: RedisValue) -> RkvResult<Self> {
        let items = match reply.into_array()? {
            Some(items) if items.len() == 2 => items,
            Some(items) => {
                return Err(RkvError::protocol(format!(
                    "scan reply has {} elements, expected 2",
                    items.len()
                )))
            }
            None => return Err(RkvError::protocol("scan reply is a null array")),
        };

        let mut items = items.into_iter();
        let (Some(cursor), Some(keys)) = (items.next(), items.next()) else {
            return Err(RkvError::protocol("scan reply truncated"));
        };

        let cursor = cursor.into_string()?;
        let cursor = cursor
            .parse::<u64>()
            .map_err(|_| RkvError::protocol(format!("invalid scan cursor {:?}", cursor)))?;
        Ok(Cursor {
            cursor,
            keys: keys.into_string_array()?,
        })
    }
}

/// Optional `MATCH` and `COUNT` arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub pattern: Option<String>,
    /// Batch-size hint; the server may return more or fewer.
    pub count: Option<usize>,
}

impl ScanOptions {
    pub fn matching(pattern: impl Into<String>) -> Self {
        ScanOptions {
            pattern: Some(pattern.into()),
            count: None,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// Which collection a scan walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget<'a> {
    Keys,
    Hash(&'a [u8]),
    Set(&'a [u8]),
    SortedSet(&'a [u8]),
}

impl ScanTarget<'_> {
    fn command(&self) -> &'static [u8] {
        match self {
            ScanTarget::Keys => b"SCAN",
            ScanTarget::Hash(_) => b"HSCAN",
            ScanTarget::Set(_) => b"SSCAN",
            ScanTarget::SortedSet(_) => b"ZSCAN",
        }
    }

    fn key(&self) -> Option<&[u8]> {
        match self {
            ScanTarget::Keys => None,
            ScanTarget::Hash(key) | ScanTarget::Set(key) | ScanTarget::SortedSet(key) => Some(*key),
        }
    }
}

impl CommandConnection {
    /// Runs one scan step against `target`, resuming from `cursor`.
    pub fn scan_step(
        &mut self,
        target: ScanTarget<'_>,
        cursor: u64,
        options: &ScanOptions,
    ) -> RkvResult<Cursor> {
        let cursor = cursor.to_string();
        let count = options.count.map(|count| count.to_string());

        let mut args: Vec<&[u8]> = Vec::with_capacity(7);
        args.push(target.command());
        if let Some(key) = target.key() {
            args.push(key);
        }
        args.push(cursor.as_bytes());
        if let Some(pattern) = &options.pattern {
            args.push(b"MATCH");
            args.push(pattern.as_bytes());
        }
        if let Some(count) = &count {
            args.push(b"COUNT");
            args.push(count.as_bytes());
        }

        Cursor::from_reply(self.execute(&args)?)
    }

    /// One `SCAN` step over the keyspace.
    pub fn scan(&mut self, cursor: u64, options: &ScanOptions) -> RkvResult<Cursor> {
        self.scan_step(ScanTarget::Keys, cursor, options)
    }

    /// One `HSCAN` step; the batch alternates field and value.
    pub fn hscan<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        cursor: u64,
        options: &ScanOptions,
    ) -> RkvResult<Cursor> {
        self.scan_step(ScanTarget::Hash(key.as_ref()), cursor, options)
    }

    pub fn sscan<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        cursor: u64,
        options: &ScanOptions,
    ) -> RkvResult<Cursor> {
        self.scan_step(ScanTarget::Set(key.as_ref()), cursor, options)
    }

    /// One `ZSCAN` step; the batch alternates member and score.
    pub fn zscan<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        cursor: u64,
        options: &ScanOptions,
    ) -> RkvResult<Cursor> {
        self.scan_step(ScanTarget::SortedSet(key.as_ref()), cursor, options)
    }

    /// Iterator over scan batches, ending after the step that returns `0`.
    pub fn scan_iter<'c>(
        &'c mut self,
        target: ScanTarget<'c>,
        options: ScanOptions,
    ) -> ScanIter<'c> {
        ScanIter {
            conn: self,
            target,
            options,
            cursor: 0,
            done: false,
        }
    }

    /// Walks the whole collection and collects every returned item.
    pub fn scan_all(
        &mut self,
        target: ScanTarget<'_>,
        options: &ScanOptions,
    ) -> RkvResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let step = self.scan_step(target, cursor, options)?;
            keys.extend(step.keys);
            if step.cursor == 0 {
                return Ok(keys);
            }
            cursor = step.cursor;
        }
    }
}

/// Batches of a running scan. Yields each server step, empty ones included.
pub struct ScanIter<'c> {
    conn: &'c mut CommandConnection,
    target: ScanTarget<'c>,
    options: ScanOptions,
    cursor: u64,
    done: bool,
}

impl Iterator for ScanIter<'_> {
    type Item = RkvResult<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.conn.scan_step(self.target, self.cursor, &self.options) {
            Ok(step) => {
                self.cursor = step.cursor;
                self.done = step.is_complete();
                Some(Ok(step.keys))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(cursor: &str, keys: &[&str]) -> RedisValue {
        RedisValue::array(vec![
            RedisValue::bulk(cursor.to_string()),
            RedisValue::array(keys.iter().map(|key| RedisValue::from(*key)).collect()),
        ])
    }

    #[test]
    fn test_parses_scan_reply() {
        let cursor = Cursor::from_reply(reply("17", &["a", "b"])).unwrap();
        assert_eq!(cursor.cursor, 17);
        assert_eq!(cursor.keys, vec!["a", "b"]);
        assert!(!cursor.is_complete());
    }

    #[test]
    fn test_empty_batch_is_not_completion() {
        let cursor = Cursor::from_reply(reply("3", &[])).unwrap();
        assert!(cursor.keys.is_empty());
        assert!(!cursor.is_complete());
        assert!(Cursor::from_reply(reply("0", &[])).unwrap().is_complete());
    }

    #[test]
    fn test_rejects_malformed_replies() {
        assert!(Cursor::from_reply(RedisValue::array(vec![RedisValue::bulk("0")])).is_err());
        assert!(Cursor::from_reply(reply("-1", &[])).is_err());
        assert!(Cursor::from_reply(reply("x", &[])).is_err());
        assert!(matches!(
            Cursor::from_reply(RedisValue::error("ERR invalid cursor")),
            Err(RkvError::Server(_))
        ));
    }

    #[test]
    fn test_target_commands() {
        assert_eq!(ScanTarget::Keys.command(), b"SCAN");
        assert_eq!(ScanTarget::Hash(b"h").command(), b"HSCAN");
        assert_eq!(ScanTarget::Set(b"s").key(), Some(&b"s"[..]));
        assert_eq!(ScanTarget::Keys.key(), None);
    }
}
