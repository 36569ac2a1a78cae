mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rkv_client::{CommandConnection, RedisValue, ScanOptions, ScanTarget};

use common::spawn_responder;

fn scan_reply(cursor: &str, keys: &[&str]) -> RedisValue {
    RedisValue::array(vec![
        RedisValue::bulk(cursor.to_string()),
        RedisValue::array(keys.iter().map(|key| RedisValue::bulk(key.to_string())).collect()),
    ])
}

#[test]
fn scan_all_stops_on_cursor_zero() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let endpoint = spawn_responder(move |args, conn| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(args[0], b"SCAN");
        match args[1].as_slice() {
            b"0" => conn.write_value(&scan_reply("5", &["k1", "k2"])),
            b"5" => conn.write_value(&scan_reply("0", &[])),
            other => panic!("unexpected cursor {:?}", other),
        }
    });

    let mut conn = CommandConnection::open(Arc::new(endpoint)).expect("connect");
    let keys = conn.scan_all(ScanTarget::Keys, &ScanOptions::default()).expect("scan");
    assert_eq!(keys, vec!["k1", "k2"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn empty_batches_do_not_end_iteration() {
    let endpoint = spawn_responder(|args, conn| match args[2].as_slice() {
        b"0" => conn.write_value(&scan_reply("9", &[])),
        _ => conn.write_value(&scan_reply("0", &["member"])),
    });

    let mut conn = CommandConnection::open(Arc::new(endpoint)).expect("connect");
    let batches: Vec<Vec<String>> = conn
        .scan_iter(ScanTarget::Set(b"tags"), ScanOptions::default())
        .collect::<Result<_, _>>()
        .expect("sscan");
    assert_eq!(batches, vec![Vec::<String>::new(), vec!["member".to_string()]]);
}

#[test]
fn hscan_sends_match_and_count() {
    let endpoint = spawn_responder(|args, conn| {
        let args: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
        let expected = [
            &b"HSCAN"[..],
            &b"user:1"[..],
            &b"0"[..],
            &b"MATCH"[..],
            &b"na*"[..],
            &b"COUNT"[..],
            &b"50"[..],
        ];
        assert_eq!(args, expected);
        conn.write_value(&scan_reply("0", &["name", "ada"]));
    });

    let mut conn = CommandConnection::open(Arc::new(endpoint)).expect("connect");
    let options = ScanOptions::matching("na*").with_count(50);
    let step = conn.hscan("user:1", 0, &options).expect("hscan");
    assert!(step.is_complete());
    assert_eq!(step.keys, vec!["name", "ada"]);
}

#[test]
fn server_error_stops_the_iterator() {
    let endpoint = spawn_responder(|_, conn| conn.write_error("ERR invalid cursor"));

    let mut conn = CommandConnection::open(Arc::new(endpoint)).expect("connect");
    let mut iter = conn.scan_iter(ScanTarget::Keys, ScanOptions::default());
    assert!(matches!(iter.next(), Some(Err(_))));
    assert!(iter.next().is_none());
}
