mod common;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rkv_client::{CommandConnection, ConnectionPool, RkvError};

use common::{dead_endpoint, spawn_responder, wait_until};

fn ping_pool(size: usize) -> ConnectionPool {
    let endpoint = spawn_responder(|_, conn| conn.write_simple("PONG"));
    ConnectionPool::new(size, endpoint).expect("pool")
}

fn assert_invariant(pool: &ConnectionPool) {
    assert_eq!(pool.available_count() + pool.checked_out_count(), pool.size());
}

#[test]
fn blocked_acquirer_receives_first_released_connection() {
    let pool = ping_pool(2);
    let first = pool.acquire();
    let second = pool.acquire();
    let first_id = first.id();
    assert_eq!(pool.available_count(), 0);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let mut conn = pool.acquire();
            tx.send(conn.id()).expect("send");
            assert_eq!(conn.ping().expect("ping"), "PONG");
            pool.release(conn).expect("release");
        })
    };

    assert!(wait_until(|| pool.waiting_count() == 1));
    pool.release(first).expect("release first");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("handoff"), first_id);

    waiter.join().expect("waiter");
    pool.release(second).expect("release second");
    assert_eq!(pool.available_count(), 2);
    assert_invariant(&pool);
}

#[test]
fn waiters_are_served_in_arrival_order() {
    let pool = ping_pool(1);
    let held = pool.acquire();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for label in 0..3 {
        let worker_pool = pool.clone();
        let order = Arc::clone(&order);
        waiters.push(thread::spawn(move || {
            let conn = worker_pool.acquire();
            order.lock().expect("order").push(label);
            worker_pool.release(conn).expect("release");
        }));
        assert!(wait_until(|| pool.waiting_count() == label + 1));
    }

    pool.release(held).expect("release held");
    for waiter in waiters {
        waiter.join().expect("waiter");
    }

    assert_eq!(*order.lock().expect("order"), vec![0, 1, 2]);
    assert_eq!(pool.waiting_count(), 0);
    assert_invariant(&pool);
}

#[test]
fn invariant_holds_across_operations() {
    let pool = ping_pool(3);
    assert_invariant(&pool);

    let a = pool.acquire();
    let b = pool.try_acquire().expect("free connection");
    assert_invariant(&pool);
    assert_eq!(pool.checked_out_count(), 2);

    pool.release(a).expect("release a");
    assert_invariant(&pool);
    {
        let mut guard = pool.get();
        guard.ping().expect("ping through guard");
        assert_eq!(pool.checked_out_count(), 2);
    }
    assert_invariant(&pool);
    pool.release(b).expect("release b");
    assert_eq!(pool.available_count(), 3);
}

#[test]
fn foreign_connection_release_is_rejected() {
    let pool = ping_pool(1);
    let stranger = CommandConnection::open(Arc::clone(pool.endpoint())).expect("connect");

    assert!(matches!(pool.release(stranger), Err(RkvError::ConnectionState(_))));
    assert_eq!(pool.available_count(), 1);
    assert_invariant(&pool);
}

#[test]
fn acquire_timeout_gives_up_and_leaves_queue() {
    let pool = ping_pool(1);
    let held = pool.acquire();

    assert!(pool.try_acquire().is_none());
    assert!(pool.acquire_timeout(Duration::from_millis(50)).is_none());
    assert_eq!(pool.waiting_count(), 0);

    pool.release(held).expect("release");
    let conn = pool.acquire_timeout(Duration::from_millis(50)).expect("free connection");
    pool.release(conn).expect("release");
    assert_invariant(&pool);
}

#[test]
fn zero_size_pool_is_rejected() {
    let endpoint = spawn_responder(|_, conn| conn.write_simple("PONG"));
    assert!(matches!(ConnectionPool::new(0, endpoint), Err(RkvError::Config(_))));
}

#[test]
fn pool_creation_fails_when_server_is_down() {
    assert!(ConnectionPool::new(2, dead_endpoint()).is_err());
}
