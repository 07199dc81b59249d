//! Pool behavior against a scripted server.
use std::{
    sync::atomic::Ordering,
    thread,
    time::Duration,
};

use tarro::{
    ErrorKind, ExclusivePool, IteratorType, Pool, PoolConfig, Source, Value,
    connection::UsageError,
    iproto::code,
};

mod support;

use support::{ServerConn, spawn_pool};

/// Answer every request on a connection until the client disconnects.
fn echo_server(_idx: usize, mut server: ServerConn) {
    server.greet();
    while let Some(req) = server.recv_opt() {
        if req.code == u64::from(code::SELECT) {
            server.reply_data(req.sync, &[&[Value::from(1u64)]]);
        } else {
            server.reply_ok(req.sync);
        }
    }
}

#[test]
fn pool_never_exceeds_its_cap() {
    let (url, accepted) = spawn_pool(echo_server);
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(2));

    let mut handles = vec![];
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            let mut client = pool.get()?;
            client.ping()?;
            client.ping()
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let created = accepted.load(Ordering::SeqCst);
    assert!(created >= 1 && created <= 2, "created {created} connections");
    pool.close().unwrap();
}

#[test]
fn pool_prefers_idle_reuse_over_creation() {
    let (url, accepted) = spawn_pool(echo_server);
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(4));

    for _ in 0..3 {
        let mut client = pool.get().unwrap();
        client.ping().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    pool.close().unwrap();
}

#[test]
fn database_error_evicts_the_connection() {
    let (url, accepted) = spawn_pool(|idx, mut server: ServerConn| {
        server.greet();
        while let Some(req) = server.recv_opt() {
            if idx == 0 && req.code == u64::from(code::INSERT) {
                server.reply_error(req.sync, 3, "Duplicate key exists");
            } else {
                server.reply_ok(req.sync);
            }
        }
    });
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(1));

    let mut client = pool.get().unwrap();
    let err = client.insert(512, &[Value::from(1u64)]).map(drop).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Database(_)), "{err}");

    // the client is permanently closed after the eviction
    let err = client.ping().unwrap_err();
    let ErrorKind::Usage(usage) = err.kind() else {
        panic!("expected usage error, got {err}");
    };
    assert_eq!(*usage, UsageError::ClientClosed);
    drop(client);

    // the errored connection never reaches the next caller
    let mut client = pool.get().unwrap();
    client.ping().unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    pool.close().unwrap();
}

#[test]
fn protocol_error_evicts_the_connection() {
    let (url, accepted) = spawn_pool(|idx, mut server: ServerConn| {
        server.greet();
        while let Some(req) = server.recv_opt() {
            if idx == 0 {
                server.reply_ok(req.sync + 9);
            } else {
                server.reply_ok(req.sync);
            }
        }
    });
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(1));

    let mut client = pool.get().unwrap();
    let err = client.ping().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protocol(_)), "{err}");
    drop(client);

    let mut client = pool.get().unwrap();
    client.ping().unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    pool.close().unwrap();
}

#[test]
fn closed_pool_refuses_checkout() {
    let (url, _) = spawn_pool(echo_server);
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(2));

    pool.close().unwrap();
    // closing twice is fine
    pool.close().unwrap();

    let err = pool.get().map(drop).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PoolClosed(_)), "{err}");
}

#[test]
fn close_wakes_blocked_getters() {
    let (url, _) = spawn_pool(echo_server);
    let pool = Pool::new(PoolConfig::parse(&url).unwrap().size(1));

    let mut held = pool.get().unwrap();
    held.ping().unwrap();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.get().map(drop))
    };

    // let the waiter block on the exhausted pool
    thread::sleep(Duration::from_millis(100));
    pool.close().unwrap();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PoolClosed(_)), "{err}");
    drop(held);
}

#[test]
fn exclusive_pool_reconnects_after_eviction() {
    let (url, accepted) = spawn_pool(|idx, mut server: ServerConn| {
        server.greet();
        while let Some(req) = server.recv_opt() {
            if idx == 0 && req.code == u64::from(code::SELECT) {
                server.reply_error(req.sync, 9, "Space does not exist");
            } else if req.code == u64::from(code::SELECT) {
                server.reply_data(req.sync, &[&[Value::from(1u64)]]);
            } else {
                server.reply_ok(req.sync);
            }
        }
    });
    let pool = ExclusivePool::connect(&url).unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    let mut client = pool.get().unwrap();
    let err = client
        .select(512, 0, &[], 1, 0, IteratorType::All)
        .map(drop)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Database(_)), "{err}");
    drop(client);

    // the single connection is re-established lazily
    let mut client = pool.get().unwrap();
    client
        .select(512, 0, &[], 1, 0, IteratorType::All)
        .unwrap()
        .drain()
        .unwrap();
    client.ping().unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    pool.close().unwrap();
}

#[test]
fn exclusive_pool_serializes_callers() {
    let (url, accepted) = spawn_pool(echo_server);
    let pool = ExclusivePool::connect(&url).unwrap();

    let mut handles = vec![];
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            let mut client = pool.get()?;
            client.ping()
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    pool.close().unwrap();
}
