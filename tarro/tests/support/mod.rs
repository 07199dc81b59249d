//! Scripted iproto server for integration tests.
//!
//! Each test spawns a listener on an ephemeral port and drives one side
//! of the protocol by hand: send the greeting, read request frames,
//! reply with hand-built response frames.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{Bytes, BytesMut};
use tarro::{iproto::key, msgpack, msgpack::Value};

/// Fixed server salt, 32 bytes as Tarantool sends.
pub const SALT: [u8; 32] = [7u8; 32];

const ERROR_TYPE_BIT: u64 = 0x8000;

/// Spawn a server handling exactly one connection.
///
/// Returns the connection url. The script runs on its own thread;
/// a panic inside it surfaces as a broken connection in the client.
pub fn spawn(script: impl FnOnce(ServerConn) + Send + 'static) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = url_of(&listener);
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        script(ServerConn::new(stream));
    });
    url
}

/// Spawn a server accepting any number of connections, each handled by
/// `script` on its own thread with its 0-based accept index.
///
/// Returns the connection url and a counter of accepted connections.
pub fn spawn_pool(
    script: impl Fn(usize, ServerConn) + Send + Sync + 'static,
) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = url_of(&listener);
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let script = Arc::new(script);
    thread::spawn(move || {
        loop {
            let Ok((stream, _)) = listener.accept() else { break };
            let idx = counter.fetch_add(1, Ordering::SeqCst);
            let script = script.clone();
            thread::spawn(move || script(idx, ServerConn::new(stream)));
        }
    });
    (url, accepted)
}

fn url_of(listener: &TcpListener) -> String {
    let addr = listener.local_addr().expect("addr");
    format!("tarantool://127.0.0.1:{}", addr.port())
}

/// One decoded request frame.
pub struct Request {
    pub code: u64,
    pub sync: u64,
    pub body: Bytes,
}

impl Request {
    /// Decode the body map into key -> value.
    pub fn body_map(&self) -> HashMap<u64, Value> {
        let mut buf = self.body.clone();
        let entries = msgpack::get_map_len(&mut buf).expect("body map");
        let mut map = HashMap::with_capacity(entries);
        for _ in 0..entries {
            let key = msgpack::get_uint(&mut buf).expect("body key");
            let value = msgpack::get_value(&mut buf).expect("body value");
            map.insert(key, value);
        }
        assert!(buf.is_empty(), "trailing bytes after body map");
        map
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Send the 128-byte greeting with the default [`SALT`].
    pub fn greet(&mut self) {
        self.greet_with(&SALT);
    }

    pub fn greet_with(&mut self, salt: &[u8]) {
        let mut greeting = [b' '; 128];
        let line = b"Tarantool 2.10.5 (Binary) 81bb4e63-0d1e-4f92-a2de-000000000000";
        greeting[..line.len()].copy_from_slice(line);
        greeting[63] = b'\n';
        let encoded = STANDARD.encode(salt);
        greeting[64..64 + encoded.len()].copy_from_slice(encoded.as_bytes());
        greeting[127] = b'\n';
        self.stream.write_all(&greeting).expect("greeting");
        self.stream.flush().expect("flush greeting");
    }

    /// Read one request frame and decode its header.
    pub fn recv(&mut self) -> Request {
        self.recv_opt().expect("connection closed")
    }

    /// Like [`recv`][Self::recv], but returns `None` once the client
    /// disconnects.
    pub fn recv_opt(&mut self) -> Option<Request> {
        let mut prefix = [0u8; 5];
        if self.stream.read_exact(&mut prefix).is_err() {
            return None;
        }
        assert_eq!(prefix[0], 0xce, "frame length marker");
        let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).expect("frame payload");
        let mut payload = Bytes::from(payload);

        let entries = msgpack::get_map_len(&mut payload).expect("header map");
        let (mut code, mut sync) = (None, None);
        for _ in 0..entries {
            let k = msgpack::get_uint(&mut payload).expect("header key");
            let v = msgpack::get_uint(&mut payload).expect("header value");
            match k {
                k if k == u64::from(key::CODE) => code = Some(v),
                k if k == u64::from(key::SYNC) => sync = Some(v),
                _ => {},
            }
        }
        Some(Request {
            code: code.expect("request code"),
            sync: sync.expect("request sync"),
            body: payload,
        })
    }

    /// Reply with an empty body map, as for PING and AUTH.
    pub fn reply_ok(&mut self, sync: u64) {
        let mut body = BytesMut::new();
        msgpack::put_map_len(&mut body, 0);
        self.reply(0, sync, &body);
    }

    /// Reply with DATA holding `rows`, each encoded as a tuple.
    pub fn reply_data(&mut self, sync: u64, rows: &[&[Value]]) {
        let mut body = BytesMut::new();
        msgpack::put_map_len(&mut body, 1);
        msgpack::put_uint(&mut body, u64::from(key::DATA));
        msgpack::put_array_len(&mut body, rows.len());
        for row in rows {
            msgpack::put_array_len(&mut body, row.len());
            for field in *row {
                msgpack::put_value(&mut body, field);
            }
        }
        self.reply(0, sync, &body);
    }

    /// Reply with DATA holding raw values, as EVAL does for scalar returns.
    pub fn reply_values(&mut self, sync: u64, values: &[Value]) {
        let mut body = BytesMut::new();
        msgpack::put_map_len(&mut body, 1);
        msgpack::put_uint(&mut body, u64::from(key::DATA));
        msgpack::put_array_len(&mut body, values.len());
        for value in values {
            msgpack::put_value(&mut body, value);
        }
        self.reply(0, sync, &body);
    }

    /// Reply with METADATA and DATA, as for SQL responses.
    pub fn reply_sql(&mut self, sync: u64, columns: &[&str], rows: &[&[Value]]) {
        let mut body = BytesMut::new();
        msgpack::put_map_len(&mut body, 2);
        msgpack::put_uint(&mut body, u64::from(key::METADATA));
        msgpack::put_array_len(&mut body, columns.len());
        for column in columns {
            msgpack::put_map_len(&mut body, 1);
            msgpack::put_uint(&mut body, u64::from(key::FIELD_NAME));
            msgpack::put_str(&mut body, column);
        }
        msgpack::put_uint(&mut body, u64::from(key::DATA));
        msgpack::put_array_len(&mut body, rows.len());
        for row in rows {
            msgpack::put_array_len(&mut body, row.len());
            for field in *row {
                msgpack::put_value(&mut body, field);
            }
        }
        self.reply(0, sync, &body);
    }

    /// Reply with an ERROR body and the error bit set in the header code.
    pub fn reply_error(&mut self, sync: u64, code: u64, message: &str) {
        let mut body = BytesMut::new();
        msgpack::put_map_len(&mut body, 1);
        msgpack::put_uint(&mut body, u64::from(key::ERROR));
        msgpack::put_str(&mut body, message);
        self.reply(ERROR_TYPE_BIT | code, sync, &body);
    }

    /// Reply with an arbitrary header code and raw body bytes.
    pub fn reply(&mut self, code: u64, sync: u64, body: &[u8]) {
        let mut payload = BytesMut::new();
        msgpack::put_map_len(&mut payload, 2);
        msgpack::put_uint(&mut payload, u64::from(key::CODE));
        msgpack::put_uint(&mut payload, code);
        msgpack::put_uint(&mut payload, u64::from(key::SYNC));
        msgpack::put_uint(&mut payload, sync);
        payload.extend_from_slice(body);
        self.send_frame(&payload);
    }

    /// Write raw bytes, bypassing framing. For malformed-input tests.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("raw bytes");
        self.stream.flush().expect("flush raw");
    }

    fn send_frame(&mut self, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(0xce);
        frame.extend_from_slice(&u32::to_be_bytes(payload.len() as u32));
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).expect("frame");
        self.stream.flush().expect("flush frame");
    }
}
