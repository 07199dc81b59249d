//! Blocking connection pools.
//!
//! [`Pool`] hands out up to a fixed number of connections, preferring an
//! idle one over creating another, and blocks callers once the cap is
//! reached. [`ExclusivePool`] serializes all callers onto a single
//! connection. Both yield a [`Client`] proxy that evicts its connection on
//! any error that leaves the session untrustworthy, so a failed
//! connection is never handed to another caller.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use crate::{
    Error, ErrorKind, Result,
    connection::{Config, Connection, UsageError},
    iproto::{IteratorType, Operation, UpdateOp},
    msgpack::Value,
    row::{Cursor, RowSet},
};

mod config;

pub use config::PoolConfig;

/// Anything a [`Client`] can be checked out of.
pub trait Source {
    /// Block until a connection is available.
    ///
    /// Fails with [`PoolClosedError`] once the source is closed, including
    /// for callers already blocked in `get` at that moment.
    fn get(&self) -> Result<Client>;

    /// Close the source.
    ///
    /// Idle connections are closed, blocked callers wake with
    /// [`PoolClosedError`], and checked-out connections are closed as
    /// their clients release them. Close failures are aggregated: the
    /// first is returned with the rest attached as secondary errors.
    fn close(&self) -> Result<()>;
}

// ===== bounded pool =====

/// A bounded pool of connections to one server.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone, Debug)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

#[derive(Debug)]
struct PoolShared {
    config: Config,
    size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Connections alive or being created, bounded by `size`.
    created: usize,
    closed: bool,
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("idle", &self.idle.len())
            .field("created", &self.created)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Pool {
    /// Create a pool. No connection is established until the first
    /// [`get`][Source::get].
    pub fn new(config: impl Into<PoolConfig>) -> Self {
        let config = config.into();
        Self {
            shared: Arc::new(PoolShared {
                config: config.conn,
                size: config.size.max(1),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    created: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Create a pool from url, see [`Config::parse`].
    pub fn parse(url: &str) -> Result<Self> {
        Ok(Self::new(PoolConfig::parse(url)?))
    }
}

impl Source for Pool {
    fn get(&self) -> Result<Client> {
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(PoolClosedError.into());
            }
            if let Some(conn) = state.idle.pop_front() {
                return Ok(Client::new(conn, Owner::Bounded(self.shared.clone())));
            }
            if state.created < self.shared.size {
                state.created += 1;
                // connect outside the lock
                drop(state);
                return match Connection::connect_with(self.shared.config.clone()) {
                    Ok(conn) => Ok(Client::new(conn, Owner::Bounded(self.shared.clone()))),
                    Err(err) => {
                        self.shared.forget_one();
                        Err(err)
                    },
                };
            }
            state = self
                .shared
                .available
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.created -= idle.len();
        drop(state);
        self.shared.available.notify_all();

        let mut result = Ok(());
        for conn in idle {
            if let Err(err) = conn.close() {
                match &mut result {
                    Ok(()) => result = Err(err),
                    Err(first) => first.attach(err),
                }
            }
        }
        result.map_err(|err| err.with_context("closing pool"))
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool mutex poisoned")
    }

    /// Hand a connection back, closing it instead when it cannot be
    /// reused or the pool closed meanwhile.
    fn release(&self, conn: Connection) {
        let mut state = self.lock();
        if state.closed || !conn.is_reusable() {
            state.created -= 1;
            drop(state);
            close_quietly(conn);
        } else {
            state.idle.push_back(conn);
            drop(state);
        }
        self.available.notify_one();
    }

    /// Drop a creation slot after an eviction or a failed connect,
    /// letting a blocked caller create a replacement.
    fn forget_one(&self) {
        self.lock().created -= 1;
        self.available.notify_one();
    }
}

// ===== exclusive pool =====

/// A pool serializing all callers onto a single connection.
///
/// After an eviction the connection is re-established lazily on the next
/// [`get`][Source::get]. Cloning is cheap and shares the pool.
#[derive(Clone, Debug)]
pub struct ExclusivePool {
    shared: Arc<ExclusiveShared>,
}

#[derive(Debug)]
struct ExclusiveShared {
    config: Config,
    state: Mutex<ExclusiveState>,
    available: Condvar,
}

struct ExclusiveState {
    idle: Option<Connection>,
    checked_out: bool,
    closed: bool,
}

impl std::fmt::Debug for ExclusiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveState")
            .field("idle", &self.idle.is_some())
            .field("checked_out", &self.checked_out)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ExclusivePool {
    /// Connect the single underlying connection up front.
    pub fn connect_with(config: Config) -> Result<Self> {
        let conn = Connection::connect_with(config.clone())?;
        Ok(Self {
            shared: Arc::new(ExclusiveShared {
                config,
                state: Mutex::new(ExclusiveState {
                    idle: Some(conn),
                    checked_out: false,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Connect from url, see [`Config::parse`].
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?)
    }
}

impl Source for ExclusivePool {
    fn get(&self) -> Result<Client> {
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(PoolClosedError.into());
            }
            if !state.checked_out {
                state.checked_out = true;
                if let Some(conn) = state.idle.take() {
                    return Ok(Client::new(conn, Owner::Exclusive(self.shared.clone())));
                }
                // evicted earlier, reconnect outside the lock
                drop(state);
                return match Connection::connect_with(self.shared.config.clone()) {
                    Ok(conn) => Ok(Client::new(conn, Owner::Exclusive(self.shared.clone()))),
                    Err(err) => {
                        self.shared.forget();
                        Err(err)
                    },
                };
            }
            state = self
                .shared
                .available
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let idle = state.idle.take();
        drop(state);
        self.shared.available.notify_all();
        match idle {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }
}

impl ExclusiveShared {
    fn lock(&self) -> MutexGuard<'_, ExclusiveState> {
        self.state.lock().expect("pool mutex poisoned")
    }

    fn release(&self, conn: Connection) {
        let mut state = self.lock();
        state.checked_out = false;
        if state.closed || !conn.is_reusable() {
            drop(state);
            close_quietly(conn);
        } else {
            state.idle = Some(conn);
            drop(state);
        }
        self.available.notify_one();
    }

    fn forget(&self) {
        self.lock().checked_out = false;
        self.available.notify_one();
    }
}

fn close_quietly(conn: Connection) {
    if let Err(err) = conn.close() {
        log::warn!("closing pooled connection: {err}");
    }
}

// ===== checked-out client =====

enum Owner {
    Bounded(Arc<PoolShared>),
    Exclusive(Arc<ExclusiveShared>),
}

impl Owner {
    fn release(&self, conn: Connection) {
        match self {
            Self::Bounded(shared) => shared.release(conn),
            Self::Exclusive(shared) => shared.release(conn),
        }
    }

    fn forget(&self) {
        match self {
            Self::Bounded(shared) => shared.forget_one(),
            Self::Exclusive(shared) => shared.forget(),
        }
    }
}

/// A connection checked out of a pool.
///
/// Exposes the same operations as [`Connection`]. Dropping the client
/// returns the connection to its pool when it is reusable and closes it
/// otherwise. After an eviction every further call fails with
/// [`UsageError::ClientClosed`].
pub struct Client {
    conn: Option<Connection>,
    owner: Owner,
}

impl Client {
    fn new(conn: Connection, owner: Owner) -> Self {
        Self { conn: Some(conn), owner }
    }

    /// Run one exchange, evicting the connection when the error leaves it
    /// untrustworthy.
    ///
    /// Server errors evict as well: the session would remain usable, but
    /// eviction keeps a failed connection from reaching the next caller.
    fn run<T>(&mut self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.as_mut().ok_or(UsageError::ClientClosed)?;
        op(conn).map_err(|err| self.evict_on(err))
    }

    fn evict_on(&mut self, mut err: Error) -> Error {
        let evict = err.is_fatal() || matches!(err.kind(), ErrorKind::Database(_));
        if evict {
            if let Some(conn) = self.conn.take() {
                log::debug!("evicting pooled connection: {}", err.kind());
                if let Err(close_err) = conn.close() {
                    err.attach(close_err);
                }
                self.owner.forget();
            }
        }
        err
    }

    /// Release the connection back to the pool.
    ///
    /// Equivalent to dropping the client.
    pub fn close(self) { }

    fn cursor(&mut self, set: RowSet) -> Result<Cursor<'_>> {
        let conn = self.conn.as_mut().ok_or(UsageError::ClientClosed)?;
        Ok(Cursor::new(conn, set))
    }

    /// See [`Connection::begin`].
    pub fn begin(&mut self, op: Operation<'_>) -> Result<()> {
        self.run(|conn| conn.begin(op))
    }

    /// See [`Connection::bind`].
    pub fn bind(&mut self, value: impl Into<Value>) -> Result<()> {
        self.run(|conn| conn.bind(value))
    }

    /// See [`Connection::execute`].
    pub fn execute(&mut self) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.execute_set())?;
        self.cursor(set)
    }

    /// See [`Connection::enqueue`].
    pub fn enqueue(&mut self) -> Result<()> {
        self.run(|conn| conn.enqueue())
    }

    /// See [`Connection::execute_batch`].
    pub fn execute_batch(&mut self) -> Result<()> {
        self.run(|conn| conn.execute_batch())
    }

    /// See [`Connection::ping`].
    pub fn ping(&mut self) -> Result<()> {
        self.run(|conn| conn.ping())
    }

    /// See [`Connection::select`].
    pub fn select(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        limit: u32,
        offset: u32,
        iterator: IteratorType,
    ) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.select_set(space, index, key, limit, offset, iterator))?;
        self.cursor(set)
    }

    /// See [`Connection::insert`].
    pub fn insert(&mut self, space: u32, tuple: &[Value]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.insert_set(space, tuple))?;
        self.cursor(set)
    }

    /// See [`Connection::replace`].
    pub fn replace(&mut self, space: u32, tuple: &[Value]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.replace_set(space, tuple))?;
        self.cursor(set)
    }

    /// See [`Connection::update`].
    pub fn update(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        ops: &[UpdateOp],
    ) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.update_set(space, index, key, ops))?;
        self.cursor(set)
    }

    /// See [`Connection::delete`].
    pub fn delete(&mut self, space: u32, index: u32, key: &[Value]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.delete_set(space, index, key))?;
        self.cursor(set)
    }

    /// See [`Connection::upsert`].
    pub fn upsert(&mut self, space: u32, tuple: &[Value], ops: &[UpdateOp]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.upsert_set(space, tuple, ops))?;
        self.cursor(set)
    }

    /// See [`Connection::eval`].
    pub fn eval(&mut self, expression: &str, args: &[Value]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.eval_set(expression, args))?;
        self.cursor(set)
    }

    /// See [`Connection::sql`].
    pub fn sql(&mut self, statement: &str, binds: &[Value]) -> Result<Cursor<'_>> {
        let set = self.run(|conn| conn.sql_set(statement, binds))?;
        self.cursor(set)
    }

    /// See [`Connection::space_id`].
    pub fn space_id(&mut self, name: &str) -> Result<u32> {
        self.run(|conn| conn.space_id(name))
    }

    /// See [`Connection::index_id`].
    pub fn index_id(&mut self, space: u32, name: &str) -> Result<u32> {
        self.run(|conn| conn.index_id(space, name))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.owner.release(conn);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .finish()
    }
}

/// Checkout attempted on a closed pool.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PoolClosedError;

impl std::error::Error for PoolClosedError { }

impl std::fmt::Display for PoolClosedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("pool is closed")
    }
}

impl std::fmt::Debug for PoolClosedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}
