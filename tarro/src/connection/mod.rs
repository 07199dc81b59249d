//! Tarantool connection session.
//!
//! A [`Connection`] owns one TCP connection and drives it through a small
//! state machine: an operation is begun (header written under a fresh
//! sync), arguments are bound, then the request is either executed
//! synchronously or queued into a write-ahead batch. One logical caller
//! drives a connection at a time; concurrent use is serialized externally
//! by a [pool][crate::pool].
use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};
use lru::LruCache;

use crate::{
    Error, Result,
    iproto::{
        IteratorType, Operation, ProtocolError, UpdateOp, request,
        response::{self, Body, Header, ServerError},
        system_space,
    },
    msgpack::{self, Value},
    row::{Cursor, Row, RowSet},
    stream::IprotoStream,
};

mod config;
pub(crate) mod startup;

pub use config::{Config, ParseError};
pub use startup::AuthError;

const DEFAULT_SCHEMA_CACHE: NonZeroUsize = NonZeroUsize::new(128).unwrap();

/// An operation begun but not yet sent: header and fixed body fields are
/// encoded, arguments accumulate separately until finish.
#[derive(Debug)]
struct PendingOp {
    sync: u64,
    buf: BytesMut,
    args: BytesMut,
    argc: u32,
    args_key: Option<u8>,
}

/// One iproto session over one TCP connection.
///
/// Not internally thread-safe: exactly one caller drives it at a time.
pub struct Connection {
    pub(crate) stream: IprotoStream,
    /// Strictly increasing request id, never shared across connections.
    sync: u64,
    open: Option<PendingOp>,
    /// Requests sent ahead of their responses.
    batched: u32,
    /// Rows of the last response not yet handed to the cursor.
    pending: Bytes,
    pending_rows: u32,
    spaces: LruCache<String, u32>,
    indexes: LruCache<(u32, String), u32>,
    /// Set on any wire-level failure; the connection then refuses reuse.
    dead: bool,
}

impl Connection {
    /// Connect and authenticate via url.
    ///
    /// See [`Config::parse`] for the accepted forms.
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?)
    }

    /// Connect and authenticate from environment variables.
    ///
    /// See [`Config::from_env`] for the variables read.
    pub fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env())
    }

    /// Connect and authenticate with options.
    pub fn connect_with(config: Config) -> Result<Self> {
        let stream = IprotoStream::connect(&config)?;
        let mut conn = Self {
            stream,
            sync: 0,
            open: None,
            batched: 0,
            pending: Bytes::new(),
            pending_rows: 0,
            spaces: LruCache::new(DEFAULT_SCHEMA_CACHE),
            indexes: LruCache::new(DEFAULT_SCHEMA_CACHE),
            dead: false,
        };
        if !config.user.is_empty() {
            startup::authenticate(&mut conn, &config)?;
        }
        Ok(conn)
    }

    // ===== the request state machine =====

    /// Start an operation under a freshly incremented sync.
    ///
    /// Legal only when no operation is open and the previous result is
    /// fully read; anything else is a [`UsageError`].
    pub fn begin(&mut self, op: Operation<'_>) -> Result<()> {
        if self.dead {
            return Err(ProtocolError::desynchronized().into());
        }
        if self.open.is_some() {
            return Err(UsageError::OperationOpen.into());
        }
        if self.pending_rows > 0 {
            return Err(UsageError::UnreadResult.into());
        }

        self.sync += 1;
        let mut buf = BytesMut::with_capacity(64);
        request::put_header(&mut buf, op.code(), self.sync);
        op.encode_body(&mut buf);
        self.open = Some(PendingOp {
            sync: self.sync,
            buf,
            args: BytesMut::new(),
            argc: 0,
            args_key: op.args_key(),
        });
        Ok(())
    }

    /// Append one value to the open operation's argument array.
    pub fn bind(&mut self, value: impl Into<Value>) -> Result<()> {
        let Some(op) = self.open.as_mut() else {
            return Err(UsageError::NoOperation.into());
        };
        msgpack::put_value(&mut op.args, &value.into());
        op.argc += 1;
        Ok(())
    }

    /// Complete the open operation and buffer its frame for sending.
    ///
    /// Returns the operation's sync for response correlation.
    pub(crate) fn finish_send(&mut self) -> Result<u64> {
        let Some(mut op) = self.open.take() else {
            return Err(UsageError::NoOperation.into());
        };
        if let Some(key) = op.args_key {
            msgpack::put_uint(&mut op.buf, u64::from(key));
            msgpack::put_array_len(&mut op.buf, op.argc as usize);
            op.buf.extend_from_slice(&op.args);
        }
        self.stream.send_frame(&op.buf);
        Ok(op.sync)
    }

    /// Send the open operation and read its response.
    ///
    /// A pending batch is executed and drained first. The response sync
    /// must equal the request sync; a DATA body becomes a [`Cursor`], an
    /// ERROR body a [`ServerError`], anything else is fatal.
    pub fn execute(&mut self) -> Result<Cursor<'_>> {
        let set = self.execute_set()?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn execute_set(&mut self) -> Result<RowSet> {
        if self.batched > 0 {
            self.execute_batch()?;
        }
        let sync = self.finish_send()?;
        let (header, body) = self.recv()?;
        if header.sync != sync {
            return Err(self.poison(ProtocolError::sync_mismatch(sync, header.sync)));
        }
        self.interpret(header, body)
    }

    /// Send the open operation without reading its response.
    ///
    /// The response is collected later by
    /// [`execute_batch`][Self::execute_batch], which lets any number of
    /// requests go out ahead of their replies to amortize round trips.
    pub fn enqueue(&mut self) -> Result<()> {
        self.finish_send()?;
        self.batched += 1;
        Ok(())
    }

    /// Read and drain the responses of every enqueued request, in send
    /// order.
    ///
    /// Each response sync is bound-checked against the session counter
    /// only; the first server error is surfaced after the remaining
    /// responses have still been read off the wire.
    pub fn execute_batch(&mut self) -> Result<()> {
        let count = self.batched;
        self.batched = 0;

        let mut first_err: Option<Error> = None;
        for _ in 0..count {
            let (header, body) = self.recv()?;
            if header.sync > self.sync {
                return Err(self.poison(ProtocolError::sync_ahead(self.sync, header.sync)));
            }
            match body {
                Body::Data { rows, payload, .. } => {
                    self.pending = payload;
                    self.pending_rows = rows;
                    self.drain_pending()?;
                },
                Body::Error { message } => {
                    if first_err.is_none() {
                        let code = header.error_code().unwrap_or(0);
                        first_err = Some(ServerError { code, message }.into());
                    }
                },
                Body::Empty => {},
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Liveness check: empty request, empty response.
    pub fn ping(&mut self) -> Result<()> {
        if self.batched > 0 {
            self.execute_batch()?;
        }
        self.begin(Operation::Ping)?;
        let sync = self.finish_send()?;
        let (header, body) = self.recv()?;
        if header.sync != sync {
            return Err(self.poison(ProtocolError::sync_mismatch(sync, header.sync)));
        }
        match body {
            Body::Empty => Ok(()),
            Body::Error { message } => {
                let code = header.error_code().unwrap_or(0);
                Err(ServerError { code, message }.into())
            },
            Body::Data { .. } => Err(self.poison(ProtocolError::shape("ping response body is not empty"))),
        }
    }

    // ===== operations =====

    /// Select `limit` tuples matching `key` under the iterator semantics.
    ///
    /// An empty key with [`IteratorType::All`] walks the whole space.
    pub fn select(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        limit: u32,
        offset: u32,
        iterator: IteratorType,
    ) -> Result<Cursor<'_>> {
        let set = self.select_set(space, index, key, limit, offset, iterator)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn select_set(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        limit: u32,
        offset: u32,
        iterator: IteratorType,
    ) -> Result<RowSet> {
        self.begin(Operation::Select { space, index, limit, offset, iterator })?;
        self.bind_all(key)?;
        self.execute_set()
    }

    /// Insert a tuple; duplicate primary key is a server error.
    pub fn insert(&mut self, space: u32, tuple: &[Value]) -> Result<Cursor<'_>> {
        let set = self.insert_set(space, tuple)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn insert_set(&mut self, space: u32, tuple: &[Value]) -> Result<RowSet> {
        self.begin(Operation::Insert { space })?;
        self.bind_all(tuple)?;
        self.execute_set()
    }

    /// Insert a tuple, overwriting any existing tuple with the same key.
    pub fn replace(&mut self, space: u32, tuple: &[Value]) -> Result<Cursor<'_>> {
        let set = self.replace_set(space, tuple)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn replace_set(&mut self, space: u32, tuple: &[Value]) -> Result<RowSet> {
        self.begin(Operation::Replace { space })?;
        self.bind_all(tuple)?;
        self.execute_set()
    }

    /// Apply field operations to the tuple matching `key`.
    pub fn update(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        ops: &[UpdateOp],
    ) -> Result<Cursor<'_>> {
        let set = self.update_set(space, index, key, ops)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn update_set(
        &mut self,
        space: u32,
        index: u32,
        key: &[Value],
        ops: &[UpdateOp],
    ) -> Result<RowSet> {
        self.begin(Operation::Update { space, index, k: key })?;
        for op in ops {
            self.bind(Value::from(op.clone()))?;
        }
        self.execute_set()
    }

    /// Delete the tuple matching `key`.
    pub fn delete(&mut self, space: u32, index: u32, key: &[Value]) -> Result<Cursor<'_>> {
        let set = self.delete_set(space, index, key)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn delete_set(&mut self, space: u32, index: u32, key: &[Value]) -> Result<RowSet> {
        self.begin(Operation::Delete { space, index })?;
        self.bind_all(key)?;
        self.execute_set()
    }

    /// Insert the tuple, or apply `ops` to the existing one.
    pub fn upsert(
        &mut self,
        space: u32,
        tuple: &[Value],
        ops: &[UpdateOp],
    ) -> Result<Cursor<'_>> {
        let set = self.upsert_set(space, tuple, ops)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn upsert_set(
        &mut self,
        space: u32,
        tuple: &[Value],
        ops: &[UpdateOp],
    ) -> Result<RowSet> {
        self.begin(Operation::Upsert { space, tuple })?;
        for op in ops {
            self.bind(Value::from(op.clone()))?;
        }
        self.execute_set()
    }

    /// Evaluate a Lua expression server-side.
    pub fn eval(&mut self, expression: &str, args: &[Value]) -> Result<Cursor<'_>> {
        let set = self.eval_set(expression, args)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn eval_set(&mut self, expression: &str, args: &[Value]) -> Result<RowSet> {
        self.begin(Operation::Eval { expression })?;
        self.bind_all(args)?;
        self.execute_set()
    }

    /// Execute an SQL statement; the cursor carries column metadata.
    pub fn sql(&mut self, statement: &str, binds: &[Value]) -> Result<Cursor<'_>> {
        let set = self.sql_set(statement, binds)?;
        Ok(Cursor::new(self, set))
    }

    pub(crate) fn sql_set(&mut self, statement: &str, binds: &[Value]) -> Result<RowSet> {
        self.begin(Operation::SqlExecute { statement })?;
        self.bind_all(binds)?;
        self.execute_set()
    }

    fn bind_all(&mut self, values: &[Value]) -> Result<()> {
        for value in values {
            self.bind(value.clone())?;
        }
        Ok(())
    }

    // ===== schema resolution =====

    /// Resolve a space name to its numeric id.
    ///
    /// Resolved once per name via a select against the `_space` system
    /// directory and cached; staleness under live schema change is
    /// accepted. Must not be called while another operation is open, as
    /// it recursively executes.
    pub fn space_id(&mut self, name: &str) -> Result<u32> {
        if let Some(id) = self.spaces.get(name) {
            return Ok(*id);
        }
        let id = self.directory_lookup(system_space::SPACE, &[Value::from(name)], name, 0)?;
        self.spaces.put(name.to_owned(), id);
        Ok(id)
    }

    /// Resolve an index name within a space to its numeric id, with the
    /// same caching as [`space_id`][Self::space_id].
    pub fn index_id(&mut self, space: u32, name: &str) -> Result<u32> {
        if let Some(id) = self.indexes.get(&(space, name.to_owned())) {
            return Ok(*id);
        }
        let key = [Value::from(space), Value::from(name)];
        let id = self.directory_lookup(system_space::INDEX, &key, name, 1)?;
        self.indexes.put((space, name.to_owned()), id);
        Ok(id)
    }

    /// Equality select on a system directory's name index; exactly one
    /// match required. `field` is the position of the id in the entry.
    fn directory_lookup(
        &mut self,
        directory: u32,
        key: &[Value],
        name: &str,
        field: usize,
    ) -> Result<u32> {
        let set = self.select_set(
            directory,
            system_space::NAME_INDEX,
            key,
            2,
            0,
            IteratorType::Eq,
        )?;

        let mut rows = Cursor::new(self, set);
        if !rows.advance()? {
            return Err(NoSuchSpace::missing(name).into());
        }
        let id = rows.try_get(field)?;
        if rows.advance()? {
            rows.drain()?;
            return Err(NoSuchSpace::ambiguous(name).into());
        }
        Ok(id)
    }

    // ===== response plumbing =====

    pub(crate) fn recv(&mut self) -> Result<(Header, Body)> {
        let result = self.recv_inner();
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    fn recv_inner(&mut self) -> Result<(Header, Body)> {
        let mut payload = self.stream.recv_frame()?;
        let header = response::decode_header(&mut payload)?;
        let body = response::decode_body(payload)?;
        Ok((header, body))
    }

    fn interpret(&mut self, header: Header, body: Body) -> Result<RowSet> {
        match body {
            Body::Data { rows, columns, payload } => {
                if header.error_code().is_some() {
                    return Err(self.poison(ProtocolError::shape("error response carries DATA")));
                }
                self.pending = payload;
                self.pending_rows = rows;
                Ok(RowSet { size: rows, columns })
            },
            Body::Error { message } => {
                let code = header.error_code().unwrap_or(0);
                Err(ServerError { code, message }.into())
            },
            Body::Empty => {
                Err(self.poison(ProtocolError::shape("response body has neither DATA nor ERROR")))
            },
        }
    }

    /// Decode one pending tuple. Single non-array values, as returned by
    /// eval, decode as one-field rows.
    pub(crate) fn next_row(&mut self) -> Result<Row> {
        match msgpack::get_value(&mut self.pending) {
            Ok(value) => {
                self.pending_rows -= 1;
                if self.pending_rows == 0 {
                    self.pending = Bytes::new();
                }
                let fields = match value {
                    Value::Array(fields) => fields,
                    other => vec![other],
                };
                Ok(Row::new(fields))
            },
            Err(err) => Err(self.poison(err)),
        }
    }

    /// Discard all pending tuples.
    pub(crate) fn drain_pending(&mut self) -> Result<()> {
        while self.pending_rows > 0 {
            if let Err(err) = msgpack::skip_value(&mut self.pending) {
                return Err(self.poison(err));
            }
            self.pending_rows -= 1;
        }
        self.pending = Bytes::new();
        Ok(())
    }

    pub(crate) fn pending_rows(&self) -> u32 {
        self.pending_rows
    }

    /// Mark the connection as desynchronized and pass the error through.
    pub(crate) fn poison(&mut self, err: impl Into<Error>) -> Error {
        self.dead = true;
        err.into()
    }

    /// Whether a pool may hand this connection to another caller.
    pub(crate) fn is_reusable(&self) -> bool {
        !self.dead && self.open.is_none() && self.pending_rows == 0 && self.batched == 0
    }

    /// Shut the underlying socket down.
    pub fn close(self) -> Result<()> {
        self.stream.close()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("sync", &self.sync)
            .field("open", &self.open.is_some())
            .field("batched", &self.batched)
            .field("pending_rows", &self.pending_rows)
            .field("dead", &self.dead)
            .finish()
    }
}

/// Caller drove the session or a pooled client outside its state machine.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// A new exchange was started while the previous result still has
    /// unread rows.
    UnreadResult,
    /// `begin` while another operation is open.
    OperationOpen,
    /// `bind` or execute without an open operation.
    NoOperation,
    /// Operation on a pooled client already closed or evicted.
    ClientClosed,
}

impl std::error::Error for UsageError { }

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnreadResult => write!(f, "sending next request without reading previous result"),
            Self::OperationOpen => write!(f, "another operation is already in progress"),
            Self::NoOperation => write!(f, "no operation in progress"),
            Self::ClientClosed => write!(f, "client is closed"),
        }
    }
}

impl std::fmt::Debug for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A space or index name lookup that did not match exactly one directory
/// entry.
pub struct NoSuchSpace {
    name: String,
    ambiguous: bool,
}

impl NoSuchSpace {
    fn missing(name: &str) -> Self {
        Self { name: name.to_owned(), ambiguous: false }
    }

    fn ambiguous(name: &str) -> Self {
        Self { name: name.to_owned(), ambiguous: true }
    }
}

impl std::error::Error for NoSuchSpace { }

impl std::fmt::Display for NoSuchSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ambiguous {
            write!(f, "name '{}' resolves to more than one entry", self.name)
        } else {
            write!(f, "no space or index named '{}'", self.name)
        }
    }
}

impl std::fmt::Debug for NoSuchSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}
