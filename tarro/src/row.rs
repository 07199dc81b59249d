//! Result rows and the streaming cursor.
//!
//! - [`Cursor`] — scoped view over the connection's unread response rows
//! - [`Row`] — one decoded tuple
//! - [`ColumnIndex`] — 0-based or metadata-name column lookup
//! - [`FromValue`] — typed column decoding
//! - [`DecodeError`]
use std::fmt;

use bytes::Bytes;

use crate::{
    Result,
    common::ByteStr,
    connection::Connection,
    msgpack::Value,
};

/// Size and metadata of a decoded response, before any row is read.
#[derive(Debug)]
pub(crate) struct RowSet {
    pub size: u32,
    pub columns: Option<Vec<ByteStr>>,
}

/// One decoded tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Vec<Value>,
}

impl Row {
    pub(crate) fn new(fields: Vec<Value>) -> Self {
        Self { fields }
    }

    /// All fields in order.
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the tuple has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Streaming cursor over one response.
///
/// Rows decode one at a time on [`advance`][Cursor::advance]; unread rows
/// stay in the connection's receive state, so the connection refuses a new
/// exchange until the cursor is exhausted or [`drain`][Cursor::drain]ed.
/// The borrow ties the cursor to the connection: it cannot outlive it or
/// overlap the next request.
pub struct Cursor<'c> {
    conn: &'c mut Connection,
    size: u32,
    columns: Option<Vec<ByteStr>>,
    row: Option<Row>,
}

impl<'c> Cursor<'c> {
    pub(crate) fn new(conn: &'c mut Connection, set: RowSet) -> Self {
        Self { conn, size: set.size, columns: set.columns, row: None }
    }

    /// Total number of rows in this response. Fixed at construction.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns `true` while unread rows remain.
    pub fn has_more(&self) -> bool {
        self.conn.pending_rows() > 0
    }

    /// Column names parsed from SQL response metadata, if present.
    pub fn columns(&self) -> Option<&[ByteStr]> {
        self.columns.as_deref()
    }

    /// Decode the next row into the current-row slot.
    ///
    /// Returns `false` when no rows remain; the current row is cleared in
    /// that case. Must be called before the first column access.
    pub fn advance(&mut self) -> Result<bool> {
        if self.conn.pending_rows() == 0 {
            self.row = None;
            return Ok(false);
        }
        self.row = Some(self.conn.next_row()?);
        Ok(true)
    }

    /// The current row, if positioned on one.
    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    /// Discard all remaining rows.
    ///
    /// No-op when already exhausted. Required before the connection can
    /// start a new exchange.
    pub fn drain(&mut self) -> Result<()> {
        self.row = None;
        self.conn.drain_pending()
    }

    fn field<I: ColumnIndex>(&self, idx: I) -> Result<&Value, DecodeError> {
        let row = self.row.as_ref().ok_or(DecodeError::NoCurrentRow)?;
        let nth = idx.position(self.columns.as_deref(), row.len())?;
        Ok(&row.fields[nth])
    }

    /// Decode a column of the current row.
    ///
    /// The index is a 0-based position or, for SQL responses with
    /// metadata, a column name.
    pub fn try_get<I: ColumnIndex, R: FromValue>(&self, idx: I) -> Result<R, DecodeError> {
        R::from_value(self.field(idx)?)
    }

    pub fn get_bool<I: ColumnIndex>(&self, idx: I) -> Result<bool, DecodeError> {
        self.try_get(idx)
    }

    pub fn get_i64<I: ColumnIndex>(&self, idx: I) -> Result<i64, DecodeError> {
        self.try_get(idx)
    }

    pub fn get_u64<I: ColumnIndex>(&self, idx: I) -> Result<u64, DecodeError> {
        self.try_get(idx)
    }

    pub fn get_f32<I: ColumnIndex>(&self, idx: I) -> Result<f32, DecodeError> {
        self.try_get(idx)
    }

    pub fn get_f64<I: ColumnIndex>(&self, idx: I) -> Result<f64, DecodeError> {
        self.try_get(idx)
    }

    /// Borrow a string column from the current row.
    pub fn get_str<I: ColumnIndex>(&self, idx: I) -> Result<&str, DecodeError> {
        match self.field(idx)? {
            Value::Str(s) => Ok(s.as_str()),
            other => Err(DecodeError::unexpected("str", other)),
        }
    }

    /// Borrow a binary column from the current row.
    pub fn get_bytes<I: ColumnIndex>(&self, idx: I) -> Result<&[u8], DecodeError> {
        match self.field(idx)? {
            Value::Bin(b) => Ok(b),
            other => Err(DecodeError::unexpected("bin", other)),
        }
    }

    /// Returns `true` if the column of the current row is nil.
    pub fn is_null<I: ColumnIndex>(&self, idx: I) -> Result<bool, DecodeError> {
        Ok(self.field(idx)?.is_nil())
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("size", &self.size)
            .field("remaining", &self.conn.pending_rows())
            .field("row", &self.row)
            .finish()
    }
}

/// Column lookup by 0-based position or metadata name.
pub trait ColumnIndex {
    fn position(&self, columns: Option<&[ByteStr]>, width: usize) -> Result<usize, DecodeError>;
}

impl ColumnIndex for usize {
    fn position(&self, _: Option<&[ByteStr]>, width: usize) -> Result<usize, DecodeError> {
        if *self < width {
            Ok(*self)
        } else {
            Err(DecodeError::IndexOutOfBounds(*self))
        }
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: Option<&[ByteStr]>, width: usize) -> Result<usize, DecodeError> {
        let nth = columns
            .and_then(|cols| cols.iter().position(|name| name == self))
            .ok_or_else(|| DecodeError::NoSuchColumn((*self).into()))?;
        if nth >= width {
            return Err(DecodeError::IndexOutOfBounds(nth));
        }
        Ok(nth)
    }
}

/// A type decodable from one tuple field.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, DecodeError>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => Err(DecodeError::unexpected("bool", other)),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::UInt(v) => Ok(*v),
            other => Err(DecodeError::unexpected("uint", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => i64::try_from(*v).map_err(|_| DecodeError::unexpected("int", value)),
            other => Err(DecodeError::unexpected("int", other)),
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {
        $(impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, DecodeError> {
                let wide = i64::from_value(value)?;
                <$ty>::try_from(wide).map_err(|_| DecodeError::unexpected(stringify!($ty), value))
            }
        })*
    };
}

narrow_int!(i32, u32, i16, u16, i8, u8);

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::F32(v) => Ok(*v),
            other => Err(DecodeError::unexpected("float32", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::F64(v) => Ok(*v),
            Value::F32(v) => Ok(f64::from(*v)),
            other => Err(DecodeError::unexpected("float64", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Str(s) => Ok(s.as_str().to_owned()),
            other => Err(DecodeError::unexpected("str", other)),
        }
    }
}

impl FromValue for ByteStr {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => Err(DecodeError::unexpected("str", other)),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Bin(b) => Ok(b.clone()),
            other => Err(DecodeError::unexpected("bin", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Bytes::from_value(value).map(|b| b.to_vec())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Column access failure. Recoverable: the connection stays usable.
pub enum DecodeError {
    /// Access before the first `advance()` or past the end.
    NoCurrentRow,
    IndexOutOfBounds(usize),
    NoSuchColumn(String),
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
}

impl DecodeError {
    fn unexpected(expected: &'static str, found: &Value) -> Self {
        Self::UnexpectedType { expected, found: found.type_name() }
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCurrentRow => write!(f, "no current row"),
            Self::IndexOutOfBounds(nth) => write!(f, "column index {nth} out of bounds"),
            Self::NoSuchColumn(name) => write!(f, "no such column: {name}"),
            Self::UnexpectedType { expected, found } => {
                write!(f, "expected {expected} column, found {found}")
            },
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
