//! Request encoding.
//!
//! A request payload is a header map `{CODE, SYNC}` followed by an
//! opcode-specific body map. The body's trailing entry is always the
//! argument array (key tuple, new tuple, update ops or SQL binds) which the
//! session accumulates separately, so [`Operation::encode_body`] writes the
//! map header with the trailing key already counted and every fixed entry;
//! the session appends the final key and array itself.
use bytes::BytesMut;

use super::{IteratorType, code, key};
use crate::msgpack::{self, Value};

/// One request kind with its fixed body fields.
///
/// A closed union: the opcode, the fixed body entries and the key of the
/// trailing argument array are all derived from the variant, so a declared
/// map entry count can never drift from the entries actually written.
#[derive(Debug)]
pub enum Operation<'a> {
    Select {
        space: u32,
        index: u32,
        limit: u32,
        offset: u32,
        iterator: IteratorType,
    },
    Insert { space: u32 },
    Replace { space: u32 },
    Update { space: u32, index: u32, k: &'a [Value] },
    Delete { space: u32, index: u32 },
    Upsert { space: u32, tuple: &'a [Value] },
    Eval { expression: &'a str },
    SqlExecute { statement: &'a str },
    Ping,
    Auth { user: &'a str },
}

impl Operation<'_> {
    /// Request opcode.
    pub fn code(&self) -> u8 {
        match self {
            Operation::Select { .. } => code::SELECT,
            Operation::Insert { .. } => code::INSERT,
            Operation::Replace { .. } => code::REPLACE,
            Operation::Update { .. } => code::UPDATE,
            Operation::Delete { .. } => code::DELETE,
            Operation::Upsert { .. } => code::UPSERT,
            Operation::Eval { .. } => code::EVAL,
            Operation::SqlExecute { .. } => code::SQL_EXECUTE,
            Operation::Ping => code::PING,
            Operation::Auth { .. } => code::AUTH,
        }
    }

    /// Body key under which the bound argument array is written, if the
    /// variant takes one.
    pub fn args_key(&self) -> Option<u8> {
        match self {
            Operation::Select { .. } | Operation::Delete { .. } => Some(key::KEY),
            Operation::Insert { .. }
            | Operation::Replace { .. }
            | Operation::Eval { .. }
            | Operation::Auth { .. } => Some(key::TUPLE),
            Operation::Update { .. } => Some(key::TUPLE),
            Operation::Upsert { .. } => Some(key::UPSERT_OPS),
            Operation::SqlExecute { .. } => Some(key::SQL_BIND),
            Operation::Ping => None,
        }
    }

    /// Write the body map header and every fixed entry.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        let trailing = usize::from(self.args_key().is_some());
        match self {
            Operation::Select { space, index, limit, offset, iterator } => {
                msgpack::put_map_len(buf, 5 + trailing);
                put_entry_uint(buf, key::SPACE, u64::from(*space));
                put_entry_uint(buf, key::INDEX, u64::from(*index));
                put_entry_uint(buf, key::LIMIT, u64::from(*limit));
                put_entry_uint(buf, key::OFFSET, u64::from(*offset));
                put_entry_uint(buf, key::ITERATOR, *iterator as u64);
            },
            Operation::Insert { space } | Operation::Replace { space } => {
                msgpack::put_map_len(buf, 1 + trailing);
                put_entry_uint(buf, key::SPACE, u64::from(*space));
            },
            Operation::Update { space, index, k } => {
                msgpack::put_map_len(buf, 3 + trailing);
                put_entry_uint(buf, key::SPACE, u64::from(*space));
                put_entry_uint(buf, key::INDEX, u64::from(*index));
                put_entry_tuple(buf, key::KEY, k);
            },
            Operation::Delete { space, index } => {
                msgpack::put_map_len(buf, 2 + trailing);
                put_entry_uint(buf, key::SPACE, u64::from(*space));
                put_entry_uint(buf, key::INDEX, u64::from(*index));
            },
            Operation::Upsert { space, tuple } => {
                msgpack::put_map_len(buf, 2 + trailing);
                put_entry_uint(buf, key::SPACE, u64::from(*space));
                put_entry_tuple(buf, key::TUPLE, tuple);
            },
            Operation::Eval { expression } => {
                msgpack::put_map_len(buf, 1 + trailing);
                msgpack::put_uint(buf, u64::from(key::EXPRESSION));
                msgpack::put_str(buf, expression);
            },
            Operation::SqlExecute { statement } => {
                msgpack::put_map_len(buf, 1 + trailing);
                msgpack::put_uint(buf, u64::from(key::SQL_TEXT));
                msgpack::put_str(buf, statement);
            },
            Operation::Ping => {
                msgpack::put_map_len(buf, 0);
            },
            Operation::Auth { user } => {
                msgpack::put_map_len(buf, 1 + trailing);
                msgpack::put_uint(buf, u64::from(key::USER_NAME));
                msgpack::put_str(buf, user);
            },
        }
    }
}

/// Write the request header map for `code` under request id `sync`.
pub fn put_header(buf: &mut BytesMut, code: u8, sync: u64) {
    msgpack::put_map_len(buf, 2);
    msgpack::put_uint(buf, u64::from(key::CODE));
    msgpack::put_uint(buf, u64::from(code));
    msgpack::put_uint(buf, u64::from(key::SYNC));
    msgpack::put_uint(buf, sync);
}

fn put_entry_uint(buf: &mut BytesMut, k: u8, value: u64) {
    msgpack::put_uint(buf, u64::from(k));
    msgpack::put_uint(buf, value);
}

fn put_entry_tuple(buf: &mut BytesMut, k: u8, tuple: &[Value]) {
    msgpack::put_uint(buf, u64::from(k));
    msgpack::put_array_len(buf, tuple.len());
    for value in tuple {
        msgpack::put_value(buf, value);
    }
}

/// One field mutation of an update or upsert.
///
/// Encoded as the protocol's 3-element op array `[op, field, operand]`
/// (`["#", field, count]` for deletion).
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// `+` add the operand to the field.
    Plus(u32, Value),
    /// `-` subtract the operand from the field.
    Minus(u32, Value),
    /// `&` bitwise and.
    And(u32, Value),
    /// `|` bitwise or.
    Or(u32, Value),
    /// `^` bitwise xor.
    Xor(u32, Value),
    /// `#` delete `count` fields starting at the field.
    Delete(u32, u32),
    /// `!` insert the operand before the field.
    Insert(u32, Value),
    /// `=` assign the operand to the field.
    Assign(u32, Value),
}

impl UpdateOp {
    /// Protocol op code.
    pub fn op(&self) -> &'static str {
        match self {
            UpdateOp::Plus(..) => "+",
            UpdateOp::Minus(..) => "-",
            UpdateOp::And(..) => "&",
            UpdateOp::Or(..) => "|",
            UpdateOp::Xor(..) => "^",
            UpdateOp::Delete(..) => "#",
            UpdateOp::Insert(..) => "!",
            UpdateOp::Assign(..) => "=",
        }
    }
}

impl From<UpdateOp> for Value {
    fn from(op: UpdateOp) -> Value {
        let code = Value::Str(op.op().into());
        let (field, operand) = match op {
            UpdateOp::Plus(f, v)
            | UpdateOp::Minus(f, v)
            | UpdateOp::And(f, v)
            | UpdateOp::Or(f, v)
            | UpdateOp::Xor(f, v)
            | UpdateOp::Insert(f, v)
            | UpdateOp::Assign(f, v) => (f, v),
            UpdateOp::Delete(f, count) => (f, Value::UInt(u64::from(count))),
        };
        Value::Array(vec![code, Value::UInt(u64::from(field)), operand])
    }
}
