//! MessagePack value codec.
//!
//! Tarantool encodes every request body, response body and tuple as
//! MessagePack. Only the subset the protocol actually uses is implemented:
//! nil, bool, integers, floats, str, bin, array and map. Extension types
//! are never produced by this client and are only skippable on decode.
//!
//! Encoding writes into any [`BufMut`], decoding consumes from a [`Bytes`]
//! so decoded strings and blobs borrow the frame buffer.
use bytes::{Buf, BufMut, Bytes};

use crate::{common::ByteStr, iproto::ProtocolError};

/// A single decoded MessagePack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    /// Negative integers. Non-negative integers always decode as [`UInt`][Value::UInt].
    Int(i64),
    UInt(u64),
    F32(f32),
    F64(f64),
    Str(ByteStr),
    Bin(Bytes),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Name of the wire type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::F32(_) => "float32",
            Value::F64(_) => "float64",
            Value::Str(_) => "str",
            Value::Bin(_) => "bin",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Returns `true` for [`Value::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

// ===== encode =====

pub fn put_nil(buf: &mut impl BufMut) {
    buf.put_u8(0xc0);
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 0xc3 } else { 0xc2 });
}

/// Encode a signed integer in its smallest form.
///
/// Non-negative input is written in the unsigned form, matching how the
/// server itself encodes integers.
pub fn put_int(buf: &mut impl BufMut, value: i64) {
    if value >= 0 {
        return put_uint(buf, value as u64);
    }
    if value >= -32 {
        buf.put_i8(value as i8);
    } else if value >= i64::from(i8::MIN) {
        buf.put_u8(0xd0);
        buf.put_i8(value as i8);
    } else if value >= i64::from(i16::MIN) {
        buf.put_u8(0xd1);
        buf.put_i16(value as i16);
    } else if value >= i64::from(i32::MIN) {
        buf.put_u8(0xd2);
        buf.put_i32(value as i32);
    } else {
        buf.put_u8(0xd3);
        buf.put_i64(value);
    }
}

pub fn put_uint(buf: &mut impl BufMut, value: u64) {
    if value < 0x80 {
        buf.put_u8(value as u8);
    } else if value <= u64::from(u8::MAX) {
        buf.put_u8(0xcc);
        buf.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.put_u8(0xcd);
        buf.put_u16(value as u16);
    } else if value <= u64::from(u32::MAX) {
        buf.put_u8(0xce);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(0xcf);
        buf.put_u64(value);
    }
}

pub fn put_f32(buf: &mut impl BufMut, value: f32) {
    buf.put_u8(0xca);
    buf.put_f32(value);
}

pub fn put_f64(buf: &mut impl BufMut, value: f64) {
    buf.put_u8(0xcb);
    buf.put_f64(value);
}

pub fn put_str(buf: &mut impl BufMut, value: &str) {
    let len = value.len();
    if len <= 31 {
        buf.put_u8(0xa0 | len as u8);
    } else if len <= usize::from(u8::MAX) {
        buf.put_u8(0xd9);
        buf.put_u8(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xda);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xdb);
        buf.put_u32(crate::common::UsizeExt::to_u32(len));
    }
    buf.put_slice(value.as_bytes());
}

pub fn put_bin(buf: &mut impl BufMut, value: &[u8]) {
    let len = value.len();
    if len <= usize::from(u8::MAX) {
        buf.put_u8(0xc4);
        buf.put_u8(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xc5);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xc6);
        buf.put_u32(crate::common::UsizeExt::to_u32(len));
    }
    buf.put_slice(value);
}

/// Write an array header; the caller must write exactly `len` values after it.
pub fn put_array_len(buf: &mut impl BufMut, len: usize) {
    if len <= 15 {
        buf.put_u8(0x90 | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xdc);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xdd);
        buf.put_u32(crate::common::UsizeExt::to_u32(len));
    }
}

/// Write a map header; the caller must write exactly `len` key/value pairs
/// after it. A mismatch desynchronizes the peer.
pub fn put_map_len(buf: &mut impl BufMut, len: usize) {
    if len <= 15 {
        buf.put_u8(0x80 | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(0xde);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0xdf);
        buf.put_u32(crate::common::UsizeExt::to_u32(len));
    }
}

pub fn put_value(buf: &mut impl BufMut, value: &Value) {
    match value {
        Value::Nil => put_nil(buf),
        Value::Bool(v) => put_bool(buf, *v),
        Value::Int(v) => put_int(buf, *v),
        Value::UInt(v) => put_uint(buf, *v),
        Value::F32(v) => put_f32(buf, *v),
        Value::F64(v) => put_f64(buf, *v),
        Value::Str(v) => put_str(buf, v),
        Value::Bin(v) => put_bin(buf, v),
        Value::Array(items) => {
            put_array_len(buf, items.len());
            for item in items {
                put_value(buf, item);
            }
        },
        Value::Map(entries) => {
            put_map_len(buf, entries.len());
            for (key, value) in entries {
                put_value(buf, key);
                put_value(buf, value);
            }
        },
    }
}

// ===== decode =====

fn check(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::truncated());
    }
    Ok(())
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes, ProtocolError> {
    check(buf, len)?;
    Ok(buf.split_to(len))
}

fn take_str(buf: &mut Bytes, len: usize) -> Result<ByteStr, ProtocolError> {
    let bytes = take(buf, len)?;
    ByteStr::from_utf8(bytes).map_err(|_| ProtocolError::shape("string value is not utf8"))
}

/// Decode one value of any type.
pub fn get_value(buf: &mut Bytes) -> Result<Value, ProtocolError> {
    check(buf, 1)?;
    let marker = buf.get_u8();
    let value = match marker {
        0x00..=0x7f => Value::UInt(u64::from(marker)),
        0x80..=0x8f => get_map_body(buf, usize::from(marker & 0x0f))?,
        0x90..=0x9f => get_array_body(buf, usize::from(marker & 0x0f))?,
        0xa0..=0xbf => Value::Str(take_str(buf, usize::from(marker & 0x1f))?),
        0xc0 => Value::Nil,
        0xc2 => Value::Bool(false),
        0xc3 => Value::Bool(true),
        0xc4 => {
            check(buf, 1)?;
            let len = usize::from(buf.get_u8());
            Value::Bin(take(buf, len)?)
        },
        0xc5 => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            Value::Bin(take(buf, len)?)
        },
        0xc6 => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            Value::Bin(take(buf, len)?)
        },
        0xca => {
            check(buf, 4)?;
            Value::F32(buf.get_f32())
        },
        0xcb => {
            check(buf, 8)?;
            Value::F64(buf.get_f64())
        },
        0xcc => {
            check(buf, 1)?;
            Value::UInt(u64::from(buf.get_u8()))
        },
        0xcd => {
            check(buf, 2)?;
            Value::UInt(u64::from(buf.get_u16()))
        },
        0xce => {
            check(buf, 4)?;
            Value::UInt(u64::from(buf.get_u32()))
        },
        0xcf => {
            check(buf, 8)?;
            Value::UInt(buf.get_u64())
        },
        0xd0 => {
            check(buf, 1)?;
            int_value(i64::from(buf.get_i8()))
        },
        0xd1 => {
            check(buf, 2)?;
            int_value(i64::from(buf.get_i16()))
        },
        0xd2 => {
            check(buf, 4)?;
            int_value(i64::from(buf.get_i32()))
        },
        0xd3 => {
            check(buf, 8)?;
            int_value(buf.get_i64())
        },
        0xd9 => {
            check(buf, 1)?;
            let len = usize::from(buf.get_u8());
            Value::Str(take_str(buf, len)?)
        },
        0xda => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            Value::Str(take_str(buf, len)?)
        },
        0xdb => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            Value::Str(take_str(buf, len)?)
        },
        0xdc => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            get_array_body(buf, len)?
        },
        0xdd => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            get_array_body(buf, len)?
        },
        0xde => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            get_map_body(buf, len)?
        },
        0xdf => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            get_map_body(buf, len)?
        },
        0xe0..=0xff => Value::Int(i64::from(marker as i8)),
        other => return Err(ProtocolError::marker("value", other)),
    };
    Ok(value)
}

fn int_value(value: i64) -> Value {
    // signed wire forms may still hold non-negative numbers
    if value >= 0 { Value::UInt(value as u64) } else { Value::Int(value) }
}

fn get_array_body(buf: &mut Bytes, len: usize) -> Result<Value, ProtocolError> {
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(get_value(buf)?);
    }
    Ok(Value::Array(items))
}

fn get_map_body(buf: &mut Bytes, len: usize) -> Result<Value, ProtocolError> {
    let mut entries = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        let key = get_value(buf)?;
        let value = get_value(buf)?;
        entries.push((key, value));
    }
    Ok(Value::Map(entries))
}

/// Decode an unsigned integer, as used for header keys and id fields.
pub fn get_uint(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    check(buf, 1)?;
    let marker = buf.get_u8();
    match marker {
        0x00..=0x7f => Ok(u64::from(marker)),
        0xcc => {
            check(buf, 1)?;
            Ok(u64::from(buf.get_u8()))
        },
        0xcd => {
            check(buf, 2)?;
            Ok(u64::from(buf.get_u16()))
        },
        0xce => {
            check(buf, 4)?;
            Ok(u64::from(buf.get_u32()))
        },
        0xcf => {
            check(buf, 8)?;
            Ok(buf.get_u64())
        },
        other => Err(ProtocolError::marker("unsigned integer", other)),
    }
}

/// Decode an array header, returning the element count.
pub fn get_array_len(buf: &mut Bytes) -> Result<usize, ProtocolError> {
    check(buf, 1)?;
    let marker = buf.get_u8();
    match marker {
        0x90..=0x9f => Ok(usize::from(marker & 0x0f)),
        0xdc => {
            check(buf, 2)?;
            Ok(usize::from(buf.get_u16()))
        },
        0xdd => {
            check(buf, 4)?;
            Ok(buf.get_u32() as usize)
        },
        other => Err(ProtocolError::marker("array", other)),
    }
}

/// Decode a map header, returning the entry count.
pub fn get_map_len(buf: &mut Bytes) -> Result<usize, ProtocolError> {
    check(buf, 1)?;
    let marker = buf.get_u8();
    match marker {
        0x80..=0x8f => Ok(usize::from(marker & 0x0f)),
        0xde => {
            check(buf, 2)?;
            Ok(usize::from(buf.get_u16()))
        },
        0xdf => {
            check(buf, 4)?;
            Ok(buf.get_u32() as usize)
        },
        other => Err(ProtocolError::marker("map", other)),
    }
}

/// Skip one value of any type, including extension types the client never
/// decodes (newer servers attach them to error bodies).
pub fn skip_value(buf: &mut Bytes) -> Result<(), ProtocolError> {
    check(buf, 1)?;
    let marker = buf.get_u8();
    let skip = match marker {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => 0,
        0xa0..=0xbf => usize::from(marker & 0x1f),
        0xcc | 0xd0 => 1,
        0xcd | 0xd1 => 2,
        0xce | 0xd2 | 0xca => 4,
        0xcf | 0xd3 | 0xcb => 8,
        0xd4 => 2,
        0xd5 => 3,
        0xd6 => 5,
        0xd7 => 9,
        0xd8 => 17,
        0xc4 | 0xd9 => {
            check(buf, 1)?;
            usize::from(buf.get_u8())
        },
        0xc5 | 0xda => {
            check(buf, 2)?;
            usize::from(buf.get_u16())
        },
        0xc6 | 0xdb => {
            check(buf, 4)?;
            buf.get_u32() as usize
        },
        0xc7 => {
            check(buf, 1)?;
            usize::from(buf.get_u8()) + 1
        },
        0xc8 => {
            check(buf, 2)?;
            usize::from(buf.get_u16()) + 1
        },
        0xc9 => {
            check(buf, 4)?;
            buf.get_u32() as usize + 1
        },
        0x90..=0x9f => return skip_many(buf, usize::from(marker & 0x0f)),
        0xdc => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            return skip_many(buf, len);
        },
        0xdd => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            return skip_many(buf, len);
        },
        0x80..=0x8f => return skip_many(buf, usize::from(marker & 0x0f) * 2),
        0xde => {
            check(buf, 2)?;
            let len = usize::from(buf.get_u16());
            return skip_many(buf, len * 2);
        },
        0xdf => {
            check(buf, 4)?;
            let len = buf.get_u32() as usize;
            return skip_many(buf, len * 2);
        },
        other => return Err(ProtocolError::marker("value", other)),
    };
    check(buf, skip)?;
    buf.advance(skip);
    Ok(())
}

fn skip_many(buf: &mut Bytes, count: usize) -> Result<(), ProtocolError> {
    for _ in 0..count {
        skip_value(buf)?;
    }
    Ok(())
}

// ===== conversions =====

macro_rules! value_from {
    ($($ty:ty: $pat:pat => $body:expr,)*) => {
        $(impl From<$ty> for Value {
            fn from($pat: $ty) -> Value {
                $body
            }
        })*
    };
}

value_from! {
    (): _ => Value::Nil,
    bool: v => Value::Bool(v),
    i8: v => Value::from(i64::from(v)),
    i16: v => Value::from(i64::from(v)),
    i32: v => Value::from(i64::from(v)),
    i64: v => if v >= 0 { Value::UInt(v as u64) } else { Value::Int(v) },
    u8: v => Value::UInt(u64::from(v)),
    u16: v => Value::UInt(u64::from(v)),
    u32: v => Value::UInt(u64::from(v)),
    u64: v => Value::UInt(v),
    f32: v => Value::F32(v),
    f64: v => Value::F64(v),
    &str: v => Value::Str(ByteStr::copy_from_str(v)),
    String: v => Value::Str(v.into()),
    ByteStr: v => Value::Str(v),
    &[u8]: v => Value::Bin(Bytes::copy_from_slice(v)),
    Vec<u8>: v => Value::Bin(Bytes::from(v)),
    Bytes: v => Value::Bin(v),
    Vec<Value>: v => Value::Array(v),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        match value {
            Some(v) => v.into(),
            None => Value::Nil,
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut buf = BytesMut::new();
        put_value(&mut buf, &value);
        let mut bytes = buf.freeze();
        let out = get_value(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "value not fully consumed");
        out
    }

    #[test]
    fn scalar_roundtrip() {
        assert_eq!(roundtrip(Value::Nil), Value::Nil);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Bool(false)), Value::Bool(false));
        assert_eq!(roundtrip(Value::F32(1.5)), Value::F32(1.5));
        assert_eq!(roundtrip(Value::F64(-0.25)), Value::F64(-0.25));
        assert_eq!(roundtrip(Value::from("FooBar500")), Value::from("FooBar500"));
        assert_eq!(roundtrip(Value::from(vec![0u8, 1, 255])), Value::from(vec![0u8, 1, 255]));
    }

    #[test]
    fn integer_boundaries() {
        for v in [0u64, 1, 127, 128, 255, 256, 65535, 65536, u64::from(u32::MAX), u64::from(u32::MAX) + 1, u64::MAX] {
            assert_eq!(roundtrip(Value::UInt(v)), Value::UInt(v));
        }
        for v in [-1i64, -32, -33, -128, -129, -32768, -32769, i64::from(i32::MIN), i64::from(i32::MIN) - 1, i64::MIN] {
            assert_eq!(roundtrip(Value::Int(v)), Value::Int(v));
        }
    }

    #[test]
    fn signed_wire_form_normalizes_to_uint() {
        // int64 marker holding a non-negative number decodes as UInt
        let mut buf = BytesMut::new();
        buf.put_u8(0xd3);
        buf.put_i64(42);
        assert_eq!(get_value(&mut buf.freeze()).unwrap(), Value::UInt(42));
    }

    #[test]
    fn smallest_integer_encoding() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, 5);
        assert_eq!(&buf[..], &[0x05]);

        let mut buf = BytesMut::new();
        put_int(&mut buf, -1);
        assert_eq!(&buf[..], &[0xff]);

        let mut buf = BytesMut::new();
        put_uint(&mut buf, 500);
        assert_eq!(&buf[..], &[0xcd, 0x01, 0xf4]);
    }

    #[test]
    fn string_length_boundaries() {
        let fix = "a".repeat(31);
        let mut buf = BytesMut::new();
        put_str(&mut buf, &fix);
        assert_eq!(buf[0], 0xa0 | 31);

        let long = "a".repeat(32);
        let mut buf = BytesMut::new();
        put_str(&mut buf, &long);
        assert_eq!(buf[0], 0xd9);
        assert_eq!(roundtrip(Value::from(long.clone())), Value::from(long));
    }

    #[test]
    fn container_roundtrip() {
        let value = Value::Array(vec![
            Value::UInt(500),
            Value::from("FooBar500"),
            Value::Map(vec![(Value::from("k"), Value::Nil)]),
        ]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn skip_matches_decode() {
        let value = Value::Array(vec![
            Value::Map(vec![(Value::from("a"), Value::Array(vec![Value::UInt(1), Value::Nil]))]),
            Value::from("tail"),
        ]);
        let mut buf = BytesMut::new();
        put_value(&mut buf, &value);
        put_uint(&mut buf, 7);

        let mut bytes = buf.freeze();
        skip_value(&mut bytes).unwrap();
        assert_eq!(get_uint(&mut bytes).unwrap(), 7);
        assert!(bytes.is_empty());
    }

    #[test]
    fn skip_extension_types() {
        // fixext4 and ext8, as newer servers attach to error bodies
        let mut buf = BytesMut::new();
        buf.put_u8(0xd6);
        buf.put_slice(&[3, 1, 2, 3, 4]);
        buf.put_u8(0xc7);
        buf.put_u8(2);
        buf.put_slice(&[3, 0xaa, 0xbb]);
        put_nil(&mut buf);

        let mut bytes = buf.freeze();
        skip_value(&mut bytes).unwrap();
        skip_value(&mut bytes).unwrap();
        assert_eq!(get_value(&mut bytes).unwrap(), Value::Nil);
    }

    #[test]
    fn truncated_input() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "hello");
        let mut bytes = buf.freeze();
        bytes.truncate(3);
        assert!(get_value(&mut bytes).is_err());

        let mut empty = Bytes::new();
        assert!(get_value(&mut empty).is_err());
    }
}
