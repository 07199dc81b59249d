//! Response decoding.
//!
//! A response payload is a header map echoing the request sync, then a body
//! map. The body carries `DATA` (an array of tuples), or `ERROR` (a message
//! string) when the high bit of the header code is set; SQL-shaped
//! responses put a `METADATA` array of field-name maps before `DATA`.
use bytes::Bytes;

use super::{ProtocolError, key};
use crate::{common::ByteStr, msgpack};

/// High bit of the response code marking a server error.
const ERROR_TYPE_BIT: u64 = 0x8000;

/// Decoded response header.
#[derive(Debug)]
pub struct Header {
    pub sync: u64,
    pub code: u64,
}

impl Header {
    /// Server error code, if the header marks an error response.
    pub fn error_code(&self) -> Option<u32> {
        (self.code & ERROR_TYPE_BIT != 0).then_some((self.code & !ERROR_TYPE_BIT) as u32)
    }
}

/// Decoded response body with the tuple payload left unparsed.
#[derive(Debug)]
pub enum Body {
    /// `DATA`: `rows` tuples remain undecoded in `payload`.
    Data {
        rows: u32,
        columns: Option<Vec<ByteStr>>,
        payload: Bytes,
    },
    /// `ERROR` message.
    Error { message: ByteStr },
    /// Absent or empty body map, as a ping response.
    Empty,
}

/// Error reported by the server in an ERROR body.
///
/// Recoverable at the session level: the byte stream is still positioned
/// at a frame boundary and the connection stays usable.
pub struct ServerError {
    pub code: u32,
    pub message: ByteStr,
}

impl std::error::Error for ServerError { }

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error 0x{:x}: {}", self.code, self.message)
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Decode the header map, consuming it from the payload.
///
/// Unknown header keys (`SCHEMA_ID` and friends) are skipped.
pub fn decode_header(payload: &mut Bytes) -> Result<Header, ProtocolError> {
    let entries = msgpack::get_map_len(payload)?;
    let mut sync = None;
    let mut code = None;
    for _ in 0..entries {
        match msgpack::get_uint(payload)? {
            k if k == u64::from(key::CODE) => code = Some(msgpack::get_uint(payload)?),
            k if k == u64::from(key::SYNC) => sync = Some(msgpack::get_uint(payload)?),
            _ => msgpack::skip_value(payload)?,
        }
    }
    match (sync, code) {
        (Some(sync), Some(code)) => Ok(Header { sync, code }),
        _ => Err(ProtocolError::shape("response header misses CODE or SYNC")),
    }
}

/// Decode the body map up to the tuple data.
///
/// `DATA` is the last body entry the server writes, so the tuples
/// themselves stay undecoded: only the array header is consumed and the
/// rest of the frame is handed to the cursor.
pub fn decode_body(mut payload: Bytes) -> Result<Body, ProtocolError> {
    if payload.is_empty() {
        return Ok(Body::Empty);
    }

    let entries = msgpack::get_map_len(&mut payload)?;
    if entries == 0 {
        return Ok(Body::Empty);
    }

    let mut columns = None;
    for _ in 0..entries {
        match msgpack::get_uint(&mut payload)? {
            k if k == u64::from(key::DATA) => {
                let rows = msgpack::get_array_len(&mut payload)?;
                let rows = u32::try_from(rows)
                    .map_err(|_| ProtocolError::shape("DATA row count overflows u32"))?;
                return Ok(Body::Data { rows, columns, payload });
            },
            k if k == u64::from(key::ERROR) => {
                let message = match msgpack::get_value(&mut payload)? {
                    msgpack::Value::Str(message) => message,
                    _ => return Err(ProtocolError::shape("ERROR body is not a string")),
                };
                return Ok(Body::Error { message });
            },
            k if k == u64::from(key::METADATA) => {
                columns = Some(decode_metadata(&mut payload)?);
            },
            _ => msgpack::skip_value(&mut payload)?,
        }
    }
    Ok(Body::Empty)
}

/// `METADATA` is an array of maps, each holding at least `FIELD_NAME`.
fn decode_metadata(payload: &mut Bytes) -> Result<Vec<ByteStr>, ProtocolError> {
    let fields = msgpack::get_array_len(payload)?;
    let mut columns = Vec::with_capacity(fields.min(1024));
    for _ in 0..fields {
        let entries = msgpack::get_map_len(payload)?;
        let mut name = None;
        for _ in 0..entries {
            match msgpack::get_uint(payload)? {
                k if k == u64::from(key::FIELD_NAME) => match msgpack::get_value(payload)? {
                    msgpack::Value::Str(n) => name = Some(n),
                    _ => return Err(ProtocolError::shape("FIELD_NAME is not a string")),
                },
                _ => msgpack::skip_value(payload)?,
            }
        }
        match name {
            Some(name) => columns.push(name),
            None => return Err(ProtocolError::shape("METADATA field misses FIELD_NAME")),
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;
    use crate::msgpack::{put_array_len, put_map_len, put_str, put_uint, put_value, Value};

    fn header_bytes(code: u64, sync: u64, schema_id: Option<u64>) -> BytesMut {
        let mut buf = BytesMut::new();
        put_map_len(&mut buf, 2 + usize::from(schema_id.is_some()));
        put_uint(&mut buf, u64::from(key::CODE));
        put_uint(&mut buf, code);
        put_uint(&mut buf, u64::from(key::SYNC));
        put_uint(&mut buf, sync);
        if let Some(schema) = schema_id {
            put_uint(&mut buf, u64::from(key::SCHEMA_ID));
            put_uint(&mut buf, schema);
        }
        buf
    }

    #[test]
    fn header_with_unknown_keys() {
        let mut payload = header_bytes(0, 3, Some(99)).freeze();
        let header = decode_header(&mut payload).unwrap();
        assert_eq!(header.sync, 3);
        assert_eq!(header.code, 0);
        assert_eq!(header.error_code(), None);
        assert!(payload.is_empty());
    }

    #[test]
    fn error_code_bit() {
        let mut payload = header_bytes(0x8000 | 36, 1, None).freeze();
        let header = decode_header(&mut payload).unwrap();
        assert_eq!(header.error_code(), Some(36));
    }

    #[test]
    fn data_body_leaves_tuples_unparsed() {
        let mut buf = BytesMut::new();
        put_map_len(&mut buf, 1);
        put_uint(&mut buf, u64::from(key::DATA));
        put_array_len(&mut buf, 2);
        put_value(&mut buf, &Value::Array(vec![Value::UInt(1)]));
        put_value(&mut buf, &Value::Array(vec![Value::UInt(2)]));

        let Body::Data { rows, columns, mut payload } = decode_body(buf.freeze()).unwrap() else {
            panic!("expected data body");
        };
        assert_eq!(rows, 2);
        assert!(columns.is_none());
        // the two tuples are still encoded in the payload
        assert_eq!(crate::msgpack::get_value(&mut payload).unwrap(), Value::Array(vec![Value::UInt(1)]));
        assert_eq!(crate::msgpack::get_value(&mut payload).unwrap(), Value::Array(vec![Value::UInt(2)]));
        assert!(payload.is_empty());
    }

    #[test]
    fn error_body() {
        let mut buf = BytesMut::new();
        put_map_len(&mut buf, 1);
        put_uint(&mut buf, u64::from(key::ERROR));
        put_str(&mut buf, "Space '512' does not exist");

        let Body::Error { message } = decode_body(buf.freeze()).unwrap() else {
            panic!("expected error body");
        };
        assert_eq!(message, "Space '512' does not exist");
    }

    #[test]
    fn metadata_before_data() {
        let mut buf = BytesMut::new();
        put_map_len(&mut buf, 2);
        put_uint(&mut buf, u64::from(key::METADATA));
        put_array_len(&mut buf, 2);
        for name in ["ID", "NAME"] {
            put_map_len(&mut buf, 1);
            put_uint(&mut buf, u64::from(key::FIELD_NAME));
            put_str(&mut buf, name);
        }
        put_uint(&mut buf, u64::from(key::DATA));
        put_array_len(&mut buf, 0);

        let Body::Data { rows, columns, .. } = decode_body(buf.freeze()).unwrap() else {
            panic!("expected data body");
        };
        assert_eq!(rows, 0);
        assert_eq!(columns.as_deref().unwrap(), ["ID", "NAME"]);
    }

    #[test]
    fn empty_bodies() {
        assert!(matches!(decode_body(Bytes::new()).unwrap(), Body::Empty));

        let mut buf = BytesMut::new();
        put_map_len(&mut buf, 0);
        assert!(matches!(decode_body(buf.freeze()).unwrap(), Body::Empty));
    }
}
