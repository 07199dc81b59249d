//! Tarantool iproto wire protocol.
//!
//! # Messaging overview
//!
//! Every message is a frame: one MessagePack unsigned integer holding the
//! payload length, always written in its 5-byte `uint32` form, followed by
//! exactly that many payload bytes.
//!
//! ```text
//! | 0xce |     u32 BE length     | payload
//! |------|-----------------------|--------
//! |  ce  | 00 | 00 | 00 | 2a     |   ..
//! ```
//!
//! The payload is a header map followed by a body map. The request header
//! carries the opcode (`CODE`) and a per-connection monotonic request id
//! (`SYNC`); the response header echoes the sync, with the high bit of the
//! code marking a server error. The body is keyed by the small integer
//! constants in [`key`].
//!
//! Before any frame is exchanged the server sends a raw 128-byte greeting;
//! bytes `[64, 108)` hold the base64-encoded salt for the chap-sha1 auth
//! handshake.
mod error;
pub mod request;
pub mod response;

pub use error::ProtocolError;
pub use request::{Operation, UpdateOp};

/// MessagePack marker of the frame length prefix.
pub(crate) const FRAME_LENGTH_MARKER: u8 = 0xce;

/// Size of the raw greeting sent by the server on connect.
pub(crate) const GREETING_SIZE: usize = 128;

/// Byte range of the base64-encoded salt inside the greeting.
pub(crate) const GREETING_SALT: std::ops::Range<usize> = 64..108;

/// Header and body map keys.
pub mod key {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_ID: u8 = 0x05;
    pub const SPACE: u8 = 0x10;
    pub const INDEX: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPRESSION: u8 = 0x27;
    pub const UPSERT_OPS: u8 = 0x28;
    pub const FIELD_NAME: u8 = 0x29;
    pub const DATA: u8 = 0x30;
    pub const ERROR: u8 = 0x31;
    pub const METADATA: u8 = 0x32;
    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const SQL_OPTIONS: u8 = 0x42;
    pub const SQL_INFO: u8 = 0x43;
    pub const SQL_ROW_COUNT: u8 = 0x44;
}

/// Request opcodes.
pub mod code {
    pub const SELECT: u8 = 1;
    pub const INSERT: u8 = 2;
    pub const REPLACE: u8 = 3;
    pub const UPDATE: u8 = 4;
    pub const DELETE: u8 = 5;
    pub const OLD_CALL: u8 = 6;
    pub const AUTH: u8 = 7;
    pub const EVAL: u8 = 8;
    pub const UPSERT: u8 = 9;
    pub const CALL: u8 = 10;
    pub const SQL_EXECUTE: u8 = 11;
    pub const NOP: u8 = 12;
    pub const PING: u8 = 64;
    pub const SUBSCRIBE: u8 = 66;
}

/// System spaces, resolvable without a directory lookup.
pub mod system_space {
    pub const SCHEMA: u32 = 272;
    pub const SPACE: u32 = 280;
    pub const INDEX: u32 = 288;
    pub const FUNC: u32 = 296;
    pub const USER: u32 = 304;
    pub const PRIV: u32 = 312;
    pub const CLUSTER: u32 = 320;

    /// Name index of `_space` and `_index`.
    pub const NAME_INDEX: u32 = 2;
}

/// Comparison semantics of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IteratorType {
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}
