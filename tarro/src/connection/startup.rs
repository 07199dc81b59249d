//! The auth handshake.
//!
//! Performed once, right after the greeting, when credentials are
//! configured: a single AUTH request carrying the user name and the
//! chap-sha1 scramble, answered by an empty body on success.
use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::{Config, Connection};
use crate::{
    Result,
    common::ByteStr,
    iproto::{Operation, ProtocolError, response::Body},
    msgpack::Value,
    stream::SALT_SIZE,
};

/// The scramble and its tuple prefix named by the protocol.
const CHAP_SHA1: &str = "chap-sha1";

pub(crate) fn authenticate(conn: &mut Connection, config: &Config) -> Result<()> {
    let scramble = scramble(conn.stream.salt(), config.pass.as_str());

    conn.begin(Operation::Auth { user: config.user.as_str() })?;
    conn.bind(Value::Str(ByteStr::from_static(CHAP_SHA1)))?;
    conn.bind(Value::Bin(Bytes::copy_from_slice(&scramble)))?;
    let sync = conn.finish_send()?;

    let (header, body) = conn.recv()?;
    if header.sync != sync {
        return Err(conn.poison(ProtocolError::sync_mismatch(sync, header.sync)));
    }
    match body {
        Body::Empty => {
            log::debug!("authenticated as {}", config.user);
            Ok(())
        },
        Body::Error { message } => Err(AuthError { message }.into()),
        Body::Data { .. } => {
            Err(conn.poison(ProtocolError::shape("auth response carries DATA")))
        },
    }
}

/// Challenge-response scramble per the protocol:
/// `sha1(pass) XOR sha1(salt ++ sha1(sha1(pass)))`.
fn scramble(salt: &[u8; SALT_SIZE], password: &str) -> [u8; 20] {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut step3 = Sha1::new();
    step3.update(salt);
    step3.update(hash2);
    let step3 = step3.finalize();

    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ step3[i];
    }
    out
}

/// The server rejected the handshake. Retrying with the same credentials
/// will not succeed.
pub struct AuthError {
    pub message: ByteStr,
}

impl std::error::Error for AuthError { }

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: {}", self.message)
    }
}

impl std::fmt::Debug for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}
