//! Buffered connection to the server.
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    Result,
    common::UsizeExt,
    connection::Config,
    iproto::{FRAME_LENGTH_MARKER, GREETING_SALT, GREETING_SIZE, ProtocolError},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Bytes of the decoded salt used by the chap-sha1 scramble.
pub(crate) const SALT_SIZE: usize = 20;

/// Buffered frame transport over one TCP connection.
///
/// Sends are buffered; [`recv_frame`][IprotoStream::recv_frame] flushes
/// pending writes first, which is what lets a batch of frames go out
/// back-to-back before the first response is read.
#[derive(Debug)]
pub(crate) struct IprotoStream {
    socket: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    salt: [u8; SALT_SIZE],
}

impl IprotoStream {
    /// Connect and consume the 128-byte greeting.
    pub fn connect(config: &Config) -> Result<Self> {
        let socket = TcpStream::connect((config.host(), config.port()))?;
        socket.set_nodelay(true)?;

        let mut stream = Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            salt: [0; SALT_SIZE],
        };

        stream.fill(GREETING_SIZE)?;
        let greeting = stream.read_buf.split_to(GREETING_SIZE);
        stream.salt = parse_salt(&greeting)?;

        log::debug!(
            "connected to {}: {}",
            stream.socket.peer_addr()?,
            String::from_utf8_lossy(&greeting[..64]).trim_end(),
        );
        Ok(stream)
    }

    /// Salt from the greeting, for the auth handshake.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Buffer one frame: length prefix plus payload.
    pub fn send_frame(&mut self, payload: &[u8]) {
        self.write_buf.reserve(5 + payload.len());
        self.write_buf.put_u8(FRAME_LENGTH_MARKER);
        self.write_buf.put_u32(payload.len().to_u32());
        self.write_buf.extend_from_slice(payload);
    }

    /// Write out all buffered frames.
    pub fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.socket.write_all(&self.write_buf)?;
            self.socket.flush()?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Receive exactly one frame and return its payload.
    pub fn recv_frame(&mut self) -> Result<Bytes> {
        self.flush()?;

        self.fill(5)?;
        let marker = self.read_buf[0];
        if marker != FRAME_LENGTH_MARKER {
            return Err(ProtocolError::frame_marker(marker).into());
        }
        let len = u32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]) as usize;

        self.fill(5 + len)?;
        self.read_buf.advance(5);
        Ok(self.read_buf.split_to(len).freeze())
    }

    /// Block until at least `needed` bytes are buffered.
    fn fill(&mut self, needed: usize) -> Result<()> {
        let mut chunk = [0u8; 4096];
        while self.read_buf.len() < needed {
            let n = self.socket.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )
                .into());
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Shut the socket down in both directions.
    pub fn close(&self) -> Result<()> {
        self.socket.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

/// The greeting's second line holds the base64-encoded salt at a fixed
/// offset; only the first 20 decoded bytes participate in the scramble.
fn parse_salt(greeting: &[u8]) -> Result<[u8; SALT_SIZE]> {
    let field = &greeting[GREETING_SALT];
    let end = field
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(field.len());
    let decoded = BASE64
        .decode(&field[..end])
        .map_err(|_| ProtocolError::greeting("salt is not valid base64"))?;
    let mut salt = [0u8; SALT_SIZE];
    match decoded.get(..SALT_SIZE) {
        Some(head) => salt.copy_from_slice(head),
        None => return Err(ProtocolError::greeting("salt is too short").into()),
    }
    Ok(salt)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn salt_from_greeting() {
        let mut greeting = vec![b' '; GREETING_SIZE];
        greeting[..9].copy_from_slice(b"Tarantool");
        let salt_bytes: Vec<u8> = (0u8..32).collect();
        let encoded = BASE64.encode(&salt_bytes);
        greeting[GREETING_SALT][..encoded.len()].copy_from_slice(encoded.as_bytes());

        let salt = parse_salt(&greeting).unwrap();
        assert_eq!(&salt[..], &salt_bytes[..SALT_SIZE]);
    }

    #[test]
    fn malformed_salt() {
        let mut greeting = vec![b' '; GREETING_SIZE];
        greeting[64..70].copy_from_slice(b"!!!!!!");
        assert!(parse_salt(&greeting).is_err());
    }
}
