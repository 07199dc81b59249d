use std::fmt;

/// Fatal wire-level violation.
///
/// Once raised, the position of the byte stream can no longer be trusted
/// and the owning connection is permanently discarded.
pub struct ProtocolError {
    message: Box<str>,
}

impl ProtocolError {
    fn new(message: String) -> Self {
        Self { message: message.into_boxed_str() }
    }

    /// Input ended inside a value.
    pub(crate) fn truncated() -> Self {
        Self::new("unexpected end of frame".into())
    }

    /// A marker byte that cannot start the expected value type.
    pub(crate) fn marker(expected: &'static str, found: u8) -> Self {
        Self::new(format!("expected {expected}, found marker 0x{found:02x}"))
    }

    /// The frame length prefix did not start with the fixed uint32 marker.
    pub(crate) fn frame_marker(found: u8) -> Self {
        Self::new(format!("bad frame length marker 0x{found:02x}, expected 0xce"))
    }

    /// Response sync does not match the expected in-flight request.
    pub(crate) fn sync_mismatch(expected: u64, found: u64) -> Self {
        Self::new(format!("response sync {found} does not match request sync {expected}"))
    }

    /// A batched response carries a sync the session never issued.
    pub(crate) fn sync_ahead(counter: u64, found: u64) -> Self {
        Self::new(format!("response sync {found} is ahead of session counter {counter}"))
    }

    /// Structurally valid MessagePack in a place the protocol forbids it.
    pub(crate) fn shape(what: &'static str) -> Self {
        Self::new(what.into())
    }

    /// The greeting could not be parsed.
    pub(crate) fn greeting(what: &'static str) -> Self {
        Self::new(format!("malformed greeting: {what}"))
    }

    /// Operation attempted on a connection already known to be desynchronized.
    pub(crate) fn desynchronized() -> Self {
        Self::new("connection is desynchronized and cannot be reused".into())
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.message)
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
