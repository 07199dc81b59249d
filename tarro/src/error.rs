//! `tarro` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::{NoSuchSpace, ParseError, UsageError},
    connection::startup::AuthError,
    iproto::ProtocolError,
    iproto::response::ServerError,
    pool::PoolClosedError,
    row::DecodeError,
};

/// A specialized [`Result`] type for `tarro` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `tarro` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
    secondary: Option<Box<Error>>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// A follow-up failure that happened while handling this error, such
    /// as a close error during pool eviction. Never replaces the original.
    pub fn secondary(&self) -> Option<&Error> {
        self.secondary.as_deref()
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn attach(&mut self, secondary: Error) {
        // keep the earliest secondary, append deeper ones to its chain
        match &mut self.secondary {
            Some(existing) => existing.attach(secondary),
            slot @ None => *slot = Some(Box::new(secondary)),
        }
    }

    /// Whether the originating connection can no longer be trusted.
    ///
    /// Server errors leave the session usable, yet a pool still evicts on
    /// them, so pooled fault isolation checks [`is_fatal`][Self::is_fatal]
    /// together with the kind.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::Io(_))
    }
}

/// All possible error kind from `tarro` library.
pub enum ErrorKind {
    /// Configuration url could not be parsed.
    Config(ParseError),
    /// Socket failure: fatal to the owning connection.
    Io(io::Error),
    /// Wire-level violation: fatal to the owning connection.
    Protocol(ProtocolError),
    /// Server replied with an ERROR body: the connection stays usable.
    Database(ServerError),
    /// The auth handshake was rejected.
    Auth(AuthError),
    /// Caller drove the session or pool outside its state machine.
    Usage(UsageError),
    /// Space or index name lookup did not match exactly one entry.
    Schema(NoSuchSpace),
    /// Column access failure: the connection stays usable.
    Decode(DecodeError),
    /// Acquire on a closed source.
    PoolClosed(PoolClosedError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body, secondary: None }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ServerError>e => ErrorKind::Database(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<UsageError>e => ErrorKind::Usage(e));
from!(<NoSuchSpace>e => ErrorKind::Schema(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<PoolClosedError>e => ErrorKind::PoolClosed(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let Some(secondary) = &self.secondary {
            write!(f, "; additionally: {}", secondary.kind)?;
        }

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
            Self::Schema(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::PoolClosed(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
