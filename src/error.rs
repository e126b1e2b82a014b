//! Error taxonomy for the bus runtime.
//!
//! Transport failures tear down the whole connection; everything else is
//! scoped to a single message or call. Peer-induced conditions never panic.

use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// Well-known error names used on the wire.
pub mod name {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    pub const INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
}

/// A named bus error, as carried by an error reply.
///
/// This is the payload of a `MethodError` message: a reverse-domain error
/// name plus a human readable message. Synthesized local errors (timeouts,
/// disconnects) use the same representation, so callers have a single code
/// path for peer-sent and locally generated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    pub name: Cow<'static, str>,
    pub message: Cow<'static, str>,
}

impl BusError {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        BusError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<Cow<'static, str>>) -> Self {
        BusError::new(name::FAILED, message)
    }

    pub fn invalid_args(message: impl Into<Cow<'static, str>>) -> Self {
        BusError::new(name::INVALID_ARGS, message)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusError {}

/// Everything that can go wrong in the runtime.
#[derive(Error, Debug)]
pub enum Error {
    // === Transport errors: unrecoverable for the connection ===
    /// I/O error on the underlying transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionReset,

    /// Operation attempted on a connection that is not open.
    #[error("not connected")]
    NotConnected,

    // === Protocol errors: reject the one offending message ===
    /// Incoming bytes did not form a valid message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The declared sizes of a message did not match the supplied bytes.
    #[error("message size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// Container nesting exceeded the fixed ceiling.
    #[error("container nesting deeper than {0} levels")]
    DepthExceeded(usize),

    /// The declared fd count does not match the descriptors received.
    #[error("message declared {declared} file descriptors, received {received}")]
    FdCountMismatch { declared: usize, received: usize },

    /// A type signature failed validation.
    #[error("invalid type signature {signature:?}: {reason}")]
    BadSignature { signature: String, reason: &'static str },

    // === Address errors ===
    /// An address string failed to parse; `offset` is the first offending
    /// character.
    #[error("invalid bus address at byte {offset}: {reason}")]
    BadAddress { offset: usize, reason: &'static str },

    /// The address list contained no usable address.
    #[error("no addresses to connect to")]
    NoAddresses,

    // === Authentication ===
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("authentication rejected by peer: {0}")]
    AuthRejected(String),

    // === Correlation ===
    /// A call's deadline elapsed before the reply arrived.
    #[error("method call timed out")]
    Timeout,

    /// A blocking call observed its own outbound message looping back.
    #[error("message addressed to ourselves, refusing to wait")]
    SelfLoop,

    /// The peer answered with an error reply.
    #[error(transparent)]
    Method(#[from] BusError),

    // === Programming errors: fail fast, connection untouched ===
    /// Attempt to mutate a sealed message, or to send an unsealed one.
    #[error("message is sealed")]
    Sealed,

    #[error("message is not sealed")]
    NotSealed,

    /// Value appended or read does not match the message signature.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The connection is used from a process other than its creator.
    #[error("connection used across fork boundary")]
    ChildOfFork,

    /// Queue limit reached.
    #[error("message queue full ({0} messages)")]
    QueueFull(usize),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// True if this error must drive the connection into `Closing`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionReset)
    }

    /// Map an error onto the wire-level error reply it should produce.
    pub fn to_bus_error(&self) -> BusError {
        match self {
            Error::Timeout => BusError::new(name::NO_REPLY, "Method call timed out"),
            Error::ConnectionReset | Error::NotConnected => {
                BusError::new(name::DISCONNECTED, "Connection terminated")
            }
            Error::Method(e) => e.clone(),
            other => BusError::new(name::FAILED, other.to_string()),
        }
    }
}

impl From<io::Error> for Box<Error> {
    fn from(e: io::Error) -> Self {
        Box::new(Error::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classify an I/O error: connection-terminating errors collapse into
/// `ConnectionReset` so state-machine code has one branch to take.
pub(crate) fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => Error::ConnectionReset,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::ConnectionReset.is_fatal());
        assert!(Error::Io(io::Error::new(io::ErrorKind::Other, "x")).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Sealed.is_fatal());
    }

    #[test]
    fn io_mapping_collapses_disconnects() {
        let e = map_io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(e, Error::ConnectionReset));
        let e = map_io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn timeout_becomes_no_reply() {
        let b = Error::Timeout.to_bus_error();
        assert_eq!(b.name, name::NO_REPLY);
    }
}
