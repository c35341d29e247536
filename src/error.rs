use std::{fmt, sync::Arc};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while using the driver.
///
/// `Error` is cheap to clone, so it can be stored in connection state and
/// handed to every caller parked on that connection when it fails.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Arc<ErrorKind>,
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Arc::new(err.into()),
        }
    }
}

impl std::ops::Deref for Error {
    type Target = Arc<ErrorKind>;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

impl Error {
    /// Whether this is the sentinel returned when a query that requires a
    /// result produced none.
    pub fn is_not_found(&self) -> bool {
        matches!(*self.kind, ErrorKind::NotFound)
    }

    /// Whether a tailable cursor gave up waiting for new data.
    pub fn is_tail_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::TailTimeout)
    }

    /// Whether the session was closed while the operation was suspended.
    pub fn is_session_closed(&self) -> bool {
        matches!(*self.kind, ErrorKind::SessionClosed)
    }

    /// Whether the error originated from socket I/O. Network errors abend the
    /// connection they occurred on; the session's next operation after a
    /// `refresh` will acquire a fresh one.
    pub fn is_network_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Io(..))
    }

    /// Whether an acknowledged write failed to satisfy its write concern
    /// within the requested time.
    pub fn is_write_concern_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::LastError(ref le) if le.wtimeout)
    }

    pub(crate) fn not_found() -> Self {
        ErrorKind::NotFound.into()
    }

    pub(crate) fn session_closed() -> Self {
        ErrorKind::SessionClosed.into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }
}

/// The types of errors that can occur.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No document matched a query that required one.
    #[error("document not found")]
    NotFound,

    /// A tailable cursor exceeded its timeout without new data arriving.
    #[error("tailable cursor timed out waiting for new data")]
    TailTimeout,

    /// The session was closed while an operation was suspended on it.
    #[error("session was closed")]
    SessionClosed,

    /// No server matching the required class could be reached within the
    /// sync timeout.
    #[error("no reachable servers")]
    NoReachableServers,

    /// The server rejected the query.
    #[error("query failed: {message} (code {code})")]
    QueryFailure { code: i32, message: String },

    /// The server acknowledged a write but reported a problem with it.
    #[error("{0}")]
    LastError(LastError),

    /// The nonce challenge-response login was rejected.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The server refused an operation for lack of credentials.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Socket I/O failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("{0}")]
    BsonDecode(#[from] bson::de::Error),

    /// An invalid argument was provided to a database operation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The connection string could not be parsed.
    #[error("invalid connection string: {message}")]
    InvalidConnectionString { message: String },

    /// A database operation returned a reply the driver could not interpret.
    #[error("invalid server reply: {message}")]
    InvalidResponse { message: String },
}

/// The outcome of the `getLastError` command run after an acknowledged write.
///
/// A non-empty `message` or non-zero `code` means the write was processed but
/// failed (a duplicate key, for example). `wtimeout` set means the write
/// concern could not be satisfied within the requested window.
#[derive(Clone, Debug, Default)]
pub struct LastError {
    pub code: i32,
    pub message: String,
    pub n: i64,
    pub wtimeout: bool,
}

impl fmt::Display for LastError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.wtimeout {
            write!(fmt, "write concern timed out ({})", self.message)
        } else {
            write!(fmt, "{} (code {})", self.message, self.code)
        }
    }
}

/// Server error codes that indicate missing or insufficient credentials.
pub(crate) fn is_unauthorized_code(code: i32) -> bool {
    code == 13 || code == 10057
}

pub(crate) fn is_unauthorized_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.starts_with("unauthorized") || message.starts_with("not authorized")
}
