use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Errors are cheap to clone: a single failure frequently settles many
/// promises at once (a lost connection rejects every queued command), so
/// non-clonable payloads are shared behind `Rc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Canonical cancellation reason. The message text is load-bearing for
    /// callers that match on it.
    #[error("Promise cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Stream EOF or unrecoverable I/O failure while commands were in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// Malformed or unexpected packet from the server. Fatal for the
    /// connection that produced it.
    #[error("malformed packet")]
    InvalidPacket,

    /// A packet ended before a field could be read. Fatal, like
    /// [`Error::InvalidPacket`].
    #[error("unexpected end of packet")]
    UnexpectedEof,

    /// Parsed from an ERR packet. Fails only the current command; the
    /// connection stays usable.
    #[error("ERROR {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("pool is closing")]
    PoolClosing,

    #[error("HTTP error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Http { status: Option<u32>, message: String },

    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(Rc<std::io::Error>),

    /// Every input of `Promise::any` rejected.
    #[error("all promises rejected ({} reasons)", .0.len())]
    Aggregate(Vec<Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Rc::new(err))
    }
}

impl Error {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost
                | Error::InvalidPacket
                | Error::UnexpectedEof
                | Error::Auth(_)
                | Error::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_message_is_canonical() {
        assert_eq!(Error::Cancelled.to_string(), "Promise cancelled");
    }

    #[test]
    fn server_error_formats_code_and_state() {
        let err = Error::Server {
            code: 1045,
            sql_state: "28000".to_string(),
            message: "Access denied".to_string(),
        };
        assert_eq!(err.to_string(), "ERROR 1045 (28000): Access denied");
    }

    #[test]
    fn fatality_classification() {
        assert!(Error::ConnectionLost.is_fatal_for_connection());
        assert!(Error::InvalidPacket.is_fatal_for_connection());
        assert!(
            !Error::Server {
                code: 1064,
                sql_state: "42000".to_string(),
                message: "syntax".to_string(),
            }
            .is_fatal_for_connection()
        );
        assert!(!Error::Cancelled.is_fatal_for_connection());
    }
}
