//! Error types for reactive-pg.

use std::sync::Arc;

use thiserror::Error;

use crate::result::ResultKind;

/// Result type for reactive-pg operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = self.severity() {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for reactive-pg.
///
/// The type is `Clone` so that one latched failure can be handed to every
/// subscription of a task.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server rejected a statement (ErrorResponse).
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection was closed before the operation completed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS negotiation or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// A subscription asked for one kind of result but the server produced another
    #[error("Subscription expects {expected} but the result is {actual}")]
    KindMismatch {
        /// Kind the subscription was created for
        expected: ResultKind,
        /// Kind of the result actually produced
        actual: ResultKind,
    },

    /// The server produced more results than the statement declared
    #[error("Too many results: statement declared at most {declared}")]
    TooManyResults {
        /// Number of results the statement declared
        declared: usize,
    },

    /// Every result of the task has already been consumed
    #[error("No more results")]
    NoMoreResults,

    /// The task queue or command channel is full
    #[error("Task queue overflow (capacity {0})")]
    QueueOverflow(usize),

    /// Invalid usage (e.g., bad connection options)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Tls(_) => true,
            // FATAL and PANIC errors terminate the backend
            Error::Server(fields) => matches!(fields.severity(), Some("FATAL") | Some("PANIC")),
            _ => false,
        }
    }

    /// Returns true if the server reported this error for a statement.
    pub fn is_access_error(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// Returns true for errors raised by a subscription that does not fit the result sequence.
    pub fn is_subscription_error(&self) -> bool {
        matches!(
            self,
            Error::KindMismatch { .. } | Error::TooManyResults { .. } | Error::NoMoreResults
        )
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[cfg(feature = "tokio-tls")]
impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_server_error_breaks_connection() {
        let fields = ErrorFields {
            severity_non_localized: Some("FATAL".into()),
            ..Default::default()
        };
        assert!(Error::Server(fields).is_connection_broken());

        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42601".into()),
            ..Default::default()
        };
        let err = Error::Server(fields);
        assert!(!err.is_connection_broken());
        assert!(err.is_access_error());
        assert_eq!(err.sqlstate(), Some("42601"));
    }

    #[test]
    fn test_cloned_io_error_shares_source() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        let copy = err.clone();
        assert!(copy.is_connection_broken());
        assert_eq!(err.to_string(), copy.to_string());
    }
}
