//! Errors.

use crate::messages::ServerError;

/// Every failure mode of the driver core, with a stable machine-readable
/// kind. The server's sqlstate is carried whenever one applies.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// DNS resolution, refused connection or TLS handshake failure.
    ConnectionFailed(String),
    /// Server-reported or local credential error during the handshake.
    AuthenticationFailed(String),
    /// Open, rent or command deadline exceeded. Carries the operation name.
    Timeout(String),
    /// Caller-initiated cancellation.
    Canceled,
    /// An ErrorResponse from the server, parsed into its tagged fields.
    Server(ServerError),
    /// Unexpected message, bad length or truncated body.
    ProtocolViolation(String),
    /// An operation was attempted on a connector that is not ready.
    OperationInProgress(String),
    /// The connector became unusable after an I/O or protocol failure.
    Broken(String),
    /// Bad connection string or incompatible options.
    ConfigurationInvalid(String),
}

impl Error {
    /// Transient classes that an opt-in retry strategy may retry on open.
    /// Commands are never retried because they may have executed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectionFailed(_) => true,
            Error::Server(err) => {
                err.code.starts_with("57") || err.code.starts_with("08") || err.code.starts_with("53")
            }
            _ => false,
        }
    }

    /// The server's sqlstate, when this error carries one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(&err.code),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Error::AuthenticationFailed(msg) => write!(f, "Authentication failed: {msg}"),
            Error::Timeout(op) => write!(f, "Timeout while waiting for {op}"),
            Error::Canceled => write!(f, "Operation canceled"),
            Error::Server(err) => write!(f, "Server error: {err}"),
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
            Error::OperationInProgress(state) => {
                write!(f, "Connection is busy: an operation is already in progress ({state})")
            }
            Error::Broken(msg) => write!(f, "Connection is broken: {msg}"),
            Error::ConfigurationInvalid(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}
