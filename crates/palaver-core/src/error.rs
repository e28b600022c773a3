//! Error types for the palaver server.
//!
//! Errors are split by blast radius. Framing and I/O failures end the
//! connection; everything else is reported back as an `ERR` line and the
//! connection keeps going.

use thiserror::Error;

/// Core error type for palaver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed envelope: bad length field, unknown type tag, inconsistent
    /// field lengths. Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// The stream ended in the middle of a frame.
    #[error("frame truncated")]
    Truncated,

    /// Socket read or write failed.
    #[error("io error: {0}")]
    Io(String),

    /// Text field was not valid UTF-8, or a JSON body did not parse.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Message failed validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer connection has already been shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using palaver's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error must terminate the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Framing(_) | Error::Truncated | Error::Io(_) | Error::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
