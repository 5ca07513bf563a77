//! Error types shared by the blocking and async clients.
//!
//! [`ClamdError`] is the base error for every operation. Parse failures come
//! in two flavours: [`ClamdError::Response`] for lines the client does not
//! understand, and [`ClamdError::BufferTooLong`] for the daemon's
//! `INSTREAM size limit exceeded` sentinel. Both report `true` from
//! [`ClamdError::is_response_error`].

use std::io;

use thiserror::Error;

/// Errors returned by clamd operations.
#[derive(Debug, Error)]
pub enum ClamdError {
    /// The daemon replied with an error, or with a line that does not match
    /// the response grammar.
    ///
    /// Carries the response text preceding the last `ERROR` token.
    #[error("clamd response error: {0}")]
    Response(String),

    /// The daemon rejected an INSTREAM upload because it exceeded its
    /// configured `StreamMaxLength`.
    #[error("clamd stream size limit exceeded: {0}")]
    BufferTooLong(String),

    /// Establishing the connection, or reading from / writing to it, failed.
    #[error("{message}")]
    Connection {
        /// What the client was doing when the socket failed.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The local data source being streamed could not be opened or read.
    #[error("{message}")]
    Source {
        /// What the client was doing when the source failed.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl ClamdError {
    pub(crate) fn connection(message: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            message: message.into(),
            source,
        }
    }

    pub(crate) fn data_source(message: impl Into<String>, source: io::Error) -> Self {
        Self::Source {
            message: message.into(),
            source,
        }
    }

    /// Returns `true` for [`ClamdError::Response`] and its specialization
    /// [`ClamdError::BufferTooLong`].
    #[must_use]
    pub const fn is_response_error(&self) -> bool {
        matches!(self, Self::Response(_) | Self::BufferTooLong(_))
    }

    /// Returns `true` if the socket failed.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// The daemon closed its end while the client was still writing.
    pub(crate) fn peer_hung_up(&self) -> bool {
        match self {
            Self::Connection { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClamdError>;
