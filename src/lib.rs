//! Client for the clamd network protocol.
//!
//! Every operation opens a fresh connection, performs one command exchange
//! and closes the connection before returning. Two flavours share the same
//! protocol code:
//!
//! - [`ClamdSync`] for blocking `std::net` sockets
//! - [`ClamdAsync`] for runtime-agnostic async sockets (feature `async`)
//!
//! ```no_run
//! use clamd_client::{ClamdSync, Tcp};
//!
//! let clamd = Tcp::default();
//! assert_eq!(clamd.ping()?, clamd_client::PONG);
//!
//! let result = clamd.scan_buffer(b"hello", None)?.expect("daemon replied");
//! assert!(result.is_clean());
//! # Ok::<(), clamd_client::ClamdError>(())
//! ```

use std::{fmt, net::SocketAddr, time::Duration};

#[cfg(unix)]
use std::path::PathBuf;

/// Async clamd client that is abstract over all runtimes
#[cfg(feature = "async")]
pub mod nonblocking;
#[cfg(feature = "async")]
pub use nonblocking::ClamdAsync;

/// Synchronous clamd client
pub mod blocking;
pub use blocking::ClamdSync;

pub mod command;
pub mod connection;
pub mod error;
pub mod response;

pub use command::Command;
pub use connection::{Close, Connection};
pub use error::{ClamdError, Result};
pub use response::{parse_response_line, ScanEntry, ScanResult, Status, Verdict};

/// Default chunk size in bytes for INSTREAM frames
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Host clamd listens on by default
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port clamd listens on by default
pub const DEFAULT_PORT: u16 = 3310;

/// clamd's response to a PING request
pub const PONG: &str = "PONG";

/// Use a TCP connection to communicate with a clamd server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcp {
    /// Host name or IP address of the daemon
    pub host: String,
    /// TCP port of the daemon
    pub port: u16,
    /// Operation timeout. A zero duration counts as no timeout.
    ///
    /// The async client bounds each operation as a whole, from connecting to
    /// the end of the reply. The blocking client bounds connecting and each
    /// socket read or write on its own, so a daemon that keeps trickling
    /// bytes can hold a blocking call longer than this.
    pub timeout: Option<Duration>,
}

impl Tcp {
    /// Targets `host:port` with no timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: None,
        }
    }

    /// Sets the operation timeout. [`Duration::ZERO`] clears it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = nonzero(Some(timeout));
        self
    }
}

impl Default for Tcp {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl From<SocketAddr> for Tcp {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Use a Unix socket connection to communicate with a clamd server
#[cfg(unix)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    /// Path of the daemon's local socket
    pub path: PathBuf,
    /// Operation timeout, applied as for [`Tcp::timeout`]
    pub timeout: Option<Duration>,
}

#[cfg(unix)]
impl Socket {
    /// Targets the socket at `path` with no timeout.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    /// Sets the operation timeout. [`Duration::ZERO`] clears it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = nonzero(Some(timeout));
        self
    }
}

#[cfg(unix)]
impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Zero disables a timeout: std rejects zero socket timeouts.
pub(crate) fn nonzero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|timeout| !timeout.is_zero())
}
