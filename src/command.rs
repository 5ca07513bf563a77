//! Command encoding and INSTREAM framing.

use std::fmt;

/// A clamd command.
///
/// Every command is sent in its newline-terminated form: `n<COMMAND>[ <arg>...]\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness check, answered with `PONG`.
    Ping,
    /// Daemon and signature database version.
    Version,
    /// Reload the signature database.
    Reload,
    /// Terminate the daemon.
    Shutdown,
    /// Scan a daemon-local path, stopping at the first infected file.
    Scan,
    /// Scan a daemon-local path, continuing after infected files.
    ContScan,
    /// Scan a daemon-local path with the daemon's worker threads.
    MultiScan,
    /// Scan a chunked byte stream uploaded by the client.
    Instream,
}

impl Command {
    /// Wire name of the command, without the `n` prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Version => "VERSION",
            Self::Reload => "RELOAD",
            Self::Shutdown => "SHUTDOWN",
            Self::Scan => "SCAN",
            Self::ContScan => "CONTSCAN",
            Self::MultiScan => "MULTISCAN",
            Self::Instream => "INSTREAM",
        }
    }

    /// Encodes the command line, joining `args` with single spaces.
    #[must_use]
    pub fn encode(self, args: &[&str]) -> Vec<u8> {
        let mut line = format!("n{}", self.as_str());
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        line.into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zero-length frame that ends an INSTREAM upload.
pub const END_OF_STREAM: &[u8; 4] = &[0, 0, 0, 0];

/// Big-endian length prefix for one INSTREAM frame.
///
/// `len` never exceeds `u32::MAX` because chunk sizes are clamped by
/// [`chunk_size`].
#[must_use]
pub(crate) fn frame_header(len: usize) -> [u8; 4] {
    (len as u32).to_be_bytes()
}

/// Resolves an optional caller chunk size to a usable frame payload size.
pub(crate) fn chunk_size(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(crate::DEFAULT_CHUNK_SIZE)
        .clamp(1, u32::MAX as usize)
}
