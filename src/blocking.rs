use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::{debug, trace};

#[cfg(unix)]
use crate::Socket;
use crate::{
    command::{self, Command, END_OF_STREAM},
    connection::{Close, Connection},
    error::{ClamdError, Result},
    response::{self, ScanResult, SIZE_LIMIT_EXCEEDED},
    Tcp,
};

impl ClamdSync for Tcp {
    type Stream = TcpStream;

    fn connect(&self) -> io::Result<Self::Stream> {
        let timeout = crate::nonzero(self.timeout);
        let stream = match timeout {
            Some(timeout) => connect_timeout(self, timeout)?,
            None => TcpStream::connect((self.host.as_str(), self.port))?,
        };
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl ClamdSync for Socket {
    type Stream = UnixStream;

    fn connect(&self) -> io::Result<Self::Stream> {
        let timeout = crate::nonzero(self.timeout);
        let stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(stream)
    }
}

fn connect_timeout(tcp: &Tcp, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (tcp.host.as_str(), tcp.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    }))
}

/// Sending commands and scanning data with clamd
///
/// Every method opens its own connection through [`ClamdSync::acquire`] and
/// closes it before returning, whether the exchange succeeded or not.
pub trait ClamdSync: fmt::Display {
    /// Bidirectional stream for communicating with clamd
    type Stream: Read + Write + Close;

    /// Connecting to the clamd instance
    fn connect(&self) -> io::Result<Self::Stream>;

    /// Opens a scoped connection, wrapping connect failures in
    /// [`ClamdError::Connection`]
    fn acquire(&self) -> Result<Connection<Self::Stream>> {
        let stream = self
            .connect()
            .map_err(|e| ClamdError::connection(format!("Error connecting to {}", self), e))?;
        debug!(endpoint = %self, "connected to clamd");
        Ok(Connection::new(stream))
    }

    /// Sends a ping request to clamd
    ///
    /// If the server is available, it responds with [`PONG`](crate::PONG).
    fn ping(&self) -> Result<String> {
        let mut connection = self.acquire()?;
        basic_command(&mut *connection, Command::Ping)
    }

    /// Gets the version string from clamd
    fn get_version(&self) -> Result<String> {
        let mut connection = self.acquire()?;
        basic_command(&mut *connection, Command::Version)
    }

    /// Asks clamd to reload its signature database
    fn reload(&self) -> Result<String> {
        let mut connection = self.acquire()?;
        basic_command(&mut *connection, Command::Reload)
    }

    /// Shuts down a clamd server
    ///
    /// The server performs a clean exit; the response is usually empty.
    fn shutdown(&self) -> Result<String> {
        let mut connection = self.acquire()?;
        basic_command(&mut *connection, Command::Shutdown)
    }

    /// Scans a path on the daemon's filesystem, stopping at the first match
    ///
    /// # Arguments
    ///
    /// * `path`: A path as seen by the daemon, not by this process
    fn scan(&self, path: &str) -> Result<ScanResult> {
        let mut connection = self.acquire()?;
        file_system_scan(&mut *connection, Command::Scan, path)
    }

    /// Scans a path on the daemon's filesystem, reporting every match
    fn contscan(&self, path: &str) -> Result<ScanResult> {
        let mut connection = self.acquire()?;
        file_system_scan(&mut *connection, Command::ContScan, path)
    }

    /// Scans a path on the daemon's filesystem using multiple daemon threads
    fn multiscan(&self, path: &str) -> Result<ScanResult> {
        let mut connection = self.acquire()?;
        file_system_scan(&mut *connection, Command::MultiScan, path)
    }

    /// Streams readable data to clamd for scanning
    ///
    /// # Arguments
    ///
    /// * `input`: The data to be scanned
    /// * `chunk_size`: An optional frame size. If [`None`], [`DEFAULT_CHUNK_SIZE`](crate::DEFAULT_CHUNK_SIZE) is used
    ///
    /// # Returns
    ///
    /// A single-entry [`ScanResult`] keyed by the daemon's stream label, or
    /// [`None`] if the daemon closed the connection without replying
    fn instream<R: Read>(&self, input: R, chunk_size: Option<usize>) -> Result<Option<ScanResult>> {
        let mut connection = self.acquire()?;
        instream(input, chunk_size, &mut *connection)
    }

    /// Scans a data buffer for viruses
    fn scan_buffer(&self, buffer: &[u8], chunk_size: Option<usize>) -> Result<Option<ScanResult>> {
        self.instream(buffer, chunk_size)
    }

    /// Streams a local file to clamd for scanning
    ///
    /// The file is opened before connecting, so a missing file never reaches
    /// the daemon.
    fn scan_file<P: AsRef<Path>>(
        &self,
        file_path: P,
        chunk_size: Option<usize>,
    ) -> Result<Option<ScanResult>> {
        let file_path = file_path.as_ref();
        let file = File::open(file_path).map_err(|e| {
            ClamdError::data_source(format!("Error opening {}", file_path.display()), e)
        })?;
        self.instream(file, chunk_size)
    }
}

fn write_error(e: io::Error) -> ClamdError {
    ClamdError::connection("Error while writing to socket", e)
}

fn send_command<W: Write>(stream: &mut W, command: Command, args: &[&str]) -> Result<()> {
    trace!(%command, "sending command");
    stream.write_all(&command.encode(args)).map_err(write_error)?;
    stream.flush().map_err(write_error)
}

fn recv_response<R: Read>(stream: &mut R) -> Result<String> {
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .map_err(|e| ClamdError::connection("Error while reading from socket", e))?;
    trace!(bytes = response.len(), "received response");
    response::decode(&response)
}

fn basic_command<RW: Read + Write>(stream: &mut RW, command: Command) -> Result<String> {
    send_command(stream, command, &[])?;
    response::basic_reply(recv_response(stream)?)
}

fn file_system_scan<RW: Read + Write>(
    stream: &mut RW,
    command: Command,
    path: &str,
) -> Result<ScanResult> {
    send_command(stream, command, &[path])?;
    response::scan_reply(&recv_response(stream)?)
}

fn instream<R: Read, RW: Read + Write>(
    mut input: R,
    chunk_size: Option<usize>,
    stream: &mut RW,
) -> Result<Option<ScanResult>> {
    send_command(stream, Command::Instream, &[])?;

    let mut buffer = vec![0; command::chunk_size(chunk_size)];
    match upload(&mut input, &mut buffer, stream) {
        Ok(frames) => debug!(frames, "instream upload finished"),
        Err(err) => return Err(size_limit_reply(stream, err)),
    }

    response::instream_reply(&recv_response(stream)?)
}

fn upload<R: Read, W: Write>(input: &mut R, buffer: &mut [u8], stream: &mut W) -> Result<usize> {
    let mut frames = 0usize;
    loop {
        let len = fill_chunk(input, buffer)
            .map_err(|e| ClamdError::data_source("Error while reading scan input", e))?;
        if len == 0 {
            break;
        }
        stream
            .write_all(&command::frame_header(len))
            .map_err(write_error)?;
        stream.write_all(&buffer[..len]).map_err(write_error)?;
        stream.flush().map_err(write_error)?;
        frames += 1;
    }
    stream.write_all(END_OF_STREAM).map_err(write_error)?;
    stream.flush().map_err(write_error)?;
    Ok(frames)
}

/// clamd answers an oversized upload with the size limit sentinel and hangs
/// up while the client is still writing. The reply stays readable after the
/// write side broke, so a hangup is checked for it before giving up.
fn size_limit_reply<R: Read>(stream: &mut R, err: ClamdError) -> ClamdError {
    if !err.peer_hung_up() {
        return err;
    }
    // Bytes read before a reset are kept in `reply` even when read_to_end fails.
    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply);
    match response::decode(&reply) {
        Ok(text) if text == SIZE_LIMIT_EXCEEDED => {
            debug!("daemon hung up on an oversized upload");
            ClamdError::BufferTooLong(text)
        }
        _ => err,
    }
}

/// Reads until `buffer` is full or `input` is exhausted.
fn fill_chunk<R: Read>(input: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
