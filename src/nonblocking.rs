use std::{fmt, future::Future, io, path::Path, pin::Pin, time::Duration};

use async_fs::File;
use async_io::Timer;
use async_net::TcpStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_lite::{future, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stream, StreamExt};
use tracing::{debug, trace};

#[cfg(unix)]
use async_net::unix::UnixStream;

#[cfg(unix)]
use crate::Socket;
use crate::{
    command::{self, Command, END_OF_STREAM},
    connection::{Close, Connection},
    error::{ClamdError, Result},
    response::{self, ScanResult, SIZE_LIMIT_EXCEEDED},
    Tcp,
};

#[async_trait]
impl ClamdAsync for Tcp {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<Self::Stream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }

    fn timeout(&self) -> Option<Duration> {
        crate::nonzero(self.timeout)
    }
}

#[cfg(unix)]
#[async_trait]
impl ClamdAsync for Socket {
    type Stream = UnixStream;

    async fn connect(&self) -> io::Result<Self::Stream> {
        UnixStream::connect(&self.path).await
    }

    fn timeout(&self) -> Option<Duration> {
        crate::nonzero(self.timeout)
    }
}

/// Sending commands and scanning data with clamd, asynchronously
///
/// Works with any executor. Dropping an in-flight future closes its
/// connection. When [`ClamdAsync::timeout`] returns a duration, every
/// operation, from connecting to the end of the reply, fails with a
/// [`ClamdError::Connection`] of kind [`io::ErrorKind::TimedOut`] once it
/// runs longer than that.
#[async_trait]
pub trait ClamdAsync: fmt::Display + Sync {
    /// Bidirectional stream for communicating with clamd
    type Stream: AsyncRead + AsyncWrite + Close + Unpin + Send;

    /// Connecting to the clamd instance
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Deadline for a whole operation, from connecting to the end of the
    /// reply. [`None`] lets operations run until the daemon answers.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Opens a scoped connection, wrapping connect failures in
    /// [`ClamdError::Connection`]
    async fn acquire(&self) -> Result<Connection<Self::Stream>> {
        let endpoint = self.to_string();
        let stream = self
            .connect()
            .await
            .map_err(|e| ClamdError::connection(format!("Error connecting to {endpoint}"), e))?;
        debug!(%endpoint, "connected to clamd");
        Ok(Connection::new(stream))
    }

    /// Sends a ping request to clamd
    async fn ping(&self) -> Result<String> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            basic_command(&mut *connection, Command::Ping).await
        })
        .await
    }

    /// Gets the version string from clamd
    async fn get_version(&self) -> Result<String> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            basic_command(&mut *connection, Command::Version).await
        })
        .await
    }

    /// Asks clamd to reload its signature database
    async fn reload(&self) -> Result<String> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            basic_command(&mut *connection, Command::Reload).await
        })
        .await
    }

    /// Shuts down a clamd server
    async fn shutdown(&self) -> Result<String> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            basic_command(&mut *connection, Command::Shutdown).await
        })
        .await
    }

    /// Scans a path on the daemon's filesystem, stopping at the first match
    async fn scan(&self, path: &str) -> Result<ScanResult> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            file_system_scan(&mut *connection, Command::Scan, path).await
        })
        .await
    }

    /// Scans a path on the daemon's filesystem, reporting every match
    async fn contscan(&self, path: &str) -> Result<ScanResult> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            file_system_scan(&mut *connection, Command::ContScan, path).await
        })
        .await
    }

    /// Scans a path on the daemon's filesystem using multiple daemon threads
    async fn multiscan(&self, path: &str) -> Result<ScanResult> {
        within(self.timeout(), async {
            let mut connection = self.acquire().await?;
            file_system_scan(&mut *connection, Command::MultiScan, path).await
        })
        .await
    }

    /// Streams async readable data to clamd for scanning
    async fn instream<R: AsyncRead + Unpin + Send>(
        &self,
        input: R,
        chunk_size: Option<usize>,
    ) -> Result<Option<ScanResult>> {
        within(self.timeout(), async move {
            let mut connection = self.acquire().await?;
            instream(input, chunk_size, &mut *connection).await
        })
        .await
    }

    /// Scans a data buffer for viruses
    async fn scan_buffer(
        &self,
        buffer: &[u8],
        chunk_size: Option<usize>,
    ) -> Result<Option<ScanResult>> {
        self.instream(buffer, chunk_size).await
    }

    /// Streams a local file to clamd for scanning
    async fn scan_file<P: AsRef<Path> + Send>(
        &self,
        file_path: P,
        chunk_size: Option<usize>,
    ) -> Result<Option<ScanResult>> {
        let file_path = file_path.as_ref();
        let file = File::open(file_path).await.map_err(|e| {
            ClamdError::data_source(format!("Error opening {}", file_path.display()), e)
        })?;
        self.instream(file, chunk_size).await
    }

    /// Scans a stream of byte buffers
    ///
    /// Each item is split into frames of at most `chunk_size` bytes.
    async fn scan_stream<S>(&self, input: S, chunk_size: Option<usize>) -> Result<Option<ScanResult>>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        within(self.timeout(), async move {
            let mut connection = self.acquire().await?;
            scan_stream(input, chunk_size, &mut *connection).await
        })
        .await
    }
}

/// Runs `operation`, failing it once `timeout` elapses. The losing future is
/// dropped, which closes its connection.
async fn within<T, F>(timeout: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(timeout) = timeout else {
        return operation.await;
    };
    let expired = async move {
        Timer::after(timeout).await;
        debug!(?timeout, "clamd operation timed out");
        Err(ClamdError::connection(
            format!("Timed out after {timeout:?}"),
            io::Error::new(io::ErrorKind::TimedOut, "clamd did not answer in time"),
        ))
    };
    future::or(operation, expired).await
}

fn write_error(e: io::Error) -> ClamdError {
    ClamdError::connection("Error while writing to socket", e)
}

async fn send_command<W: AsyncWrite + Unpin + Send>(
    stream: &mut W,
    command: Command,
    args: &[&str],
) -> Result<()> {
    trace!(%command, "sending command");
    stream
        .write_all(&command.encode(args))
        .await
        .map_err(write_error)?;
    stream.flush().await.map_err(write_error)
}

async fn recv_response<R: AsyncRead + Unpin + Send>(stream: &mut R) -> Result<String> {
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| ClamdError::connection("Error while reading from socket", e))?;
    trace!(bytes = response.len(), "received response");
    response::decode(&response)
}

async fn basic_command<RW: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut RW,
    command: Command,
) -> Result<String> {
    send_command(stream, command, &[]).await?;
    response::basic_reply(recv_response(stream).await?)
}

async fn file_system_scan<RW: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut RW,
    command: Command,
    path: &str,
) -> Result<ScanResult> {
    send_command(stream, command, &[path]).await?;
    response::scan_reply(&recv_response(stream).await?)
}

async fn write_frame<W: AsyncWrite + Unpin + Send>(stream: &mut W, chunk: &[u8]) -> Result<()> {
    stream
        .write_all(&command::frame_header(chunk.len()))
        .await
        .map_err(write_error)?;
    stream.write_all(chunk).await.map_err(write_error)?;
    stream.flush().await.map_err(write_error)
}

async fn end_upload<W: AsyncWrite + Unpin + Send>(stream: &mut W) -> Result<()> {
    stream.write_all(END_OF_STREAM).await.map_err(write_error)?;
    stream.flush().await.map_err(write_error)
}

async fn finish_upload<RW: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut RW,
    uploaded: Result<usize>,
) -> Result<Option<ScanResult>> {
    match uploaded {
        Ok(frames) => debug!(frames, "instream upload finished"),
        Err(err) => return Err(size_limit_reply(stream, err).await),
    }

    response::instream_reply(&recv_response(stream).await?)
}

/// clamd answers an oversized upload with the size limit sentinel and hangs
/// up while the client is still writing. The reply stays readable after the
/// write side broke, so a hangup is checked for it before giving up.
async fn size_limit_reply<R: AsyncRead + Unpin + Send>(
    stream: &mut R,
    err: ClamdError,
) -> ClamdError {
    if !err.peer_hung_up() {
        return err;
    }
    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply).await;
    match response::decode(&reply) {
        Ok(text) if text == SIZE_LIMIT_EXCEEDED => {
            debug!("daemon hung up on an oversized upload");
            ClamdError::BufferTooLong(text)
        }
        _ => err,
    }
}

/// Scan async readable data with clamd
async fn instream<R, RW>(
    mut input: R,
    chunk_size: Option<usize>,
    stream: &mut RW,
) -> Result<Option<ScanResult>>
where
    R: AsyncRead + Unpin + Send,
    RW: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_command(stream, Command::Instream, &[]).await?;

    let mut buffer = vec![0; command::chunk_size(chunk_size)];
    let uploaded = upload(&mut input, &mut buffer, stream).await;
    finish_upload(stream, uploaded).await
}

async fn upload<R, W>(input: &mut R, buffer: &mut [u8], stream: &mut W) -> Result<usize>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames = 0usize;
    loop {
        let len = fill_chunk(input, buffer)
            .await
            .map_err(|e| ClamdError::data_source("Error while reading scan input", e))?;
        if len == 0 {
            break;
        }
        write_frame(stream, &buffer[..len]).await?;
        frames += 1;
    }
    end_upload(stream).await?;
    Ok(frames)
}

/// Scans a stream of data with clamd
async fn scan_stream<S, RW>(
    input: S,
    chunk_size: Option<usize>,
    stream: &mut RW,
) -> Result<Option<ScanResult>>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
    RW: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_command(stream, Command::Instream, &[]).await?;

    let input = std::pin::pin!(input);
    let uploaded = upload_items(input, command::chunk_size(chunk_size), stream).await;
    finish_upload(stream, uploaded).await
}

async fn upload_items<S, W>(
    mut input: Pin<&mut S>,
    chunk_size: usize,
    stream: &mut W,
) -> Result<usize>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames = 0usize;
    while let Some(bytes) = input.next().await {
        let bytes =
            bytes.map_err(|e| ClamdError::data_source("Error while reading scan input", e))?;
        for chunk in bytes.chunks(chunk_size) {
            write_frame(stream, chunk).await?;
            frames += 1;
        }
    }
    end_upload(stream).await?;
    Ok(frames)
}

/// Reads until `buffer` is full or `input` is exhausted.
async fn fill_chunk<R: AsyncRead + Unpin + Send>(
    input: &mut R,
    buffer: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::SIZE_LIMIT_EXCEEDED;
    use futures_lite::{future, io::Cursor, stream};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    #[derive(Default, Clone)]
    struct Tally {
        written: Arc<Mutex<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
    }

    struct MockStream {
        response: Cursor<Vec<u8>>,
        fail_after: Option<usize>,
        tally: Tally,
    }

    impl AsyncRead for MockStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.response).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MockStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut written = self.tally.written.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if written.len() + buf.len() > limit {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "reset by peer",
                    )));
                }
            }
            written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Close for MockStream {
        fn close(&mut self) -> io::Result<()> {
            self.tally.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockDaemon {
        response: &'static str,
        fail_after: Option<usize>,
        timeout: Option<Duration>,
        tally: Tally,
    }

    impl MockDaemon {
        fn replying(response: &'static str) -> Self {
            Self {
                response,
                fail_after: None,
                timeout: None,
                tally: Tally::default(),
            }
        }

        fn written(&self) -> Vec<u8> {
            self.tally.written.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            self.tally.closes.load(Ordering::SeqCst)
        }
    }

    impl fmt::Display for MockDaemon {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("mock")
        }
    }

    #[async_trait]
    impl ClamdAsync for MockDaemon {
        type Stream = MockStream;

        async fn connect(&self) -> io::Result<Self::Stream> {
            Ok(MockStream {
                response: Cursor::new(self.response.as_bytes().to_vec()),
                fail_after: self.fail_after,
                tally: self.tally.clone(),
            })
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
    }

    #[test]
    fn ping_over_mock() {
        let daemon = MockDaemon::replying("PONG\n");
        let response = future::block_on(daemon.ping()).unwrap();
        assert_eq!(response, crate::PONG);
        assert_eq!(daemon.written(), b"nPING\n");
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn multiscan_over_mock() {
        let daemon = MockDaemon::replying("/x/1: OK\n/x/2: Bad.Thing FOUND\n");
        let result = future::block_on(daemon.multiscan("/x")).unwrap();
        assert_eq!(daemon.written(), b"nMULTISCAN /x\n");
        assert_eq!(result.len(), 2);
        assert!(!result.is_clean());
    }

    #[test]
    fn instream_frames_and_terminator() {
        let daemon = MockDaemon::replying("stream: OK\n");
        let result = future::block_on(daemon.scan_buffer(&[9u8; 3000], None))
            .unwrap()
            .unwrap();
        assert!(result.is_clean());

        let wire = daemon.written();
        let upload = &wire[b"nINSTREAM\n".len()..];
        assert_eq!(upload.len(), 4 * 4 + 3000);
        assert_eq!(&upload[..4], &[0, 0, 4, 0]);
        assert_eq!(&upload[upload.len() - 4..], END_OF_STREAM);
    }

    #[test]
    fn scan_stream_splits_items_into_frames() {
        let items = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abc")),
        ];
        let daemon = MockDaemon::replying("stream: OK\n");
        future::block_on(daemon.scan_stream(stream::iter(items), Some(4)))
            .unwrap()
            .unwrap();

        let mut expected = b"nINSTREAM\n".to_vec();
        for chunk in [&b"0123"[..], b"4567", b"89", b"abc"] {
            expected.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            expected.extend_from_slice(chunk);
        }
        expected.extend_from_slice(END_OF_STREAM);
        assert_eq!(daemon.written(), expected);
    }

    #[test]
    fn scan_stream_item_error_is_a_source_error() {
        let items = vec![
            Ok(Bytes::from_static(b"data")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated")),
        ];
        let daemon = MockDaemon::replying("stream: OK\n");
        let err = future::block_on(daemon.scan_stream(stream::iter(items), None)).unwrap_err();
        assert!(matches!(err, ClamdError::Source { .. }));
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn size_limit_sentinel() {
        let daemon = MockDaemon::replying(SIZE_LIMIT_EXCEEDED);
        let err = future::block_on(daemon.scan_buffer(b"too big", None)).unwrap_err();
        assert!(matches!(err, ClamdError::BufferTooLong(_)));
    }

    #[test]
    fn write_failure_releases_connection() {
        let mut daemon = MockDaemon::replying("stream: OK\n");
        daemon.fail_after = Some(0);
        let err = future::block_on(daemon.scan_buffer(b"data", None)).unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn reset_mid_upload_with_size_limit_reply() {
        let mut daemon = MockDaemon::replying("INSTREAM size limit exceeded. ERROR\n");
        daemon.fail_after = Some(b"nINSTREAM\n".len() + 4 + 1024);
        let err = future::block_on(daemon.scan_buffer(&[0u8; 8192], None)).unwrap_err();
        match err {
            ClamdError::BufferTooLong(message) => assert_eq!(message, SIZE_LIMIT_EXCEEDED),
            other => panic!("expected BufferTooLong, got {other:?}"),
        }
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn reset_mid_stream_upload_with_size_limit_reply() {
        let items: Vec<io::Result<Bytes>> = (0..4)
            .map(|_| Ok(Bytes::from(vec![0u8; 4096])))
            .collect();
        let mut daemon = MockDaemon::replying(SIZE_LIMIT_EXCEEDED);
        daemon.fail_after = Some(b"nINSTREAM\n".len() + 4 + 1024);
        let err = future::block_on(daemon.scan_stream(stream::iter(items), None)).unwrap_err();
        assert!(matches!(err, ClamdError::BufferTooLong(_)));
    }

    #[test]
    fn reset_mid_upload_with_other_reply_keeps_write_error() {
        let mut daemon = MockDaemon::replying("stream: OK\n");
        daemon.fail_after = Some(b"nINSTREAM\n".len() + 4 + 1024);
        let err = future::block_on(daemon.scan_buffer(&[0u8; 8192], None)).unwrap_err();
        match err {
            ClamdError::Connection { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("expected a connection error, got {other:?}"),
        }
    }

    /// A scan input that never produces data.
    struct Stalled;

    impl AsyncRead for Stalled {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }
    }

    #[test]
    fn dropped_future_releases_connection() {
        let daemon = MockDaemon::replying("stream: OK\n");
        {
            let mut scan = Box::pin(daemon.instream(Stalled, None));
            assert!(future::block_on(future::poll_once(&mut scan)).is_none());
            assert_eq!(daemon.closes(), 0);
        }
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn timeout_fails_a_stalled_operation_and_releases() {
        let mut daemon = MockDaemon::replying("stream: OK\n");
        daemon.timeout = Some(Duration::from_millis(50));
        let err = future::block_on(daemon.instream(Stalled, None)).unwrap_err();
        match err {
            ClamdError::Connection { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(daemon.closes(), 1);
    }

    #[test]
    fn timeout_leaves_fast_operations_alone() {
        let mut daemon = MockDaemon::replying("PONG\n");
        daemon.timeout = Some(Duration::from_secs(5));
        assert_eq!(future::block_on(daemon.ping()).unwrap(), crate::PONG);
    }
}
