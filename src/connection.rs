//! Scoped ownership of a daemon socket.
//!
//! A [`Connection`] is created for exactly one request and closes its socket
//! when dropped, which covers normal returns, early `?` returns, panics and
//! cancelled futures alike.

use std::io;
use std::net::Shutdown;
use std::ops::{Deref, DerefMut};

use tracing::{debug, trace};

/// Sockets that can be closed in place.
pub trait Close {
    /// Shuts down both directions of the socket.
    fn close(&mut self) -> io::Result<()>;
}

impl Close for std::net::TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Close for std::os::unix::net::UnixStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(feature = "async")]
impl Close for async_net::TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(all(unix, feature = "async"))]
impl Close for async_net::unix::UnixStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// A socket held for the duration of one request.
///
/// Dereferences to the underlying stream. The socket is closed exactly once,
/// on drop; close failures are logged and discarded so they never replace the
/// outcome of the request.
#[derive(Debug)]
pub struct Connection<S: Close> {
    stream: S,
}

impl<S: Close> Connection<S> {
    /// Wraps a freshly connected socket.
    pub fn new(stream: S) -> Self {
        trace!("connection acquired");
        Self { stream }
    }
}

impl<S: Close> Deref for Connection<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.stream
    }
}

impl<S: Close> DerefMut for Connection<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: Close> Drop for Connection<S> {
    fn drop(&mut self) {
        match self.stream.close() {
            Ok(()) => trace!("connection released"),
            Err(e) => debug!(error = %e, "ignoring error while closing connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Close for Counting {
        fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::NotConnected, "already gone"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn closes_once_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _conn = Connection::new(Counting {
                closes: Arc::clone(&closes),
                fail: false,
            });
            assert_eq!(closes.load(Ordering::SeqCst), 0);
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_failure_is_swallowed() {
        let closes = Arc::new(AtomicUsize::new(0));
        drop(Connection::new(Counting {
            closes: Arc::clone(&closes),
            fail: true,
        }));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closes_on_early_return() {
        fn fails(closes: Arc<AtomicUsize>) -> Result<(), &'static str> {
            let _conn = Connection::new(Counting {
                closes,
                fail: false,
            });
            let written: Result<(), &'static str> = Err("write failed");
            written?;
            Ok(())
        }

        let closes = Arc::new(AtomicUsize::new(0));
        assert!(fails(Arc::clone(&closes)).is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
