//! Transport abstraction
//!
//! This module provides the transport operations pattern that allows
//! transparent switching between plain TCP and TLS connections. All HTTP
//! I/O goes through [`HttpSession`], which polls the transport with the
//! applicable timeout before every read and write.

use super::cancel::CancelHandle;
use super::{Error, Result, TimeoutKind};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Transport operations
///
/// Defines the operations that can be performed on a connected socket,
/// abstracting over plain TCP and TLS.
pub trait Transport: Send {
    /// Poll the transport for events
    ///
    /// Returns true if the transport is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the transport
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data to the transport
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the transport
    fn close(&mut self) -> Result<()>;

    /// A second handle to the underlying socket, used to abort blocked I/O
    fn socket(&self) -> io::Result<TcpStream>;

    /// Whether the transport is TLS-encrypted
    fn is_secure(&self) -> bool {
        false
    }

    /// Bound blocking socket I/O issued after a successful poll
    ///
    /// Transports that may block mid-record (TLS) apply this as a socket
    /// timeout; plain TCP never blocks after poll and ignores it.
    fn set_io_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Poll a raw socket descriptor
///
/// `None` blocks indefinitely. Retries on `EINTR`.
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        // Round sub-millisecond waits up so they do not become a busy poll
        Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as i32,
    };

    loop {
        // SAFETY: `pfd` is a valid pollfd for the duration of the call and
        // nfds is 1.
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }

        return Ok(result > 0);
    }
}

/// Plain TCP transport
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Create a new transport from a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn socket(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

/// HTTP session wrapping a transport with timeouts and cancellation
///
/// Each read waits at most the read timeout and never past the call
/// deadline; the two are reported as different [`TimeoutKind`]s.
pub struct HttpSession {
    transport: Box<dyn Transport>,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: Option<CancelHandle>,
}

impl HttpSession {
    /// Create a new HTTP session
    pub fn new(transport: Box<dyn Transport>) -> Self {
        HttpSession {
            transport,
            read_timeout: Some(Duration::from_secs(10)),
            deadline: None,
            cancel: None,
        }
    }

    /// Set the per-read timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Get the per-read timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Set the deadline of the overall call
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Attach (or detach) a cancellation handle
    pub fn set_cancel(&mut self, cancel: Option<CancelHandle>) {
        if let Some(old) = self.cancel.take() {
            old.clear();
        }
        if let Some(handle) = &cancel {
            if let Ok(socket) = self.transport.socket() {
                handle.register(socket);
            }
        }
        self.cancel = cancel;
    }

    fn check_canceled(&self) -> Result<()> {
        match &self.cancel {
            Some(c) if c.is_canceled() => Err(Error::Canceled),
            _ => Ok(()),
        }
    }

    /// Effective wait and the kind of timeout that applies if it elapses
    fn wait_budget(&self) -> Result<(Option<Duration>, TimeoutKind)> {
        match self.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Timeout(TimeoutKind::Total));
                }
                match self.read_timeout {
                    Some(t) if t < left => Ok((Some(t), TimeoutKind::Read)),
                    _ => Ok((Some(left), TimeoutKind::Total)),
                }
            }
            None => Ok((self.read_timeout, TimeoutKind::Read)),
        }
    }

    fn map_io(&self, err: io::Error, kind: TimeoutKind) -> Error {
        if self.check_canceled().is_err() {
            return Error::Canceled;
        }
        if crate::net::is_reset(&err) {
            return Error::Connection(crate::net::Error::Reset);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout(kind),
            _ => Error::Io(err),
        }
    }

    /// Read data with timeout; `Ok(0)` means the peer closed the connection
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_canceled()?;
        let (timeout, kind) = self.wait_budget()?;

        if !self.transport.poll(PollEvents::Read, timeout)? {
            return Err(Error::Timeout(kind));
        }
        self.transport.set_io_timeout(timeout)?;

        match self.transport.read(buf) {
            Ok(n) => {
                self.check_canceled()?;
                Ok(n)
            }
            Err(e) => Err(self.map_io(e, kind)),
        }
    }

    /// Write the whole buffer with timeout
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            self.check_canceled()?;
            let (timeout, kind) = self.wait_budget()?;

            if !self.transport.poll(PollEvents::Write, timeout)? {
                return Err(Error::Timeout(kind));
            }
            self.transport.set_io_timeout(timeout)?;

            match self.transport.write(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.map_io(e, kind)),
            }
        }
        Ok(())
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<()> {
        let kind = self.wait_budget()?.1;
        self.transport.flush().map_err(|e| self.map_io(e, kind))
    }

    /// Whether an idle connection was closed or sent unsolicited data
    ///
    /// An idle HTTP/1.1 connection must not be readable; readability means
    /// EOF, a reset, or garbage, and in all cases it must not be reused.
    pub fn is_stale(&self) -> bool {
        !matches!(self.transport.poll(PollEvents::Read, Some(Duration::ZERO)), Ok(false))
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.clear();
        }
        self.transport.close()
    }

    /// Whether the session runs over TLS
    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession {
    HttpSession::new(Box::new(TcpTransport::new(stream)))
}
