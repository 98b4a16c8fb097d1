//! TLS transport
//!
//! This module implements the Transport trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use crate::http::transport::{poll_fd, PollEvents, Transport};
use crate::http::{Error, Result};
use openssl::ssl::SslStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS transport
///
/// Wraps an OpenSSL SslStream and provides poll/read/write/close operations.
pub struct TlsTransport {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsTransport {
    pub(crate) fn new(stream: SslStream<TcpStream>) -> Self {
        TlsTransport {
            stream,
            failed: false,
        }
    }

    /// Negotiated protocol version, e.g. "TLSv1.3"
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Protocol selected by ALPN, if any
    pub fn alpn_protocol(&self) -> Option<String> {
        self.stream
            .ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    /// Check if a TLS operation failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl Transport for TlsTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        // Decrypted bytes already buffered by OpenSSL
        if matches!(events, PollEvents::Read | PollEvents::Both) && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).inspect_err(|_| self.failed = true)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf).inspect_err(|_| self.failed = true)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().inspect_err(|_| self.failed = true)
    }

    fn close(&mut self) -> Result<()> {
        // Send close_notify only on a healthy session
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn socket(&self) -> io::Result<TcpStream> {
        self.stream.get_ref().try_clone()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        let socket = self.stream.get_ref();
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)
    }
}
