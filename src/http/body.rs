//! Lazy response bodies
//!
//! A [`BodyStream`] owns the connection its response arrived on and reads
//! the body off the wire on demand, one framing unit at a time. Once the
//! body is complete the connection goes back to the pool; dropping an
//! unfinished stream closes it.

use super::chunked::ChunkedDecoder;
use super::parser::BodyFraming;
use super::pool::{Connection, ConnectionPool};
use super::{Error, Headers, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};
use std::sync::Arc;

/// Default chunk size when iterating a body
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// A connection checked out of the pool
///
/// Released as reusable only through [`Checkout::finish`]; a checkout that
/// is dropped, e.g. after an error, closes its connection.
pub(crate) struct Checkout {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl Checkout {
    pub(crate) fn new(conn: Connection, pool: Arc<ConnectionPool>) -> Self {
        Checkout {
            conn: Some(conn),
            pool,
        }
    }

    pub(crate) fn conn(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    pub(crate) fn finish(&mut self, reusable: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, reusable);
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Raw body of a response, read lazily from its connection
///
/// Yields the body exactly as framed on the wire (still content-encoded);
/// [`Response`](super::Response) applies decoding on top.
pub struct BodyStream {
    checkout: Checkout,
    framing: BodyFraming,
    remaining: u64,
    chunked: ChunkedDecoder,
    keep_alive: bool,
    done: bool,
    failed: bool,
    received: u64,
    trailers: Headers,
}

impl BodyStream {
    pub(crate) fn new(checkout: Checkout, framing: BodyFraming, keep_alive: bool) -> Self {
        let mut stream = BodyStream {
            checkout,
            framing,
            remaining: match framing {
                BodyFraming::Length(n) => n,
                _ => 0,
            },
            chunked: ChunkedDecoder::new(),
            keep_alive,
            done: false,
            failed: false,
            received: 0,
            trailers: Headers::new(),
        };
        if matches!(framing, BodyFraming::Empty | BodyFraming::Length(0)) {
            stream.complete();
        }
        stream
    }

    /// How the body is delimited
    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether the whole body has been read
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Body bytes received so far
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Trailer fields of a chunked body, available once it is complete
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    pub(crate) fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }

    fn complete(&mut self) {
        self.done = true;
        let reusable = self.keep_alive && self.framing != BodyFraming::UntilClose;
        self.checkout.finish(reusable);
    }

    /// Whether a read failed; the rest of the body is lost
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, err: Error) -> Error {
        self.done = true;
        self.failed = true;
        self.checkout.finish(false);
        log::debug!("response body failed after {} bytes: {}", self.received, err);
        err
    }

    /// Read body bytes into `out`; 0 means the body is complete
    ///
    /// After a failed read every later read fails with
    /// [`Error::BodyConsumed`].
    pub fn read_body(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.failed {
            return Err(Error::BodyConsumed);
        }
        if self.done || out.is_empty() {
            return Ok(0);
        }
        match self.read_framed(out) {
            Ok(n) => {
                self.received += n as u64;
                Ok(n)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn read_framed(&mut self, out: &mut [u8]) -> Result<usize> {
        match self.framing {
            BodyFraming::Empty => {
                self.complete();
                Ok(0)
            }
            BodyFraming::Length(_) => {
                let conn = self.checkout.conn()?;
                if conn.buffer_mut().is_empty() && conn.fill()? == 0 {
                    return Err(Error::ConnectionClosed);
                }
                let n = take_into(conn.buffer_mut(), out, self.remaining);
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.complete();
                }
                Ok(n)
            }
            BodyFraming::UntilClose => {
                let conn = self.checkout.conn()?;
                if conn.buffer_mut().is_empty() && conn.fill()? == 0 {
                    self.complete();
                    return Ok(0);
                }
                Ok(take_into(conn.buffer_mut(), out, u64::MAX))
            }
            BodyFraming::Chunked => loop {
                let conn = self.checkout.conn()?;
                let buffer = conn.buffer_mut();
                if !buffer.is_empty() {
                    let (consumed, decoded, complete) = self.chunked.decode(buffer, out)?;
                    buffer.advance(consumed);
                    if complete {
                        self.trailers = self.chunked.take_trailers();
                        self.complete();
                        return Ok(decoded);
                    }
                    if decoded > 0 {
                        return Ok(decoded);
                    }
                    if consumed > 0 {
                        continue;
                    }
                }
                if conn.fill()? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            },
        }
    }

    /// Next piece of the body, at most `max` bytes
    pub fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; max.max(1)];
        loop {
            let n = self.read_body(&mut buf)?;
            if n > 0 {
                buf.truncate(n);
                return Ok(Some(Bytes::from(buf)));
            }
            if self.done {
                return Ok(None);
            }
        }
    }

    /// Read the rest of the body into memory
    pub fn read_all(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        if let BodyFraming::Length(n) = self.framing {
            body.reserve(n.min(1 << 20) as usize);
        }
        while let Some(chunk) = self.next_chunk(DEFAULT_CHUNK_SIZE)? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Move up to `limit` bytes from the front of `buffer` into `out`
fn take_into(buffer: &mut BytesMut, out: &mut [u8], limit: u64) -> usize {
    let n = buffer
        .len()
        .min(out.len())
        .min(usize::try_from(limit).unwrap_or(usize::MAX));
    out[..n].copy_from_slice(&buffer[..n]);
    buffer.advance(n);
    n
}

/// Wrap an error so it survives a trip through `std::io::Read`
pub(crate) fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
        other => io::Error::other(other),
    }
}

/// Recover an error wrapped by [`to_io`]; anything else came from a decoder
pub(crate) fn from_io(err: io::Error) -> Error {
    if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(e) = inner.downcast::<Error>() {
                return *e;
            }
        }
        return Error::Decode("corrupt body".to_string());
    }
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::Decode(err.to_string())
        }
        _ => Error::Io(err),
    }
}

impl Read for BodyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.read_body(buf).map_err(to_io)?;
            if n > 0 || self.done || buf.is_empty() {
                return Ok(n);
            }
        }
    }
}

impl Iterator for BodyStream {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.next_chunk(DEFAULT_CHUNK_SIZE).transpose()
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("framing", &self.framing)
            .field("received", &self.received)
            .field("done", &self.done)
            .field("failed", &self.failed)
            .finish()
    }
}
