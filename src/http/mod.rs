//! HTTP/1.1 client engine
//!
//! This module provides a blocking HTTP/1.1 client with connection pooling,
//! retries, cookie persistence, compression and streaming bodies.
//!
//! # Architecture
//!
//! Requests flow leaf-to-root through these layers:
//!
//! - `Transport` abstracts plain TCP and TLS sockets (poll, read, write, close)
//! - `ConnectionPool` caches idle transports keyed by scheme, host, port and proxy
//! - `RequestBuilder` turns an immutable `Request` into wire bytes
//! - `ResponseParser` reads the status line and headers; the body stays lazy
//! - `decode` inflates gzip/deflate content and decodes charsets
//! - `RetryPolicy` wraps each logical call in bounded, backed-off attempts
//! - `CookieJar` records `Set-Cookie` and replays matching cookies
//! - `HttpClient` orchestrates all of the above per instance
//!
//! # Examples
//!
//! ```no_run
//! use courier::http::{HttpClient, RequestOptions};
//!
//! let client = HttpClient::builder().build().unwrap();
//! let response = client.get("https://example.com/", RequestOptions::new()).unwrap();
//! println!("{} {}", response.status(), response.text().unwrap());
//! ```

pub mod body;
pub mod cancel;
pub mod chunked;
pub mod client;
pub mod cookie;
pub mod decode;
pub mod headers;
pub mod message;
pub mod middleware;
pub mod multipart;
pub mod parser;
pub mod pool;
pub mod proxy;
pub mod response;
pub mod retry;
pub mod tls;
pub mod transport;
pub mod wire;

pub use body::BodyStream;
pub use cancel::CancelHandle;
pub use client::{ClientBuilder, HttpClient, RequestOptions, Timeouts, DEFAULT_MAX_REDIRECTS};
pub use cookie::{Cookie, CookieJar};
pub use headers::Headers;
pub use message::{BasicAuth, Body, Method, Request, Status, StreamBody, Version};
pub use middleware::{BoxError, DebugLog, Middleware};
pub use multipart::{MultipartPart, PartSource};
pub use parser::{BodyFraming, ParsedRequest, RequestParser, ResponseHead, ResponseParser};
pub use pool::{Connection, ConnectionPool, ConnectionState, Connector, DefaultConnector, PoolConfig, PoolFull, PoolKey};
pub use proxy::{Proxies, Proxy};
pub use response::{Chunks, Response};
pub use retry::{RetryPolicy, RetryState};
pub use tls::TlsConfig;
pub use transport::{HttpSession, Transport};
pub use wire::{BuildContext, RequestBuilder, WireBody, WireRequest};

use std::fmt;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Establishing the TCP connection or TLS session
    Connect,
    /// Waiting for the next bytes from the peer
    Read,
    /// The overall deadline of the logical call
    Total,
    /// Waiting for a pool slot
    PoolWait,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Read => "read",
            TimeoutKind::Total => "total",
            TimeoutKind::PoolWait => "pool wait",
        };
        f.write_str(s)
    }
}

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(crate::net::Error),

    #[error("Timeout ({0})")]
    Timeout(TimeoutKind),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("Malformed cookie file at line {line}: {message}")]
    Format { line: usize, message: String },

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Too many redirects (max {0})")]
    TooManyRedirects(usize),

    #[error("HTTP {code} {reason}")]
    Status { code: u16, reason: String },

    #[error("Response body already consumed")]
    BodyConsumed,

    #[error("Request canceled")]
    Canceled,
}

impl From<crate::net::Error> for Error {
    fn from(err: crate::net::Error) -> Self {
        match err {
            crate::net::Error::TimedOut(_) => Error::Timeout(TimeoutKind::Connect),
            other => Error::Connection(other),
        }
    }
}

/// Flat classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Protocol,
    Encoding,
    Decode,
    RetryExhausted,
    Format,
    Middleware,
    InvalidUrl,
    Redirect,
    Status,
    BodyConsumed,
    Canceled,
    Io,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Connection(_) | Error::ConnectionClosed => ErrorKind::Connection,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Decode(_) => ErrorKind::Decode,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::Format { .. } => ErrorKind::Format,
            Error::Middleware(_) => ErrorKind::Middleware,
            Error::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Error::TooManyRedirects(_) => ErrorKind::Redirect,
            Error::Status { .. } => ErrorKind::Status,
            Error::BodyConsumed => ErrorKind::BodyConsumed,
            Error::Canceled => ErrorKind::Canceled,
        }
    }

    /// Whether a new attempt on a fresh connection may succeed
    ///
    /// Only refused/reset connections, premature closes, connect and read
    /// timeouts qualify. Retryable status codes are decided by the policy.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_transient(),
            Error::ConnectionClosed => true,
            Error::Timeout(kind) => matches!(kind, TimeoutKind::Connect | TimeoutKind::Read),
            _ => false,
        }
    }

    /// Whether this is a timeout of any kind, including one wrapped by retry exhaustion
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Maximum number of headers in a response head
pub const MAX_HEADERS: usize = 128;

/// Default limit on the size of a response header block
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
