//! Network utilities
//!
//! Name resolution and TCP connection setup. Everything above this module
//! talks to a connected `TcpStream`; everything below it is the OS.

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Keepalive probe interval applied to every outgoing socket
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no addresses found for {0}")]
    NoAddress(String),

    #[error("connection refused by {0}")]
    Refused(SocketAddr),

    #[error("connection reset by peer")]
    Reset,

    #[error("connect to {0} timed out")]
    TimedOut(SocketAddr),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),
}

impl Error {
    /// Whether a fresh attempt on a new socket may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Refused(_) | Error::Reset | Error::TimedOut(_) | Error::Connect { .. }
        )
    }
}

/// Whether an I/O error means the peer tore the connection down
pub fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Resolve `host:port` to socket addresses
///
/// Accepts bracketed IPv6 literals as produced by URL host serialization.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (bare, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::NoAddress(host.to_string()));
    }
    Ok(addrs)
}

/// Connect to `host:port`, trying each resolved address in turn
///
/// The timeout applies to each individual address attempt.
pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let addrs = resolve(host, port)?;
    let mut last_err = None;

    for addr in addrs {
        match connect_addr(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::NoAddress(host.to_string())))
}

/// Connect to a single socket address
pub fn connect_addr(addr: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| Error::Connect { addr, source })?;

    let result = match timeout {
        Some(t) => socket.connect_timeout(&addr.into(), t),
        None => socket.connect(&addr.into()),
    };

    if let Err(e) = result {
        return Err(match e.kind() {
            io::ErrorKind::ConnectionRefused => Error::Refused(addr),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::TimedOut(addr),
            _ => Error::Connect { addr, source: e },
        });
    }

    socket
        .set_nodelay(true)
        .map_err(|source| Error::Connect { addr, source })?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    socket
        .set_tcp_keepalive(&keepalive)
        .map_err(|source| Error::Connect { addr, source })?;

    Ok(socket.into())
}
