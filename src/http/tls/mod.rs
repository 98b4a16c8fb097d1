//! TLS support for HTTPS connections
//!
//! TLS plugs into the transport abstraction:
//!
//! 1. `TlsConfig` holds the client context (verification, CA file, versions, ALPN)
//! 2. `TlsTransport` implements the `Transport` trait for encrypted I/O
//! 3. Everything above the pool is unchanged and uses TLS transparently
//!
//! # Examples
//!
//! ```no_run
//! use courier::http::tls::{TlsConfig, TlsVersion};
//! use std::net::TcpStream;
//! use std::time::Duration;
//!
//! let tls = TlsConfig::builder()
//!     .min_version(TlsVersion::Tls12)
//!     .build()
//!     .unwrap();
//!
//! let tcp = TcpStream::connect("example.com:443").unwrap();
//! let transport = tls.connect("example.com", tcp, Some(Duration::from_secs(10))).unwrap();
//! ```

pub mod config;
pub mod session;

pub use config::{TlsConfig, TlsConfigBuilder, TlsVersion};
pub use session::TlsTransport;
