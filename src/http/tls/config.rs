//! TLS configuration
//!
//! This module provides the client TLS configuration builder.

use super::session::TlsTransport;
use crate::http::{Error, Result, TimeoutKind};
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use std::fmt;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = Error;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(Error::Connection(crate::net::Error::Tls(format!(
                "invalid TLS version: {}",
                s
            )))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(crate::net::Error::Tls(message.into()))
}

/// Client TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    connector: SslConnector,
    verify: bool,
}

impl TlsConfig {
    /// Create a new configuration builder
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Default configuration: system trust store with full verification
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Whether certificates and hostnames are verified
    pub fn verifies(&self) -> bool {
        self.verify
    }

    /// Perform the client handshake over a connected stream
    ///
    /// The handshake is bounded by `timeout`; an expired handshake reports a
    /// connect timeout.
    pub fn connect(&self, host: &str, stream: TcpStream, timeout: Option<Duration>) -> Result<TlsTransport> {
        stream.set_read_timeout(timeout.filter(|t| !t.is_zero()))?;
        stream.set_write_timeout(timeout.filter(|t| !t.is_zero()))?;

        let mut config = self
            .connector
            .configure()
            .map_err(|e| tls_error(e.to_string()))?;
        if !self.verify {
            config.set_verify_hostname(false);
            config.set_verify(SslVerifyMode::NONE);
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        match config.connect(host, stream) {
            Ok(ssl_stream) => {
                log::debug!(
                    "TLS session to {} established ({})",
                    host,
                    ssl_stream.ssl().version_str()
                );
                Ok(TlsTransport::new(ssl_stream))
            }
            Err(HandshakeError::WouldBlock(_)) => Err(Error::Timeout(TimeoutKind::Connect)),
            Err(HandshakeError::Failure(mid)) => {
                let err = mid.error();
                if let Some(io) = err.io_error() {
                    if matches!(io.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
                        return Err(Error::Timeout(TimeoutKind::Connect));
                    }
                }
                let verify = mid.ssl().verify_result();
                if verify != openssl::x509::X509VerifyResult::OK {
                    return Err(tls_error(format!(
                        "certificate verification failed for {}: {}",
                        host,
                        verify.error_string()
                    )));
                }
                Err(tls_error(format!("handshake with {} failed: {}", host, err)))
            }
            Err(HandshakeError::SetupFailure(e)) => Err(tls_error(e.to_string())),
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").field("verify", &self.verify).finish()
    }
}

/// Client configuration builder
#[derive(Debug, Clone)]
pub struct TlsConfigBuilder {
    verify: bool,
    ca_file: Option<PathBuf>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
}

impl TlsConfigBuilder {
    fn new() -> Self {
        TlsConfigBuilder {
            verify: true,
            ca_file: None,
            min_version: None,
            max_version: None,
            alpn: vec!["http/1.1".to_string()],
        }
    }

    /// Enable/disable peer certificate and hostname verification
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Trust the CA certificates in this PEM file in addition to the system store
    pub fn ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the minimum TLS version
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set ALPN protocols offered to the server
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig> {
        let err = |e: openssl::error::ErrorStack| tls_error(e.to_string());

        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(err)?;

        if let Some(min) = self.min_version {
            builder
                .set_min_proto_version(Some(min.to_openssl_version()))
                .map_err(err)?;
        }
        if let Some(max) = self.max_version {
            builder
                .set_max_proto_version(Some(max.to_openssl_version()))
                .map_err(err)?;
        }

        if let Some(path) = &self.ca_file {
            builder.set_ca_file(path).map_err(|e| {
                tls_error(format!("failed to load CA file {}: {}", path.display(), e))
            })?;
        }

        if !self.alpn.is_empty() {
            // Length-prefixed protocol list
            let mut alpn_bytes = Vec::new();
            for proto in &self.alpn {
                alpn_bytes.push(proto.len() as u8);
                alpn_bytes.extend_from_slice(proto.as_bytes());
            }
            builder.set_alpn_protos(&alpn_bytes).map_err(err)?;
        }

        if !self.verify {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(TlsConfig {
            connector: builder.build(),
            verify: self.verify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("invalid".parse::<TlsVersion>().is_err());
        assert!(TlsVersion::Tls12 < TlsVersion::Tls13);
    }

    #[test]
    fn test_builder_defaults() {
        let config = TlsConfig::builder().build().unwrap();
        assert!(config.verifies());

        let config = TlsConfig::builder()
            .verify(false)
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .build()
            .unwrap();
        assert!(!config.verifies());
    }

    #[test]
    fn test_missing_ca_file() {
        let result = TlsConfig::builder()
            .ca_file("/nonexistent/courier-ca.pem")
            .build();
        assert!(matches!(
            result,
            Err(Error::Connection(crate::net::Error::Tls(_)))
        ));
    }
}
