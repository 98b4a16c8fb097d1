//! Connection pool
//!
//! Idle connections are cached per [`PoolKey`] and handed out to one
//! in-flight request at a time. The pool lock only guards bookkeeping;
//! connecting, TLS handshakes and staleness probes happen outside it.

use super::proxy::{self, Proxy};
use super::tls::TlsConfig;
use super::transport::{from_tcp_stream, HttpSession};
use super::{Error, Result, TimeoutKind, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, DEFAULT_MAX_HEADER_BYTES};
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use url::Url;

/// Read-ahead chunk size when filling a connection buffer
const READ_CHUNK: usize = 16 * 1024;

/// Identity of a reusable connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
    proxy: Option<Proxy>,
    verify: bool,
}

impl PoolKey {
    pub fn new(scheme: &str, host: &str, port: u16, proxy: Option<Proxy>) -> Self {
        PoolKey {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
            proxy,
            verify: true,
        }
    }

    /// Key for the origin of `url`
    pub fn for_url(url: &Url, proxy: Option<Proxy>) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("missing host: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(match url.scheme() {
            "https" => DEFAULT_HTTPS_PORT,
            _ => DEFAULT_HTTP_PORT,
        });
        Ok(Self::new(url.scheme(), host, port, proxy))
    }

    /// Whether certificates are verified on connections for this key
    ///
    /// Verified and unverified TLS sessions to the same origin never share
    /// a connection.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy.authority())?;
        }
        Ok(())
    }
}

/// What `acquire` does when a key has no free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolFull {
    /// Wait for a release, bounded by the call deadline
    #[default]
    Block,
    /// Open a one-off connection that is closed after use
    Overflow,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections per key, idle plus in use
    pub max_per_key: usize,
    /// Idle connections kept per key
    pub max_idle_per_key: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Duration,
    pub when_full: PoolFull,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_key: 10,
            max_idle_per_key: 10,
            idle_timeout: Duration::from_secs(90),
            when_full: PoolFull::Block,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_per_key(mut self, max: usize) -> Self {
        self.max_per_key = max.max(1);
        self
    }

    pub fn max_idle_per_key(mut self, max: usize) -> Self {
        self.max_idle_per_key = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn when_full(mut self, policy: PoolFull) -> Self {
        self.when_full = policy;
        self
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Closed,
}

/// An open transport bound to one pool key
///
/// Owned by the pool while idle and by exactly one request while checked
/// out. Bytes read past the end of a response stay in the read-ahead buffer.
pub struct Connection {
    id: u64,
    key: PoolKey,
    session: HttpSession,
    buffer: BytesMut,
    created: Instant,
    last_used: Instant,
    requests: u32,
    pooled: bool,
    state: ConnectionState,
}

impl Connection {
    fn new(id: u64, key: PoolKey, session: HttpSession, pooled: bool) -> Self {
        let now = Instant::now();
        Connection {
            id,
            key,
            session,
            buffer: BytesMut::new(),
            created: now,
            last_used: now,
            requests: 0,
            pooled,
            state: ConnectionState::InUse,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether a previous request already ran on this connection
    pub fn is_reused(&self) -> bool {
        self.requests > 0
    }

    /// Whether the connection returns to the pool on release
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn session_mut(&mut self) -> &mut HttpSession {
        &mut self.session
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub(crate) fn mark_request(&mut self) {
        self.requests += 1;
    }

    /// Read more bytes from the peer into the read-ahead buffer
    ///
    /// Returns the number of bytes added; 0 means the peer closed.
    pub(crate) fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.session.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Close the transport
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            if let Err(e) = self.session.close() {
                log::trace!("closing connection #{}: {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .field("pooled", &self.pooled)
            .finish()
    }
}

/// Opens transports for pool keys
pub trait Connector: Send + Sync {
    /// Connect (and handshake) to the endpoint of `key`
    fn connect(&self, key: &PoolKey, timeout: Option<Duration>) -> Result<HttpSession>;
}

/// TCP connector with TLS for `https` keys and proxy support
pub struct DefaultConnector {
    tls_verify: TlsConfig,
    tls_insecure: TlsConfig,
    max_header_bytes: usize,
}

impl DefaultConnector {
    /// Connector trusting the system store
    pub fn new() -> Result<Self> {
        Self::with_ca_file(None)
    }

    /// Connector additionally trusting the CAs in `ca_file`
    pub fn with_ca_file(ca_file: Option<&std::path::Path>) -> Result<Self> {
        let mut verify = TlsConfig::builder();
        if let Some(path) = ca_file {
            verify = verify.ca_file(path);
        }
        Ok(DefaultConnector {
            tls_verify: verify.build()?,
            tls_insecure: TlsConfig::builder().verify(false).build()?,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        })
    }

    /// Limit on the proxy's `CONNECT` reply head
    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }
}

impl Connector for DefaultConnector {
    fn connect(&self, key: &PoolKey, timeout: Option<Duration>) -> Result<HttpSession> {
        let (host, port) = match key.proxy() {
            Some(p) => (p.host(), p.port()),
            None => (key.host(), key.port()),
        };
        let stream = crate::net::connect(host, port, timeout)?;

        if !key.is_secure() {
            return Ok(from_tcp_stream(stream));
        }

        if let Some(proxy) = key.proxy() {
            let mut session = from_tcp_stream(stream.try_clone()?);
            session.set_timeout(timeout);
            proxy::tunnel(&mut session, key.host(), key.port(), proxy, self.max_header_bytes)?;
        }

        let tls = if key.verify() {
            &self.tls_verify
        } else {
            &self.tls_insecure
        };
        let transport = tls.connect(key.host(), stream, timeout)?;
        Ok(HttpSession::new(Box::new(transport)))
    }
}

#[derive(Default)]
struct KeyState {
    idle: Vec<Connection>,
    in_use: usize,
}

impl KeyState {
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && self.in_use == 0
    }
}

enum Reservation {
    Idle(Connection),
    Slot,
    Overflow,
}

/// Keyed cache of open connections
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Box<dyn Connector>,
    state: Mutex<HashMap<PoolKey, KeyState>>,
    available: Condvar,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Pool using the default TCP/TLS connector
    pub fn new(config: PoolConfig) -> Result<Self> {
        Ok(Self::with_connector(config, Box::new(DefaultConnector::new()?)))
    }

    /// Pool opening connections through `connector`
    pub fn with_connector(config: PoolConfig, connector: Box<dyn Connector>) -> Self {
        ConnectionPool {
            config,
            connector,
            state: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, KeyState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection for `key`
    ///
    /// Reuses a live idle connection when one exists, otherwise opens a new
    /// one. At capacity this blocks until `deadline` or opens an overflow
    /// connection, per [`PoolConfig::when_full`].
    pub fn acquire(
        &self,
        key: &PoolKey,
        connect_timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<Connection> {
        loop {
            match self.reserve(key, deadline)? {
                Reservation::Idle(mut conn) => {
                    if conn.session.is_stale() {
                        log::debug!("discarding stale connection #{} to {}", conn.id, key);
                        conn.close();
                        self.free_slot(key);
                        continue;
                    }
                    log::debug!("reusing connection #{} to {}", conn.id, key);
                    conn.state = ConnectionState::InUse;
                    return Ok(conn);
                }
                Reservation::Slot => {
                    return self.open(key, connect_timeout, true).inspect_err(|_| self.free_slot(key));
                }
                Reservation::Overflow => return self.open(key, connect_timeout, false),
            }
        }
    }

    fn reserve(&self, key: &PoolKey, deadline: Option<Instant>) -> Result<Reservation> {
        let mut expired = Vec::new();
        let mut state = self.lock();

        let reservation = loop {
            let entry = state.entry(key.clone()).or_default();
            let now = Instant::now();

            let idle_timeout = self.config.idle_timeout;
            let (fresh, old): (Vec<_>, Vec<_>) = entry
                .idle
                .drain(..)
                .partition(|c| now.duration_since(c.last_used) < idle_timeout);
            entry.idle = fresh;
            expired.extend(old);

            if let Some(conn) = entry.idle.pop() {
                entry.in_use += 1;
                break Reservation::Idle(conn);
            }
            if entry.in_use < self.config.max_per_key {
                entry.in_use += 1;
                break Reservation::Slot;
            }
            if self.config.when_full == PoolFull::Overflow {
                log::debug!("pool full for {}, opening overflow connection", key);
                break Reservation::Overflow;
            }

            log::trace!("pool full for {}, waiting", key);
            state = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(now);
                    if left.is_zero() {
                        drop(state);
                        close_all(expired);
                        return Err(Error::Timeout(TimeoutKind::PoolWait));
                    }
                    self.available
                        .wait_timeout(state, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        };

        drop(state);
        close_all(expired);
        Ok(reservation)
    }

    fn open(&self, key: &PoolKey, timeout: Option<Duration>, pooled: bool) -> Result<Connection> {
        let session = self.connector.connect(key, timeout)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("opened connection #{} to {}", id, key);
        Ok(Connection::new(id, key.clone(), session, pooled))
    }

    fn free_slot(&self, key: &PoolKey) {
        let mut state = self.lock();
        if let Some(entry) = state.get_mut(key) {
            entry.in_use = entry.in_use.saturating_sub(1);
            if entry.is_unused() {
                state.remove(key);
            }
        }
        drop(state);
        self.available.notify_one();
    }

    /// Return a checked-out connection
    ///
    /// Only a connection released with `reusable` and no unread bytes goes
    /// back to the idle list; everything else is closed.
    pub fn release(&self, mut conn: Connection, reusable: bool) {
        if !conn.pooled {
            conn.close();
            return;
        }

        let keep = reusable && conn.state != ConnectionState::Closed && conn.buffer.is_empty();
        if keep {
            conn.session.set_cancel(None);
            conn.session.set_deadline(None);
            conn.last_used = Instant::now();
            conn.state = ConnectionState::Idle;
        }

        let conn_key = conn.key.clone();
        let mut state = self.lock();
        let entry = state.entry(conn_key.clone()).or_default();
        entry.in_use = entry.in_use.saturating_sub(1);
        let rejected = if keep && entry.idle.len() < self.config.max_idle_per_key {
            log::trace!("connection #{} back to pool", conn.id);
            entry.idle.push(conn);
            None
        } else {
            Some(conn)
        };
        if entry.is_unused() {
            state.remove(&conn_key);
        }
        drop(state);
        self.available.notify_one();

        if let Some(mut conn) = rejected {
            log::debug!("closing connection #{} to {}", conn.id, conn.key);
            conn.close();
        }
    }

    /// Idle connections currently cached for `key`
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.idle.len())
    }

    /// Pooled connections currently checked out for `key`
    pub fn in_use_count(&self, key: &PoolKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.in_use)
    }

    /// Close every idle connection
    pub fn clear(&self) {
        let mut state = self.lock();
        let idle: Vec<Connection> = state.values_mut().flat_map(|e| e.idle.drain(..)).collect();
        state.retain(|_, e| !e.is_unused());
        drop(state);
        close_all(idle);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish()
    }
}

fn close_all(conns: Vec<Connection>) {
    for mut conn in conns {
        log::debug!("closing expired connection #{} to {}", conn.id, conn.key);
        conn.close();
    }
}
