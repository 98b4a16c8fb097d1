//! HTTP client
//!
//! [`HttpClient`] runs logical calls over a connection pool and cookie jar
//! owned by the client instance. Each call moves through these states:
//!
//! ```text
//! Building -> Connecting -> Sending -> AwaitingHeaders -> StreamingBody -> Complete
//!                 ^                                                  |
//!                 +------------------ Retrying <---------------------+
//! ```
//!
//! with `Failed` terminal on a permanent error or retry exhaustion.
//! Redirects start a fresh retry budget for every hop.

use super::body::{BodyStream, Checkout};
use super::cancel::CancelHandle;
use super::cookie::CookieJar;
use super::middleware::Middleware;
use super::multipart::MultipartPart;
use super::parser::ResponseParser;
use super::pool::{Connection, ConnectionPool, Connector, DefaultConnector, PoolConfig, PoolKey};
use super::proxy::{Proxies, Proxy};
use super::response::{Chunks, Response};
use super::retry::{RetryPolicy, RetryState};
use super::wire::{BuildContext, RequestBuilder};
use super::{
    BasicAuth, Body, Error, Headers, Method, Request, ResponseHead, Result, TimeoutKind,
    DEFAULT_MAX_HEADER_BYTES,
};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Default maximum number of redirects followed per call
pub const DEFAULT_MAX_REDIRECTS: usize = 30;

/// Connect, per-read and whole-call timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub total: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(10)),
            total: None,
        }
    }
}

impl Timeouts {
    /// Same limit for connecting and for each read; no total limit
    pub fn uniform(timeout: Duration) -> Self {
        Timeouts {
            connect: Some(timeout),
            read: Some(timeout),
            total: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Building,
    Connecting,
    Sending,
    AwaitingHeaders,
    StreamingBody,
    Complete,
    Retrying,
    Failed,
}

fn enter(state: CallState, url: &Url) {
    log::trace!("{:?}: {}", state, url);
}

/// Options of a single call
///
/// ```no_run
/// use courier::http::{HttpClient, RequestOptions};
/// use std::time::Duration;
///
/// let client = HttpClient::new().unwrap();
/// let options = RequestOptions::new()
///     .header("X-Api-Key", "secret")
///     .param("page", "2")
///     .timeout(Duration::from_secs(5));
/// let response = client.get("https://api.example.com/items", options).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub headers: Headers,
    pub params: Vec<(String, String)>,
    pub body: Body,
    pub timeout: Option<Duration>,
    pub proxy: Option<Proxy>,
    pub auth: Option<BasicAuth>,
    /// Follow redirects; the client default when `None`
    pub allow_redirects: Option<bool>,
    /// Leave the body on the connection
    pub stream: bool,
    /// Verify TLS certificates; the client default when `None`
    pub verify_ssl: Option<bool>,
    pub cancel: Option<CancelHandle>,
    body_error: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing earlier values of that name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.merge(&headers);
        self
    }

    /// Add a query parameter; repeated names are all sent
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// JSON body; a serialization failure is reported when the call is made
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Body::json(value) {
            Ok(body) => self.body = body,
            Err(e) => self.body_error = Some(e.to_string()),
        }
        self
    }

    /// Raw body bytes
    pub fn data(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Form fields; sent as text parts when files are attached too
    pub fn form<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let pairs: Vec<(String, String)> = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.body = match std::mem::take(&mut self.body) {
            Body::Multipart(files) => {
                let mut parts: Vec<MultipartPart> =
                    pairs.into_iter().map(|(k, v)| MultipartPart::text(k, v)).collect();
                parts.extend(files);
                Body::Multipart(parts)
            }
            _ => Body::Form(pairs),
        };
        self
    }

    /// Multipart file parts; earlier form fields become text parts
    pub fn files(mut self, files: Vec<MultipartPart>) -> Self {
        self.body = match std::mem::take(&mut self.body) {
            Body::Form(pairs) => {
                let mut parts: Vec<MultipartPart> =
                    pairs.into_iter().map(|(k, v)| MultipartPart::text(k, v)).collect();
                parts.extend(files);
                Body::Multipart(parts)
            }
            Body::Multipart(mut parts) => {
                parts.extend(files);
                Body::Multipart(parts)
            }
            _ => Body::Multipart(files),
        };
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Limit for connecting and for each read of this call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(BasicAuth::new(username, password));
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = Some(allow);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = Some(verify);
        self
    }

    pub fn cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Per-call settings that do not travel with the request
#[derive(Debug, Clone, Default)]
struct CallOptions {
    allow_redirects: Option<bool>,
    stream: bool,
    verify_ssl: Option<bool>,
    cancel: Option<CancelHandle>,
}

/// Configures and builds an [`HttpClient`]
pub struct ClientBuilder {
    timeouts: Timeouts,
    headers: Headers,
    auth: Option<BasicAuth>,
    follow_redirects: bool,
    max_redirects: usize,
    proxies: Proxies,
    cookie_file: Option<PathBuf>,
    retry: RetryPolicy,
    verify_ssl: bool,
    ca_file: Option<PathBuf>,
    pool_config: PoolConfig,
    max_header_bytes: usize,
    middleware: Vec<Arc<dyn Middleware>>,
    pool: Option<Arc<ConnectionPool>>,
    connector: Option<Box<dyn Connector>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            timeouts: Timeouts::default(),
            headers: RequestBuilder::default_headers(),
            auth: None,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            proxies: Proxies::new(),
            cookie_file: None,
            retry: RetryPolicy::default(),
            verify_ssl: true,
            ca_file: None,
            pool_config: PoolConfig::default(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            middleware: Vec::new(),
            pool: None,
            connector: None,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect and per-read timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = Some(timeout);
        self.timeouts.read = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.read = timeout;
        self
    }

    /// Limit on a whole call, retries and redirects included
    pub fn total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.total = timeout;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.headers.set("User-Agent", user_agent);
        self
    }

    /// Header sent with every request unless the call overrides it
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Replace the whole default header set
    pub fn default_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(BasicAuth::new(username, password));
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn proxies(mut self, proxies: Proxies) -> Self {
        self.proxies = proxies;
        self
    }

    /// Send all traffic through `proxy`
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxies = Proxies::new().all(proxy);
        self
    }

    /// Load cookies from `path` now and save them after every call
    pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_file = Some(path.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    /// Trust the CA certificates in a PEM file in addition to the system store
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Largest response header block accepted
    pub fn max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    /// Append a middleware; hooks run in insertion order
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Use an existing pool, shared with other clients
    pub fn shared_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open connections through a custom connector
    pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                let connector = match self.connector {
                    Some(c) => c,
                    None => Box::new(
                        DefaultConnector::with_ca_file(self.ca_file.as_deref())?
                            .with_max_header_bytes(self.max_header_bytes),
                    ),
                };
                Arc::new(ConnectionPool::with_connector(self.pool_config, connector))
            }
        };

        let cookies = match &self.cookie_file {
            Some(path) => CookieJar::load(path)?,
            None => CookieJar::new(),
        };

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                pool,
                cookies,
                builder: RequestBuilder::new(self.headers),
                timeouts: self.timeouts,
                auth: self.auth,
                follow_redirects: self.follow_redirects,
                max_redirects: self.max_redirects,
                proxies: self.proxies,
                cookie_file: self.cookie_file,
                retry: self.retry,
                verify_ssl: self.verify_ssl,
                max_header_bytes: self.max_header_bytes,
                middleware: self.middleware,
            }),
        })
    }
}

struct ClientInner {
    pool: Arc<ConnectionPool>,
    cookies: CookieJar,
    builder: RequestBuilder,
    timeouts: Timeouts,
    auth: Option<BasicAuth>,
    follow_redirects: bool,
    max_redirects: usize,
    proxies: Proxies,
    cookie_file: Option<PathBuf>,
    retry: RetryPolicy,
    verify_ssl: bool,
    max_header_bytes: usize,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Blocking HTTP/1.1 client
///
/// Clones share the pool, the cookie jar and the configuration, so one
/// client can serve many threads.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("timeouts", &self.inner.timeouts)
            .field("follow_redirects", &self.inner.follow_redirects)
            .field("retry", &self.inner.retry)
            .field("cookies", &self.inner.cookies.len())
            .finish()
    }
}

impl HttpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client with the default configuration
    pub fn new() -> Result<Self> {
        ClientBuilder::new().build()
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.inner.cookies
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Write the jar to the configured cookie file, if any
    pub fn save_cookies(&self) -> Result<()> {
        match &self.inner.cookie_file {
            Some(path) => self.inner.cookies.save(path),
            None => Ok(()),
        }
    }

    pub fn get(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Get, url, options)
    }

    pub fn post(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Post, url, options)
    }

    pub fn put(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Put, url, options)
    }

    pub fn delete(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Delete, url, options)
    }

    pub fn patch(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Patch, url, options)
    }

    pub fn head(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Head, url, options)
    }

    /// Run one logical call
    pub fn request(&self, method: Method, url: &str, options: RequestOptions) -> Result<Response> {
        if let Some(message) = options.body_error {
            return Err(Error::Encoding(message));
        }
        let request = Request::parse(method, url)?
            .with_headers(options.headers)
            .with_params(options.params)
            .with_body(options.body)
            .with_timeout(options.timeout)
            .with_proxy(options.proxy)
            .with_auth(options.auth);
        let call = CallOptions {
            allow_redirects: options.allow_redirects,
            stream: options.stream,
            verify_ssl: options.verify_ssl,
            cancel: options.cancel,
        };
        self.execute(request, &call)
    }

    /// Send a prepared request with the client defaults
    pub fn send(&self, request: Request) -> Result<Response> {
        self.execute(request, &CallOptions::default())
    }

    /// Fetch `url` into memory and write the decoded body to `path`
    ///
    /// Returns the number of bytes written. Error statuses fail with
    /// [`Error::Status`] and leave `path` untouched.
    pub fn download(&self, url: &str, path: impl AsRef<Path>) -> Result<u64> {
        let response = self.get(url, RequestOptions::new())?;
        response.raise_for_status()?;
        let content = response.content()?;
        std::fs::write(path.as_ref(), &content)?;
        Ok(content.len() as u64)
    }

    /// Stream `url` to `path`, calling `progress` with the running total
    pub fn download_stream<F>(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        chunk_size: usize,
        mut progress: F,
    ) -> Result<u64>
    where
        F: FnMut(u64),
    {
        let response = self.get(url, RequestOptions::new().stream(true))?;
        response.raise_for_status()?;
        let mut file = File::create(path.as_ref())?;
        let mut written = 0u64;
        for chunk in response.chunks(chunk_size)? {
            let chunk = chunk?;
            file.write_all(&chunk)?;
            written += chunk.len() as u64;
            progress(written);
        }
        file.flush()?;
        Ok(written)
    }

    /// Decoded body of `url` as an iterator of chunks
    pub fn stream_response(&self, url: &str, chunk_size: usize) -> Result<Chunks> {
        let response = self.get(url, RequestOptions::new().stream(true))?;
        response.chunks(chunk_size)
    }

    /// POST text fields and files as `multipart/form-data`
    pub fn post_multipart<P: AsRef<Path>>(
        &self,
        url: &str,
        fields: &[(&str, &str)],
        files: &[(&str, P)],
    ) -> Result<Response> {
        let mut parts: Vec<MultipartPart> = fields
            .iter()
            .map(|(name, value)| MultipartPart::text(*name, *value))
            .collect();
        parts.extend(files.iter().map(|(name, path)| MultipartPart::file(*name, path)));
        self.post(url, RequestOptions::new().body(Body::Multipart(parts)))
    }

    fn execute(&self, request: Request, call: &CallOptions) -> Result<Response> {
        let inner = &self.inner;
        let deadline = inner.timeouts.total.map(|t| Instant::now() + t);
        let follow = call.allow_redirects.unwrap_or(inner.follow_redirects);

        enter(CallState::Building, request.url());
        let mut request = request;
        if request.auth().is_none() {
            request = request.with_auth(inner.auth.clone());
        }
        for middleware in &inner.middleware {
            request = middleware
                .on_request(request)
                .map_err(|e| Error::Middleware(e.to_string()))?;
        }

        let mut history: Vec<Url> = Vec::new();
        let response = loop {
            let response = inner
                .retry
                .execute(request.method(), deadline, call.cancel.as_ref(), |state| {
                    self.attempt(&request, call, follow, deadline, state)
                })
                .inspect_err(|e| {
                    enter(CallState::Failed, request.url());
                    log::debug!("{} {} failed: {}", request.method(), request.url(), e);
                })?;

            if !(follow && is_followed_redirect(&response)) {
                break response;
            }
            if history.len() >= inner.max_redirects {
                return Err(Error::TooManyRedirects(inner.max_redirects));
            }
            let next = redirect_request(&request, &response)?;
            log::debug!(
                "{} redirect from {} to {}",
                response.status_code(),
                request.url(),
                next.url()
            );
            history.push(response.url().clone());
            request = next;
        };
        let response = response.with_history(history);

        for middleware in &inner.middleware {
            middleware
                .on_response(&response)
                .map_err(|e| Error::Middleware(e.to_string()))?;
        }
        if let Some(path) = &inner.cookie_file {
            if let Err(e) = inner.cookies.save(path) {
                log::warn!("failed to save cookies to {}: {}", path.display(), e);
            }
        }
        Ok(response)
    }

    /// One physical attempt on a freshly checked-out connection
    fn attempt(
        &self,
        request: &Request,
        call: &CallOptions,
        follow: bool,
        deadline: Option<Instant>,
        state: &RetryState,
    ) -> Result<Response> {
        let inner = &self.inner;
        let url = request.url();
        if state.attempt() > 1 {
            enter(CallState::Retrying, url);
        }

        enter(CallState::Connecting, url);
        let proxy = request
            .proxy()
            .or_else(|| inner.proxies.for_url(url))
            .cloned();
        let verify = call.verify_ssl.unwrap_or(inner.verify_ssl);
        let key = PoolKey::for_url(url, proxy.clone())?.with_verify(verify);
        let connect_timeout = bounded(request.timeout().or(inner.timeouts.connect), deadline)?;
        let read_timeout = request.timeout().or(inner.timeouts.read);

        let conn = inner.pool.acquire(&key, connect_timeout, deadline)?;
        let mut checkout = Checkout::new(conn, Arc::clone(&inner.pool));
        let conn = checkout.conn()?;
        conn.mark_request();
        {
            let session = conn.session_mut();
            session.set_timeout(read_timeout);
            session.set_deadline(deadline);
            session.set_cancel(call.cancel.clone());
        }

        let absolute_form = proxy.is_some() && !key.is_secure();
        let ctx = BuildContext {
            cookie: inner.cookies.cookie_header(url),
            absolute_form,
            proxy_authorization: proxy
                .as_ref()
                .filter(|_| absolute_form)
                .and_then(Proxy::authorization),
        };
        let wire = inner.builder.build(request, &ctx)?;
        for middleware in &inner.middleware {
            middleware.on_send(&wire);
        }

        enter(CallState::Sending, url);
        log::debug!(
            "{} {} (connection #{}, attempt {})",
            request.method(),
            url,
            conn.id(),
            state.attempt()
        );
        let sent = Instant::now();
        wire.send(conn.session_mut())?;

        enter(CallState::AwaitingHeaders, url);
        let mut head = read_head(conn, inner.max_header_bytes)?;
        let elapsed = sent.elapsed();
        log::debug!("{} {} -> {} {}", request.method(), url, head.status.code(), head.reason);

        inner.cookies.merge_headers(url, &head.headers);
        let framing = head.framing(request.method())?;
        let keep_alive = head.keep_alive();
        let mut body = BodyStream::new(checkout, framing, keep_alive);

        let redirect = follow && head.status.is_redirect() && head.headers.contains("Location");
        if call.stream && !redirect {
            enter(CallState::StreamingBody, url);
            return Ok(Response::streaming(head, body, url.clone(), elapsed));
        }

        let raw = body.read_all()?;
        for (name, value) in body.take_trailers().iter() {
            head.headers.insert(name, value);
        }
        enter(CallState::Complete, url);
        Ok(Response::from_head(head, raw, url.clone(), elapsed))
    }
}

/// Clamp `timeout` to the time left before `deadline`
fn bounded(timeout: Option<Duration>, deadline: Option<Instant>) -> Result<Option<Duration>> {
    let Some(deadline) = deadline else {
        return Ok(timeout);
    };
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::Timeout(TimeoutKind::Total));
    }
    Ok(Some(timeout.map_or(left, |t| t.min(left))))
}

/// Read the final response head, skipping interim 1xx responses
fn read_head(conn: &mut Connection, max_header_bytes: usize) -> Result<ResponseHead> {
    let mut parser = ResponseParser::with_limit(max_header_bytes);
    loop {
        if !conn.buffer_mut().is_empty() {
            let data = conn.buffer_mut().split();
            if let Some(head) = parser.parse(&data)? {
                let rest = parser.take_remaining();
                conn.buffer_mut().extend_from_slice(&rest);
                if head.status.is_informational() {
                    log::trace!("skipping interim {} response", head.status.code());
                    parser.reset();
                    continue;
                }
                return Ok(head);
            }
        }
        if conn.fill()? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn is_followed_redirect(response: &Response) -> bool {
    matches!(response.status_code(), 301 | 302 | 303 | 307 | 308) && response.header("Location").is_some()
}

/// The request to send for a redirect response
///
/// 303 turns into GET (HEAD stays HEAD) and so do POSTs answered with 301
/// or 302; 307 and 308 repeat method and body. Credentials are dropped when
/// the redirect leaves the original origin.
fn redirect_request(request: &Request, response: &Response) -> Result<Request> {
    let location = response
        .header("Location")
        .ok_or_else(|| Error::Protocol("redirect without Location".to_string()))?;
    let next_url = request
        .url()
        .join(location)
        .map_err(|e| Error::InvalidUrl(format!("redirect to {}: {}", location, e)))?;
    if !matches!(next_url.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!("redirect to unsupported scheme: {}", next_url)));
    }

    let method = request.method();
    let to_get = match response.status_code() {
        303 => method != Method::Head,
        301 | 302 => method == Method::Post,
        _ => false,
    };

    let mut next = request.clone().with_url(next_url.clone()).with_params(Vec::new());
    if to_get {
        next = next
            .with_method(Method::Get)
            .with_body(Body::Empty)
            .without_header("Content-Type");
    } else if !request.body().is_replayable() {
        return Err(Error::Encoding(format!(
            "cannot repeat a streamed body for a {} redirect",
            response.status_code()
        )));
    }

    let same_origin = request.url().scheme() == next_url.scheme()
        && request.url().host_str() == next_url.host_str()
        && request.url().port_or_known_default() == next_url.port_or_known_default();
    if !same_origin {
        next = next.without_header("Authorization").with_auth(None);
    }
    Ok(next)
}
