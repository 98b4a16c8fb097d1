//! Cookie storage
//!
//! The jar records cookies from `Set-Cookie` response headers and produces
//! the `Cookie` header for outgoing requests. Entries are unique per
//! (domain, path, name); a newer cookie for the same key replaces the old
//! one and keeps its creation order.
//!
//! Jars persist to the Netscape cookie file format used by curl and wget:
//! one cookie per line, seven tab-separated fields
//! `domain, include-subdomains, path, secure, expiry, name, value`. Lines
//! starting with `#` are comments except for curl's `#HttpOnly_` prefix,
//! which marks an http-only cookie.

use super::{Error, Headers, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use url::Url;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// A single cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
    host_only: bool,
    expires: Option<SystemTime>,
}

impl Cookie {
    /// Host-only session cookie for `domain` and `path`
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: domain.into().trim_start_matches('.').to_ascii_lowercase(),
            path: path.into(),
            secure: false,
            http_only: false,
            host_only: true,
            expires: None,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Also send the cookie to subdomains of its domain
    pub fn with_subdomains(mut self, include: bool) -> Self {
        self.host_only = !include;
        self
    }

    pub fn with_expires(mut self, expires: Option<SystemTime>) -> Self {
        self.expires = expires;
        self
    }

    /// Parse a `Set-Cookie` header value received from `url`
    ///
    /// Returns `None` for headers that must be ignored: no name, or a
    /// `Domain` attribute the request host does not belong to.
    pub fn parse(header: &str, url: &Url) -> Option<Cookie> {
        let host = url.host_str()?.trim_matches(['[', ']']).to_ascii_lowercase();
        let mut parts = header.split(';');

        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            path: default_path(url.path()),
            secure: false,
            http_only: false,
            host_only: true,
            expires: None,
        };

        let mut max_age: Option<i64> = None;
        let mut expires: Option<SystemTime> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain) {
                        log::debug!("ignoring cookie {} for foreign domain {}", name, domain);
                        return None;
                    }
                    cookie.host_only = domain == host && host.parse::<IpAddr>().is_ok();
                    cookie.domain = domain;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "max-age" => max_age = val.parse().ok(),
                "expires" => expires = parse_cookie_date(val),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires
        cookie.expires = match max_age {
            Some(secs) if secs <= 0 => Some(UNIX_EPOCH),
            Some(secs) => SystemTime::now().checked_add(Duration::from_secs(secs as u64)),
            None => expires,
        };
        Some(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Domain without a leading dot
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    /// Whether the cookie is sent to the exact host only
    pub fn host_only(&self) -> bool {
        self.host_only
    }

    /// Expiry; `None` for session cookies
    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|t| t <= now)
    }

    /// Whether the cookie is sent with a request to `url`
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok && path_matches(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }

    fn key(&self) -> CookieKey {
        (self.domain.clone(), self.path.clone(), self.name.clone())
    }

    fn to_netscape_line(&self) -> String {
        let expiry = self
            .expires
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let (prefix, domain) = match (self.http_only, self.host_only) {
            (true, true) => (HTTP_ONLY_PREFIX, self.domain.clone()),
            (true, false) => (HTTP_ONLY_PREFIX, format!(".{}", self.domain)),
            (false, true) => ("", self.domain.clone()),
            (false, false) => ("", format!(".{}", self.domain)),
        };
        format!(
            "{}{}\t{}\t{}\t{}\t{}\t{}\t{}",
            prefix,
            domain,
            bool_field(!self.host_only),
            self.path,
            bool_field(self.secure),
            expiry,
            self.name,
            self.value
        )
    }

    fn from_netscape_line(line: &str, line_no: usize) -> Result<Cookie> {
        let format_err = |message: String| Error::Format {
            line: line_no,
            message,
        };

        let (http_only, line) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, line),
        };

        let fields: Vec<&str> = line.split('\t').collect();
        let (domain, flag, path, secure, expiry, name, value) = match fields.as_slice() {
            [d, f, p, s, e, n, v] => (*d, *f, *p, *s, *e, *n, *v),
            [d, f, p, s, e, n] => (*d, *f, *p, *s, *e, *n, ""),
            _ => {
                return Err(format_err(format!(
                    "expected 7 tab-separated fields, found {}",
                    fields.len()
                )))
            }
        };

        if domain.is_empty() || name.is_empty() {
            return Err(format_err("empty domain or name".to_string()));
        }
        let include_subdomains = parse_bool_field(flag).ok_or_else(|| format_err(format!("invalid flag {:?}", flag)))?;
        let secure = parse_bool_field(secure).ok_or_else(|| format_err(format!("invalid secure field {:?}", secure)))?;
        let expiry: u64 = expiry
            .trim()
            .parse()
            .map_err(|_| format_err(format!("invalid expiry {:?}", expiry)))?;

        Ok(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            secure,
            http_only,
            host_only: !include_subdomains,
            expires: (expiry != 0).then(|| UNIX_EPOCH + Duration::from_secs(expiry)),
        })
    }
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

fn parse_bool_field(field: &str) -> Option<bool> {
    match field.trim() {
        f if f.eq_ignore_ascii_case("TRUE") => Some(true),
        f if f.eq_ignore_ascii_case("FALSE") => Some(false),
        _ => None,
    }
}

/// Directory of the request path, used when `Path` is absent
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => request_path[..i].to_string(),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Parse an `Expires` attribute
///
/// Accepts the IMF-fixdate, RFC 850 and asctime forms, plus the common
/// dash-separated `Wed, 21-Oct-2015 07:28:00 GMT`.
fn parse_cookie_date(value: &str) -> Option<SystemTime> {
    let value = value.trim().trim_matches('"');
    httpdate::parse_http_date(value)
        .ok()
        .or_else(|| httpdate::parse_http_date(&value.replace('-', " ")).ok())
}

type CookieKey = (String, String, String);

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    cookie: Cookie,
}

#[derive(Debug, Default)]
struct JarState {
    entries: HashMap<CookieKey, Entry>,
    next_seq: u64,
}

/// Thread-safe cookie store
///
/// Readers (`apply`) share the lock; `merge`, `insert` and `load_from`
/// take it exclusively so concurrent updates are never lost.
#[derive(Debug, Default)]
pub struct CookieJar {
    state: RwLock<JarState>,
}

impl CookieJar {
    /// Create an empty jar
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, JarState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, JarState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the cookies of a response
    pub fn merge(&self, response: &super::Response) {
        self.merge_headers(response.url(), response.headers());
    }

    /// Record every `Set-Cookie` header in `headers` received from `url`
    ///
    /// An expired cookie (past `Expires` or `Max-Age<=0`) deletes the entry
    /// with the same key.
    pub fn merge_headers(&self, url: &Url, headers: &Headers) {
        let set_cookies = headers.get_all("Set-Cookie");
        if set_cookies.is_empty() {
            return;
        }
        let now = SystemTime::now();
        let mut state = self.write();
        for header in set_cookies {
            let Some(cookie) = Cookie::parse(header, url) else {
                continue;
            };
            if cookie.is_expired(now) {
                if state.entries.remove(&cookie.key()).is_some() {
                    log::debug!("cookie {} for {} expired", cookie.name, cookie.domain);
                }
                continue;
            }
            log::trace!("storing cookie {} for {}{}", cookie.name, cookie.domain, cookie.path);
            upsert(&mut state, cookie);
        }
    }

    /// Add or replace a cookie
    pub fn insert(&self, cookie: Cookie) {
        upsert(&mut self.write(), cookie);
    }

    /// `Cookie` header value for a request
    pub fn apply(&self, request: &super::Request) -> Option<String> {
        self.cookie_header(request.url())
    }

    /// `Cookie` header value for `url`, or `None` if nothing matches
    ///
    /// Cookies with longer paths come first; ties keep creation order.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let now = SystemTime::now();
        let state = self.read();
        let mut matching: Vec<&Entry> = state
            .entries
            .values()
            .filter(|e| !e.cookie.is_expired(now) && e.cookie.matches(url))
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| {
            b.cookie
                .path
                .len()
                .cmp(&a.cookie.path.len())
                .then(a.seq.cmp(&b.seq))
        });
        Some(
            matching
                .iter()
                .map(|e| format!("{}={}", e.cookie.name, e.cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Snapshot of all live cookies in creation order
    pub fn cookies(&self) -> Vec<Cookie> {
        let now = SystemTime::now();
        let state = self.read();
        let mut entries: Vec<&Entry> = state
            .entries
            .values()
            .filter(|e| !e.cookie.is_expired(now))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.cookie.clone()).collect()
    }

    /// Look up a cookie by its full key
    pub fn get(&self, domain: &str, path: &str, name: &str) -> Option<Cookie> {
        let key = (domain.trim_start_matches('.').to_ascii_lowercase(), path.to_string(), name.to_string());
        self.read().entries.get(&key).map(|e| e.cookie.clone())
    }

    /// Remove a cookie by its full key
    pub fn remove(&self, domain: &str, path: &str, name: &str) -> Option<Cookie> {
        let key = (domain.trim_start_matches('.').to_ascii_lowercase(), path.to_string(), name.to_string());
        self.write().entries.remove(&key).map(|e| e.cookie)
    }

    /// Number of stored cookies, expired ones included until pruned
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().entries.clear();
    }

    /// Drop expired cookies
    pub fn clear_expired(&self) {
        let now = SystemTime::now();
        self.write().entries.retain(|_, e| !e.cookie.is_expired(now));
    }

    /// Write the jar to `path` in Netscape format
    ///
    /// The file is written to a uniquely named temporary file in the same
    /// directory and renamed into place, so concurrent saves never see a
    /// partial file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut out = NamedTempFile::new_in(dir)?;
        writeln!(out, "# Netscape HTTP Cookie File")?;
        writeln!(out, "# This file was generated by courier. Edit at your own risk.")?;
        writeln!(out)?;
        for cookie in self.cookies() {
            writeln!(out, "{}", cookie.to_netscape_line())?;
        }
        out.flush()?;
        out.persist(path).map_err(|e| Error::Io(e.error))?;
        log::debug!("saved cookies to {}", path.display());
        Ok(())
    }

    /// Read a jar from `path`
    ///
    /// A missing file yields an empty jar; a malformed line fails with
    /// [`Error::Format`]. Expired cookies are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<CookieJar> {
        let jar = CookieJar::new();
        jar.load_from(path)?;
        Ok(jar)
    }

    /// Merge the cookies stored at `path` into this jar
    pub fn load_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("cookie file {} not found, starting empty", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut cookies = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || (line.starts_with('#') && !line.starts_with(HTTP_ONLY_PREFIX)) {
                continue;
            }
            let cookie = Cookie::from_netscape_line(line, index + 1)?;
            if !cookie.is_expired(now) {
                cookies.push(cookie);
            }
        }

        let mut state = self.write();
        for cookie in cookies {
            upsert(&mut state, cookie);
        }
        Ok(())
    }
}

fn upsert(state: &mut JarState, cookie: Cookie) {
    let key = cookie.key();
    match state.entries.get_mut(&key) {
        Some(entry) => entry.cookie = cookie,
        None => {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(key, Entry { seq, cookie });
        }
    }
}

/// Name/value pairs of the `Set-Cookie` headers in `headers`
pub fn set_cookie_pairs(url: &Url, headers: &Headers) -> BTreeMap<String, String> {
    headers
        .get_all("Set-Cookie")
        .into_iter()
        .filter_map(|h| Cookie::parse(h, url))
        .map(|c| (c.name, c.value))
        .collect()
}
