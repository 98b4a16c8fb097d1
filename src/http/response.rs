//! HTTP responses
//!
//! A [`Response`] carries the head of the final response and its body,
//! either fully buffered or still on the connection. Text, JSON and decoded
//! byte views are computed on demand from the raw body.

use super::body::{self, BodyStream, DEFAULT_CHUNK_SIZE};
use super::cookie;
use super::decode;
use super::{Error, Headers, Result, Status, Version};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

enum BodyState {
    /// Raw body in memory, still content-encoded
    Buffered(Bytes),
    /// Body not read yet
    Pending(BodyStream),
    /// Handed out as a stream
    Taken,
}

/// HTTP response
pub struct Response {
    status: Status,
    reason: String,
    version: Version,
    headers: Headers,
    url: Url,
    history: Vec<Url>,
    elapsed: Duration,
    streaming: bool,
    body: Mutex<BodyState>,
}

impl Response {
    /// A response whose body is fully in memory
    pub fn buffered(status: Status, headers: Headers, body: impl Into<Bytes>, url: Url) -> Self {
        Response {
            reason: status.reason_phrase().to_string(),
            status,
            version: Version::Http11,
            headers,
            url,
            history: Vec::new(),
            elapsed: Duration::ZERO,
            streaming: false,
            body: Mutex::new(BodyState::Buffered(body.into())),
        }
    }

    pub(crate) fn streaming(head: super::ResponseHead, stream: BodyStream, url: Url, elapsed: Duration) -> Self {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            elapsed,
            streaming: true,
            body: Mutex::new(BodyState::Pending(stream)),
        }
    }

    pub(crate) fn from_head(head: super::ResponseHead, body: Bytes, url: Url, elapsed: Duration) -> Self {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            history: Vec::new(),
            elapsed,
            streaming: false,
            body: Mutex::new(BodyState::Buffered(body)),
        }
    }

    pub(crate) fn with_history(mut self, history: Vec<Url>) -> Self {
        self.history = history;
        self
    }

    fn state(&self) -> MutexGuard<'_, BodyState> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.code()
    }

    /// Reason phrase as sent by the server
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Effective URL after redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URLs of the redirect responses that led here, oldest first
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    /// Time from sending the request until the response head arrived
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether the body was left on the connection
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the status is below 400
    pub fn ok(&self) -> bool {
        self.status.code() < 400
    }

    /// Fail with [`Error::Status`] on a 4xx or 5xx status
    pub fn raise_for_status(&self) -> Result<()> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(Error::Status {
                code: self.status.code(),
                reason: self.reason.clone(),
            });
        }
        Ok(())
    }

    /// Body bytes exactly as received, before content decoding
    ///
    /// Reading a streaming body buffers it; later views reuse the buffer.
    /// If that read fails, later views fail with [`Error::BodyConsumed`].
    pub fn raw_content(&self) -> Result<Bytes> {
        let mut state = self.state();
        match &mut *state {
            BodyState::Buffered(raw) => Ok(raw.clone()),
            BodyState::Taken => Err(Error::BodyConsumed),
            BodyState::Pending(stream) => match stream.read_all() {
                Ok(raw) => {
                    *state = BodyState::Buffered(raw.clone());
                    Ok(raw)
                }
                Err(e) => {
                    *state = BodyState::Taken;
                    Err(e)
                }
            },
        }
    }

    /// Body with gzip/deflate removed
    pub fn content(&self) -> Result<Bytes> {
        decode::decode_content(&self.raw_content()?, &self.headers)
    }

    /// Charset declared in `Content-Type`
    pub fn charset(&self) -> Option<String> {
        decode::charset(&self.headers)
    }

    /// Body decoded as text; invalid sequences are replaced
    pub fn text(&self) -> Result<String> {
        let content = self.content()?;
        Ok(decode::decode_text(&content, self.charset().as_deref()))
    }

    /// Body parsed as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        decode::parse_json(&self.content()?)
    }

    /// Body parsed as JSON, or `default` if it is not valid JSON
    pub fn json_or<T: DeserializeOwned>(&self, default: T) -> T {
        match self.json() {
            Ok(value) => value,
            Err(e) => {
                log::debug!("response from {} is not JSON: {}", self.url, e);
                default
            }
        }
    }

    /// Cookies set by this response, by name
    pub fn cookies(&self) -> BTreeMap<String, String> {
        cookie::set_cookie_pairs(&self.url, &self.headers)
    }

    /// Read a streaming body into memory
    ///
    /// Trailer fields of a chunked body are merged into the headers.
    pub fn buffer(mut self) -> Result<Self> {
        let state = std::mem::replace(self.body.get_mut().unwrap_or_else(PoisonError::into_inner), BodyState::Taken);
        let raw = match state {
            BodyState::Buffered(raw) => raw,
            BodyState::Taken => return Err(Error::BodyConsumed),
            BodyState::Pending(mut stream) => {
                let raw = stream.read_all()?;
                for (name, value) in stream.take_trailers().iter() {
                    self.headers.insert(name, value);
                }
                raw
            }
        };
        self.body = Mutex::new(BodyState::Buffered(raw));
        self.streaming = false;
        Ok(self)
    }

    /// Take the raw body stream, still content-encoded
    pub fn into_body_stream(self) -> Result<BodyStream> {
        match self.take_state() {
            BodyState::Pending(stream) => Ok(stream),
            BodyState::Buffered(_) => Err(Error::BodyConsumed),
            BodyState::Taken => Err(Error::BodyConsumed),
        }
    }

    /// Reader over the decoded body
    pub fn into_reader(self) -> Result<Box<dyn Read + Send>> {
        let headers = self.headers.clone();
        let raw: Box<dyn Read + Send> = match self.take_state() {
            BodyState::Buffered(raw) => Box::new(Cursor::new(raw)),
            BodyState::Pending(stream) => Box::new(stream),
            BodyState::Taken => return Err(Error::BodyConsumed),
        };
        Ok(decode::decoding_reader(raw, &headers))
    }

    /// Iterate over the decoded body in pieces of at most `chunk_size` bytes
    ///
    /// A streaming body can be iterated once; a buffered one any number of
    /// times.
    pub fn chunks(&self, chunk_size: usize) -> Result<Chunks> {
        let mut state = self.state();
        let raw: Box<dyn Read + Send> = match std::mem::replace(&mut *state, BodyState::Taken) {
            BodyState::Buffered(raw) => {
                *state = BodyState::Buffered(raw.clone());
                Box::new(Cursor::new(raw))
            }
            BodyState::Pending(stream) => Box::new(stream),
            BodyState::Taken => return Err(Error::BodyConsumed),
        };
        Ok(Chunks::new(decode::decoding_reader(raw, &self.headers), chunk_size))
    }

    fn take_state(self) -> BodyState {
        self.body.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status.code())
            .field("reason", &self.reason)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// Decoded body pieces
///
/// Ends after the last byte or the first error.
pub struct Chunks {
    reader: Box<dyn Read + Send>,
    chunk_size: usize,
    done: bool,
}

impl Chunks {
    pub(crate) fn new(reader: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Chunks {
            reader,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            done: false,
        }
    }
}

impl Iterator for Chunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        match self.reader.read(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => self.next(),
            Err(e) => {
                self.done = true;
                Some(Err(body::from_io(e)))
            }
        }
    }
}
