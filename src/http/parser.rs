//! HTTP message parsing
//!
//! [`ResponseParser`] reads a response head (status line and headers) and
//! leaves the body on the wire; [`ResponseHead::framing`] says how to read it.
//! [`RequestParser`] reads complete requests and is what the request
//! encoder's output is checked against.

use super::chunked::{find_crlf, ChunkedDecoder};
use super::{
    Error, Headers, Method, Result, Status, Version, DEFAULT_MAX_HEADER_BYTES, MAX_HEADERS,
};

/// Parse HTTP request line
///
/// Format: METHOD TARGET VERSION
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();

    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Protocol(format!("invalid request line: {:?}", line)));
    }

    let method = parts[0].parse()?;
    let version = parts[2].parse()?;

    Ok((method, parts[1].to_string(), version))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS [REASON]
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Protocol(format!("invalid status line: {:?}", line)));
    }

    let version = parts[0].parse()?;
    if parts[1].len() != 3 || !parts[1].bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!("invalid status code: {:?}", parts[1])));
    }
    let status = Status::new(
        parts[1]
            .parse::<u16>()
            .map_err(|_| Error::Protocol(format!("invalid status code: {:?}", parts[1])))?,
    )?;
    let reason = match parts.get(2) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    Empty,
    /// Exactly this many bytes follow
    Length(u64),
    /// Chunked transfer encoding
    Chunked,
    /// Body runs until the peer closes the connection
    UntilClose,
}

/// Determine framing from message headers (request or response)
fn framing_from_headers(headers: &Headers) -> Result<Option<BodyFraming>> {
    let encodings = headers.get_all("Transfer-Encoding");
    if !encodings.is_empty() {
        let last = encodings
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last();
        return Ok(Some(match last {
            Some(t) if t.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
            _ => BodyFraming::UntilClose,
        }));
    }

    let lengths = headers.get_all("Content-Length");
    if lengths.is_empty() {
        return Ok(None);
    }

    let mut length: Option<u64> = None;
    for value in lengths.iter().flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol(format!("invalid Content-Length: {:?}", value)));
        }
        let n = value
            .parse::<u64>()
            .map_err(|_| Error::Protocol(format!("invalid Content-Length: {:?}", value)))?;
        match length {
            Some(prev) if prev != n => {
                return Err(Error::Protocol("conflicting Content-Length values".to_string()))
            }
            _ => length = Some(n),
        }
    }

    Ok(length.map(BodyFraming::Length))
}

/// Read the next CRLF-terminated line of a message head
///
/// Counts consumed bytes against `limit` so an endless header block fails
/// instead of growing memory.
fn next_head_line(buffer: &mut Vec<u8>, head_bytes: &mut usize, limit: usize) -> Result<Option<String>> {
    match find_crlf(buffer) {
        Some(crlf_pos) => {
            *head_bytes += crlf_pos + 2;
            if *head_bytes > limit {
                return Err(Error::Protocol(format!(
                    "header block exceeds {} bytes",
                    limit
                )));
            }
            let line = String::from_utf8_lossy(&buffer[..crlf_pos]).into_owned();
            buffer.drain(..crlf_pos + 2);
            Ok(Some(line))
        }
        None => {
            if *head_bytes + buffer.len() > limit {
                return Err(Error::Protocol(format!(
                    "header block exceeds {} bytes",
                    limit
                )));
            }
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StartLine,
    Headers,
    Body,
    Complete,
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// How the body following this head is delimited
    pub fn framing(&self, request_method: Method) -> Result<BodyFraming> {
        let code = self.status.code();
        if request_method == Method::Head || self.status.is_informational() || code == 204 || code == 304 {
            return Ok(BodyFraming::Empty);
        }
        Ok(framing_from_headers(&self.headers)?.unwrap_or(BodyFraming::UntilClose))
    }

    /// Whether the server allows the connection to be reused
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("Connection", "close"),
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }
}

/// HTTP response head parser
pub struct ResponseParser {
    state: ParserState,
    buffer: Vec<u8>,
    max_header_bytes: usize,
    head_bytes: usize,
    status_line: Option<(Version, Status, String)>,
    headers: Headers,
}

impl ResponseParser {
    /// Create a new response parser with the default header size limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HEADER_BYTES)
    }

    /// Create a parser rejecting header blocks larger than `max_header_bytes`
    pub fn with_limit(max_header_bytes: usize) -> Self {
        ResponseParser {
            state: ParserState::StartLine,
            buffer: Vec::new(),
            max_header_bytes,
            head_bytes: 0,
            status_line: None,
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(head)) once the blank line ending the head is seen,
    /// Ok(None) if more data is needed, or Err on malformed input. Bytes past
    /// the head stay buffered; see [`ResponseParser::take_remaining`].
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<ResponseHead>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::StartLine => {
                    let Some(line) = next_head_line(&mut self.buffer, &mut self.head_bytes, self.max_header_bytes)? else {
                        return Ok(None);
                    };
                    self.status_line = Some(parse_status_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = next_head_line(&mut self.buffer, &mut self.head_bytes, self.max_header_bytes)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = ParserState::Complete;
                        let (version, status, reason) = self
                            .status_line
                            .take()
                            .ok_or_else(|| Error::Protocol("missing status line".to_string()))?;
                        return Ok(Some(ResponseHead {
                            version,
                            status,
                            reason,
                            headers: std::mem::take(&mut self.headers),
                        }));
                    }
                    if self.headers.len() >= MAX_HEADERS {
                        return Err(Error::Protocol(format!("more than {} headers", MAX_HEADERS)));
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParserState::Body | ParserState::Complete => return Ok(None),
            }
        }
    }

    /// Bytes received after the head
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Reset the parser for reuse, keeping any unconsumed bytes
    pub fn reset(&mut self) {
        self.state = ParserState::StartLine;
        self.head_bytes = 0;
        self.status_line = None;
        self.headers.clear();
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// A request as read off the wire
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// HTTP request parser
pub struct RequestParser {
    state: ParserState,
    buffer: Vec<u8>,
    head_bytes: usize,
    request_line: Option<(Method, String, Version)>,
    headers: Headers,
    framing: BodyFraming,
    chunked: ChunkedDecoder,
    body: Vec<u8>,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        RequestParser {
            state: ParserState::StartLine,
            buffer: Vec::new(),
            head_bytes: 0,
            request_line: None,
            headers: Headers::new(),
            framing: BodyFraming::Empty,
            chunked: ChunkedDecoder::new(),
            body: Vec::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<ParsedRequest>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::StartLine => {
                    let Some(line) = next_head_line(&mut self.buffer, &mut self.head_bytes, DEFAULT_MAX_HEADER_BYTES)? else {
                        return Ok(None);
                    };
                    self.request_line = Some(parse_request_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = next_head_line(&mut self.buffer, &mut self.head_bytes, DEFAULT_MAX_HEADER_BYTES)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.framing = framing_from_headers(&self.headers)?.unwrap_or(BodyFraming::Empty);
                        if self.framing == BodyFraming::UntilClose {
                            return Err(Error::Protocol(
                                "request body without length or chunked framing".to_string(),
                            ));
                        }
                        self.state = ParserState::Body;
                        continue;
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParserState::Body => return self.parse_body(),
                ParserState::Complete => return Ok(None),
            }
        }
    }

    fn parse_body(&mut self) -> Result<Option<ParsedRequest>> {
        match self.framing {
            BodyFraming::Length(len) => {
                let len = len as usize;
                if self.buffer.len() < len {
                    return Ok(None);
                }
                self.body = self.buffer.drain(..len).collect();
            }
            BodyFraming::Chunked => {
                let mut out = vec![0u8; 8192];
                loop {
                    let (consumed, decoded, complete) = self.chunked.decode(&self.buffer, &mut out)?;
                    self.buffer.drain(..consumed);
                    self.body.extend_from_slice(&out[..decoded]);
                    if complete {
                        break;
                    }
                    if consumed == 0 && decoded == 0 {
                        return Ok(None);
                    }
                }
                let trailers = self.chunked.take_trailers();
                self.headers.merge(&trailers);
            }
            BodyFraming::Empty | BodyFraming::UntilClose => {}
        }

        self.state = ParserState::Complete;
        let (method, target, version) = self
            .request_line
            .take()
            .ok_or_else(|| Error::Protocol("missing request line".to_string()))?;
        Ok(Some(ParsedRequest {
            method,
            target,
            version,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        }))
    }

    /// Bytes received after the parsed request (pipelined data)
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, uri, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/index.html");
        assert_eq!(version, Version::Http11);
        assert!(parse_request_line("GET  /index.html HTTP/1.1").is_err());
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "OK");

        let (version, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");

        assert!(matches!(parse_status_line("garbage"), Err(Error::Protocol(_))));
        assert!(matches!(parse_status_line("HTTP/1.1 2000 OK"), Err(Error::Protocol(_))));
        assert!(matches!(parse_status_line("SPDY/3 200 OK"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_response_parser_incremental() {
        let mut parser = ResponseParser::new();

        assert!(parser.parse(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.parse(b"200 OK\r\n").unwrap().is_none());
        assert!(parser.parse(b"Content-Type: text/plain\r\n").unwrap().is_none());
        let head = parser
            .parse(b"Content-Length: 4\r\n\r\nTest")
            .unwrap()
            .unwrap();

        assert_eq!(head.status.code(), 200);
        assert_eq!(head.headers.get("content-type"), Some("text/plain"));
        assert_eq!(head.framing(Method::Get).unwrap(), BodyFraming::Length(4));
        assert_eq!(parser.take_remaining(), b"Test");
    }

    #[test]
    fn test_reset_after_interim_head() {
        let mut parser = ResponseParser::with_limit(64);
        let interim = parser
            .parse(b"HTTP/1.1 100 Continue\r\nX-Interim: 1\r\n\r\nHTTP/1.1 200 OK\r\n")
            .unwrap()
            .unwrap();
        assert!(interim.status.is_informational());

        // buffered bytes survive and the header budget starts over
        parser.reset();
        let head = parser
            .parse(format!("X-Pad: {}\r\n\r\n", "p".repeat(30)).as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(head.status.code(), 200);
        assert_eq!(head.headers.get("X-Interim"), None);
        assert!(head.headers.get("X-Pad").is_some());
    }

    #[test]
    fn test_header_block_limit() {
        let mut parser = ResponseParser::with_limit(64);
        let mut data = b"HTTP/1.1 200 OK\r\n".to_vec();
        data.extend_from_slice(format!("X-Big: {}\r\n\r\n", "a".repeat(100)).as_bytes());
        assert!(matches!(parser.parse(&data), Err(Error::Protocol(_))));

        // Unterminated line also counts against the limit
        let mut parser = ResponseParser::with_limit(64);
        assert!(matches!(parser.parse(&[b'a'; 100]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_framing_rules() {
        let head = |headers: &[(&str, &str)], code: u16| ResponseHead {
            version: Version::Http11,
            status: Status::new(code).unwrap(),
            reason: String::new(),
            headers: headers.iter().copied().collect(),
        };

        assert_eq!(
            head(&[("Transfer-Encoding", "chunked"), ("Content-Length", "5")], 200)
                .framing(Method::Get)
                .unwrap(),
            BodyFraming::Chunked
        );
        assert_eq!(
            head(&[("Transfer-Encoding", "gzip")], 200).framing(Method::Get).unwrap(),
            BodyFraming::UntilClose
        );
        assert_eq!(head(&[], 200).framing(Method::Get).unwrap(), BodyFraming::UntilClose);
        assert_eq!(
            head(&[("Content-Length", "10")], 200).framing(Method::Head).unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(head(&[], 204).framing(Method::Get).unwrap(), BodyFraming::Empty);
        assert_eq!(
            head(&[("Content-Length", "7, 7")], 200).framing(Method::Get).unwrap(),
            BodyFraming::Length(7)
        );
        assert!(head(&[("Content-Length", "7"), ("Content-Length", "8")], 200)
            .framing(Method::Get)
            .is_err());
        assert!(head(&[("Content-Length", "-1")], 200).framing(Method::Get).is_err());
    }

    #[test]
    fn test_keep_alive() {
        let mut head = ResponseHead {
            version: Version::Http11,
            status: Status::OK,
            reason: "OK".into(),
            headers: Headers::new(),
        };
        assert!(head.keep_alive());
        head.headers.insert("Connection", "close");
        assert!(!head.keep_alive());

        head.version = Version::Http10;
        head.headers.clear();
        assert!(!head.keep_alive());
        head.headers.insert("Connection", "Keep-Alive");
        assert!(head.keep_alive());
    }

    #[test]
    fn test_request_parser_content_length() {
        let mut parser = RequestParser::new();
        assert!(parser.parse(b"POST /data HTTP/1.1\r\nContent-Length: 9\r\n\r\ntest").unwrap().is_none());
        let req = parser.parse(b" data").unwrap().unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.target, "/data");
        assert_eq!(req.body, b"test data");
    }

    #[test]
    fn test_request_parser_chunked_with_trailer() {
        let mut parser = RequestParser::new();
        let req = parser
            .parse(b"PUT /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n0\r\nX-Sum: 1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.body, b"abcd");
        assert_eq!(req.headers.get("X-Sum"), Some("1"));
    }
}
