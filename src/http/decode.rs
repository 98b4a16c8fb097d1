//! Content decoding
//!
//! Undoes `Content-Encoding` (gzip, deflate) and turns the resulting bytes
//! into text or JSON. Compression is removed first; charset decoding only
//! ever sees the inflated bytes.

use super::body::from_io;
use super::{Error, Headers, Result};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use serde::de::DeserializeOwned;
use std::io::{self, Cursor, Read};

/// A single content coding from `Content-Encoding`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Identity,
    Other(String),
}

impl ContentCoding {
    fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => ContentCoding::Gzip,
            "deflate" => ContentCoding::Deflate,
            "identity" | "" => ContentCoding::Identity,
            other => ContentCoding::Other(other.to_string()),
        }
    }
}

/// Codings in the order they were applied by the sender
pub fn content_codings(headers: &Headers) -> Vec<ContentCoding> {
    headers
        .get_all("Content-Encoding")
        .iter()
        .flat_map(|v| v.split(','))
        .map(ContentCoding::parse)
        .filter(|c| *c != ContentCoding::Identity)
        .collect()
}

/// Wrap `reader` so it yields the body with its content codings undone
///
/// Codings are removed in reverse order of application. If any coding is
/// unknown the body is passed through untouched, since none of the layers
/// below it could be reached.
pub fn decoding_reader(reader: Box<dyn Read + Send>, headers: &Headers) -> Box<dyn Read + Send> {
    let codings = content_codings(headers);
    if codings.iter().any(|c| matches!(c, ContentCoding::Other(_))) {
        log::debug!("unknown content coding {:?}, passing body through", codings);
        return reader;
    }

    codings.iter().rev().fold(reader, |inner, coding| match coding {
        ContentCoding::Gzip => Box::new(MultiGzDecoder::new(inner)),
        ContentCoding::Deflate => Box::new(DeflateReader::new(inner)),
        ContentCoding::Identity | ContentCoding::Other(_) => inner,
    })
}

/// Inflate a complete body according to `headers`
pub fn decode_content(raw: &Bytes, headers: &Headers) -> Result<Bytes> {
    if content_codings(headers).is_empty() {
        return Ok(raw.clone());
    }
    let mut reader = decoding_reader(Box::new(Cursor::new(raw.clone())), headers);
    let mut out = Vec::with_capacity(raw.len() * 2);
    reader.read_to_end(&mut out).map_err(|e| match from_io(e) {
        Error::Io(e) => Error::Decode(e.to_string()),
        other => other,
    })?;
    Ok(Bytes::from(out))
}

/// Deflate body that may or may not carry a zlib header
///
/// `Content-Encoding: deflate` means zlib, but servers commonly send raw
/// deflate streams. The first two bytes decide which decoder is used.
struct DeflateReader {
    state: DeflateState,
}

enum DeflateState {
    Pending(Box<dyn Read + Send>),
    Active(Box<dyn Read + Send>),
    Empty,
}

impl DeflateReader {
    fn new(inner: Box<dyn Read + Send>) -> Self {
        DeflateReader {
            state: DeflateState::Pending(inner),
        }
    }
}

fn is_zlib_header(head: &[u8]) -> bool {
    head.len() == 2 && head[0] & 0x0f == 8 && (u16::from(head[0]) << 8 | u16::from(head[1])) % 31 == 0
}

impl Read for DeflateReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let DeflateState::Pending(_) = self.state {
            let DeflateState::Pending(mut inner) = std::mem::replace(&mut self.state, DeflateState::Empty) else {
                return Ok(0);
            };
            let mut head = [0u8; 2];
            let mut got = 0;
            while got < 2 {
                match inner.read(&mut head[got..])? {
                    0 => break,
                    n => got += n,
                }
            }
            let prefixed: Box<dyn Read + Send> = Box::new(Cursor::new(head[..got].to_vec()).chain(inner));
            self.state = if is_zlib_header(&head[..got]) {
                DeflateState::Active(Box::new(ZlibDecoder::new(prefixed)))
            } else {
                DeflateState::Active(Box::new(DeflateDecoder::new(prefixed)))
            };
        }

        match &mut self.state {
            DeflateState::Active(reader) => reader.read(buf),
            _ => Ok(0),
        }
    }
}

/// Charset parameter of the `Content-Type` header, lowercased
pub fn charset(headers: &Headers) -> Option<String> {
    let content_type = headers.get("Content-Type")?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').to_ascii_lowercase();
        (!value.is_empty()).then_some(value)
    })
}

/// Decode `bytes` as text in `charset`, replacing invalid sequences
///
/// Unknown or missing charsets fall back to UTF-8. A leading byte-order
/// mark is stripped.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    match charset.unwrap_or("utf-8") {
        "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1" | "l1" => {
            bytes.iter().map(|&b| char::from(b)).collect()
        }
        "windows-1252" | "cp1252" => bytes.iter().map(|&b| cp1252_char(b)).collect(),
        "us-ascii" | "ascii" => bytes
            .iter()
            .map(|&b| if b.is_ascii() { char::from(b) } else { char::REPLACEMENT_CHARACTER })
            .collect(),
        "utf-16le" => decode_utf16(bytes, u16::from_le_bytes),
        "utf-16be" => decode_utf16(bytes, u16::from_be_bytes),
        "utf-16" => match bytes {
            [0xfe, 0xff, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
            [0xff, 0xfe, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
            _ => decode_utf16(bytes, u16::from_be_bytes),
        },
        other => {
            if !matches!(other, "utf-8" | "utf8") {
                log::trace!("unsupported charset {:?}, decoding as UTF-8", other);
            }
            let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks(2).map(|pair| match pair {
        [a, b] => to_unit([*a, *b]),
        _ => 0xfffd,
    });
    let text: String = char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text)
}

/// windows-1252 differs from latin-1 only in 0x80..=0x9f
fn cp1252_char(b: u8) -> char {
    const HIGH: [char; 32] = [
        '\u{20ac}', '\u{fffd}', '\u{201a}', '\u{0192}', '\u{201e}', '\u{2026}', '\u{2020}', '\u{2021}',
        '\u{02c6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{fffd}', '\u{017d}', '\u{fffd}',
        '\u{fffd}', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}', '\u{2022}', '\u{2013}', '\u{2014}',
        '\u{02dc}', '\u{2122}', '\u{0161}', '\u{203a}', '\u{0153}', '\u{fffd}', '\u{017e}', '\u{0178}',
    ];
    match b {
        0x80..=0x9f => HIGH[usize::from(b - 0x80)],
        _ => char::from(b),
    }
}

/// Parse decoded body bytes as JSON
pub fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(format!("invalid JSON: {}", e)))
}
