//! `Transfer-Encoding: chunked` framing
//!
//! The decoder is incremental: it is fed whatever bytes have arrived and
//! reports how many it used, so a caller can keep unread input in its own
//! buffer between reads. Trailer fields after the last chunk are collected.

use super::{Error, Headers, Result, CRLF};
use std::io::Write;

/// Longest chunk-size line (size plus extensions) accepted
const MAX_CHUNK_LINE: usize = 4096;

/// Largest trailer section accepted
const MAX_TRAILER_BYTES: usize = 16 * 1024;

/// Writes chunks of unknown total length
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Frame `data` as one chunk; empty input writes nothing
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if !data.is_empty() {
            let size_line = format!("{:x}{}", data.len(), CRLF);
            self.writer.write_all(size_line.as_bytes())?;
            self.writer.write_all(data)?;
            self.writer.write_all(CRLF.as_bytes())?;
        }
        Ok(())
    }

    /// Write the terminal zero-size chunk with an empty trailer section
    pub fn finish(&mut self) -> Result<()> {
        self.writer.write_all(b"0\r\n\r\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    SizeLine,
    Data { left: usize },
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for a chunked body
pub struct ChunkedDecoder {
    stage: Stage,
    trailers: Headers,
    trailer_bytes: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            stage: Stage::SizeLine,
            trailers: Headers::new(),
            trailer_bytes: 0,
        }
    }

    /// Decode from `input` into `output`
    ///
    /// Returns `(consumed, produced, done)`. Stops early when `output` is
    /// full or `input` ends inside a size line, a chunk delimiter or a
    /// trailer line; those bytes are left unconsumed.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let mut used = 0;
        let mut produced = 0;

        loop {
            let rest = &input[used..];
            match self.stage {
                Stage::Done => break,
                Stage::SizeLine => {
                    let Some(end) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_LINE {
                            return Err(Error::Protocol("chunk size line too long".to_string()));
                        }
                        break;
                    };
                    let size = parse_chunk_size(&rest[..end])?;
                    used += end + 2;
                    self.stage = match size {
                        0 => Stage::Trailers,
                        n => Stage::Data { left: n },
                    };
                }
                Stage::Data { left } => {
                    let n = left.min(rest.len()).min(output.len() - produced);
                    if n == 0 {
                        break;
                    }
                    output[produced..produced + n].copy_from_slice(&rest[..n]);
                    used += n;
                    produced += n;
                    self.stage = match left - n {
                        0 => Stage::DataEnd,
                        left => Stage::Data { left },
                    };
                }
                Stage::DataEnd => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(Error::Protocol("expected CRLF after chunk data".to_string()));
                    }
                    used += 2;
                    self.stage = Stage::SizeLine;
                }
                Stage::Trailers => {
                    let Some(end) = find_crlf(rest) else {
                        if self.trailer_bytes + rest.len() > MAX_TRAILER_BYTES {
                            return Err(Error::Protocol("trailer section too large".to_string()));
                        }
                        break;
                    };
                    used += end + 2;
                    if end == 0 {
                        self.stage = Stage::Done;
                        continue;
                    }
                    self.trailer_bytes += end + 2;
                    if self.trailer_bytes > MAX_TRAILER_BYTES {
                        return Err(Error::Protocol("trailer section too large".to_string()));
                    }
                    let line = String::from_utf8_lossy(&rest[..end]);
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.trailers.insert(name, value);
                }
            }
        }

        Ok((used, produced, self.is_complete()))
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Trailer fields received after the last chunk
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    pub fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Size of a chunk-size line; extensions after `;` are ignored
fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let mut digits = line.split(|&b| b == b';').next().unwrap_or_default();
    while let [rest @ .., b' ' | b'\t'] = digits {
        digits = rest;
    }
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::Protocol(format!(
            "invalid chunk size: {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    // checked: every byte is an ASCII hex digit
    let digits = std::str::from_utf8(digits).unwrap_or_default();
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::Protocol(format!("chunk size overflow: {}", digits)))
}

pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode a complete chunked body held in memory
pub fn decode_chunked_body(input: &[u8]) -> Result<(Vec<u8>, Headers)> {
    let mut decoder = ChunkedDecoder::new();
    let mut body = Vec::with_capacity(input.len());
    let mut scratch = [0u8; 8192];
    let mut rest = input;

    while !decoder.is_complete() {
        let (used, produced, _) = decoder.decode(rest, &mut scratch)?;
        if used == 0 && produced == 0 {
            return Err(Error::Protocol("truncated chunked body".to_string()));
        }
        body.extend_from_slice(&scratch[..produced]);
        rest = &rest[used..];
    }
    Ok((body, decoder.take_trailers()))
}
