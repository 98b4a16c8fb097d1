//! `multipart/form-data` bodies
//!
//! Parts are encoded lazily: file parts are opened when the request is
//! built and streamed while it is sent, never read into memory up front.

use super::message::StreamBody;
use super::{Error, Result, CRLF};
use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

/// Byte source of a multipart part
#[derive(Debug, Clone)]
pub enum PartSource {
    /// In-memory content
    Bytes(Bytes),
    /// File opened lazily at build time
    File(PathBuf),
    /// Single-pass reader
    Reader(StreamBody),
}

impl PartSource {
    /// Whether the source can be read again for a retry
    pub fn is_replayable(&self) -> bool {
        !matches!(self, PartSource::Reader(_))
    }
}

/// One field of a multipart form
#[derive(Debug, Clone)]
pub struct MultipartPart {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    source: PartSource,
}

impl MultipartPart {
    /// Plain text field
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        MultipartPart {
            name: name.into(),
            filename: None,
            content_type: None,
            source: PartSource::Bytes(Bytes::from(value.into())),
        }
    }

    /// In-memory binary field
    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        MultipartPart {
            name: name.into(),
            filename: None,
            content_type: Some("application/octet-stream".to_string()),
            source: PartSource::Bytes(data.into()),
        }
    }

    /// File field; filename and content type are derived from the path
    pub fn file(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned());
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        MultipartPart {
            name: name.into(),
            filename,
            content_type: Some(content_type),
            source: PartSource::File(path.to_path_buf()),
        }
    }

    /// Field fed from a reader
    pub fn reader(name: impl Into<String>, body: StreamBody) -> Self {
        MultipartPart {
            name: name.into(),
            filename: None,
            content_type: Some("application/octet-stream".to_string()),
            source: PartSource::Reader(body),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn source(&self) -> &PartSource {
        &self.source
    }

    fn write_head(&self, boundary: &str, buf: &mut BytesMut) {
        buf.extend_from_slice(format!("--{}{}", boundary, CRLF).as_bytes());
        buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quoted(&self.name)
            )
            .as_bytes(),
        );
        if let Some(filename) = &self.filename {
            buf.extend_from_slice(format!("; filename=\"{}\"", escape_quoted(filename)).as_bytes());
        }
        buf.extend_from_slice(CRLF.as_bytes());
        if let Some(ct) = &self.content_type {
            buf.extend_from_slice(format!("Content-Type: {}{}", ct, CRLF).as_bytes());
        }
        buf.extend_from_slice(CRLF.as_bytes());
    }
}

/// Percent-escape characters that would break a quoted header parameter
fn escape_quoted(s: &str) -> String {
    s.replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Random boundary token
pub fn generate_boundary() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Encoded multipart payload
pub enum EncodedMultipart {
    /// Every part was in memory
    Bytes(Bytes),
    /// At least one part is read while sending
    Reader {
        reader: Box<dyn Read + Send>,
        len: Option<u64>,
    },
}

/// Encode `parts` delimited by `boundary`
///
/// Files are opened here so an unreadable part fails before anything is sent.
/// The length is known only if every part is sized.
pub fn encode(parts: &[MultipartPart], boundary: &str) -> Result<EncodedMultipart> {
    let closing = Bytes::from(format!("--{}--{}", boundary, CRLF));

    if parts
        .iter()
        .all(|p| matches!(p.source, PartSource::Bytes(_)))
    {
        let mut buf = BytesMut::new();
        for part in parts {
            part.write_head(boundary, &mut buf);
            if let PartSource::Bytes(data) = &part.source {
                buf.extend_from_slice(data);
            }
            buf.extend_from_slice(CRLF.as_bytes());
        }
        buf.extend_from_slice(&closing);
        return Ok(EncodedMultipart::Bytes(buf.freeze()));
    }

    let mut segments: Vec<Box<dyn Read + Send>> = Vec::with_capacity(parts.len() * 3 + 1);
    let mut len: Option<u64> = Some(0);

    for part in parts {
        let mut head = BytesMut::new();
        part.write_head(boundary, &mut head);
        len = len.map(|l| l + head.len() as u64 + CRLF.len() as u64);
        segments.push(Box::new(Cursor::new(head.freeze())));

        match &part.source {
            PartSource::Bytes(data) => {
                len = len.map(|l| l + data.len() as u64);
                segments.push(Box::new(Cursor::new(data.clone())));
            }
            PartSource::File(path) => {
                let file = File::open(path).map_err(|e| {
                    Error::Encoding(format!("multipart part {:?}: {}: {}", part.name, path.display(), e))
                })?;
                let size = file
                    .metadata()
                    .map_err(|e| Error::Encoding(format!("multipart part {:?}: {}", part.name, e)))?
                    .len();
                len = len.map(|l| l + size);
                segments.push(Box::new(file.take(size)));
            }
            PartSource::Reader(stream) => {
                let reader = stream.take()?;
                match stream.len() {
                    Some(size) => {
                        len = len.map(|l| l + size);
                        segments.push(Box::new(reader.take(size)));
                    }
                    None => {
                        len = None;
                        segments.push(reader);
                    }
                }
            }
        }
        segments.push(Box::new(Cursor::new(Bytes::from_static(CRLF.as_bytes()))));
    }
    len = len.map(|l| l + closing.len() as u64);
    segments.push(Box::new(Cursor::new(closing)));

    Ok(EncodedMultipart::Reader {
        reader: Box::new(SequenceReader::new(segments)),
        len,
    })
}

/// Reads each segment to exhaustion before moving on to the next
struct SequenceReader {
    segments: std::collections::VecDeque<Box<dyn Read + Send>>,
}

impl SequenceReader {
    fn new(segments: Vec<Box<dyn Read + Send>>) -> Self {
        SequenceReader {
            segments: segments.into(),
        }
    }
}

impl Read for SequenceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some(current) = self.segments.front_mut() {
            let n = current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.segments.pop_front();
        }
        Ok(0)
    }
}
