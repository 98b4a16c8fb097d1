//! Request and response hooks
//!
//! Middleware runs at two points of a call: before the request is encoded
//! (it may replace the request) and once the final response is available
//! (inspection only). It also sees every encoded request just before it is
//! written. A hook that fails aborts the call with [`Error::Middleware`]
//! and is never retried.
//!
//! [`Error::Middleware`]: super::Error::Middleware

use super::wire::{WireBody, WireRequest};
use super::{Request, Response};

/// Error type returned by hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body bytes shown by [`DebugLog`]
const PREVIEW_BYTES: usize = 1024;

/// Hooks around a call
pub trait Middleware: Send + Sync {
    /// Inspect or replace the request before it is encoded
    fn on_request(&self, request: Request) -> Result<Request, BoxError> {
        Ok(request)
    }

    /// Observe an encoded request right before it goes on the wire
    fn on_send(&self, _request: &WireRequest) {}

    /// Inspect the final response
    fn on_response(&self, _response: &Response) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<F> Middleware for F
where
    F: Fn(Request) -> Result<Request, BoxError> + Send + Sync,
{
    fn on_request(&self, request: Request) -> Result<Request, BoxError> {
        self(request)
    }
}

/// Logs every request and response at debug level
///
/// Request lines are prefixed `=>`, response lines `<=`. In-memory bodies
/// are shown up to 1 KiB; streaming bodies are not touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLog;

impl Middleware for DebugLog {
    fn on_send(&self, request: &WireRequest) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!("=> {} {} HTTP/1.1", request.method(), request.target());
        for (name, value) in request.headers().iter() {
            log::debug!("=> {}: {}", name, value);
        }
        match request.body() {
            WireBody::Bytes(data) => log::debug!("=> {}", preview(data)),
            WireBody::Reader { len, .. } => log::debug!("=> <streamed body, length {:?}>", len),
            WireBody::Empty => {}
        }
    }

    fn on_response(&self, response: &Response) -> Result<(), BoxError> {
        if !log::log_enabled!(log::Level::Debug) {
            return Ok(());
        }
        log::debug!(
            "<= {} {} {} ({:?})",
            response.version(),
            response.status_code(),
            response.reason(),
            response.elapsed()
        );
        for (name, value) in response.headers().iter() {
            log::debug!("<= {}: {}", name, value);
        }
        if !response.is_streaming() {
            if let Ok(content) = response.content() {
                log::debug!("<= {}", preview(&content));
            }
        }
        Ok(())
    }
}

fn preview(data: &[u8]) -> String {
    let shown = &data[..data.len().min(PREVIEW_BYTES)];
    let text = String::from_utf8_lossy(shown);
    if data.len() > PREVIEW_BYTES {
        format!("{}... ({} bytes total)", text, data.len())
    } else {
        text.into_owned()
    }
}
