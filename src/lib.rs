//! courier - blocking HTTP/1.1 client engine
//!
//! This crate composes and dispatches HTTP requests over plain TCP or TLS,
//! pools persistent connections, retries transient failures, persists
//! cookies and exposes both buffered and streaming responses.

pub mod http;
pub mod net;
