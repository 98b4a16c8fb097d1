//! Caller-initiated cancellation
//!
//! A [`CancelHandle`] is shared between the caller and an in-flight call.
//! The call registers a clone of its socket; `cancel()` shuts that socket
//! down, which wakes any thread blocked in poll or read on it.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
}

/// Handle to abort an in-flight call
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the call; the current connection is shut down and discarded
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        let guard = self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = guard.as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Track the socket currently used by the call
    pub(crate) fn register(&self, socket: TcpStream) {
        let mut guard = self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_canceled() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        *guard = Some(socket);
    }

    /// Stop tracking the socket, e.g. once it went back to the pool
    pub(crate) fn clear(&self) {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
