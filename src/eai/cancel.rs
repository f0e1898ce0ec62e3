//! Cooperative cancellation primitives.
//!
//! Every suspending operation in the engine (LLM calls, shell executions,
//! pane polling, file waits) accepts a [`CancelToken`]. Cancelling the
//! owning [`CancelSource`] is observed by every derived token: in-flight
//! shell commands are killed, file waits return promptly, and the agent
//! loop stops at its next iteration boundary.
//!
//! # Example
//!
//! ```rust
//! use eai::CancelSource;
//!
//! let source = CancelSource::new();
//! let token = source.token();
//! assert!(!token.is_cancelled());
//!
//! source.cancel();
//! assert!(token.is_cancelled());
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of a cancellation signal.
///
/// Clone-able; the first call to [`cancel`](CancelSource::cancel) wins and
/// subsequent calls are no-ops.
#[derive(Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSource {
    /// Create a new, not-yet-cancelled source.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the cancellation signal.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Derive a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal.
///
/// Tokens are cheap to clone and safe to hold across `.await` points.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for tokens created via `never()`, so that
    // `cancelled()` stays pending instead of resolving on sender drop.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// A token that will never fire. Useful for tests and for call sites
    /// that have no cancellation scope.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Whether the source has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the source is cancelled. Never resolves for tokens
    /// whose source is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without ever cancelling.
        std::future::pending::<()>().await;
    }
}
