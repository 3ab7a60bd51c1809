//! Per-request cancellation signal.
//!
//! Every [`Request`](crate::Request) carries a [`Cancellation`]. It fires at
//! most once and remembers why: the client went away
//! ([`CancelError::Canceled`]) or the server-side deadline elapsed
//! ([`CancelError::DeadlineExceeded`]).
//!
//! The handle is passed explicitly alongside the request. Nothing here is
//! global: a handler that wants to observe cancellation clones the handle
//! out of the request and awaits [`Cancellation::cancelled`].

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a request was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CancelError {
    /// The client closed the connection before the response was ready.
    #[error("context canceled")]
    Canceled,
    /// The server-side request deadline elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A one-shot, broadcast "done" notification with a terminal cause.
///
/// Cloning is cheap and every clone observes the same signal.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelError>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal with [`CancelError::Canceled`].
    pub fn cancel(&self) {
        self.cancel_with(CancelError::Canceled);
    }

    /// Fires the signal with `cause`. Only the first cause is kept; later
    /// calls are no-ops.
    pub fn cancel_with(&self, cause: CancelError) {
        // The cause is stored before the token fires so that anyone woken by
        // `cancelled()` reads it.
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired. Resolves immediately if it
    /// already has.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The terminal cause, or `None` while the request is still live.
    pub fn cause(&self) -> Option<CancelError> {
        if self.is_cancelled() {
            self.cause.get().copied()
        } else {
            None
        }
    }

    /// Returns a guard that fires the signal with [`CancelError::Canceled`]
    /// when dropped, unless [`CancelOnDrop::disarm`] is called first.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop { signal: Some(self.clone()) }
    }
}

/// Fires a [`Cancellation`] when dropped.
///
/// hyper drops the service future when the client connection closes; the
/// server keeps one of these inside that future to turn the drop into a
/// cancellation the handler side can observe.
#[must_use = "dropping the guard cancels immediately"]
#[derive(Debug)]
pub struct CancelOnDrop {
    signal: Option<Cancellation>,
}

impl CancelOnDrop {
    /// Consumes the guard without firing the signal.
    pub fn disarm(mut self) {
        self.signal = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.cancel();
        }
    }
}
