use std::future::Future;

use futures::future::{self, Either};
use tokio_util::sync::CancellationToken;

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Disarms the guard, the callback will never run.
    pub fn cancel(mut self) {
        self.f = None;
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Drives `future` until it completes or `token` is cancelled.
///
/// Returns `None` on cancellation, dropping the future without polling it again.
pub async fn cancellable<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    if token.is_cancelled() {
        return None;
    }

    let cancelled = std::pin::pin!(token.cancelled());
    let future = std::pin::pin!(future);
    match future::select(future, cancelled).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(((), _)) => None,
    }
}
