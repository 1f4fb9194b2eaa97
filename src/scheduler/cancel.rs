//! Cooperative cancellation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Cancellation flag threaded into every task body.
///
/// Setting the flag never interrupts a body; the body is expected to poll
/// [`CancelToken::is_cancelled`] and return early. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, waking early if cancelled.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn sleep(
        &self,
        duration: Duration,
    ) -> bool {
        const SLICE: Duration = Duration::from_millis(5);

        let deadline = std::time::Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
