//! Cooperative cancellation token
//!
//! One token is shared by the consumer and the dispatcher. The bounded-wait
//! primitives check it on every poll tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared "abort requested" flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    requested: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running operation to stop
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clear the flag; returns whether it was set
    pub fn reset(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_requested());

        token.request();
        assert!(other.is_requested());

        assert!(other.reset());
        assert!(!token.is_requested());
        assert!(!token.reset());
    }

    #[test]
    fn test_request_from_other_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.request()).join().unwrap();
        assert!(token.is_requested());
    }
}
