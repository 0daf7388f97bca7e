//! Cancellation tokens governing top-level operations.
//!
//! One [`CancelToken`] governs each `convert`/`merge`/`push` call. Blocking
//! reads observe it through [`crate::stream::CancelReader`]; the uploader's
//! retry loop checks it before each sleep and each attempt. Child tokens let
//! one failing chunk upload cancel its in-flight siblings without touching
//! the caller's token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Canceled;

struct Inner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn state(&self) -> Option<Canceled> {
        if self.canceled.load(Ordering::Acquire) {
            return Some(Canceled::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(Canceled::DeadlineExceeded);
            }
        }
        match &self.parent {
            Some(parent) => parent.state(),
            None => None,
        }
    }
}

/// Cloneable cancellation context with an optional deadline.
///
/// Clones share state: canceling any clone cancels them all. A child token
/// observes its parent but can be canceled independently.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that never expires on its own.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// A token that reports `DeadlineExceeded` once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: None,
            }),
        }
    }

    /// A child token: canceled when either it or `self` is canceled.
    /// Canceling the child does not affect the parent.
    pub fn child(&self) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: None,
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state().is_some()
    }

    /// Fails fast with the cancellation flavor if the token has fired.
    pub fn check(&self) -> Result<(), Canceled> {
        match self.inner.state() {
            Some(state) => Err(state),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert_eq!(token.check(), Err(Canceled::Canceled));
    }

    #[test]
    fn test_deadline_expires() {
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        assert!(!token.is_canceled());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(token.check(), Err(Canceled::DeadlineExceeded));
    }

    #[test]
    fn test_child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_canceled());
        parent.cancel();
        assert!(child.is_canceled());
    }

    #[test]
    fn test_child_does_not_leak_upward() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());
    }
}
