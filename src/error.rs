//! Sentinel error conditions callers need to distinguish from plain failures.
//!
//! Most errors in this crate are `anyhow::Error`s wrapped with the identity of
//! the stage that produced them. Two conditions carry meaning beyond their
//! message and are modeled as concrete types so they survive the journey up
//! the chain:
//! - [`NotFound`]: a blob is absent from a storage backend (`Backend::check`).
//! - [`Canceled`]: the governing [`crate::cancel::CancelToken`] fired; never
//!   to be conflated with a retryable transport error.

use thiserror::Error;

/// A blob does not exist in the storage backend.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("data not found")]
pub struct NotFound;

/// The governing cancellation token fired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canceled {
    #[error("operation canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Returns true if `err` is, or was caused by, a blob-not-found condition.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<NotFound>())
}

/// Returns true if `err` is, or was caused by, cancellation or an expired
/// deadline. Cancellation may surface as an `io::Error` wrapping [`Canceled`]
/// when it interrupts a blocking read, so the whole chain is inspected.
pub fn is_canceled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<Canceled>() {
            return true;
        }
        cause
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .map(|inner| inner.is::<Canceled>())
            .unwrap_or(false)
    })
}
