//! Cooperative cancellation signal for long operations (hybrid search,
//! compaction, batch insert). Checked between sub-steps; mirrors the
//! `Arc<AtomicBool>` running-flag pattern `llmspell-memory`'s consolidation
//! daemon uses for its own start/stop signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MemoryError, Result};

/// A clonable, shareable cancellation flag. Callers hold one end and pass
/// `Some(&token)` into a long-running call; calling `cancel()` from another
/// thread causes the next cooperative checkpoint inside that call to return
/// `Err(MemoryError::Cancelled)`.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cooperative checkpoint: `Err(MemoryError::Cancelled)` once `cancel()`
    /// has been called, `Ok(())` otherwise. Call between sub-steps of a long
    /// operation, never inside a tight loop body that hasn't committed yet.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MemoryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Checks an optional token, treating `None` as "never cancelled".
pub fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => token.check(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(MemoryError::Cancelled)));
    }

    #[test]
    fn none_never_cancels() {
        assert!(check_cancelled(None).is_ok());
    }
}
