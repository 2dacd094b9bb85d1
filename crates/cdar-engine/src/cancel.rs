//! Cooperative cancellation for pack and unpack runs.
//!
//! The pipeline checks the token at every chunk boundary and before every
//! store operation; whoever holds the handle can abort a run without waiting
//! for the whole file to be processed.

use crate::error::{ArchiveError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A lightweight, cloneable cancellation token.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that is never cancelled unless paired with a handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The handle that triggers cancellation.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Trigger cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let cancelled = Arc::new(AtomicBool::new(false));
    (
        CancelToken {
            cancelled: cancelled.clone(),
        },
        CancelHandle { cancelled },
    )
}
