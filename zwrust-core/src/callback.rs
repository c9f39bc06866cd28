//! Callback id allocation
//!
//! Every frame that expects a callback from the controller carries a one-byte
//! id. Ids cycle through `1..=255`; zero means "no callback" on the wire and is
//! never handed out.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Callback id allocator
///
/// Owned by the driver and passed to [`Message::finalize`](crate::Message::finalize).
/// Thread-safe and can be cloned cheaply (Arc internally); clones share the
/// same sequence.
#[derive(Debug, Clone)]
pub struct CallbackIds {
    next: Arc<AtomicU8>,
}

impl CallbackIds {
    /// First id handed out by a fresh allocator
    pub const FIRST: u8 = 1;

    /// Create an allocator starting at [`Self::FIRST`]
    pub fn new() -> Self {
        Self::with_start(Self::FIRST)
    }

    /// Create an allocator starting at `start` (0 is treated as 1)
    pub fn with_start(start: u8) -> Self {
        Self {
            next: Arc::new(AtomicU8::new(start.max(Self::FIRST))),
        }
    }

    /// Get next callback id
    ///
    /// Returns 1, 2, ..., 255, 1, 2, ... and never 0.
    pub fn next_id(&self) -> u8 {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current == u8::MAX { Self::FIRST } else { current + 1 })
            })
            .unwrap_or_else(|current| current)
    }

    /// Peek at the id the next call will return
    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for CallbackIds {
    fn default() -> Self {
        Self::new()
    }
}
