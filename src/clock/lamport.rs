use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic causal counter shared by every handler task of a process.
///
/// All operations are lock-free; concurrent `tick`/`observe` calls never
/// hand out the same value twice.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicI64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::with_start(0)
    }

    /// Seeds the clock, e.g. from the highest logical timestamp already persisted.
    pub fn with_start(start: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
        }
    }

    /// Advances the clock for a locally generated event and returns the new value.
    pub fn tick(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merges a timestamp carried by a received message.
    pub fn observe(&self, received: i64) -> i64 {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(received) + 1)
            })
            .unwrap_or_else(|current| current);

        previous.max(received) + 1
    }

    pub fn peek(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}
