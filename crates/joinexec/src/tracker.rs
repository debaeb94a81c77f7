use std::sync::atomic::{AtomicI64, Ordering};

use tracing::trace;

/// Byte accounting for one resource kind (memory, disk).
///
/// Purely observational: nothing in the pipeline gates on these counters.
/// Negative deltas release previously consumed bytes.
#[derive(Debug)]
pub struct UsageTracker {
    label: &'static str,
    bytes: AtomicI64,
}

impl UsageTracker {
    pub fn new(label: &'static str) -> UsageTracker {
        UsageTracker {
            label,
            bytes: AtomicI64::new(0),
        }
    }

    pub fn consume(&self, bytes: i64) {
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        trace!(label = self.label, bytes, total, "usage consumed");
    }

    pub fn consumed(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_accumulates_and_releases() {
        let tracker = UsageTracker::new("mem");
        tracker.consume(100);
        tracker.consume(50);
        tracker.consume(-30);
        assert_eq!(120, tracker.consumed());
    }
}
