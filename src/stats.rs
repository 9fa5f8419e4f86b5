use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime counters for one pipeline.
///
/// Design:
/// - Lock-free (Atomics)
/// - Owned by a single `Flow`, shared with its delivery task through `Arc`
/// - Never persisted; a restart begins at zero
#[derive(Debug, Default)]
pub struct PipelineStats {
    // Messages accepted by the destination
    delivered: AtomicU64,

    // Per-message failures
    write_errors: AtomicU64,
    transform_errors: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called only after `Destination::write` returned `Ok`.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_error(&self) {
        self.transform_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn transform_errors(&self) -> u64 {
        self.transform_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = PipelineStats::new();
        stats.record_delivered();
        stats.record_delivered();
        stats.record_write_error();
        stats.record_transform_error();
        stats.record_transform_error();
        stats.record_transform_error();

        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.write_errors(), 1);
        assert_eq!(stats.transform_errors(), 3);
    }
}
