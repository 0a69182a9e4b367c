use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};

pub struct IndexMetrics {
    pub num_splits: Counter<u64>,
    pub num_merges: Counter<u64>,
    pub num_vector_deletes: Counter<u64>,
    pub num_fixups_dropped: Counter<u64>,
    pub num_fixups_retried: Counter<u64>,
    pub fixup_latency: Histogram<u64>,
}

impl Default for IndexMetrics {
    fn default() -> Self {
        let meter = global::meter("vecindex");
        let num_splits = meter.u64_counter("num_splits").build();
        let num_merges = meter.u64_counter("num_merges").build();
        let num_vector_deletes = meter.u64_counter("num_vector_deletes").build();
        let num_fixups_dropped = meter.u64_counter("num_fixups_dropped").build();
        let num_fixups_retried = meter.u64_counter("num_fixups_retried").build();
        let fixup_latency = meter.u64_histogram("fixup_latency").build();
        Self {
            num_splits,
            num_merges,
            num_vector_deletes,
            num_fixups_dropped,
            num_fixups_retried,
            fixup_latency,
        }
    }
}

/// Process local fixup counters, reported by `format_stats`.
#[derive(Default)]
pub(crate) struct FixupCounters {
    splits: AtomicU64,
    merges: AtomicU64,
    vector_deletes: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixupStats {
    pub splits: u64,
    pub merges: u64,
    pub vector_deletes: u64,
    /// Fixups that found nothing to do, usually because they raced with
    /// another change.
    pub skipped: u64,
    /// Fixups abandoned after an error.
    pub dropped: u64,
    pub retried: u64,
    pub pending: u64,
}

impl FixupCounters {
    pub(crate) fn add_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_vector_delete(&self) {
        self.vector_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: u64) -> FixupStats {
        FixupStats {
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            vector_deletes: self.vector_deletes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            pending,
        }
    }
}
