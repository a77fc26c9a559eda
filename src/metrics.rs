//! Running counters for the ingestion path.
//!
//! An owned component rather than module statics so it can be injected into
//! the dispatcher, directory, and recorder explicitly and inspected as a
//! whole in tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    received: AtomicU64,
    stored: AtomicU64,
    errors: AtomicU64,
    nodes_created: AtomicU64,
    nodes_updated: AtomicU64,
    nodeinfo_triggers: AtomicU64,
    direct_updates: AtomicU64,
    dropped_oversize: AtomicU64,
    /// Gauge: provisional nodes currently awaiting resolution.
    pending: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodes_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodes_updated(&self) {
        self.nodes_updated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodeinfo_triggers(&self) {
        self.nodeinfo_triggers.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_direct_updates(&self) {
        self.direct_updates.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_dropped_oversize(&self) {
        self.dropped_oversize.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_pending(&self, value: u64) {
        self.pending.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_updated: self.nodes_updated.load(Ordering::Relaxed),
            nodeinfo_triggers: self.nodeinfo_triggers.load(Ordering::Relaxed),
            direct_updates: self.direct_updates.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub received: u64,
    pub stored: u64,
    pub errors: u64,
    pub nodes_created: u64,
    pub nodes_updated: u64,
    pub nodeinfo_triggers: u64,
    pub direct_updates: u64,
    pub dropped_oversize: u64,
    pub pending: u64,
}

impl Snapshot {
    /// One-line summary for the periodic stats report.
    pub fn summary(&self, runtime_secs: u64, db_healthy: bool) -> String {
        format!(
            "Stats - Runtime: {}s, Received: {}, Stored: {}, Errors: {}, \
             Nodes Created: {}, Nodes Updated: {}, NODEINFO Triggers: {}, \
             Direct Updates: {}, Dropped Oversize: {}, Pending: {}, DB Health: {}",
            runtime_secs,
            self.received,
            self.stored,
            self.errors,
            self.nodes_created,
            self.nodes_updated,
            self.nodeinfo_triggers,
            self.direct_updates,
            self.dropped_oversize,
            self.pending,
            if db_healthy { "ok" } else { "unhealthy" }
        )
    }
}
