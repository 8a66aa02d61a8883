//! Runner-count gauges.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::RunnerDisposition;

/// The five runner gauges: total, starting, idle, active, preparing.
///
/// Shared as an `Arc` between the reconciliation loop (writer) and the
/// metrics endpoint (reader); all updates are plain atomic stores.
#[derive(Debug, Default)]
pub struct RunnerGauges {
    total: AtomicU64,
    starting: AtomicU64,
    idle: AtomicU64,
    active: AtomicU64,
    preparing: AtomicU64,
}

impl RunnerGauges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh disposition snapshot. Called once per tick.
    pub fn record_disposition(&self, disposition: &RunnerDisposition) {
        self.total.store(disposition.total() as u64, Ordering::Relaxed);
        self.starting
            .store(disposition.starting as u64, Ordering::Relaxed);
        self.idle.store(disposition.idle as u64, Ordering::Relaxed);
        self.active
            .store(disposition.active as u64, Ordering::Relaxed);
    }

    /// Mark a bake as in flight until the returned guard drops.
    ///
    /// The gauge decrements on drop whether the bake succeeded or failed.
    pub fn begin_preparing(&self) -> PreparingGuard<'_> {
        self.preparing.fetch_add(1, Ordering::Relaxed);
        PreparingGuard(self)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn starting(&self) -> u64 {
        self.starting.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> u64 {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn preparing(&self) -> u64 {
        self.preparing.load(Ordering::Relaxed)
    }
}

/// Holds the preparing gauge high while a bake is running.
#[must_use]
pub struct PreparingGuard<'a>(&'a RunnerGauges);

impl Drop for PreparingGuard<'_> {
    fn drop(&mut self) {
        self.0.preparing.fetch_sub(1, Ordering::Relaxed);
    }
}
