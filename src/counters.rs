// Per-process and host-wide byte accounting

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::rules::Direction;

/// One process's byte counters, mutated with relaxed fetch-add on the
/// packet path. Snapshots swap each field to zero independently; the pair
/// is not atomic as a whole and readers tolerate the skew.
#[derive(Default)]
struct PidCounters {
    dl: AtomicU64,
    ul: AtomicU64,
}

/// Byte counters for every sighted PID plus the host-wide pair. Per-PID
/// entries appear on the first byte and stay (zeroed by snapshots) until
/// the engine stops.
#[derive(Default)]
pub struct ByteCounters {
    per_pid: DashMap<u32, PidCounters>,
    global_dl: AtomicU64,
    global_ul: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `len` bytes to `pid`'s counter for `dir`.
    pub fn record(&self, pid: u32, dir: Direction, len: u64) {
        let entry = self.per_pid.entry(pid).or_default();
        match dir {
            Direction::Download => entry.dl.fetch_add(len, Ordering::Relaxed),
            Direction::Upload => entry.ul.fetch_add(len, Ordering::Relaxed),
        };
    }

    /// Add `len` bytes to the host-wide counter for `dir`.
    pub fn record_global(&self, dir: Direction, len: u64) {
        match dir {
            Direction::Download => self.global_dl.fetch_add(len, Ordering::Relaxed),
            Direction::Upload => self.global_ul.fetch_add(len, Ordering::Relaxed),
        };
    }

    /// Swap every per-PID counter to zero and return what was accumulated
    /// since the previous snapshot.
    pub fn snapshot_and_reset(&self) -> HashMap<u32, (u64, u64)> {
        let mut snapshot = HashMap::with_capacity(self.per_pid.len());
        for entry in self.per_pid.iter() {
            snapshot.insert(
                *entry.key(),
                (
                    entry.value().dl.swap(0, Ordering::Relaxed),
                    entry.value().ul.swap(0, Ordering::Relaxed),
                ),
            );
        }
        snapshot
    }

    /// Swap the host-wide counters to zero and return them.
    pub fn snapshot_global(&self) -> (u64, u64) {
        (
            self.global_dl.swap(0, Ordering::Relaxed),
            self.global_ul.swap(0, Ordering::Relaxed),
        )
    }

    /// Current per-PID totals without resetting.
    pub fn totals(&self) -> HashMap<u32, (u64, u64)> {
        let mut totals = HashMap::with_capacity(self.per_pid.len());
        for entry in self.per_pid.iter() {
            totals.insert(
                *entry.key(),
                (
                    entry.value().dl.load(Ordering::Relaxed),
                    entry.value().ul.load(Ordering::Relaxed),
                ),
            );
        }
        totals
    }

    /// Current host-wide totals without resetting.
    pub fn global_totals(&self) -> (u64, u64) {
        (
            self.global_dl.load(Ordering::Relaxed),
            self.global_ul.load(Ordering::Relaxed),
        )
    }

    /// Forget all counters (engine stop).
    pub fn clear(&self) {
        self.per_pid.clear();
        self.global_dl.store(0, Ordering::Relaxed);
        self.global_ul.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creates_counter_on_first_byte() {
        let counters = ByteCounters::new();
        assert!(counters.totals().is_empty());

        counters.record(42, Direction::Download, 1500);
        counters.record(42, Direction::Download, 1500);
        counters.record(42, Direction::Upload, 60);

        assert_eq!(counters.totals().get(&42), Some(&(3000, 60)));
    }

    #[test]
    fn test_snapshot_resets_but_keeps_entries() {
        let counters = ByteCounters::new();
        counters.record(1, Direction::Download, 100);
        counters.record(2, Direction::Upload, 200);

        let first = counters.snapshot_and_reset();
        assert_eq!(first.get(&1), Some(&(100, 0)));
        assert_eq!(first.get(&2), Some(&(0, 200)));

        // an immediate second snapshot is all zeros, same PID set
        let second = counters.snapshot_and_reset();
        assert_eq!(second.len(), 2);
        assert!(second.values().all(|&(dl, ul)| dl == 0 && ul == 0));
    }

    #[test]
    fn test_global_snapshot_resets() {
        let counters = ByteCounters::new();
        counters.record_global(Direction::Download, 5000);
        counters.record_global(Direction::Upload, 700);

        assert_eq!(counters.global_totals(), (5000, 700));
        assert_eq!(counters.snapshot_global(), (5000, 700));
        assert_eq!(counters.snapshot_global(), (0, 0));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let counters = ByteCounters::new();
        counters.record(9, Direction::Download, 1);
        counters.record_global(Direction::Download, 1);
        counters.clear();
        assert!(counters.totals().is_empty());
        assert_eq!(counters.global_totals(), (0, 0));
    }
}
