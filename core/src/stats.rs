//! Per-CPU sparse statistics counters.
//!
//! Counters touched on the data path are sharded across CPUs so producers
//! never contend on a cache line; the cells are summed on read. Readings are
//! monotonic and never reset implicitly.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

/// Upper bound on receive contexts.
pub const MAX_CPUS: usize = 64;

pub(crate) struct SparseCounter {
    cells: Box<[CachePadded<AtomicU64>]>,
}

impl SparseCounter {
    pub(crate) fn new() -> Self {
        SparseCounter {
            cells: (0..MAX_CPUS)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    #[inline]
    pub(crate) fn add(&self, cpu: usize, n: u64) {
        self.cells[cpu & (MAX_CPUS - 1)].fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc(&self, cpu: usize) {
        self.add(cpu, 1);
    }

    pub(crate) fn sum(&self) -> u64 {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// The `recv / lost / drop` triple reported for consumers and groups.
///
/// `lost` counts frames eligible for a queue but discarded on overflow;
/// `drop` counts frames discarded by a filter or classifier decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub recv: u64,
    pub lost: u64,
    pub drop: u64,
}

pub(crate) struct StatCounters {
    pub(crate) recv: SparseCounter,
    pub(crate) lost: SparseCounter,
    pub(crate) drop: SparseCounter,
}

impl StatCounters {
    pub(crate) fn new() -> Self {
        StatCounters {
            recv: SparseCounter::new(),
            lost: SparseCounter::new(),
            drop: SparseCounter::new(),
        }
    }

    pub(crate) fn read(&self) -> Stats {
        Stats {
            recv: self.recv.sum(),
            lost: self.lost.sum(),
            drop: self.drop.sum(),
        }
    }
}
