//! Device binding map: (interface, hardware queue) to group masks.
//!
//! One atomic word per (device, queue) cell holds the mask of groups bound
//! there, so the receive path resolves a frame's groups with a single
//! relaxed load. A per-device summary word answers "is anyone watching this
//! interface at all" for the direct-capture check.

use std::sync::atomic::{AtomicU64, Ordering};

/// Device table width; interface indexes are taken modulo this.
pub const MAX_DEVICES: usize = 256;

/// Hardware queues tracked per device.
pub const MAX_HW_QUEUES: usize = 256;

/// A binding update: which cells to touch and what to do with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapUpdate {
    Set,
    Reset,
}

pub(crate) struct DeviceMap {
    /// `MAX_DEVICES * MAX_HW_QUEUES` group-mask cells, row per device.
    masks: Box<[AtomicU64]>,
    /// Per-device union of all queue cells.
    monitor: Box<[AtomicU64]>,
}

impl DeviceMap {
    pub(crate) fn new() -> Self {
        DeviceMap {
            masks: (0..MAX_DEVICES * MAX_HW_QUEUES)
                .map(|_| AtomicU64::new(0))
                .collect(),
            monitor: (0..MAX_DEVICES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn cell(&self, dev: usize, queue: usize) -> &AtomicU64 {
        &self.masks[(dev & (MAX_DEVICES - 1)) * MAX_HW_QUEUES + (queue & (MAX_HW_QUEUES - 1))]
    }

    /// Groups bound to this (interface, queue) pair.
    #[inline]
    pub(crate) fn groups(&self, if_index: u32, hw_queue: u8) -> u64 {
        self.cell(if_index as usize, hw_queue as usize)
            .load(Ordering::Relaxed)
    }

    /// Whether any group is bound anywhere on this interface.
    #[inline]
    pub(crate) fn monitored(&self, if_index: u32) -> bool {
        self.monitor[if_index as usize & (MAX_DEVICES - 1)].load(Ordering::Relaxed) != 0
    }

    /// Applies one bind/unbind. `if_index` and `hw_queue` of `None` are
    /// wildcards covering the whole axis.
    pub(crate) fn update(
        &self,
        op: MapUpdate,
        if_index: Option<u32>,
        hw_queue: Option<u8>,
        gid: usize,
    ) {
        let bit = 1u64 << gid;
        let devs: Vec<usize> = match if_index {
            Some(i) => vec![i as usize & (MAX_DEVICES - 1)],
            None => (0..MAX_DEVICES).collect(),
        };
        for dev in devs {
            match hw_queue {
                Some(q) => {
                    self.apply(op, self.cell(dev, q as usize), bit);
                }
                None => {
                    for q in 0..MAX_HW_QUEUES {
                        self.apply(op, self.cell(dev, q), bit);
                    }
                }
            }
            self.refresh_monitor(dev);
        }
    }

    /// Drops every binding of a group, typically on group destruction.
    pub(crate) fn clear_group(&self, gid: usize) {
        self.update(MapUpdate::Reset, None, None, gid);
    }

    fn apply(&self, op: MapUpdate, cell: &AtomicU64, bit: u64) {
        match op {
            MapUpdate::Set => cell.fetch_or(bit, Ordering::Relaxed),
            MapUpdate::Reset => cell.fetch_and(!bit, Ordering::Relaxed),
        };
    }

    fn refresh_monitor(&self, dev: usize) {
        let mut union = 0u64;
        for q in 0..MAX_HW_QUEUES {
            union |= self.cell(dev, q).load(Ordering::Relaxed);
        }
        self.monitor[dev].store(union, Ordering::Relaxed);
    }
}
