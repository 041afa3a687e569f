//! Double-buffered slot queue between producers and one consumer.
//!
//! Each enabled consumer owns one ring: two equally sized slot buffers and a
//! single shared control word packing `(epoch index << 24) | length`.
//! Producers reserve slots with a fetch-add on the word and fill them
//! concurrently; the consumer swaps the word to open a fresh epoch and then
//! walks the previous buffer. A slot becomes readable only once its commit
//! byte equals the epoch it was written in, so a reader arriving early spins
//! on the commit byte rather than trusting the length.
//!
//! Epoch indexes start at 1 and wrap through `u8`; the buffer a given epoch
//! writes to is picked by the index parity. Length values beyond the slot
//! count mean overflow: the excess reservations were never written and the
//! consumer clamps.

mod header;

pub use header::{slot_size, SlotHeader, SLOT_HEADER_SIZE};

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::CachePadded;

use crate::config::TimestampFormat;
use crate::error::{Error, Result};
use crate::frame::Frame;

/// Upper bound on slots per queue buffer.
pub const MAX_RING_SLOTS: usize = 1 << 22;

#[inline]
fn queue_len(word: u32) -> usize {
    (word & 0x00ff_ffff) as usize
}

#[inline]
fn queue_index(word: u32) -> u8 {
    (word >> 24) as u8
}

pub(crate) struct Reservation {
    index: u8,
    base: usize,
}

pub(crate) struct SlotRing {
    slots: usize,
    caplen: usize,
    /// Payload bytes skipped before copying into the slot.
    skip: usize,
    slot_size: usize,
    ts_enabled: Arc<AtomicBool>,
    ts_format: TimestampFormat,
    data: CachePadded<AtomicU32>,
    poll_wait: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    arena: UnsafeCell<Box<[u8]>>,
}

// Producers hold disjoint slot reservations within an epoch and the consumer
// only reads slots whose commit byte carries that epoch, observed with
// acquire ordering against the release commit.
unsafe impl Send for SlotRing {}
unsafe impl Sync for SlotRing {}

impl SlotRing {
    pub(crate) fn new(
        slots: usize,
        caplen: usize,
        skip: usize,
        ts_format: TimestampFormat,
        ts_enabled: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        debug_assert!(slots >= 1 && slots <= MAX_RING_SLOTS);
        let slot_size = slot_size(caplen);
        let size = 2 * slots * slot_size;
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(size)
            .map_err(|e| Error::RingAllocation(format!("{size} bytes: {e}")))?;
        arena.resize(size, 0u8);
        let (wake_tx, wake_rx) = bounded(1);
        Ok(Arc::new(SlotRing {
            slots,
            caplen,
            skip,
            slot_size,
            ts_enabled,
            ts_format,
            // epochs start at 1 so zeroed commit bytes never look committed
            data: CachePadded::new(AtomicU32::new(1 << 24)),
            poll_wait: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            arena: UnsafeCell::new(arena.into_boxed_slice()),
        }))
    }

    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    /// Committed-or-reserved slots in the open epoch, clamped to capacity.
    #[inline]
    pub(crate) fn pending(&self) -> usize {
        queue_len(self.data.load(Ordering::Acquire)).min(self.slots)
    }

    /// Claims `n` slots in the open epoch. Returns `None` when the epoch is
    /// already full; a successful reservation may still extend past the end
    /// of the buffer, in which case the out-of-range tail is overflow.
    fn reserve(&self, n: usize) -> Option<Reservation> {
        if queue_len(self.data.load(Ordering::Relaxed)) >= self.slots {
            return None;
        }
        let prev = self.data.fetch_add(n as u32, Ordering::AcqRel);
        Some(Reservation {
            index: queue_index(prev),
            base: queue_len(prev),
        })
    }

    /// Writes up to `burst` frames into freshly reserved slots. Returns the
    /// number actually written; the shortfall is queue overflow and has
    /// already woken the consumer.
    pub(crate) fn enqueue_batch<'a, I>(&self, frames: I, burst: usize) -> usize
    where
        I: IntoIterator<Item = &'a Frame>,
    {
        if burst == 0 {
            return 0;
        }
        let res = match self.reserve(burst) {
            Some(res) => res,
            None => {
                self.wake();
                return 0;
            }
        };
        let watermark = (self.slots / 2).max(1);
        let mut sent = 0;
        for (i, frame) in frames.into_iter().enumerate().take(burst) {
            let slot = res.base + i;
            if slot >= self.slots {
                break;
            }
            unsafe { self.write_slot(slot, res.index, frame) };
            sent += 1;
            if slot + 1 == watermark {
                self.wake();
            }
        }
        if sent < burst {
            self.wake();
        }
        sent
    }

    unsafe fn write_slot(&self, slot: usize, index: u8, frame: &Frame) {
        let buffer = (index & 1) as usize * self.slots * self.slot_size;
        let base = (*self.arena.get())
            .as_mut_ptr()
            .add(buffer + slot * self.slot_size);

        let payload = frame.payload();
        let skip = self.skip.min(payload.len());
        let copy = (payload.len() - skip).min(self.caplen);
        copy_payload(base.add(SLOT_HEADER_SIZE), payload.as_ptr().add(skip), copy);

        let tstamp = if self.ts_enabled.load(Ordering::Relaxed) {
            frame.timestamp().unwrap_or_default()
        } else {
            Default::default()
        };
        header::write_fields(
            base,
            &SlotHeader {
                state: frame.state(),
                tstamp_sec: tstamp.sec,
                tstamp_nsec: tstamp.nsec,
                if_index: frame.if_index(),
                group_id: frame.ann.gid,
                wire_len: frame.wire_len(),
                cap_len: copy as u16,
                vlan_tci: frame.vlan().map(|v| v.tci()).unwrap_or(0),
                hw_queue: frame.hw_queue(),
            },
            self.ts_format,
        );
        header::commit_cell(base).store(index, Ordering::Release);
    }

    /// Opens the next epoch and returns the closed one as `(index, length)`,
    /// with the length clamped to the slot count.
    pub(crate) fn swap(&self) -> (u8, usize) {
        let cur = self.data.load(Ordering::Relaxed);
        let next = (queue_index(cur).wrapping_add(1) as u32) << 24;
        let prev = self.data.swap(next, Ordering::AcqRel);
        (queue_index(prev), queue_len(prev).min(self.slots))
    }

    /// Wakes a parked consumer, if any.
    pub(crate) fn wake(&self) {
        if self.poll_wait.swap(false, Ordering::AcqRel) {
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Parks until a producer wake or the timeout. Returns whether frames
    /// are (or may be) pending.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        while self.wake_rx.try_recv().is_ok() {}
        self.poll_wait.store(true, Ordering::Release);
        if self.pending() > 0 {
            self.poll_wait.store(false, Ordering::Relaxed);
            return true;
        }
        let woke = self.wake_rx.recv_timeout(timeout).is_ok();
        self.poll_wait.store(false, Ordering::Relaxed);
        woke || self.pending() > 0
    }

    #[inline]
    unsafe fn slot_ptr(&self, index: u8, slot: usize) -> *const u8 {
        let buffer = (index & 1) as usize * self.slots * self.slot_size;
        (*self.arena.get()).as_ptr().add(buffer + slot * self.slot_size)
    }
}

/// Payload copy with constant-length paths for the common capture sizes,
/// which the compiler turns into straight-line vector moves.
#[inline]
unsafe fn copy_payload(dst: *mut u8, src: *const u8, len: usize) {
    match len {
        64 => std::ptr::copy_nonoverlapping(src, dst, 64),
        128 => std::ptr::copy_nonoverlapping(src, dst, 128),
        256 => std::ptr::copy_nonoverlapping(src, dst, 256),
        512 => std::ptr::copy_nonoverlapping(src, dst, 512),
        n => std::ptr::copy_nonoverlapping(src, dst, n),
    }
}

/// One committed slot, as seen by the consumer.
pub struct SlotView<'b> {
    pub header: SlotHeader,
    pub payload: &'b [u8],
}

/// A closed epoch handed to the consumer: the slots committed before the
/// swap, readable while producers fill the sibling buffer.
pub struct CapturedBatch<'a> {
    ring: Arc<SlotRing>,
    index: u8,
    len: usize,
    _parent: PhantomData<&'a mut ()>,
}

impl<'a> CapturedBatch<'a> {
    pub(crate) fn take(ring: Arc<SlotRing>) -> Self {
        let (index, len) = ring.swap();
        CapturedBatch {
            ring,
            index,
            len,
            _parent: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads slot `i`, spinning briefly if its producer has reserved but not
    /// yet committed it.
    pub fn slot(&self, i: usize) -> SlotView<'_> {
        assert!(i < self.len);
        unsafe {
            let slot = self.ring.slot_ptr(self.index, i);
            let commit = header::commit_cell(slot);
            while commit.load(Ordering::Acquire) != self.index {
                std::thread::yield_now();
            }
            let hdr = header::read_fields(slot, self.ring.ts_format);
            SlotView {
                header: hdr,
                payload: std::slice::from_raw_parts(
                    slot.add(SLOT_HEADER_SIZE),
                    (hdr.cap_len as usize).min(self.ring.caplen),
                ),
            }
        }
    }

    pub fn iter(&self) -> SlotIter<'_, 'a> {
        SlotIter {
            batch: self,
            next: 0,
        }
    }
}

pub struct SlotIter<'b, 'a> {
    batch: &'b CapturedBatch<'a>,
    next: usize,
}

impl<'b, 'a> Iterator for SlotIter<'b, 'a> {
    type Item = SlotView<'b>;

    fn next(&mut self) -> Option<SlotView<'b>> {
        if self.next >= self.batch.len {
            return None;
        }
        let view = self.batch.slot(self.next);
        self.next += 1;
        Some(view)
    }
}
