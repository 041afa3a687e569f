//! Captured frames and the per-context prefetch batch.
//!
//! A [`Frame`] is an opaque capture unit built by the ingress collaborator.
//! It carries the raw bytes plus the wire metadata the slot header needs,
//! and a private annotation that lives for exactly one pass through the
//! pipeline: matched group mask, classifier state, and the stolen/to-kernel
//! verdict flags.

use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on the prefetch batch; frame positions within a batch are
/// tracked as bits of a 64-bit mask.
pub const MAX_BATCH: usize = 64;

/// Capture timestamp, split into seconds/nanoseconds like the slot header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: d.as_secs() as u32,
            nsec: d.subsec_nanos(),
        }
    }

    pub const fn zero() -> Self {
        Timestamp { sec: 0, nsec: 0 }
    }

    /// The combined 64-bit representation (nanoseconds since the epoch).
    pub fn combined(self) -> u64 {
        self.sec as u64 * 1_000_000_000 + self.nsec as u64
    }

    pub fn from_combined(nanos: u64) -> Self {
        Timestamp {
            sec: (nanos / 1_000_000_000) as u32,
            nsec: (nanos % 1_000_000_000) as u32,
        }
    }
}

/// 802.1Q tag control word: 12-bit vlan id, 3-bit priority, one reserved
/// bit. Stored as the flat 16-bit TCI; the accessors unpack the fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VlanTag(u16);

impl VlanTag {
    pub fn new(vid: u16, priority: u8) -> Self {
        VlanTag((vid & 0x0fff) | ((priority as u16 & 0x7) << 13))
    }

    pub const fn from_tci(tci: u16) -> Self {
        VlanTag(tci)
    }

    pub const fn untagged() -> Self {
        VlanTag(0)
    }

    pub fn vid(self) -> u16 {
        self.0 & 0x0fff
    }

    pub fn priority(self) -> u8 {
        (self.0 >> 13) as u8
    }

    pub fn tci(self) -> u16 {
        self.0
    }
}

/// Which path handed the frame to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    Loopback,
}

/// Mutable state used during one pipeline pass, never retained beyond it.
#[derive(Debug, Default)]
pub(crate) struct Annotation {
    /// Opaque producer state word, copied into the slot header.
    pub state: u64,
    /// Groups whose bindings matched this frame's device/queue.
    pub group_mask: u64,
    /// Group that last selected a destination for this frame.
    pub gid: u32,
    /// Consumed entirely by a classifier stage; never delivered or routed.
    pub stolen: bool,
    /// Classifier hint to forward to the regular network stack.
    pub to_kernel: bool,
    /// Frame was diverted at the driver rather than sniffed off the stack.
    pub direct: bool,
}

/// One captured frame moving through the pipeline.
pub struct Frame {
    payload: Vec<u8>,
    wire_len: u16,
    if_index: u32,
    hw_queue: u8,
    direction: Direction,
    vlan: Option<VlanTag>,
    tstamp: Option<Timestamp>,
    pub(crate) ann: Annotation,
}

impl Frame {
    pub fn new(if_index: u32, hw_queue: u8, payload: Vec<u8>) -> Self {
        let wire_len = payload.len().min(u16::MAX as usize) as u16;
        Frame {
            payload,
            wire_len,
            if_index,
            hw_queue,
            direction: Direction::Incoming,
            vlan: None,
            tstamp: None,
            ann: Annotation::default(),
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Off-wire length when it differs from the captured payload length.
    pub fn with_wire_len(mut self, wire_len: u16) -> Self {
        self.wire_len = wire_len;
        self
    }

    pub fn with_vlan(mut self, tag: VlanTag) -> Self {
        self.vlan = Some(tag);
        self
    }

    pub fn with_timestamp(mut self, tstamp: Timestamp) -> Self {
        self.tstamp = Some(tstamp);
        self
    }

    /// Opaque producer state, surfaced in the slot header state word.
    pub fn with_state(mut self, state: u64) -> Self {
        self.ann.state = state;
        self
    }

    /// Marks the frame as diverted directly at the driver. Only direct
    /// frames are ever forwarded back to the network stack.
    pub fn with_direct(mut self) -> Self {
        self.ann.direct = true;
        self
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn wire_len(&self) -> u16 {
        self.wire_len
    }

    #[inline]
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    #[inline]
    pub fn hw_queue(&self) -> u8 {
        self.hw_queue
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn vlan(&self) -> Option<VlanTag> {
        self.vlan
    }

    #[inline]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.tstamp
    }

    #[inline]
    pub fn state(&self) -> u64 {
        self.ann.state
    }

    pub(crate) fn set_timestamp(&mut self, tstamp: Timestamp) {
        self.tstamp = Some(tstamp);
    }

    pub(crate) fn clear_vlan(&mut self) {
        self.vlan = None;
    }
}

/// Bounded, ordered prefetch batch owned by one receive context.
pub struct Batch {
    frames: Vec<Frame>,
    capacity: usize,
}

impl Batch {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 1 && capacity <= MAX_BATCH);
        Batch {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        debug_assert!(!self.is_full());
        self.frames.push(frame);
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, Frame> {
        self.frames.drain(..)
    }
}
