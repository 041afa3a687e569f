//! Slot header layout.
//!
//! Every slot starts with a fixed 32-byte header followed by the captured
//! payload, padded so slots stay 8-byte aligned. All multi-byte fields are
//! little-endian. The commit byte is the last header byte; it is written
//! with release ordering after everything else in the slot and carries the
//! epoch index of the write, which is the only signal a reader trusts.

use std::sync::atomic::AtomicU8;

use crate::config::TimestampFormat;

pub(crate) const STATE: usize = 0;
pub(crate) const TSTAMP: usize = 8;
pub(crate) const IF_INDEX: usize = 16;
pub(crate) const GROUP_ID: usize = 20;
pub(crate) const WIRE_LEN: usize = 24;
pub(crate) const CAP_LEN: usize = 26;
pub(crate) const VLAN_TCI: usize = 28;
pub(crate) const HW_QUEUE: usize = 30;
pub(crate) const COMMIT: usize = 31;

/// Fixed header bytes preceding the payload in every slot.
pub const SLOT_HEADER_SIZE: usize = 32;

/// Total slot footprint for a given capture length.
pub const fn slot_size(caplen: usize) -> usize {
    (SLOT_HEADER_SIZE + caplen + 7) & !7
}

/// Decoded slot header, as surfaced to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotHeader {
    pub state: u64,
    pub tstamp_sec: u32,
    pub tstamp_nsec: u32,
    pub if_index: u32,
    pub group_id: u32,
    pub wire_len: u16,
    pub cap_len: u16,
    pub vlan_tci: u16,
    pub hw_queue: u8,
}

#[inline]
unsafe fn put<const N: usize>(slot: *mut u8, at: usize, bytes: [u8; N]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(at), N);
}

#[inline]
unsafe fn get<const N: usize>(slot: *const u8, at: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    std::ptr::copy_nonoverlapping(slot.add(at), bytes.as_mut_ptr(), N);
    bytes
}

/// Writes every header field except the commit byte.
///
/// # Safety
/// `slot` must point at a writable region of at least [`SLOT_HEADER_SIZE`]
/// bytes that no reader observes before the commit byte is set.
pub(crate) unsafe fn write_fields(slot: *mut u8, header: &SlotHeader, fmt: TimestampFormat) {
    put(slot, STATE, header.state.to_le_bytes());
    match fmt {
        TimestampFormat::Split => {
            put(slot, TSTAMP, header.tstamp_sec.to_le_bytes());
            put(slot, TSTAMP + 4, header.tstamp_nsec.to_le_bytes());
        }
        TimestampFormat::Combined => {
            let nanos =
                header.tstamp_sec as u64 * 1_000_000_000 + header.tstamp_nsec as u64;
            put(slot, TSTAMP, nanos.to_le_bytes());
        }
    }
    put(slot, IF_INDEX, header.if_index.to_le_bytes());
    put(slot, GROUP_ID, header.group_id.to_le_bytes());
    put(slot, WIRE_LEN, header.wire_len.to_le_bytes());
    put(slot, CAP_LEN, header.cap_len.to_le_bytes());
    put(slot, VLAN_TCI, header.vlan_tci.to_le_bytes());
    put(slot, HW_QUEUE, [header.hw_queue]);
}

/// Decodes the header of a committed slot.
///
/// # Safety
/// `slot` must point at [`SLOT_HEADER_SIZE`] readable bytes whose commit
/// byte has been observed with acquire ordering.
pub(crate) unsafe fn read_fields(slot: *const u8, fmt: TimestampFormat) -> SlotHeader {
    let (tstamp_sec, tstamp_nsec) = match fmt {
        TimestampFormat::Split => (
            u32::from_le_bytes(get(slot, TSTAMP)),
            u32::from_le_bytes(get(slot, TSTAMP + 4)),
        ),
        TimestampFormat::Combined => {
            let nanos = u64::from_le_bytes(get(slot, TSTAMP));
            ((nanos / 1_000_000_000) as u32, (nanos % 1_000_000_000) as u32)
        }
    };
    SlotHeader {
        state: u64::from_le_bytes(get(slot, STATE)),
        tstamp_sec,
        tstamp_nsec,
        if_index: u32::from_le_bytes(get(slot, IF_INDEX)),
        group_id: u32::from_le_bytes(get(slot, GROUP_ID)),
        wire_len: u16::from_le_bytes(get(slot, WIRE_LEN)),
        cap_len: u16::from_le_bytes(get(slot, CAP_LEN)),
        vlan_tci: u16::from_le_bytes(get(slot, VLAN_TCI)),
        hw_queue: get::<1>(slot, HW_QUEUE)[0],
    }
}

/// The commit byte of a slot, viewed atomically.
///
/// # Safety
/// `slot` must point at a live slot; the byte at [`COMMIT`] is only ever
/// accessed through this view once the slot is shared.
pub(crate) unsafe fn commit_cell<'a>(slot: *const u8) -> &'a AtomicU8 {
    &*(slot.add(COMMIT) as *const AtomicU8)
}
