//! Shared memory layout of a topic.
//!
//! The segment holds a fixed-size header followed by `msg_count` slots. The
//! header is padded to [`DATA_START`] regardless of its actual size so the
//! layout stays stable if fields are added.
//!
//! # Memory Layout
//!
//! ```text
//! offset 0
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TopicHeader                           │
//! │  ┌────────────┬─────────────┬────────────────┬────────────┐  │
//! │  │  msg_size  │  msg_count  │  writer_cursor │  padding   │  │
//! │  │   (u32)    │    (u32)    │     (u32)      │  to 32 B   │  │
//! │  └────────────┴─────────────┴────────────────┴────────────┘  │
//! ├──────────────────────────────────────────────────────────────┤ DATA_START
//! │  slot[0]:  reader_count (u32) │ payload [u8; msg_size]       │
//! ├──────────────────────────────────────────────────────────────┤ + (msg_size + 4)
//! │  slot[1]:  reader_count (u32) │ payload [u8; msg_size]       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                           ...                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Slots are packed, so a reader count is only 4-byte aligned when
//! `msg_size` is a multiple of 4. It is always accessed unaligned.
//!
//! Nothing here synchronizes. The writer cursor is only touched under the
//! topic's cursor semaphore, a reader count only under its slot's reader
//! mutex, and payload bytes only by the holder of the slot's write
//! permission (writer) or reader claim (readers).

use crate::error::{Result, TopicError};
use shale_shm::SharedSegment;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

/// Bytes reserved for the header before the first slot.
pub const DATA_START: usize = 32;

/// Size of the reader count that prefixes every slot.
pub const COUNT_SIZE: usize = size_of::<u32>();

/// Header at offset 0 of every topic segment.
#[repr(C)]
pub struct TopicHeader {
    msg_size: AtomicU32,
    msg_count: AtomicU32,
    writer_cursor: AtomicU32,
}

const _: () = assert!(size_of::<TopicHeader>() <= DATA_START);

impl TopicHeader {
    /// Payload bytes per message.
    pub fn msg_size(&self) -> u32 {
        self.msg_size.load(Ordering::Acquire)
    }

    /// Number of slots. Zero until the creator has finished initializing.
    pub fn msg_count(&self) -> u32 {
        self.msg_count.load(Ordering::Acquire)
    }

    /// Next slot index a publish will be assigned.
    ///
    /// Only meaningful while holding the cursor semaphore.
    pub fn writer_cursor(&self) -> u32 {
        self.writer_cursor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_writer_cursor(&self, cursor: u32) {
        self.writer_cursor.store(cursor, Ordering::Relaxed);
    }

    /// Writes the header once at creation. `msg_count` goes last so that an
    /// attacher reading a non-zero count also sees the other fields.
    pub(crate) fn initialize(&self, layout: TopicLayout) {
        self.msg_size.store(layout.msg_size(), Ordering::Relaxed);
        self.writer_cursor.store(0, Ordering::Relaxed);
        self.msg_count.store(layout.msg_count(), Ordering::Release);
    }
}

/// Reads the header of a mapped segment, if the segment is large enough to
/// hold one.
pub fn header_of(segment: &SharedSegment) -> Option<&TopicHeader> {
    if segment.size() < DATA_START {
        return None;
    }
    let base = segment.base()?;
    // SAFETY: the mapping is page aligned, at least DATA_START bytes long and
    // outlives the returned borrow of `segment`. The header is all atomics.
    Some(unsafe { &*base.as_ptr().cast::<TopicHeader>() })
}

/// Validated geometry of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicLayout {
    msg_size: u32,
    msg_count: u32,
}

impl TopicLayout {
    /// Fails with `InvalidConfiguration` for a zero size or count, or a
    /// geometry whose byte size does not fit in memory.
    pub fn new(msg_size: u32, msg_count: u32) -> Result<Self> {
        if msg_size == 0 {
            return Err(TopicError::invalid("msg_size must be greater than zero"));
        }
        if msg_count == 0 {
            return Err(TopicError::invalid("msg_count must be greater than zero"));
        }
        (msg_size as usize)
            .checked_add(COUNT_SIZE)
            .and_then(|stride| stride.checked_mul(msg_count as usize))
            .and_then(|slots| slots.checked_add(DATA_START))
            .ok_or_else(|| TopicError::invalid("topic does not fit in the address space"))?;
        Ok(Self {
            msg_size,
            msg_count,
        })
    }

    pub fn msg_size(&self) -> u32 {
        self.msg_size
    }

    pub fn msg_count(&self) -> u32 {
        self.msg_count
    }

    /// Distance between the starts of two consecutive slots.
    pub fn slot_stride(&self) -> usize {
        self.msg_size as usize + COUNT_SIZE
    }

    /// Offset of slot `index` (its reader count) from the segment start.
    pub fn slot_offset(&self, index: u32) -> usize {
        DATA_START + index as usize * self.slot_stride()
    }

    /// Offset of slot `index`'s payload from the segment start.
    pub fn payload_offset(&self, index: u32) -> usize {
        self.slot_offset(index) + COUNT_SIZE
    }

    /// Total segment size: `DATA_START + (msg_size + 4) × msg_count`.
    pub fn total_bytes(&self) -> usize {
        DATA_START + self.msg_count as usize * self.slot_stride()
    }
}

/// Typed view over a mapped topic segment.
#[derive(Clone, Copy)]
pub struct Region<'a> {
    base: NonNull<u8>,
    layout: TopicLayout,
    _segment: PhantomData<&'a SharedSegment>,
}

impl<'a> Region<'a> {
    /// Views `segment` with `layout`. `None` if the segment is unmapped or
    /// smaller than the layout requires.
    pub fn new(segment: &'a SharedSegment, layout: TopicLayout) -> Option<Self> {
        if segment.size() < layout.total_bytes() {
            return None;
        }
        let base = segment.base()?;
        // SAFETY: size checked above; the mapping lives as long as `segment`.
        Some(unsafe { Self::from_raw(base, layout) })
    }

    /// # Safety
    /// `base` must point to at least `layout.total_bytes()` bytes, aligned
    /// for `TopicHeader`, that stay mapped for `'a`.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, layout: TopicLayout) -> Self {
        Self {
            base,
            layout,
            _segment: PhantomData,
        }
    }

    pub fn layout(&self) -> TopicLayout {
        self.layout
    }

    pub fn header(&self) -> &'a TopicHeader {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &*self.base.as_ptr().cast::<TopicHeader>() }
    }

    /// # Panics
    /// Panics if `index >= msg_count`.
    pub fn slot(&self, index: u32) -> SlotView<'a> {
        assert!(
            index < self.layout.msg_count,
            "slot {index} out of range for {} slots",
            self.layout.msg_count
        );
        // SAFETY: the slot lies inside the region by the bound check above.
        let ptr = unsafe { self.base.add(self.layout.slot_offset(index)) };
        SlotView {
            ptr,
            msg_size: self.layout.msg_size as usize,
            _segment: PhantomData,
        }
    }
}

/// One slot: its reader count and payload bytes.
#[derive(Clone, Copy)]
pub struct SlotView<'a> {
    ptr: NonNull<u8>,
    msg_size: usize,
    _segment: PhantomData<&'a SharedSegment>,
}

impl SlotView<'_> {
    pub fn reader_count(&self) -> u32 {
        // SAFETY: the slot starts with 4 bytes of reader count.
        unsafe { self.ptr.as_ptr().cast::<u32>().read_unaligned() }
    }

    pub(crate) fn set_reader_count(&self, count: u32) {
        // SAFETY: as above; callers hold the slot's reader mutex.
        unsafe { self.ptr.as_ptr().cast::<u32>().write_unaligned(count) }
    }

    /// # Panics
    /// Panics if `src` is not exactly `msg_size` bytes.
    pub(crate) fn write_payload(&self, src: &[u8]) {
        assert_eq!(src.len(), self.msg_size, "payload length");
        // SAFETY: the payload region is msg_size bytes and cannot overlap a
        // caller's slice, which lives outside the shared mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.ptr.as_ptr().add(COUNT_SIZE),
                self.msg_size,
            )
        }
    }

    /// # Panics
    /// Panics if `dst` is not exactly `msg_size` bytes.
    pub(crate) fn read_payload(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.msg_size, "payload length");
        // SAFETY: see write_payload.
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(COUNT_SIZE),
                dst.as_mut_ptr(),
                self.msg_size,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn offsets_match_the_wire_layout() {
        let layout = TopicLayout::new(4, 3).unwrap();
        assert_eq!(layout.slot_stride(), 8);
        assert_eq!(layout.slot_offset(0), 32);
        assert_eq!(layout.slot_offset(1), 40);
        assert_eq!(layout.slot_offset(2), 48);
        assert_eq!(layout.payload_offset(1), 44);
        assert_eq!(layout.total_bytes(), 56);
    }

    #[test]
    fn odd_message_sizes_pack_slots_without_padding() {
        let layout = TopicLayout::new(5, 2).unwrap();
        assert_eq!(layout.slot_offset(1), 32 + 9);
        assert_eq!(layout.total_bytes(), 32 + 18);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert_eq!(
            TopicLayout::new(0, 3).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(
            TopicLayout::new(4, 0).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[test]
    fn header_fits_reserved_space() {
        assert_eq!(size_of::<TopicHeader>(), 12);
        assert_eq!(std::mem::align_of::<TopicHeader>(), 4);
    }

    #[test]
    fn views_read_and_write_through_the_buffer() {
        let layout = TopicLayout::new(5, 3).unwrap();
        // u64 backing keeps the header aligned.
        let mut backing = vec![0u64; layout.total_bytes().div_ceil(8)];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let region = unsafe { Region::from_raw(base, layout) };

        region.header().initialize(layout);
        assert_eq!(region.header().msg_size(), 5);
        assert_eq!(region.header().msg_count(), 3);
        assert_eq!(region.header().writer_cursor(), 0);

        let slot = region.slot(1);
        slot.set_reader_count(2);
        slot.write_payload(b"hello");
        assert_eq!(slot.reader_count(), 2);
        assert_eq!(region.slot(0).reader_count(), 0);
        assert_eq!(region.slot(2).reader_count(), 0);

        let mut out = [0u8; 5];
        slot.read_payload(&mut out);
        assert_eq!(&out, b"hello");

        let bytes = unsafe { std::slice::from_raw_parts(base.as_ptr(), layout.total_bytes()) };
        assert_eq!(&bytes[0..4], &5u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_ne_bytes());
        assert_eq!(&bytes[41..45], &2u32.to_ne_bytes());
        assert_eq!(&bytes[45..50], b"hello");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn slot_index_is_bounds_checked() {
        let layout = TopicLayout::new(4, 2).unwrap();
        let mut backing = vec![0u64; layout.total_bytes().div_ceil(8)];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let region = unsafe { Region::from_raw(base, layout) };
        let _ = region.slot(2);
    }
}
