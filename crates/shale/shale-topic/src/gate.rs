//! Per-slot readers/writer exclusion built from named semaphores.
//!
//! Every slot has two semaphores:
//! - a **reader mutex** (count 1) guarding the slot's reader count, and
//! - a **write permission** (count 1 when no reader group holds the slot).
//!
//! A writer takes the write permission for the duration of its copy. The
//! first reader of a group takes it on behalf of the whole group and the
//! last reader to leave gives it back, so the write permission behaves as an
//! inter-process readers/writer lock on the slot.
//!
//! # Protocol
//!
//! ```text
//! ReaderGate::enter              ReaderGate::drop
//!   lock reader mutex              lock reader mutex
//!   count += 1                     count -= 1
//!   if 0 -> 1: wait write perm     if 1 -> 0: post write perm
//!   unlock reader mutex            unlock reader mutex
//!
//! WriterRotation::enter          WriterRotation::drop
//!   lock cursor                    post write perm[slot]
//!   slot = cursor
//!   cursor = (cursor + 1) % N
//!   unlock cursor
//!   wait write perm[slot]
//! ```
//!
//! A process that dies between enter and drop leaves its semaphore taken.
//! Nothing recovers it: the slot stalls until the topic is removed and
//! created again.

use crate::shm_layout::{SlotView, TopicHeader};
use shale_shm::{NamedSemaphore, ScopedGuard, SemHandle};
use std::io;
use std::num::NonZeroU32;

/// Borrowed, fixed-size array of per-slot semaphores.
#[derive(Clone, Copy)]
pub struct SemaphoreSet<'a> {
    sems: &'a [NamedSemaphore],
}

impl<'a> SemaphoreSet<'a> {
    pub fn new(sems: &'a [NamedSemaphore]) -> Self {
        Self { sems }
    }

    pub fn len(&self) -> usize {
        self.sems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sems.is_empty()
    }

    /// Handle for slot `index`.
    pub fn get(&self, index: usize) -> io::Result<SemHandle<'a>> {
        match self.sems.get(index) {
            Some(sem) => sem.handle(),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("slot {index} out of range for {} semaphores", self.sems.len()),
            )),
        }
    }
}

/// Reader occupancy of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No reader holds the slot; writers may take it.
    Free,
    /// This many readers share the slot's write permission.
    Claimed(NonZeroU32),
}

impl SlotState {
    pub fn from_count(count: u32) -> Self {
        match NonZeroU32::new(count) {
            Some(n) => Self::Claimed(n),
            None => Self::Free,
        }
    }

    pub fn count(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Claimed(n) => n.get(),
        }
    }

    /// A reader arrives. The flag is set when this reader must take the
    /// write permission for the group (the `Free -> Claimed(1)` edge).
    pub fn enter(self) -> (Self, bool) {
        match self {
            Self::Free => (Self::Claimed(NonZeroU32::MIN), true),
            Self::Claimed(n) => (Self::Claimed(n.saturating_add(1)), false),
        }
    }

    /// A reader leaves. The flag is set when this reader must hand the write
    /// permission back (the `Claimed(1) -> Free` edge).
    ///
    /// Leaving a free slot is a protocol violation; it stays free and
    /// releases nothing.
    pub fn leave(self) -> (Self, bool) {
        match self {
            Self::Free => (Self::Free, false),
            Self::Claimed(n) => match NonZeroU32::new(n.get() - 1) {
                Some(rest) => (Self::Claimed(rest), false),
                None => (Self::Free, true),
            },
        }
    }
}

/// A reader's claim on one slot, released on drop.
#[must_use = "the slot is released as soon as the gate is dropped"]
pub struct ReaderGate<'a> {
    reader_mutex: SemHandle<'a>,
    slot: SlotView<'a>,
    write_permission: SemHandle<'a>,
}

impl<'a> ReaderGate<'a> {
    pub fn enter(
        reader_mutex: SemHandle<'a>,
        slot: SlotView<'a>,
        write_permission: SemHandle<'a>,
    ) -> io::Result<Self> {
        let _lock = ScopedGuard::acquire(reader_mutex)?;
        let (next, claims) = SlotState::from_count(slot.reader_count()).enter();
        if claims {
            write_permission.acquire()?;
        }
        slot.set_reader_count(next.count());

        Ok(Self {
            reader_mutex,
            slot,
            write_permission,
        })
    }
}

impl Drop for ReaderGate<'_> {
    fn drop(&mut self) {
        let _lock = match ScopedGuard::acquire(self.reader_mutex) {
            Ok(lock) => lock,
            Err(err) => {
                tracing::warn!("reader gate could not lock its slot on exit: {}", err);
                return;
            }
        };
        let state = SlotState::from_count(self.slot.reader_count());
        if state == SlotState::Free {
            tracing::warn!("reader gate left a slot with no registered readers");
        }
        let (next, releases) = state.leave();
        self.slot.set_reader_count(next.count());
        if releases {
            if let Err(err) = self.write_permission.release() {
                tracing::warn!("reader gate could not return the slot: {}", err);
            }
        }
    }
}

/// A publisher's hold on the slot it was assigned, released on drop.
#[must_use = "the slot is released as soon as the rotation is dropped"]
pub struct WriterRotation<'a> {
    slot: u32,
    write_permission: SemHandle<'a>,
}

impl<'a> WriterRotation<'a> {
    /// Takes the next slot in rotation and blocks until no reader holds it.
    pub fn enter(
        cursor_lock: SemHandle<'a>,
        header: &TopicHeader,
        pool: SemaphoreSet<'a>,
    ) -> io::Result<Self> {
        let slot_count = u32::try_from(pool.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many slots"))?;
        if slot_count == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty slot pool"));
        }

        let slot = {
            let _lock = ScopedGuard::acquire(cursor_lock)?;
            let slot = header.writer_cursor();
            header.set_writer_cursor((slot + 1) % slot_count);
            slot
        };

        let write_permission = pool.get(slot as usize)?;
        write_permission.acquire()?;
        Ok(Self {
            slot,
            write_permission,
        })
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for WriterRotation<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.write_permission.release() {
            tracing::warn!("writer could not return slot {}: {}", self.slot, err);
        }
    }
}
