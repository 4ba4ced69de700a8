//! Broadcast publish/subscribe channel between processes over one shared
//! memory ring and named semaphores.
//!
//! # Design
//! - **Publishers**: any number; each `publish` is assigned the next slot in
//!   strict rotation through a shared writer cursor and copies its payload
//!   while holding that slot's write permission.
//! - **Subscribers**: any number; each keeps a private read cursor and reads
//!   every slot in order under a [`ReaderGate`].
//!
//! There is no backpressure: a subscriber that falls more than `msg_count`
//! messages behind reads slots that have already been overwritten. The
//! protocol only keeps a writer out of a slot while readers are inside it.
//!
//! # Lifecycle
//! The kernel objects outlive every process. Dropping or closing a [`Topic`]
//! only unmaps and closes this process's handles; [`Topic::remove`] is the
//! only way to delete the names.
//!
//! # Liveness
//! A process killed inside `publish` or `receive` leaves a semaphore taken.
//! That slot then blocks every later writer or first reader until the topic
//! is removed and created again.

use crate::error::{Result, TopicError};
use crate::gate::{ReaderGate, SemaphoreSet, WriterRotation};
use crate::names::TopicNames;
use crate::shm_layout::{Region, TopicLayout, header_of};
use shale_shm::{NamedSemaphore, ScopedGuard, SharedSegment, ShmError};
use std::ptr::NonNull;

/// What `attach_only` does when the stored geometry differs from the
/// caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Fail with `SizeMismatch` / `CountMismatch`.
    #[default]
    Reject,
    /// Adopt the stored `msg_size` / `msg_count`.
    Adopt,
}

pub struct Topic {
    names: TopicNames,
    layout: TopicLayout,
    /// Owns the mapping that `base` points into.
    segment: SharedSegment,
    base: NonNull<u8>,
    cursor_lock: NamedSemaphore,
    reader_mutexes: Vec<NamedSemaphore>,
    write_permissions: Vec<NamedSemaphore>,
    read_cursor: u32,
}

// SAFETY: `base` points into the mapping owned by `segment`, which does not
// move when the Topic does. Shared state is only touched under semaphores.
unsafe impl Send for Topic {}
unsafe impl Sync for Topic {}

impl Topic {
    /// Creates a new topic; fails with `AlreadyExists` if the segment exists.
    ///
    /// Objects are created in order segment, semaphores, header. If a step
    /// fails the objects created so far are left in place for
    /// [`Topic::remove`]; nothing is rolled back.
    pub fn create_or_fail(name: &str, msg_size: u32, msg_count: u32) -> Result<Self> {
        let layout = TopicLayout::new(msg_size, msg_count)?;
        let names = TopicNames::new(name)?;

        let mut segment = SharedSegment::new(names.segment(), layout.total_bytes())?;
        if segment.exists() {
            return Err(TopicError::AlreadyExists {
                name: name.to_string(),
            });
        }
        segment.create()?;
        segment.open(false)?;

        let cursor_lock = create_semaphore(&names.cursor(), 1)?;
        let mut reader_mutexes = Vec::with_capacity(msg_count as usize);
        let mut write_permissions = Vec::with_capacity(msg_count as usize);
        for slot in 0..msg_count {
            reader_mutexes.push(create_semaphore(&names.reader_mutex(slot), 1)?);
            write_permissions.push(create_semaphore(&names.write_permission(slot), 1)?);
        }

        let region = Region::new(&segment, layout)
            .ok_or_else(|| TopicError::corrupt(name, "segment smaller than requested"))?;
        for slot in 0..msg_count {
            region.slot(slot).set_reader_count(0);
        }
        region.header().initialize(layout);

        let base = segment
            .base()
            .ok_or_else(|| TopicError::corrupt(name, "segment is not mapped"))?;

        tracing::debug!(name, msg_size, msg_count, "created topic");
        Ok(Self {
            names,
            layout,
            segment,
            base,
            cursor_lock,
            reader_mutexes,
            write_permissions,
            read_cursor: 0,
        })
    }

    /// Attaches if the topic exists, otherwise creates it.
    ///
    /// An existing topic must match `msg_size` and `msg_count` exactly.
    ///
    /// A segment whose header is not written yet yields `Uninitialized`
    /// without retrying. That is the state while another process is still
    /// inside `create_or_fail`, or after a creator died there; callers retry
    /// after a pause, or [`Topic::remove`] the name if no creator is alive.
    pub fn attach_or_create(name: &str, msg_size: u32, msg_count: u32) -> Result<Self> {
        if Self::exists(name) {
            return Self::attach_only(name, msg_size, msg_count, MismatchPolicy::Reject);
        }
        match Self::create_or_fail(name, msg_size, msg_count) {
            // Lost a creation race; the winner's topic is the one to use.
            Err(TopicError::AlreadyExists { .. }) => {
                Self::attach_only(name, msg_size, msg_count, MismatchPolicy::Reject)
            }
            other => other,
        }
    }

    /// Attaches to an existing topic, checking its geometry against
    /// `msg_size` and `msg_count` under `policy`.
    pub fn attach_only(
        name: &str,
        msg_size: u32,
        msg_count: u32,
        policy: MismatchPolicy,
    ) -> Result<Self> {
        let expected = TopicLayout::new(msg_size, msg_count)?;
        Self::attach(name, Some((expected, policy)))
    }

    /// Attaches to an existing topic, taking its geometry from the header.
    pub fn attach_any(name: &str) -> Result<Self> {
        Self::attach(name, None)
    }

    /// True if the topic's shared segment exists.
    pub fn exists(name: &str) -> bool {
        SharedSegment::new(name, 0)
            .map(|segment| segment.exists())
            .unwrap_or(false)
    }

    /// Deletes every kernel object of the topic `name`, whether or not some
    /// process still has it open. Missing objects are skipped, so removing
    /// an absent topic succeeds.
    ///
    /// The slot count comes from the header when the segment still exists;
    /// otherwise per-slot semaphores are probed until a gap is found. Every
    /// object is attempted; the first failure is returned afterwards.
    pub fn remove(name: &str) -> Result<()> {
        let names = TopicNames::base_only(name)?;
        let mut segment = SharedSegment::new(names.segment(), 0)?;
        let msg_count = match segment.open(true) {
            Ok(()) => header_of(&segment).map(|h| h.msg_count()).filter(|&n| n > 0),
            Err(_) => None,
        };
        segment.close();

        let mut first_error: Option<ShmError> = None;
        let mut record = |err: ShmError| {
            tracing::warn!("failed to remove topic object: {}", err);
            first_error.get_or_insert(err);
        };
        let mut unlink = |sem_name: String| -> bool {
            match NamedSemaphore::new(&sem_name) {
                Ok(sem) if !sem.exists() => false,
                Ok(sem) => {
                    if let Err(err) = sem.remove() {
                        record(err);
                    }
                    true
                }
                Err(err) => {
                    record(err);
                    false
                }
            }
        };

        unlink(names.cursor());
        match msg_count {
            Some(count) => {
                for slot in 0..count {
                    unlink(names.reader_mutex(slot));
                    unlink(names.write_permission(slot));
                }
            }
            None => {
                for slot in 0.. {
                    let reader = unlink(names.reader_mutex(slot));
                    let writer = unlink(names.write_permission(slot));
                    if !reader && !writer {
                        break;
                    }
                }
            }
        }

        if let Err(err) = segment.remove() {
            tracing::warn!("failed to remove {}: {}", segment.name(), err);
            first_error.get_or_insert(err);
        }

        tracing::debug!(name, "removed topic");
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Unmaps the segment and closes every semaphore handle. The topic
    /// itself is left in place.
    pub fn close(self) {
        drop(self);
    }

    /// Closes this instance and then removes the topic's kernel objects.
    pub fn remove_self(self) -> Result<()> {
        let name = self.names.segment().to_string();
        drop(self);
        Self::remove(&name)
    }

    pub fn name(&self) -> &str {
        self.names.segment()
    }

    pub fn msg_size(&self) -> u32 {
        self.layout.msg_size()
    }

    pub fn msg_count(&self) -> u32 {
        self.layout.msg_count()
    }

    /// Slot the next `receive` on this instance reads.
    pub fn read_cursor(&self) -> u32 {
        self.read_cursor
    }

    /// Slot the next `publish` from any process will be assigned.
    pub fn writer_cursor(&self) -> Result<u32> {
        let _lock = ScopedGuard::acquire(self.cursor_lock.handle()?)?;
        Ok(self.region().header().writer_cursor())
    }

    /// Moves the read cursor to the writer cursor, so the next `receive`
    /// reads the slot the next `publish` fills.
    ///
    /// A stored cursor outside `0..msg_count` is reported as `Corrupt` and
    /// leaves the read cursor unchanged.
    pub fn follow_writer(&mut self) -> Result<()> {
        let cursor = self.writer_cursor()?;
        if cursor >= self.layout.msg_count() {
            return Err(TopicError::corrupt(
                self.name(),
                format!(
                    "writer cursor {cursor} is outside {} slots",
                    self.layout.msg_count()
                ),
            ));
        }
        self.read_cursor = cursor;
        Ok(())
    }

    /// Copies `payload` into the next slot in rotation.
    ///
    /// `payload` must be exactly `msg_size` bytes. Blocks while readers hold
    /// the assigned slot. The message is visible to subscribers once this
    /// returns.
    pub fn publish(&self, payload: &[u8]) -> Result<()> {
        self.check_len(payload.len())?;
        let region = self.region();

        let rotation = WriterRotation::enter(
            self.cursor_lock.handle()?,
            region.header(),
            SemaphoreSet::new(&self.write_permissions),
        )?;
        region.slot(rotation.slot()).write_payload(payload);
        drop(rotation);
        Ok(())
    }

    /// Copies the slot at the read cursor into `out` and advances the cursor.
    ///
    /// `out` must be exactly `msg_size` bytes. Never waits for new data: a
    /// slot that was never published reads as zeroes.
    pub fn receive(&mut self, out: &mut [u8]) -> Result<()> {
        self.check_len(out.len())?;
        let index = self.read_cursor;
        {
            let region = self.region();
            let slot = region.slot(index);
            let _gate = ReaderGate::enter(
                SemaphoreSet::new(&self.reader_mutexes).get(index as usize)?,
                slot,
                SemaphoreSet::new(&self.write_permissions).get(index as usize)?,
            )?;
            slot.read_payload(out);
        }
        self.read_cursor = (index + 1) % self.layout.msg_count();
        Ok(())
    }

    /// `receive` into a freshly allocated buffer.
    pub fn receive_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.layout.msg_size() as usize];
        self.receive(&mut out)?;
        Ok(out)
    }

    fn attach(name: &str, expected: Option<(TopicLayout, MismatchPolicy)>) -> Result<Self> {
        let names = TopicNames::new(name)?;
        let size_hint = expected.map(|(layout, _)| layout.total_bytes()).unwrap_or(0);

        let mut segment = SharedSegment::new(names.segment(), size_hint)?;
        segment.open(true)?;

        let header = header_of(&segment)
            .ok_or_else(|| TopicError::corrupt(name, "segment too small for a header"))?;
        let (stored_size, stored_count) = (header.msg_size(), header.msg_count());
        if stored_count == 0 {
            return Err(TopicError::Uninitialized {
                name: name.to_string(),
            });
        }
        let layout = TopicLayout::new(stored_size, stored_count)
            .map_err(|err| TopicError::corrupt(name, err.to_string()))?;

        if let Some((wanted, policy)) = expected {
            check_geometry(name, wanted, layout, policy)?;
        }

        if segment.size() < layout.total_bytes() {
            return Err(TopicError::corrupt(
                name,
                format!(
                    "segment holds {} bytes, header describes {}",
                    segment.size(),
                    layout.total_bytes()
                ),
            ));
        }

        let cursor_lock = open_semaphore(&names.cursor())?;
        let mut reader_mutexes = Vec::with_capacity(stored_count as usize);
        let mut write_permissions = Vec::with_capacity(stored_count as usize);
        for slot in 0..stored_count {
            reader_mutexes.push(open_semaphore(&names.reader_mutex(slot))?);
            write_permissions.push(open_semaphore(&names.write_permission(slot))?);
        }

        let base = segment
            .base()
            .ok_or_else(|| TopicError::corrupt(name, "segment is not mapped"))?;

        tracing::debug!(
            name,
            msg_size = stored_size,
            msg_count = stored_count,
            "attached to topic"
        );
        Ok(Self {
            names,
            layout,
            segment,
            base,
            cursor_lock,
            reader_mutexes,
            write_permissions,
            read_cursor: 0,
        })
    }

    fn region(&self) -> Region<'_> {
        // SAFETY: `base` and `layout` were validated against `segment` when
        // this Topic was built, and `segment` stays mapped while `self` lives.
        unsafe { Region::from_raw(self.base, self.layout) }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let expected = self.layout.msg_size() as usize;
        if len != expected {
            return Err(TopicError::PayloadLength {
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.names.segment())
            .field("msg_size", &self.layout.msg_size())
            .field("msg_count", &self.layout.msg_count())
            .field("segment_bytes", &self.segment.size())
            .field("read_cursor", &self.read_cursor)
            .finish()
    }
}

fn check_geometry(
    name: &str,
    wanted: TopicLayout,
    stored: TopicLayout,
    policy: MismatchPolicy,
) -> Result<()> {
    if wanted == stored {
        return Ok(());
    }
    if policy == MismatchPolicy::Adopt {
        tracing::debug!(
            name,
            msg_size = stored.msg_size(),
            msg_count = stored.msg_count(),
            "adopting stored topic geometry"
        );
        return Ok(());
    }
    if wanted.msg_size() != stored.msg_size() {
        return Err(TopicError::SizeMismatch {
            expected: wanted.msg_size(),
            actual: stored.msg_size(),
        });
    }
    Err(TopicError::CountMismatch {
        expected: wanted.msg_count(),
        actual: stored.msg_count(),
    })
}

/// Creates `name` fresh with `initial` and opens it.
///
/// A semaphore left over from a topic that was never removed is unlinked
/// and created again.
fn create_semaphore(name: &str, initial: u32) -> Result<NamedSemaphore> {
    let mut sem = NamedSemaphore::new(name)?;
    match sem.create(initial) {
        Ok(()) => {}
        Err(ShmError::AlreadyExists { .. }) => {
            tracing::warn!(name, "replacing stale semaphore");
            sem.remove()?;
            sem.create(initial)?;
        }
        Err(err) => return Err(err.into()),
    }
    sem.open()?;
    Ok(sem)
}

fn open_semaphore(name: &str) -> Result<NamedSemaphore> {
    let mut sem = NamedSemaphore::new(name)?;
    sem.open()?;
    Ok(sem)
}
