//! Named POSIX counting semaphores and scoped acquisition.
//!
//! [`NamedSemaphore`] owns the lifecycle of one `sem_open` object the same
//! way [`SharedSegment`](crate::SharedSegment) owns a segment: probing,
//! exclusive creation, opening a handle, closing it, and unlinking the name.
//! Blocking happens through a borrowed [`SemHandle`], and [`ScopedGuard`]
//! ties one acquire/release pair to a scope.
//!
//! Acquire and release are visible across processes: the counter lives in a
//! kernel-backed shared mapping, not in this process.

use crate::error::{Result, ShmError};
use crate::name::validate_name;
use crate::segment::OBJECT_MODE;
use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

pub struct NamedSemaphore {
    name: String,
    c_name: CString,
    sem: Option<NonNull<libc::sem_t>>,
}

// SAFETY: POSIX semaphores may be operated on from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Describes the semaphore called `name`. Touches no OS state.
    pub fn new(name: &str) -> Result<Self> {
        let c_name = validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            c_name,
            sem: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.sem.is_some()
    }

    /// Probes for the kernel object without creating it.
    pub fn exists(&self) -> bool {
        if self.is_open() {
            return true;
        }
        match self.raw_open() {
            Ok(sem) => {
                // SAFETY: sem was just returned by sem_open.
                unsafe { libc::sem_close(sem.as_ptr()) };
                true
            }
            Err(_) => false,
        }
    }

    /// Creates the semaphore exclusively with `initial` as its count.
    ///
    /// The handle used for creation is closed again; call
    /// [`open`](Self::open) to use the semaphore.
    pub fn create(&self, initial: u32) -> Result<()> {
        // SAFETY: c_name is a valid NUL-terminated string; mode and value are
        // passed as the unsigned ints sem_open reads from its varargs.
        let sem = unsafe {
            libc::sem_open(
                self.c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                OBJECT_MODE as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::from_open(
                "sem_open",
                &self.name,
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: sem is a valid handle returned above.
        unsafe { libc::sem_close(sem) };

        tracing::debug!(name = %self.name, initial, "created semaphore");
        Ok(())
    }

    /// Opens a handle to an existing semaphore. No-op when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.sem = Some(self.raw_open()?);
        Ok(())
    }

    /// Closes this process's handle. Safe to call when not open.
    pub fn close(&mut self) {
        if let Some(sem) = self.sem.take() {
            // SAFETY: sem came from sem_open and is closed exactly once.
            unsafe { libc::sem_close(sem.as_ptr()) };
        }
    }

    /// Deletes the kernel-visible name. Open handles elsewhere stay usable.
    ///
    /// Removing a name that does not exist succeeds.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(self.c_name.as_ptr()) } == 0 {
            tracing::debug!(name = %self.name, "removed semaphore");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(ShmError::os("sem_unlink", &self.name, err))
    }

    /// Borrows the open handle for blocking operations.
    ///
    /// Fails with `NotConnected` if the semaphore has not been opened.
    pub fn handle(&self) -> io::Result<SemHandle<'_>> {
        match self.sem {
            Some(sem) => Ok(SemHandle {
                sem,
                _owner: PhantomData,
            }),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("semaphore '{}' is not open", self.name),
            )),
        }
    }

    fn raw_open(&self) -> Result<NonNull<libc::sem_t>> {
        // SAFETY: c_name is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(self.c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::from_open(
                "sem_open",
                &self.name,
                io::Error::last_os_error(),
            ));
        }
        NonNull::new(sem).ok_or_else(|| {
            ShmError::os(
                "sem_open",
                &self.name,
                io::Error::other("sem_open returned null"),
            )
        })
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Non-owning handle to an open semaphore, valid while its owner is.
#[derive(Clone, Copy)]
pub struct SemHandle<'a> {
    sem: NonNull<libc::sem_t>,
    _owner: PhantomData<&'a NamedSemaphore>,
}

impl SemHandle<'_> {
    /// Blocks while the count is zero, then decrements it.
    ///
    /// Retries when a signal interrupts the wait.
    pub fn acquire(&self) -> io::Result<()> {
        loop {
            // SAFETY: the owner keeps the handle open for 'a.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Decrements the count if it is positive; never blocks.
    pub fn try_acquire(&self) -> io::Result<bool> {
        loop {
            // SAFETY: the owner keeps the handle open for 'a.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Increments the count, waking at most one blocked acquirer.
    pub fn release(&self) -> io::Result<()> {
        // SAFETY: the owner keeps the handle open for 'a.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Current count. Only a snapshot; it may change immediately.
    pub fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: the owner keeps the handle open for 'a; value is writable.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Holds one unit of a semaphore's count for the lifetime of the guard.
///
/// Not re-entrant: acquiring the same semaphore twice on one thread with a
/// count of one deadlocks.
#[must_use = "the semaphore is released as soon as the guard is dropped"]
pub struct ScopedGuard<'a> {
    sem: SemHandle<'a>,
}

impl<'a> ScopedGuard<'a> {
    /// Blocks until the semaphore is acquired.
    pub fn acquire(sem: SemHandle<'a>) -> io::Result<Self> {
        sem.acquire()?;
        Ok(Self { sem })
    }
}

impl Drop for ScopedGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sem.release() {
            tracing::warn!("semaphore release failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_name(tag: &str) -> String {
        format!("/shale-sem-{tag}-{}", std::process::id())
    }

    fn create_or_skip(sem: &NamedSemaphore, initial: u32, test: &str) -> bool {
        match sem.create(initial) {
            Ok(()) => true,
            Err(err) if err.is_permission_denied() => {
                eprintln!("Skipping {test}: {err}");
                false
            }
            Err(err) => panic!("create failed: {err}"),
        }
    }

    #[test]
    fn lifecycle_mirrors_segments() {
        let mut sem = NamedSemaphore::new(&test_name("life")).unwrap();
        let _ = sem.remove();
        assert!(!sem.exists());
        assert!(matches!(sem.open(), Err(ShmError::NotFound { .. })));

        if !create_or_skip(&sem, 1, "lifecycle_mirrors_segments") {
            return;
        }
        assert!(sem.exists());
        assert!(matches!(sem.create(1), Err(ShmError::AlreadyExists { .. })));

        sem.open().unwrap();
        sem.open().unwrap();
        assert_eq!(sem.handle().unwrap().value().unwrap(), 1);

        sem.close();
        sem.close();
        assert_eq!(
            sem.handle().err().map(|e| e.kind()),
            Some(io::ErrorKind::NotConnected)
        );

        sem.remove().unwrap();
        sem.remove().unwrap();
        assert!(!sem.exists());
    }

    #[test]
    fn guard_releases_on_every_exit_path() {
        let mut sem = NamedSemaphore::new(&test_name("guard")).unwrap();
        let _ = sem.remove();
        if !create_or_skip(&sem, 1, "guard_releases_on_every_exit_path") {
            return;
        }
        sem.open().unwrap();
        let handle = sem.handle().unwrap();

        {
            let _guard = ScopedGuard::acquire(handle).unwrap();
            assert_eq!(handle.value().unwrap(), 0);
            assert!(!handle.try_acquire().unwrap());
        }
        assert_eq!(handle.value().unwrap(), 1);

        let early: io::Result<()> = (|| {
            let _guard = ScopedGuard::acquire(handle)?;
            Err(io::Error::other("bail out"))
        })();
        assert!(early.is_err());
        assert_eq!(handle.value().unwrap(), 1);

        sem.remove().unwrap();
    }

    #[test]
    fn acquire_blocks_until_released_by_another_handle() {
        let name = test_name("block");
        let mut holder = NamedSemaphore::new(&name).unwrap();
        let _ = holder.remove();
        if !create_or_skip(&holder, 0, "acquire_blocks_until_released_by_another_handle") {
            return;
        }
        holder.open().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let mut sem = NamedSemaphore::new(&name).unwrap();
            sem.open().unwrap();
            sem.handle().unwrap().acquire().unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        holder.handle().unwrap().release().unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter never woke up");
        waiter.join().unwrap();

        holder.remove().unwrap();
    }
}
