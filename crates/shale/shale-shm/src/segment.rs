//! Named POSIX shared memory segments.
//!
//! A [`SharedSegment`] names one `shm_open` object. Creating it and mapping
//! it are separate steps: the kernel object outlives every process that maps
//! it, and only [`SharedSegment::remove`] deletes the name.

use crate::error::{Result, ShmError};
use crate::name::validate_name;
use memmap2::{MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::ptr::NonNull;

/// Permission bits for new objects, before the process umask is applied.
pub(crate) const OBJECT_MODE: libc::mode_t = 0o666;

/// A live read-write mapping of the segment.
struct Mapping {
    _file: File,
    _mmap: MmapMut,
    base: NonNull<u8>,
}

pub struct SharedSegment {
    name: String,
    c_name: CString,
    size: usize,
    mapping: Option<Mapping>,
}

// SAFETY: the mapping is plain shared memory. Concurrent access to its
// contents is coordinated by the callers through named semaphores.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Describes a segment of `size` bytes called `name`. Touches no OS state.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let c_name = validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            c_name,
            size,
            mapping: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes. After an `open` that tolerated a mismatch this is the
    /// size reported by the OS.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// Start of the mapped region, if mapped.
    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.mapping.as_ref().map(|m| m.base)
    }

    /// Probes for the kernel object without creating it.
    pub fn exists(&self) -> bool {
        if self.is_open() {
            return true;
        }
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(self.c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return false;
        }
        // SAFETY: fd was just returned by shm_open and is owned here.
        unsafe { libc::close(fd) };
        true
    }

    /// Creates the kernel object exclusively and sizes it to `size` bytes.
    ///
    /// The new region reads as zeroes. The object is not mapped; call
    /// [`open`](Self::open) for that.
    pub fn create(&self) -> Result<()> {
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                self.c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                OBJECT_MODE,
            )
        };
        if fd < 0 {
            return Err(ShmError::from_open(
                "shm_open",
                &self.name,
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: fd is a fresh descriptor we own.
        let file = unsafe { File::from_raw_fd(fd) };

        if let Err(err) = file.set_len(self.size as u64) {
            drop(file);
            // SAFETY: c_name is valid; the object was created by us above.
            unsafe { libc::shm_unlink(self.c_name.as_ptr()) };
            return Err(ShmError::os("ftruncate", &self.name, err));
        }

        tracing::debug!(name = %self.name, size = self.size, "created shared segment");
        Ok(())
    }

    /// Maps the existing segment read-write into this process.
    ///
    /// With `ignore_size_mismatch` the segment adopts the size reported by
    /// the OS; otherwise a different size fails with `SizeMismatch`.
    /// Opening an already mapped segment is a no-op.
    pub fn open(&mut self, ignore_size_mismatch: bool) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(self.c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::from_open(
                "shm_open",
                &self.name,
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: fd is a fresh descriptor we own.
        let file = unsafe { File::from_raw_fd(fd) };

        let actual = file
            .metadata()
            .map_err(|err| ShmError::os("fstat", &self.name, err))?
            .len() as usize;

        if actual != self.size {
            if !ignore_size_mismatch {
                return Err(ShmError::SizeMismatch {
                    name: self.name.clone(),
                    expected: self.size,
                    actual,
                });
            }
            self.size = actual;
        }

        if self.size == 0 {
            return Err(ShmError::os(
                "mmap",
                &self.name,
                io::Error::new(io::ErrorKind::InvalidData, "segment is empty"),
            ));
        }

        // SAFETY: the descriptor refers to a shared memory object of at least
        // `size` bytes. Other processes mutate it concurrently; every access
        // through `base` goes through raw pointers, never through `&[u8]`.
        let mut mmap = unsafe { MmapOptions::new().len(self.size).map_mut(&file) }
            .map_err(|err| ShmError::os("mmap", &self.name, err))?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            ShmError::os(
                "mmap",
                &self.name,
                io::Error::other("mapping returned a null address"),
            )
        })?;

        self.mapping = Some(Mapping {
            _file: file,
            _mmap: mmap,
            base,
        });
        Ok(())
    }

    /// Unmaps the segment. Safe to call on an unmapped segment.
    pub fn close(&mut self) {
        self.mapping = None;
    }

    /// Deletes the kernel-visible name. Processes that still map the
    /// segment keep their mapping until they close it.
    ///
    /// Removing a name that does not exist succeeds.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(self.c_name.as_ptr()) } == 0 {
            tracing::debug!(name = %self.name, "removed shared segment");
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(ShmError::os("shm_unlink", &self.name, err))
    }
}
