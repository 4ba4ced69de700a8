//! Wrappers for the named POSIX objects a topic is built from: shared memory
//! segments and counting semaphores.
//!
//! Both types follow the same lifecycle: `exists`, exclusive `create`,
//! `open`, idempotent `close`, idempotent `remove`. Dropping a value closes
//! this process's handle but never removes the kernel-visible name.

mod error;
mod name;
mod segment;
mod semaphore;

pub use error::{Result, ShmError};
pub use name::{MAX_NAME_LEN, validate_name};
pub use segment::SharedSegment;
pub use semaphore::{NamedSemaphore, ScopedGuard, SemHandle};
