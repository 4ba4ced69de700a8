//! SIGINT / SIGTERM latch.
//!
//! The handler only stores to an atomic. A second signal while the flag is
//! already set exits immediately with status 130, so a loop stuck in a
//! blocking semaphore wait can still be killed from the terminal.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        unsafe { libc::_exit(130) };
    }
}

/// Token polled by long-running loops.
#[derive(Debug, Clone, Copy)]
pub struct Interrupt {
    _installed: (),
}

impl Interrupt {
    /// Installs the handler for `SIGINT` and `SIGTERM`. Installing twice is
    /// harmless.
    pub fn install() -> io::Result<Self> {
        for signum in [libc::SIGINT, libc::SIGTERM] {
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;

            let rc = unsafe {
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(signum, &action, std::ptr::null_mut())
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { _installed: () })
    }

    pub fn is_set(&self) -> bool {
        INTERRUPTED.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_signal_sets_the_flag() {
        let interrupt = Interrupt::install().unwrap();
        assert!(!interrupt.is_set());

        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
        assert!(interrupt.is_set());
        assert!(Interrupt::install().unwrap().is_set());
    }
}
