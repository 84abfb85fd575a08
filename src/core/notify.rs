//! Purpose: Wake a side blocked in a lock call as soon as its peer hands the segment over.
//! Exports: `WakeSemaphore`, `NotifyError`, `WaitOutcome`, `wake_semaphore_name`, `open_named`,
//!          `unlink_named`.
//! Role: Latency only; the lock re-reads the shared state word after every wait.
//! Invariants: One named semaphore per (segment path, side); names are stable across processes.
//! Invariants: Platforms without named semaphores report `NotifyError::Unavailable`.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::lock::Side;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug)]
pub(crate) enum NotifyError {
    Unavailable,
    Io(io::Error),
}

/// `am-` + 24 hex + `-h`/`-p`, under the 31-byte limit macOS puts on semaphore names.
pub(crate) fn wake_semaphore_name(segment_path: &Path, side: Side) -> String {
    let resolved = std::fs::canonicalize(segment_path);
    let path = resolved.as_deref().unwrap_or(segment_path);
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex: String = digest[..12].iter().map(|byte| format!("{byte:02x}")).collect();
    let suffix = match side {
        Side::Host => 'h',
        Side::Plugin => 'p',
    };
    format!("am-{hex}-{suffix}")
}

pub(crate) fn open_named(name: &str) -> Result<WakeSemaphore, NotifyError> {
    WakeSemaphore::open(name)
}

pub(crate) fn unlink_named(name: &str) {
    WakeSemaphore::unlink(name);
}

#[cfg(unix)]
pub(crate) use posix::WakeSemaphore;

#[cfg(not(unix))]
pub(crate) use unsupported::WakeSemaphore;

#[cfg(unix)]
mod posix {
    use std::ffi::CString;
    use std::io;
    use std::time::{Duration, Instant};

    use super::{NotifyError, WaitOutcome};

    pub(crate) struct WakeSemaphore {
        sem: *mut libc::sem_t,
    }

    impl WakeSemaphore {
        pub(super) fn open(name: &str) -> Result<Self, NotifyError> {
            let c_name = c_name(name)?;
            let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint;
            let sem = unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, mode, 0) };
            if sem == libc::SEM_FAILED {
                return Err(last_error());
            }
            Ok(Self { sem })
        }

        pub(super) fn unlink(name: &str) {
            if let Ok(c_name) = c_name(name) {
                unsafe {
                    libc::sem_unlink(c_name.as_ptr());
                }
            }
        }

        pub(crate) fn post(&self) -> Result<(), NotifyError> {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        /// Polls with `sem_trywait`; macOS has no `sem_timedwait`.
        pub(crate) fn wait(&self, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
            let deadline = Instant::now() + timeout;
            let nap = timeout.clamp(Duration::from_micros(100), Duration::from_millis(1));
            loop {
                if unsafe { libc::sem_trywait(self.sem) } == 0 {
                    return Ok(WaitOutcome::Signaled);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        if Instant::now() >= deadline {
                            return Ok(WaitOutcome::TimedOut);
                        }
                        std::thread::sleep(nap);
                    }
                    _ => return Err(classify(err)),
                }
            }
        }
    }

    impl Drop for WakeSemaphore {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
            }
        }
    }

    fn c_name(name: &str) -> Result<CString, NotifyError> {
        CString::new(format!("/{name}")).map_err(|_| NotifyError::Unavailable)
    }

    fn last_error() -> NotifyError {
        classify(io::Error::last_os_error())
    }

    fn classify(err: io::Error) -> NotifyError {
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::ENOTSUP) => NotifyError::Unavailable,
            _ => NotifyError::Io(err),
        }
    }
}

#[cfg(not(unix))]
mod unsupported {
    use std::time::Duration;

    use super::{NotifyError, WaitOutcome};

    pub(crate) struct WakeSemaphore;

    impl WakeSemaphore {
        pub(super) fn open(_name: &str) -> Result<Self, NotifyError> {
            Err(NotifyError::Unavailable)
        }

        pub(super) fn unlink(_name: &str) {}

        pub(crate) fn post(&self) -> Result<(), NotifyError> {
            Err(NotifyError::Unavailable)
        }

        pub(crate) fn wait(&self, _timeout: Duration) -> Result<WaitOutcome, NotifyError> {
            Err(NotifyError::Unavailable)
        }
    }
}
