//! Hosted system threads
//!
//! Threads are host OS threads. Each created thread carries an alert flag
//! that [`alert_thread`] raises and [`sleep`] consumes.

use std::cell::OnceCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{ExitStatus, SleepOutcome, ThreadError};

#[derive(Debug, Default)]
struct ThreadShared {
    alerted: AtomicBool,
}

std::thread_local! {
    static CURRENT: OnceCell<Arc<ThreadShared>> = const { OnceCell::new() };
}

fn current_shared() -> Arc<ThreadShared> {
    CURRENT.with(|current| Arc::clone(current.get_or_init(Arc::default)))
}

/// Unwind payload carrying the status passed to [`exit_thread`]
struct ThreadExit(ExitStatus);

/// Handle to a created system thread
#[derive(Debug)]
pub struct ThreadHandle {
    inner: JoinHandle<ExitStatus>,
    shared: Arc<ThreadShared>,
}

impl ThreadHandle {
    /// Host thread identifier
    pub fn id(&self) -> thread::ThreadId {
        self.inner.thread().id()
    }

    /// Whether the thread has finished running
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Create a system thread running `start`.
///
/// The thread's exit status is `start`'s return value, or the status given
/// to [`exit_thread`] if it exits early.
pub fn create_thread<F>(start: F) -> Result<ThreadHandle, ThreadError>
where
    F: FnOnce() -> ExitStatus + Send + 'static,
{
    let shared = Arc::new(ThreadShared::default());
    let thread_shared = Arc::clone(&shared);

    let inner = thread::Builder::new()
        .name("xpf-system".into())
        .spawn(move || {
            CURRENT.with(|current| {
                let _ = current.set(thread_shared);
            });

            match panic::catch_unwind(AssertUnwindSafe(start)) {
                Ok(status) => status,
                Err(payload) => match payload.downcast::<ThreadExit>() {
                    Ok(exit) => exit.0,
                    Err(payload) => panic::resume_unwind(payload),
                },
            }
        })
        .map_err(|e| {
            log::error!("Failed to create system thread: {}", e);
            ThreadError::CreationFailed
        })?;

    log::trace!("Created system thread {:?}", inner.thread().id());
    Ok(ThreadHandle { inner, shared })
}

/// Terminate the calling thread with `status`.
///
/// Must be called on a thread created by [`create_thread`]. Destructors of
/// the thread's live locals run on the way out.
pub fn exit_thread(status: ExitStatus) -> ! {
    panic::resume_unwind(Box::new(ThreadExit(status)))
}

/// Wait for `handle`'s thread to finish and return its exit status
pub fn join_thread(handle: ThreadHandle) -> Result<ExitStatus, ThreadError> {
    let id = handle.id();
    handle.inner.join().map_err(|_| {
        log::warn!("System thread {:?} terminated abnormally", id);
        ThreadError::Panicked
    })
}

/// Alert `handle`'s thread, ending its current or next alertable sleep
pub fn alert_thread(handle: &ThreadHandle) {
    handle.shared.alerted.store(true, Ordering::SeqCst);
    handle.inner.thread().unpark();
}

/// Whether the calling thread has a pending alert. Does not consume it.
pub fn current_thread_alerted() -> bool {
    current_shared().alerted.load(Ordering::SeqCst)
}

/// Alertable sleep for `ms` milliseconds.
///
/// Returns early with [`SleepOutcome::Alerted`] if the thread is alerted,
/// including an alert raised before the call.
pub fn sleep(ms: u64) -> SleepOutcome {
    let shared = current_shared();
    let deadline = Instant::now() + Duration::from_millis(ms);

    loop {
        if shared.alerted.swap(false, Ordering::SeqCst) {
            return SleepOutcome::Alerted;
        }

        let now = Instant::now();
        if now >= deadline {
            return SleepOutcome::Elapsed;
        }
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_returns_status() {
        let handle = create_thread(|| ExitStatus(7)).unwrap();
        assert_eq!(join_thread(handle), Ok(ExitStatus(7)));
    }

    #[test]
    fn test_exit_thread_early() {
        let handle = create_thread(|| {
            exit_thread(ExitStatus::UNSUCCESSFUL);
        })
        .unwrap();
        assert_eq!(join_thread(handle), Ok(ExitStatus::UNSUCCESSFUL));
    }

    #[test]
    fn test_panicking_thread() {
        let handle = create_thread(|| panic!("worker failed")).unwrap();
        assert_eq!(join_thread(handle), Err(ThreadError::Panicked));
    }

    #[test]
    fn test_alert_ends_sleep() {
        let started = Instant::now();
        let handle = create_thread(|| match sleep(10_000) {
            SleepOutcome::Alerted => ExitStatus::ALERTED,
            SleepOutcome::Elapsed => ExitStatus::SUCCESS,
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        alert_thread(&handle);

        assert_eq!(join_thread(handle), Ok(ExitStatus::ALERTED));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_elapses() {
        let handle = create_thread(|| match sleep(10) {
            SleepOutcome::Elapsed => ExitStatus::SUCCESS,
            SleepOutcome::Alerted => ExitStatus::ALERTED,
        })
        .unwrap();
        assert_eq!(join_thread(handle), Ok(ExitStatus::SUCCESS));
    }

    #[test]
    fn test_pending_alert_is_consumed() {
        let handle = create_thread(|| {
            while !current_thread_alerted() {
                thread::yield_now();
            }
            let first = sleep(10_000);
            let second = sleep(1);
            if first == SleepOutcome::Alerted && second == SleepOutcome::Elapsed {
                ExitStatus::SUCCESS
            } else {
                ExitStatus::UNSUCCESSFUL
            }
        })
        .unwrap();

        alert_thread(&handle);
        assert_eq!(join_thread(handle), Ok(ExitStatus::SUCCESS));
    }
}
