//! Thread management
//!
//! System threads for the driver's background work: creation, early exit
//! with a status, joining, alerting and alertable sleep.

#[cfg(feature = "std")]
pub mod thread;

#[cfg(feature = "std")]
pub use thread::{alert_thread, create_thread, current_thread_alerted, exit_thread, join_thread, sleep, ThreadHandle};

/// Status a thread exits with, NT style: negative values are failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// Success
    pub const SUCCESS: ExitStatus = ExitStatus(0);
    /// A wait or sleep was ended by an alert
    pub const ALERTED: ExitStatus = ExitStatus(0x101);
    /// Generic failure
    pub const UNSUCCESSFUL: ExitStatus = ExitStatus(0xC000_0001_u32 as i32);

    /// Whether the status denotes success
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }
}

/// Thread errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    /// The host refused to create the thread
    #[error("thread creation failed")]
    CreationFailed,
    /// The thread ended by panicking instead of returning or exiting
    #[error("thread terminated abnormally")]
    Panicked,
}

/// How an alertable sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full interval elapsed
    Elapsed,
    /// The thread was alerted before the interval elapsed
    Alerted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::SUCCESS.is_success());
        assert!(ExitStatus::ALERTED.is_success());
        assert!(!ExitStatus::UNSUCCESSFUL.is_success());
    }
}
