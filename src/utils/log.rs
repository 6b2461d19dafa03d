//! Debug logging for XPF-Core
//!
//! Messages are emitted through the `log` facade on one of six debug-print
//! channels. Each channel has a fixed prefix and level; the installed
//! [`DebugLogger`] prepends the prefix and hands the finished line to a
//! [`DebugSink`] (the kernel debugger print routine on a real host, stderr on
//! the hosted platform).
//!
//! Lines are formatted into a fixed-capacity buffer so logging never
//! allocates and is usable from any execution context.

use core::fmt::{self, Write};

use heapless::String;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::{Error, Result};

/// Maximum length of one formatted line, prefix included
pub const LINE_CAPACITY: usize = 512;

/// Debug-print channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Driver lifecycle messages
    Driver,
    /// Code-integrity trace messages
    CiLog,
    /// Code-integrity failures
    CiPanic,
    /// General messages
    General,
    /// Verbose tracing
    Trace,
    /// Fatal conditions
    Panic,
}

impl Channel {
    /// All channels
    pub const ALL: [Channel; 6] = [
        Channel::Driver,
        Channel::CiLog,
        Channel::CiPanic,
        Channel::General,
        Channel::Trace,
        Channel::Panic,
    ];

    /// Prefix written in front of every line on this channel
    pub const fn prefix(self) -> &'static str {
        match self {
            Channel::Driver => "[XPF - Driver] ",
            Channel::CiLog => "[XPF - CI Log] ",
            Channel::CiPanic => "[XPF - CI Panic] ",
            Channel::General => "[XPF] ",
            Channel::Trace => "[XPF - Trace] ",
            Channel::Panic => "[XPF - Panic] ",
        }
    }

    /// Level the channel logs at
    pub const fn level(self) -> Level {
        match self {
            Channel::Driver | Channel::General => Level::Info,
            Channel::CiLog | Channel::Trace => Level::Trace,
            Channel::CiPanic | Channel::Panic => Level::Error,
        }
    }

    /// `log` target used for records on this channel
    pub const fn target(self) -> &'static str {
        match self {
            Channel::Driver => "xpf::driver",
            Channel::CiLog => "xpf::ci",
            Channel::CiPanic => "xpf::ci_panic",
            Channel::General => "xpf",
            Channel::Trace => "xpf::trace",
            Channel::Panic => "xpf::panic",
        }
    }

    /// Map a record target back to its channel
    pub fn from_target(target: &str) -> Option<Channel> {
        Self::ALL.into_iter().find(|c| c.target() == target)
    }
}

/// Destination for finished log lines
pub trait DebugSink: Send + Sync {
    /// Write one line. The line carries no trailing newline.
    fn write_line(&self, line: &str);
}

/// Sink that drops every line
pub struct NullSink;

impl DebugSink for NullSink {
    fn write_line(&self, _line: &str) {}
}

/// Sink writing to the process's standard error
#[cfg(feature = "std")]
pub struct StderrSink;

#[cfg(feature = "std")]
impl DebugSink for StderrSink {
    fn write_line(&self, line: &str) {
        std::eprintln!("{}", line);
    }
}

/// `log` backend writing prefixed lines to a [`DebugSink`]
pub struct DebugLogger {
    sink: &'static dyn DebugSink,
    level: LevelFilter,
}

impl DebugLogger {
    /// Create a logger writing to `sink` up to `level`
    pub const fn new(sink: &'static dyn DebugSink, level: LevelFilter) -> Self {
        Self { sink, level }
    }
}

impl Log for DebugLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Records not raised through a channel go out on the general one.
        let channel = Channel::from_target(record.target()).unwrap_or(Channel::General);
        let line = format_line(channel.prefix(), *record.args());
        self.sink.write_line(&line);
    }

    fn flush(&self) {}
}

/// Writer that silently drops whatever no longer fits
struct Truncating<'a>(&'a mut String<LINE_CAPACITY>);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                return Err(fmt::Error);
            }
        }
        Ok(())
    }
}

/// Format `prefix` followed by `args` into a bounded line
pub fn format_line(prefix: &str, args: fmt::Arguments<'_>) -> String<LINE_CAPACITY> {
    let mut line = String::new();
    let mut writer = Truncating(&mut line);
    // A full buffer ends formatting early; the truncated line is still emitted.
    let _ = writer.write_str(prefix).and_then(|_| writer.write_fmt(args));
    line
}

/// Emit `args` on `channel`
#[inline]
pub fn emit(channel: Channel, args: fmt::Arguments<'_>) {
    log::log!(target: channel.target(), channel.level(), "{}", args);
}

static LOGGER: Once<DebugLogger> = Once::new();

/// Install the debug logger with the platform's default sink
pub fn init(level: LevelFilter) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            init_with_sink(&StderrSink, level)
        } else {
            init_with_sink(&NullSink, level)
        }
    }
}

/// Install the debug logger writing to `sink`.
///
/// The first call fixes the sink and level. Once the debug logger is the
/// active `log` backend, later calls succeed without changing it. If another
/// logger holds the facade, every call fails with
/// [`Error::LoggerInstalled`].
pub fn init_with_sink(sink: &'static dyn DebugSink, level: LevelFilter) -> Result<()> {
    let logger = LOGGER.call_once(|| DebugLogger::new(sink, level));
    if is_active(log::logger(), logger) {
        return Ok(());
    }

    log::set_logger(logger).map_err(|_| Error::LoggerInstalled)?;
    log::set_max_level(logger.level);
    Ok(())
}

/// Whether the debug logger is installed
pub fn installed() -> bool {
    LOGGER.get().is_some_and(|logger| is_active(log::logger(), logger))
}

fn is_active(current: &dyn Log, logger: &DebugLogger) -> bool {
    core::ptr::addr_eq(current as *const dyn Log, logger as *const DebugLogger)
}

/// Print on the driver channel
#[macro_export]
macro_rules! driver_print {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::Driver, format_args!($($arg)*))
    };
}

/// Trace on the code-integrity channel
#[macro_export]
macro_rules! ci_tracef {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::CiLog, format_args!($($arg)*))
    };
}

/// Report a code-integrity failure
#[macro_export]
macro_rules! ci_panicf {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::CiPanic, format_args!($($arg)*))
    };
}

/// Print on the general channel
#[macro_export]
macro_rules! dprintf {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::General, format_args!($($arg)*))
    };
}

/// Trace on the verbose channel
#[macro_export]
macro_rules! tracef {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::Trace, format_args!($($arg)*))
    };
}

/// Report a fatal condition. Only logs; does not halt.
#[macro_export]
macro_rules! panicf {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Channel::Panic, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::vec::Vec;

    struct CaptureSink(Mutex<Vec<std::string::String>>);

    impl DebugSink for CaptureSink {
        fn write_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.into());
        }
    }

    fn capture() -> &'static CaptureSink {
        Box::leak(Box::new(CaptureSink(Mutex::new(Vec::new()))))
    }

    #[test]
    fn test_channel_targets_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_target(channel.target()), Some(channel));
        }
        assert_eq!(Channel::from_target("xpf_core::core::smp"), None);
    }

    #[test]
    fn test_channel_levels() {
        assert_eq!(Channel::Driver.level(), Level::Info);
        assert_eq!(Channel::CiLog.level(), Level::Trace);
        assert_eq!(Channel::Panic.level(), Level::Error);
    }

    #[test]
    fn test_format_line_prefix() {
        let line = format_line(Channel::Trace.prefix(), format_args!("vcpu {} ready", 3));
        assert_eq!(line.as_str(), "[XPF - Trace] vcpu 3 ready");
    }

    #[test]
    fn test_format_line_truncates() {
        let long = "x".repeat(LINE_CAPACITY * 2);
        let line = format_line(Channel::General.prefix(), format_args!("{}", long));
        assert_eq!(line.len(), LINE_CAPACITY);
        assert!(line.starts_with("[XPF] xxx"));
    }

    #[test]
    fn test_logger_filters_by_level() {
        let sink = capture();
        let logger = DebugLogger::new(sink, LevelFilter::Info);

        logger.log(
            &Record::builder()
                .target(Channel::Driver.target())
                .level(Level::Info)
                .args(format_args!("driver loaded"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .target(Channel::Trace.target())
                .level(Level::Trace)
                .args(format_args!("dropped"))
                .build(),
        );

        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.as_slice(), ["[XPF - Driver] driver loaded"]);
    }

    struct ForeignLogger;

    impl Log for ForeignLogger {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn log(&self, _record: &Record<'_>) {}

        fn flush(&self) {}
    }

    #[test]
    fn test_foreign_logger_is_not_active() {
        let ours = DebugLogger::new(&NullSink, LevelFilter::Info);
        let other = DebugLogger::new(&NullSink, LevelFilter::Info);

        assert!(is_active(&ours, &ours));
        assert!(!is_active(&ForeignLogger, &ours));
        assert!(!is_active(&other, &ours));
    }

    #[test]
    fn test_logger_unknown_target_uses_general_prefix() {
        let sink = capture();
        let logger = DebugLogger::new(sink, LevelFilter::Trace);

        logger.log(
            &Record::builder()
                .target("xpf_core::core::smp::broadcast")
                .level(Level::Warn)
                .args(format_args!("setup failed"))
                .build(),
        );

        assert_eq!(sink.0.lock().unwrap().as_slice(), ["[XPF] setup failed"]);
    }
}
