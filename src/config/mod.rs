//! Configuration management
//!
//! Runtime settings for the platform layer: log verbosity, the processor
//! count of the hosted platform and the pool tags stamped on allocations.

use log::LevelFilter;

use crate::core::mm::PoolTag;

/// Global platform configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpfConfig {
    /// Most verbose level the debug logger emits
    pub log_level: LevelFilter,
    /// Number of logical processors the hosted platform simulates.
    /// `None` uses the host's available parallelism.
    pub processor_count: Option<u32>,
    /// Tag for non-paged pool allocations
    pub nonpaged_tag: PoolTag,
    /// Tag for paged pool allocations
    pub paged_tag: PoolTag,
}

impl XpfConfig {
    /// Configuration with a fixed processor count
    pub fn with_processors(processor_count: u32) -> Self {
        Self {
            processor_count: Some(processor_count),
            ..Self::default()
        }
    }
}

impl Default for XpfConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            processor_count: None,
            nonpaged_tag: PoolTag::NONPAGED,
            paged_tag: PoolTag::PAGED,
        }
    }
}

/// Compile-time default verbosity
fn default_log_level() -> LevelFilter {
    if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else if cfg!(feature = "debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}
