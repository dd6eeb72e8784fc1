//! Peak memory measurement for the current process.

use std::fmt;

/// A byte count that displays as mebibytes with two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn as_mib_f64(&self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} MB", self.as_mib_f64())
    }
}

/// Peak resident set size of the calling process, in bytes.
///
/// Uses `getrusage()`; returns 0 if the call fails. After `fork()` the child
/// inherits the parent's high-water mark, so this is an upper bound for the
/// child's own usage.
pub fn peak_rss() -> MemorySize {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                MemorySize(max_rss)
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                MemorySize(max_rss * 1024)
            }
        }
        Err(_) => MemorySize(0),
    }
}
