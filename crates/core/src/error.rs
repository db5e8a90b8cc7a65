//! Error type for the fallible, I/O-facing parts of the crate.
//!
//! Listing anomalies (bad lines, unresolvable jump targets, lookups past the
//! end) are not errors: they are classified or skipped where they occur.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file too small for an analysis cache ({0} bytes)")]
    TooSmall(usize),

    #[error("not an analysis cache file (bad magic)")]
    BadMagic,

    #[error("unsupported analysis cache version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("CPU type mismatch: cache={cache} current={current}")]
    CpuMismatch { cache: &'static str, current: &'static str },

    #[error("decompress error: {0}")]
    Decompress(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt analysis cache: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;
