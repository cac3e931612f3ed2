//! Error taxonomy of the daemon.
//!
//! The classes mirror how the main loop reacts to a failure: `Transient` and
//! `VictimVanished` end the current tick only, `CapabilityMissing` selects a
//! degraded mode, `Protocol` drops the offending packet, and only
//! `ConfigurationUnsupported` and `Fatal` may terminate the process.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A proc-file read failed in a way that a later re-read may fix
    /// (empty read, short read during buffer growth).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The selected victim disappeared between decision and action.
    /// The record is dropped and the selector moves on.
    #[error("process {0} vanished before it could be killed")]
    VictimVanished(i32),

    /// The requested configuration cannot work on this kernel
    /// (e.g. the memcg backend on a v2-only hierarchy).
    #[error("unsupported configuration: {0}")]
    ConfigurationUnsupported(String),

    /// An optional kernel feature is absent; the caller degrades
    /// (vmstat polling instead of memevents, PID waits instead of pidfds).
    #[error("kernel capability missing: {0}")]
    CapabilityMissing(&'static str),

    /// A malformed control packet. Logged and dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Startup-time failure; the daemon exits nonzero before the main loop.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::VictimVanished(1234);
        assert_eq!(e.to_string(), "process 1234 vanished before it could be killed");
        let e = Error::io("/proc/meminfo", std::io::Error::from_raw_os_error(libc::ENOENT));
        assert!(e.to_string().contains("/proc/meminfo"));
    }
}
