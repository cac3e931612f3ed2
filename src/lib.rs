//! lowmemd, a userspace low-memory killer daemon for Linux mobile and
//! embedded platforms.
//!
//! The daemon observes kernel memory-pressure signals (PSI triggers or memcg
//! vmpressure eventfds), decides when the system is approaching memory
//! exhaustion, selects the least-valuable registered process, kills it and
//! waits until its memory is actually reclaimed before acting again. The
//! platform framework talks to it over a credential-checked control socket
//! to register process priorities, push configuration and subscribe to kill
//! notifications.
//!
//! Crate layout:
//! - procfile readers and parsers (`procfs`)
//! - the priority-indexed process registry (`registry`)
//! - the asynchronous reaper and its failure pipe (`reaper`)
//! - the handler watchdog (`watchdog`)
//! - kernel pressure sources (`monitors`)
//! - the pressure decision engine (`engine`)
//! - victim selection and the kill watch (`victim`)
//! - the control-socket server and protocol (`control`)
//! - the epoll main loop and command dispatch (`daemon`)
//! - tunables and the property-store seam (`config`)

pub mod config;
pub mod control;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod lock_ext;
pub mod logging;
pub mod monitors;
pub mod procfs;
pub mod reaper;
pub mod registry;
pub mod victim;
pub mod watchdog;

pub use error::{Error, Result};
