//! Kernel pressure sources.
//!
//! Two mutually exclusive backends feed the main loop: PSI trigger
//! descriptors (the default) or, on kernels without PSI, memcg
//! `cgroup.event_control` eventfds on the v1 hierarchy. An optional
//! memory-event listener additionally streams direct-reclaim/kswapd/vendor
//! events from a platform-provided ring buffer.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::config::Tunables;
use crate::error::{Error, Result};
use crate::procfs::PSI_MEMORY_PATH;

/// Root of the memory cgroup v1 hierarchy used by the memcg backend.
pub const MEMCG_ROOT: &str = "/dev/memcg";

/// Where the platform's BPF loader exposes the memory-event ring buffer.
pub const MEMEVENTS_SOCKET: &str = "/run/lowmemd/memevents.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Low,
    Medium,
    Critical,
}

pub const PRESSURE_LEVELS: [PressureLevel; 3] = [
    PressureLevel::Low,
    PressureLevel::Medium,
    PressureLevel::Critical,
];

impl PressureLevel {
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::Critical => "critical",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::Critical => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        PRESSURE_LEVELS.get(index).copied()
    }

    pub fn upgrade(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::Critical => Self::Critical,
        }
    }

    pub fn downgrade(self) -> Self {
        match self {
            Self::Low | Self::Medium => Self::Low,
            Self::Critical => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallType {
    Some,
    Full,
}

impl StallType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Some => "some",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiThreshold {
    pub stall: StallType,
    pub threshold_ms: i32,
}

pub const PSI_WINDOW: Duration = Duration::from_millis(1000);

/// Per-level trigger thresholds. The legacy strategy keeps the historical
/// defaults; the new strategy disables the low level and takes its stall
/// amounts from the tunables.
pub fn psi_thresholds(tun: &Tunables) -> [PsiThreshold; 3] {
    if tun.use_new_strategy {
        [
            PsiThreshold {
                stall: StallType::Some,
                threshold_ms: 0, // disabled
            },
            PsiThreshold {
                stall: StallType::Some,
                threshold_ms: tun.psi_partial_stall_ms,
            },
            PsiThreshold {
                stall: StallType::Full,
                threshold_ms: tun.psi_complete_stall_ms,
            },
        ]
    } else {
        [
            PsiThreshold {
                stall: StallType::Some,
                threshold_ms: 70,
            },
            PsiThreshold {
                stall: StallType::Some,
                threshold_ms: 100,
            },
            PsiThreshold {
                stall: StallType::Full,
                threshold_ms: 70,
            },
        ]
    }
}

/// Arm one PSI trigger: write `<stall-type> <threshold-us> <window-us>` into
/// the pressure file and keep the descriptor for EPOLLPRI registration. The
/// kernel fires it at most once per window.
pub fn init_psi_trigger(stall: StallType, threshold: Duration, window: Duration) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(PSI_MEMORY_PATH)?;
    let config = format!(
        "{} {} {}\0",
        stall.as_str(),
        threshold.as_micros(),
        window.as_micros()
    );
    file.write_all(config.as_bytes())?;
    Ok(file)
}

/// One armed memcg vmpressure level: the eventfd the kernel signals plus the
/// pressure-level descriptor that must stay open to keep the registration
/// alive.
pub struct MemcgMonitor {
    pub evfd: EventFd,
    _mpfd: File,
}

impl MemcgMonitor {
    pub fn raw_fd(&self) -> RawFd {
        self.evfd.as_raw_fd()
    }

    /// Drain the eventfd counter. Returns true if any events were pending.
    pub fn consume(&self) -> bool {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.evfd.as_raw_fd(), &mut buf) {
            Ok(8) => u64::from_ne_bytes(buf) > 0,
            _ => false,
        }
    }
}

/// The memcg backend is only valid on the v1 hierarchy.
pub fn memcg_v1_available() -> bool {
    Path::new(MEMCG_ROOT).join("memory.pressure_level").exists()
}

/// Arm a memcg vmpressure monitor for one level by registering
/// `"<evfd> <mpfd> <levelstr>"` with `cgroup.event_control`.
pub fn init_memcg_monitor(level: PressureLevel) -> Result<MemcgMonitor> {
    if !memcg_v1_available() {
        return Err(Error::ConfigurationUnsupported(
            "memcg pressure monitoring requires the v1 cgroup hierarchy".into(),
        ));
    }
    let root = Path::new(MEMCG_ROOT);
    let mp_path = root.join("memory.pressure_level");
    let mpfd = File::open(&mp_path).map_err(|e| Error::io(&mp_path, e))?;

    let evctl_path = root.join("cgroup.event_control");
    let mut evctl = OpenOptions::new()
        .write(true)
        .open(&evctl_path)
        .map_err(|e| Error::io(&evctl_path, e))?;

    let evfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
        .map_err(|e| Error::Fatal(format!("eventfd failed for level {}: {e}", level.name())))?;

    let line = format!("{} {} {}", evfd.as_raw_fd(), mpfd.as_raw_fd(), level.name());
    evctl
        .write_all(line.as_bytes())
        .map_err(|e| Error::io(&evctl_path, e))?;

    info!("Armed memcg pressure monitor for {} level", level.name());
    Ok(MemcgMonitor { evfd, _mpfd: mpfd })
}

/// Event kinds delivered by the memory-event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEvent {
    DirectReclaimBegin,
    DirectReclaimEnd,
    KswapdWake,
    KswapdSleep,
    VendorKill { reason: i32, min_oom_score_adj: i32 },
    UpdateZoneinfo,
}

const MEM_EVENT_RECORD_SIZE: usize = 16;
const MEM_EVENT_DIRECT_RECLAIM_BEGIN: u32 = 0;
const MEM_EVENT_DIRECT_RECLAIM_END: u32 = 1;
const MEM_EVENT_KSWAPD_WAKE: u32 = 2;
const MEM_EVENT_KSWAPD_SLEEP: u32 = 3;
const MEM_EVENT_VENDOR_KILL: u32 = 4;
const MEM_EVENT_UPDATE_ZONEINFO: u32 = 5;

/// Decode one fixed-size ring-buffer record:
/// `[u32 kind][i32 arg0][i32 arg1][i32 reserved]`, native endianness.
pub fn parse_mem_event(rec: &[u8]) -> Option<MemEvent> {
    if rec.len() < MEM_EVENT_RECORD_SIZE {
        return None;
    }
    let kind = u32::from_ne_bytes(rec[0..4].try_into().ok()?);
    let arg0 = i32::from_ne_bytes(rec[4..8].try_into().ok()?);
    let arg1 = i32::from_ne_bytes(rec[8..12].try_into().ok()?);
    match kind {
        MEM_EVENT_DIRECT_RECLAIM_BEGIN => Some(MemEvent::DirectReclaimBegin),
        MEM_EVENT_DIRECT_RECLAIM_END => Some(MemEvent::DirectReclaimEnd),
        MEM_EVENT_KSWAPD_WAKE => Some(MemEvent::KswapdWake),
        MEM_EVENT_KSWAPD_SLEEP => Some(MemEvent::KswapdSleep),
        MEM_EVENT_VENDOR_KILL => Some(MemEvent::VendorKill {
            reason: arg0,
            min_oom_score_adj: arg1,
        }),
        MEM_EVENT_UPDATE_ZONEINFO => Some(MemEvent::UpdateZoneinfo),
        other => {
            warn!("Unknown memory event kind {other}");
            None
        }
    }
}

/// A drainable source of memory events. The BPF side is platform
/// infrastructure; the daemon only consumes records from its descriptor.
pub trait MemEventSource: Send {
    fn raw_fd(&self) -> RawFd;
    /// Whether the source delivers zone-refresh events; without them the
    /// engine falls back to periodic zoneinfo re-parses.
    fn supports_update_zoneinfo(&self) -> bool;
    fn read_events(&mut self) -> io::Result<Vec<MemEvent>>;
}

/// Memory-event source backed by the loader's ring-buffer socket.
pub struct RingBufferSource {
    stream: UnixStream,
    carry: Vec<u8>,
}

impl RingBufferSource {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            carry: Vec::new(),
        })
    }
}

impl MemEventSource for RingBufferSource {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn supports_update_zoneinfo(&self) -> bool {
        true
    }

    fn read_events(&mut self) -> io::Result<Vec<MemEvent>> {
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.carry.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let mut events = Vec::new();
        let mut consumed = 0;
        while self.carry.len() - consumed >= MEM_EVENT_RECORD_SIZE {
            if let Some(ev) = parse_mem_event(&self.carry[consumed..consumed + MEM_EVENT_RECORD_SIZE])
            {
                events.push(ev);
            }
            consumed += MEM_EVENT_RECORD_SIZE;
        }
        self.carry.drain(..consumed);
        Ok(events)
    }
}
