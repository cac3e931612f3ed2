//! Daemon wiring: the epoll main loop, startup protections, monitor
//! lifecycle and control-command dispatch.
//!
//! A single main thread drives all policy, registry mutation and I/O
//! multiplexing. The loop has three wait modes: an idle indefinite wait,
//! periodic polling after a pressure event (at the engine-chosen interval
//! until the pressure window closes), and a timed wait for kill completion.
//! Each event batch is processed in two passes so connection drops are
//! handled before anything else in the same batch.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::config::{
    Properties, Tunables, OOM_SCORE_ADJ_MAX, OOM_SCORE_ADJ_MIN, PROP_BOOT_COMPLETED,
    PROP_MINFREE_LEVELS, PROP_REPORT_KILLS, SYSTEM_ADJ,
};
use crate::control::protocol::{self, Command, KillStat, ProcPrio, ProcType};
use crate::control::{ControlServer, ReadOutcome, CONTROL_SOCKET_PATH, MAX_DATA_CONN};
use crate::engine::{
    Engine, EvalInput, EventSource, Gate, LegacyEngine, LegacyInput, MinfreeTable,
    PollingUpdate, ReclaimTimestamps, WakeKind, PSI_POLL_PERIOD_SHORT_MS, PSI_WINDOW_SIZE_MS,
};
use crate::error::{Error, Result};
use crate::monitors::{
    init_memcg_monitor, init_psi_trigger, psi_thresholds, MemEvent, MemEventSource, MemcgMonitor,
    PressureLevel, RingBufferSource, MEMEVENTS_SOCKET, PRESSURE_LEVELS, PSI_WINDOW,
};
use crate::procfs::{self, page_k, ProcFile, ProcReaders};
use crate::reaper::{pidfd_open, pidfd_supported, Reaper};
use crate::registry::{KillCounters, Registry, RemoveOutcome};
use crate::victim::{find_and_kill, KillContext, KillEventSink, KillWaitNotifier, KillWatch};
use crate::watchdog::{watchdog_callback, Watchdog, WATCHDOG_TIMEOUT};

const INKERNEL_MINFREE_PATH: &str = "/sys/module/lowmemorykiller/parameters/minfree";
const INKERNEL_ADJ_PATH: &str = "/sys/module/lowmemorykiller/parameters/adj";

const MEMCG_MEM_USAGE_PATH: &str = "/dev/memcg/memory.usage_in_bytes";
const MEMCG_MEMSW_USAGE_PATH: &str = "/dev/memcg/memory.memsw.usage_in_bytes";

const TARGET_UPDATE_MIN_INTERVAL_MS: u64 = 1000;
const EIGHT_MEGA: i64 = 1 << 23;

const MAX_EPOLL_EVENTS: usize = 1 + MAX_DATA_CONN + 3 + 1 + 1 + 1 + 1;

// Multiplexer tokens
const TOKEN_CTRL_LISTEN: u64 = 1;
const TOKEN_DATA_BASE: u64 = 2; // one per data slot
const TOKEN_PRESSURE_BASE: u64 = 10; // one per pressure level
const TOKEN_KILL_DONE: u64 = 20;
const TOKEN_REAPER_PIPE: u64 = 21;
const TOKEN_MEMEVENT: u64 = 22;
const TOKEN_SHUTDOWN: u64 = 23;

fn data_slot_of_token(token: u64) -> Option<usize> {
    if (TOKEN_DATA_BASE..TOKEN_DATA_BASE + MAX_DATA_CONN as u64).contains(&token) {
        Some((token - TOKEN_DATA_BASE) as usize)
    } else {
        None
    }
}

fn pressure_level_of_token(token: u64) -> Option<PressureLevel> {
    if (TOKEN_PRESSURE_BASE..TOKEN_PRESSURE_BASE + 3).contains(&token) {
        PressureLevel::from_index((token - TOKEN_PRESSURE_BASE) as usize)
    } else {
        None
    }
}

fn epoll_timeout(ms: u64) -> EpollTimeout {
    EpollTimeout::from(ms.min(u64::from(u16::MAX - 1)) as u16)
}

/// The per-app memcg soft-limit policy. Scores at or above 600 mark the
/// launcher: its score is forced to perceptible (200) with multiplier 1,
/// overriding caller intent (historical platform behaviour, kept as-is).
pub fn soft_limit_policy(oomadj: i32) -> (i32, i64) {
    if oomadj >= 700 {
        (oomadj, 0)
    } else if oomadj >= 600 {
        (200, 1)
    } else if oomadj >= 400 {
        (oomadj, 0)
    } else if oomadj >= 300 {
        (oomadj, 1)
    } else if oomadj >= 200 {
        (oomadj, 8)
    } else if oomadj >= 100 {
        (oomadj, 10)
    } else if oomadj >= 0 {
        (oomadj, 20)
    } else {
        // Persistent processes get a large 512MB soft limit
        (oomadj, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PollSource {
    level: PressureLevel,
}

struct PollState {
    source: Option<PollSource>,
    paused: Option<PollSource>,
    interval_ms: u64,
    poll_start: Instant,
    last_poll: Instant,
    resume_immediately: bool,
}

impl PollState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            source: None,
            paused: None,
            interval_ms: PSI_POLL_PERIOD_SHORT_MS,
            poll_start: now,
            last_poll: now,
            resume_immediately: false,
        }
    }

    fn apply(&mut self, update: PollingUpdate, source: PollSource, interval_ms: u64, now: Instant) {
        match update {
            PollingUpdate::Start => {
                // Poll for the duration of the PSI window after the initial
                // event; events themselves are rate-limited to one per window
                self.source = Some(source);
                self.interval_ms = interval_ms;
                self.poll_start = now;
                self.last_poll = now;
            }
            PollingUpdate::Pause => {
                // The pausing handler resumes once the kill wait releases,
                // whether or not polling was already active
                self.paused = Some(self.source.take().unwrap_or(source));
            }
            PollingUpdate::Resume => self.resume(now),
            PollingUpdate::DoNotChange => {
                self.interval_ms = interval_ms;
                self.expire_window(now);
            }
        }
    }

    fn resume(&mut self, now: Instant) {
        if let Some(paused) = self.paused.take() {
            self.source = Some(paused);
            self.interval_ms = PSI_POLL_PERIOD_SHORT_MS;
            self.poll_start = now;
            self.resume_immediately = true;
        }
    }

    fn expire_window(&mut self, now: Instant) {
        if self.source.is_some()
            && now.saturating_duration_since(self.poll_start).as_millis() as u64
                > PSI_WINDOW_SIZE_MS
        {
            self.source = None;
        }
    }
}

struct EpollWaiter<'a> {
    epoll: &'a Epoll,
}

impl KillWaitNotifier for EpollWaiter<'_> {
    fn register(&mut self, fd: RawFd) -> std::io::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_KILL_DONE))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    fn unregister(&mut self, fd: RawFd) {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self.epoll.delete(bfd) {
            error!("epoll_ctl for last killed process failed: {e}");
        }
    }
}

/// Relays each kill to subscribed peers and the structured kill log.
struct ServerSink<'a> {
    server: &'a mut ControlServer,
}

impl KillEventSink for ServerSink<'_> {
    fn kill_occurred(&mut self, stat: &KillStat) {
        info!(
            "kill_stat: pid={} uid={} oom_score={} min_oom_score={} rss_kb={} swap_kb={} \
             reason={} thrashing={} max_thrashing={} free_mem_kb={} free_swap_kb={} task='{}'",
            stat.pid,
            stat.uid,
            stat.oom_score,
            stat.min_oom_score,
            stat.rss_kb,
            stat.swap_kb,
            stat.kill_reason,
            stat.thrashing,
            stat.max_thrashing,
            stat.free_mem_kb,
            stat.free_swap_kb,
            stat.taskname
        );
        self.server.broadcast(
            protocol::ASYNC_EVENT_KILL,
            &protocol::notif_kill(stat.pid, stat.uid as u32, stat.rss_kb),
        );
        self.server
            .broadcast(protocol::ASYNC_EVENT_STAT, &protocol::notif_stat(stat));
    }
}

pub struct Daemon {
    epoll: Epoll,
    props: Box<dyn Properties>,
    tun: Tunables,
    registry: Arc<Registry>,
    reaper: Arc<Reaper>,
    watchdog: Watchdog,
    watch: KillWatch,
    killcnt: KillCounters,
    readers: ProcReaders,
    engine: Engine,
    legacy: LegacyEngine,
    minfree: MinfreeTable,
    server: ControlServer,
    poll: PollState,

    psi_triggers: [Option<File>; 3],
    memcg_monitors: [Option<MemcgMonitor>; 3],
    use_psi_monitors: bool,
    monitors_initialized: bool,
    boot_completed_handled: bool,

    memevent_source: Option<Box<dyn MemEventSource>>,
    reclaim_ts: ReclaimTimestamps,

    mem_usage_file: ProcFile,
    memsw_usage_file: ProcFile,

    reaper_pipe_read: Option<OwnedFd>,
    pidfd_supported: bool,
    has_inkernel_module: bool,
    use_inkernel_interface: bool,
    last_target_update: Option<Instant>,

    shutdown: Arc<AtomicBool>,
    _shutdown_pipe_read: Option<OwnedFd>,
}

impl Daemon {
    pub fn new(props: Box<dyn Properties>) -> Result<Self> {
        let tun = Tunables::load(&*props);

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::Fatal(format!("epoll_create failed: {e}")))?;

        let server = ControlServer::bind(Path::new(CONTROL_SOCKET_PATH))?;
        epoll
            .add(
                unsafe { BorrowedFd::borrow_raw(server.listener_fd()) },
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_CTRL_LISTEN),
            )
            .map_err(|e| Error::Fatal(format!("epoll_ctl for control socket failed: {e}")))?;

        let registry = Arc::new(Registry::new());

        // The reaper pipe must be wired before the reaper is shared with the
        // watchdog thread
        let mut reaper = Reaper::new();
        let mut reaper_pipe_read = None;
        if reaper.is_reaping_supported() {
            match nix::unistd::pipe2(
                nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC,
            ) {
                Ok((read_end, write_end)) => {
                    if let Err(e) = epoll.add(
                        &read_end,
                        EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_REAPER_PIPE),
                    ) {
                        error!("epoll_ctl for reaper pipe failed: {e}");
                    } else if reaper.init(write_end) {
                        info!(
                            "Process reaper initialized with {} threads in the pool",
                            reaper.thread_cnt()
                        );
                        reaper_pipe_read = Some(read_end);
                    }
                }
                Err(e) => error!("Failed to create reaper communication pipe: {e}"),
            }
        } else {
            info!("Process reaping is not supported");
        }
        let reaper = Arc::new(reaper);

        let watchdog = {
            let registry = registry.clone();
            let reaper = reaper.clone();
            Watchdog::new(WATCHDOG_TIMEOUT, move || {
                watchdog_callback(&registry, &reaper)
            })
        };

        let has_inkernel_module =
            nix::unistd::access(INKERNEL_MINFREE_PATH, nix::unistd::AccessFlags::W_OK).is_ok();

        let engine = Engine::new(&tun);

        Ok(Self {
            epoll,
            props,
            tun,
            registry,
            reaper,
            watchdog,
            watch: KillWatch::new(),
            killcnt: KillCounters::new(),
            readers: ProcReaders::new(),
            engine,
            legacy: LegacyEngine::new(),
            minfree: MinfreeTable::new(),
            server,
            poll: PollState::new(),
            psi_triggers: [None, None, None],
            memcg_monitors: [None, None, None],
            use_psi_monitors: false,
            monitors_initialized: false,
            boot_completed_handled: false,
            memevent_source: None,
            reclaim_ts: ReclaimTimestamps::default(),
            mem_usage_file: ProcFile::new(MEMCG_MEM_USAGE_PATH),
            memsw_usage_file: ProcFile::new(MEMCG_MEMSW_USAGE_PATH),
            reaper_pipe_read,
            pidfd_supported: pidfd_supported(),
            has_inkernel_module,
            use_inkernel_interface: has_inkernel_module,
            last_target_update: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            _shutdown_pipe_read: None,
        })
    }

    /// One-time startup: monitors, runtime protections, the reaper pipe and
    /// signal handling. Failures here are fatal; the daemon exits nonzero
    /// before entering the main loop.
    pub fn init(&mut self) -> Result<()> {
        if self.use_inkernel_interface {
            info!("Using in-kernel low memory killer interface");
        } else {
            // Low-resource devices may postpone monitor registration to
            // save CPU cycles during boot
            if !self.tun.delay_monitors_until_boot
                || self.props.get_bool(PROP_BOOT_COMPLETED, false)
            {
                if !self.init_monitors() {
                    return Err(Error::Fatal("failed to initialize monitors".into()));
                }
            }
            self.apply_runtime_protections();
        }
        self.props.set(PROP_REPORT_KILLS, "1");

        // Size the shared read buffer before the first pressure event
        self.readers.warm_up();

        info!(
            "Process polling is {}",
            if self.pidfd_supported {
                "supported"
            } else {
                "not supported"
            }
        );

        self.install_signal_handlers()?;
        Ok(())
    }

    fn apply_runtime_protections(&self) {
        // Pin current and future pages on first fault so the daemon is never
        // swapped out; old kernels reject MCL_ONFAULT with EINVAL, which is
        // acceptable
        let ret =
            unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE | libc::MCL_ONFAULT) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                warn!("mlockall failed: {err}");
            }
        }

        let param = libc::sched_param { sched_priority: 99 };
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } != 0 {
            warn!("set SCHED_RR failed: {}", std::io::Error::last_os_error());
        }
    }

    fn install_signal_handlers(&mut self) -> Result<()> {
        let mut signals = signal_hook::iterator::Signals::new([
            signal_hook::consts::SIGTERM,
            signal_hook::consts::SIGINT,
        ])
        .map_err(|e| Error::Fatal(format!("could not set up signal handling: {e}")))?;

        let (read_end, write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| Error::Fatal(format!("could not create shutdown pipe: {e}")))?;
        self.epoll
            .add(
                &read_end,
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SHUTDOWN),
            )
            .map_err(|e| Error::Fatal(format!("epoll_ctl for shutdown pipe failed: {e}")))?;
        self._shutdown_pipe_read = Some(read_end);

        let flag = self.shutdown.clone();
        std::thread::spawn(move || {
            for signal in signals.forever() {
                info!("Received termination signal {signal}. lowmemd checking out");
                flag.store(true, Ordering::Release);
                let _ = nix::unistd::write(&write_end, &[1u8]);
                break;
            }
        });
        Ok(())
    }

    // Monitor lifecycle

    fn init_monitors(&mut self) -> bool {
        info!(
            "Wakeup counter is reset from {} to 0",
            self.engine.event_count + self.legacy.event_count
        );
        self.engine.event_count = 0;
        self.legacy.event_count = 0;

        self.use_psi_monitors = self.tun.use_psi && self.init_psi_monitors();
        if !self.use_psi_monitors && !self.init_memcg_monitors() {
            error!("Kernel does not support memory pressure events or in-kernel low memory killer");
            return false;
        }
        if self.use_psi_monitors {
            info!("Using psi monitors for memory pressure detection");
        } else {
            info!("Using vmpressure for memory pressure detection");
        }
        self.monitors_initialized = true;
        true
    }

    fn init_psi_monitors(&mut self) -> bool {
        if !self.tun.use_new_strategy && !crate::monitors::memcg_v1_available() {
            error!("Old kill strategy can only be used with v1 cgroup hierarchy");
            return false;
        }
        let thresholds = psi_thresholds(&self.tun);
        for level in PRESSURE_LEVELS {
            let threshold = thresholds[level.index()];
            if threshold.threshold_ms == 0 {
                continue;
            }
            let trigger = match init_psi_trigger(
                threshold.stall,
                Duration::from_millis(threshold.threshold_ms as u64),
                PSI_WINDOW,
            ) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        "Failed to create {} psi trigger: {e}",
                        level.name()
                    );
                    self.destroy_psi_monitors();
                    return false;
                }
            };
            if let Err(e) = self.epoll.add(
                &trigger,
                EpollEvent::new(
                    EpollFlags::EPOLLPRI,
                    TOKEN_PRESSURE_BASE + level.index() as u64,
                ),
            ) {
                error!("epoll_ctl for {} psi trigger failed: {e}", level.name());
                self.destroy_psi_monitors();
                return false;
            }
            self.psi_triggers[level.index()] = Some(trigger);
        }
        true
    }

    fn init_memcg_monitors(&mut self) -> bool {
        for level in PRESSURE_LEVELS {
            let monitor = match init_memcg_monitor(level) {
                Ok(m) => m,
                Err(e) => {
                    info!("No memcg pressure monitoring for {}: {e}", level.name());
                    self.destroy_memcg_monitors();
                    return false;
                }
            };
            if let Err(e) = self.epoll.add(
                unsafe { BorrowedFd::borrow_raw(monitor.raw_fd()) },
                EpollEvent::new(
                    EpollFlags::EPOLLIN,
                    TOKEN_PRESSURE_BASE + level.index() as u64,
                ),
            ) {
                error!("epoll_ctl for {} memcg eventfd failed: {e}", level.name());
                self.destroy_memcg_monitors();
                return false;
            }
            self.memcg_monitors[level.index()] = Some(monitor);
        }
        true
    }

    fn destroy_psi_monitors(&mut self) {
        for trigger in &mut self.psi_triggers {
            if let Some(t) = trigger.take() {
                let _ = self.epoll.delete(&t);
            }
        }
    }

    fn destroy_memcg_monitors(&mut self) {
        for monitor in &mut self.memcg_monitors {
            if let Some(m) = monitor.take() {
                let _ = self
                    .epoll
                    .delete(unsafe { BorrowedFd::borrow_raw(m.raw_fd()) });
            }
        }
    }

    fn destroy_monitors(&mut self) {
        if self.use_psi_monitors {
            self.destroy_psi_monitors();
        } else {
            self.destroy_memcg_monitors();
        }
        self.monitors_initialized = false;
    }

    fn init_memevent_listener(&mut self) -> bool {
        if self.memevent_source.is_some() {
            return true;
        }
        match RingBufferSource::connect(Path::new(MEMEVENTS_SOCKET)) {
            Ok(source) => {
                if let Err(e) = self.epoll.add(
                    unsafe { BorrowedFd::borrow_raw(source.raw_fd()) },
                    EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_MEMEVENT),
                ) {
                    error!("epoll_ctl for memevent listener failed: {e}");
                    return false;
                }
                self.reclaim_ts = ReclaimTimestamps::default();
                self.memevent_source = Some(Box::new(source));
                true
            }
            Err(e) => {
                info!("Memory event listener is unavailable: {e}");
                false
            }
        }
    }

    // Main loop

    pub fn run(&mut self) -> Result<()> {
        // Allocated once; pressure wakeups must not allocate
        let mut events = vec![EpollEvent::empty(); MAX_EPOLL_EVENTS];
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                info!("exiting");
                return Ok(());
            }

            let nevents;

            if let Some(src) = self.poll.source {
                let poll_now;
                if self.poll.resume_immediately {
                    // Just transitioned out of a kill wait, poll right away
                    self.poll.resume_immediately = false;
                    nevents = 0;
                    poll_now = true;
                } else {
                    let now = Instant::now();
                    let since_ms =
                        now.saturating_duration_since(self.poll.last_poll).as_millis() as u64;
                    let delay = if since_ms < self.poll.interval_ms {
                        self.poll.interval_ms - since_ms
                    } else {
                        self.poll.interval_ms
                    };
                    nevents = match self.epoll.wait(&mut events, epoll_timeout(delay)) {
                        Ok(n) => n,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            error!("epoll_wait failed: {e}");
                            continue;
                        }
                    };
                    let now = Instant::now();
                    poll_now = now.saturating_duration_since(self.poll.last_poll).as_millis()
                        as u64
                        >= self.poll.interval_ms;
                }
                if poll_now {
                    self.call_pressure_handler(src.level, WakeKind::Polling);
                }
            } else if self.tun.kill_timeout_ms > 0 && self.watch.is_waiting_for_kill() {
                let now = Instant::now();
                let elapsed = self.watch.elapsed_since_kill_ms(now).unwrap_or(0);
                let delay = self.tun.kill_timeout_ms.saturating_sub(elapsed);
                nevents = if delay > 0 {
                    match self.epoll.wait(&mut events, epoll_timeout(delay)) {
                        Ok(n) => n,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            error!("epoll_wait failed: {e}");
                            continue;
                        }
                    }
                } else {
                    0
                };
                if nevents == 0 {
                    // Kill notification timed out; release the wait and
                    // resume polling
                    let mut waiter = EpollWaiter { epoll: &self.epoll };
                    self.watch
                        .stop(false, &mut waiter, self.tun.debug_process_killing);
                    self.poll.resume(Instant::now());
                }
            } else {
                nevents = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                    Ok(n) => n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        error!("epoll_wait failed: {e}");
                        continue;
                    }
                };
            }

            // First pass: connection drops and kill completion, so that a
            // reconnect in the same batch finds a clean slot
            for event in &events[..nevents] {
                if !event.events().contains(EpollFlags::EPOLLHUP) {
                    continue;
                }
                let token = event.data();
                if token == TOKEN_KILL_DONE {
                    self.watchdog.start();
                    self.handle_kill_done();
                    self.watchdog.stop();
                } else if let Some(slot) = data_slot_of_token(token) {
                    info!("control data connection dropped");
                    self.watchdog.start();
                    self.close_data_connection(slot);
                    self.watchdog.stop();
                }
            }

            // Second pass: everything else
            for event in &events[..nevents] {
                let flags = event.events();
                if flags.contains(EpollFlags::EPOLLERR) {
                    log::debug!("EPOLLERR on event token {}", event.data());
                }
                if flags.contains(EpollFlags::EPOLLHUP) {
                    continue;
                }
                self.dispatch(event.data());
            }
        }
    }

    fn dispatch(&mut self, token: u64) {
        self.watchdog.start();
        match token {
            TOKEN_CTRL_LISTEN => self.handle_ctrl_connect(),
            TOKEN_KILL_DONE => self.handle_kill_done(),
            TOKEN_REAPER_PIPE => self.handle_reaper_pipe(),
            TOKEN_MEMEVENT => self.handle_memevents(),
            TOKEN_SHUTDOWN => {}
            token => {
                if let Some(slot) = data_slot_of_token(token) {
                    self.handle_data_socket(slot);
                } else if let Some(level) = pressure_level_of_token(token) {
                    self.call_pressure_handler_locked(level, WakeKind::Event);
                }
            }
        }
        self.watchdog.stop();
    }

    fn call_pressure_handler(&mut self, level: PressureLevel, wake: WakeKind) {
        self.watchdog.start();
        self.call_pressure_handler_locked(level, wake);
        self.watchdog.stop();
        self.poll.last_poll = Instant::now();
    }

    fn call_pressure_handler_locked(&mut self, level: PressureLevel, wake: WakeKind) {
        if self.tun.use_new_strategy {
            self.pressure_event_psi(level, wake);
        } else {
            self.pressure_event_common(level, wake);
        }
        if wake == WakeKind::Event {
            self.poll.last_poll = Instant::now();
        }
    }

    // The PSI decision path (new strategy)

    fn pressure_event_psi(&mut self, level: PressureLevel, wake: WakeKind) {
        let now = Instant::now();
        if !self
            .engine
            .accept_psi_event(level, wake, now, self.tun.debug_process_killing)
        {
            return;
        }
        self.mp_event_psi(EventSource::Psi { level, wake }, level, now);
    }

    fn mp_event_psi(&mut self, source: EventSource, poll_level: PressureLevel, now: Instant) {
        // Vendor kills do not count as pressure events for polling purposes
        let event = matches!(
            source,
            EventSource::Psi {
                wake: WakeKind::Event,
                ..
            }
        );

        let kill_pending = self.watch.is_kill_pending();
        let elapsed = self.watch.elapsed_since_kill_ms(now);
        match self.engine.gate_kill_in_flight(kill_pending, elapsed, &self.tun) {
            Gate::Skip => {
                self.apply_engine_polling(event, poll_level, now);
                return;
            }
            Gate::Proceed { release_finished } => {
                let mut waiter = EpollWaiter { epoll: &self.epoll };
                self.watch
                    .stop(release_finished, &mut waiter, self.tun.debug_process_killing);
            }
        }

        let vs = match self.readers.read_vmstat() {
            Ok(vs) => vs,
            Err(e) => {
                error!("Failed to parse vmstat: {e}");
                return;
            }
        };
        let mi = match self.readers.read_meminfo() {
            Ok(mi) => mi,
            Err(e) => {
                error!("Failed to parse meminfo: {e}");
                return;
            }
        };
        let psi_mem = self.readers.read_psi_mem().ok();

        let reclaim_ts = self.memevent_source.as_ref().map(|_| self.reclaim_ts);
        let zone_refresh_supported = self
            .memevent_source
            .as_ref()
            .map(|s| s.supports_update_zoneinfo())
            .unwrap_or(false);

        let request = {
            let inp = EvalInput {
                source,
                now,
                mi: &mi,
                vs: &vs,
                psi_mem: psi_mem.as_ref(),
                reclaim_ts,
                zone_refresh_supported,
            };
            // The zoneinfo reader doubles as the watermark source; split the
            // borrow around the engine call
            let Self {
                engine, readers, tun, ..
            } = self;
            engine.evaluate(&inp, tun, readers)
        };

        if let Some(request) = request {
            let pages_freed = {
                let mut waiter = EpollWaiter { epoll: &self.epoll };
                let mut sink = ServerSink {
                    server: &mut self.server,
                };
                let mut sizer = |pid: i32| procfs::read_statm_rss(pid);
                let mut ctx = KillContext {
                    registry: &self.registry,
                    reaper: &self.reaper,
                    watch: &mut self.watch,
                    killcnt: &mut self.killcnt,
                    sink: &mut sink,
                    waiter: &mut waiter,
                    sizer: &mut sizer,
                    tun: &self.tun,
                };
                find_and_kill(&mut ctx, request.min_score, Some(&request), &mi, now)
            };
            if pages_freed == 0 {
                info!("No eligible process found to kill: {}", request.desc);
            }
            self.engine.note_kill_result(&request, pages_freed, &self.tun);
        }

        self.apply_engine_polling(event, poll_level, now);
    }

    fn apply_engine_polling(&mut self, event: bool, level: PressureLevel, now: Instant) {
        let directive = self
            .engine
            .polling_directive(event, self.watch.is_waiting_for_kill());
        self.poll.apply(
            directive.update,
            PollSource { level },
            directive.interval_ms,
            now,
        );
    }

    // The legacy vmpressure decision path

    fn pressure_event_common(&mut self, level: PressureLevel, wake: WakeKind) {
        let now = Instant::now();
        let event = wake == WakeKind::Event;
        let mut level = level;

        if !self.use_psi_monitors {
            // Reading the eventfds also resets their counters; upgrade to
            // the highest level signalled in this batch
            for lvl in PRESSURE_LEVELS {
                if let Some(monitor) = &self.memcg_monitors[lvl.index()] {
                    if monitor.consume() && lvl > level {
                        level = lvl;
                    }
                }
            }
        }

        if self.use_psi_monitors && event {
            // Override polling only when this event is more critical than
            // the one currently driving the poll
            let escalate = match self.poll.source {
                None => true,
                Some(src) => level > src.level,
            };
            if escalate {
                self.poll.apply(
                    PollingUpdate::Start,
                    PollSource { level },
                    PSI_POLL_PERIOD_SHORT_MS,
                    now,
                );
            }
        }

        let elapsed = self.watch.elapsed_since_kill_ms(now);
        if self.tun.kill_timeout_ms > 0
            && elapsed.map_or(false, |e| e < self.tun.kill_timeout_ms)
        {
            if self.watch.is_kill_pending() {
                self.legacy.note_skipped();
                return;
            }
            let mut waiter = EpollWaiter { epoll: &self.epoll };
            self.watch
                .stop(true, &mut waiter, self.tun.debug_process_killing);
        } else {
            let mut waiter = EpollWaiter { epoll: &self.epoll };
            self.watch
                .stop(false, &mut waiter, self.tun.debug_process_killing);
        }
        self.legacy.flush_skip_count();

        let mi = match self.readers.read_meminfo() {
            Ok(mi) => mi,
            Err(e) => {
                error!("Failed to get free memory: {e}");
                return;
            }
        };
        let zi = match self.readers.read_zoneinfo() {
            Ok(zi) => zi,
            Err(e) => {
                error!("Failed to get free memory: {e}");
                return;
            }
        };

        let (mem_usage, memsw_usage) = if self.tun.use_minfree_levels {
            (None, None)
        } else {
            (
                read_usage_file(&mut self.mem_usage_file),
                read_usage_file(&mut self.memsw_usage_file),
            )
        };

        let decision = self.legacy.evaluate(
            &LegacyInput {
                level,
                wake,
                now,
                mi: &mi,
                totalreserve_pages: zi.totalreserve_pages,
                mem_usage,
                memsw_usage,
            },
            &self.tun,
            &self.minfree,
        );

        if let Some(decision) = decision {
            let pages_freed = {
                let mut waiter = EpollWaiter { epoll: &self.epoll };
                let mut sink = ServerSink {
                    server: &mut self.server,
                };
                let mut sizer = |pid: i32| procfs::read_statm_rss(pid);
                let mut ctx = KillContext {
                    registry: &self.registry,
                    reaper: &self.reaper,
                    watch: &mut self.watch,
                    killcnt: &mut self.killcnt,
                    sink: &mut sink,
                    waiter: &mut waiter,
                    sizer: &mut sizer,
                    tun: &self.tun,
                };
                find_and_kill(&mut ctx, decision.min_score, None, &mi, now)
            };

            if self.tun.low_ram_device {
                if pages_freed == 0 && self.tun.debug_process_killing {
                    info!("Nothing to kill");
                }
            } else if self.legacy.should_report(pages_freed, now) {
                if self.tun.use_minfree_levels {
                    info!(
                        "Reclaimed {}kB, cache({}kB) and free({}kB)-reserved({}kB) below min({}kB) for oom_score_adj {}",
                        pages_freed * page_k(),
                        decision.other_file * page_k(),
                        mi.nr_free_pages * page_k(),
                        zi.totalreserve_pages * page_k(),
                        decision.minfree * page_k(),
                        decision.min_score
                    );
                } else {
                    info!(
                        "Reclaimed {}kB at oom_score_adj {}",
                        pages_freed * page_k(),
                        decision.min_score
                    );
                }
            }
        }

        if self.watch.is_waiting_for_kill() {
            self.poll.apply(
                PollingUpdate::Pause,
                PollSource { level },
                self.poll.interval_ms,
                now,
            );
        }
    }

    // Kill-wait bookkeeping

    fn handle_kill_done(&mut self) {
        let mut waiter = EpollWaiter { epoll: &self.epoll };
        self.watch
            .stop(true, &mut waiter, self.tun.debug_process_killing);
        self.poll.resume(Instant::now());
    }

    fn handle_reaper_pipe(&mut self) {
        if let Some(fd) = &self.reaper_pipe_read {
            let mut buf = [0u8; 4];
            match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
                Ok(4) => {
                    let pid = i32::from_ne_bytes(buf);
                    warn!("Reaping of process {pid} failed");
                }
                Ok(_) => error!("thread communication read failed: short read"),
                Err(e) => error!("thread communication read failed: {e}"),
            }
        }
        let mut waiter = EpollWaiter { epoll: &self.epoll };
        self.watch
            .stop(false, &mut waiter, self.tun.debug_process_killing);
        self.poll.resume(Instant::now());
    }

    // Memory-event listener

    fn handle_memevents(&mut self) {
        let now = Instant::now();
        let events = match self.memevent_source.as_mut() {
            Some(source) => match source.read_events() {
                Ok(events) => events,
                Err(e) => {
                    self.reclaim_ts.direct_reclaim_start = None;
                    error!("Failed fetching memory listener events: {e}");
                    return;
                }
            },
            None => return,
        };

        for event in events {
            match event {
                MemEvent::DirectReclaimBegin => self.reclaim_ts.direct_reclaim_start = Some(now),
                MemEvent::DirectReclaimEnd => self.reclaim_ts.direct_reclaim_start = None,
                MemEvent::KswapdWake => self.reclaim_ts.kswapd_start = Some(now),
                MemEvent::KswapdSleep => self.reclaim_ts.kswapd_start = None,
                MemEvent::VendorKill {
                    reason,
                    min_oom_score_adj,
                } => {
                    self.engine.note_vendor_event(self.tun.debug_process_killing);
                    self.mp_event_psi(
                        EventSource::Vendor {
                            reason_code: reason,
                            min_score: min_oom_score_adj,
                        },
                        PressureLevel::Low,
                        now,
                    );
                }
                MemEvent::UpdateZoneinfo => {
                    let Self { engine, readers, .. } = self;
                    engine.refresh_watermarks(readers, now);
                }
            }
        }
    }

    // Control socket

    fn handle_ctrl_connect(&mut self) {
        match self.server.accept() {
            Ok(outcome) => {
                // Forcibly dropped peers leave adoptable records behind;
                // their descriptors were closed, which also removed them
                // from the multiplexer
                for pid in &outcome.dropped_peers {
                    self.registry.remove_claims(*pid);
                }
                if let Some(fd) = self.server.slot_fd(outcome.slot) {
                    if let Err(e) = self.epoll.add(
                        unsafe { BorrowedFd::borrow_raw(fd) },
                        EpollEvent::new(
                            EpollFlags::EPOLLIN,
                            TOKEN_DATA_BASE + outcome.slot as u64,
                        ),
                    ) {
                        error!("epoll_ctl for data connection socket failed: {e}");
                        self.close_data_connection(outcome.slot);
                    }
                }
            }
            Err(e) => error!("control socket accept failed: {e}"),
        }
    }

    fn close_data_connection(&mut self, slot: usize) {
        if let Some(fd) = self.server.slot_fd(slot) {
            let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
        }
        if let Some(peer_pid) = self.server.close(slot) {
            // Records of the old registrant become adoptable, not removed
            self.registry.remove_claims(peer_pid);
        }
    }

    fn handle_data_socket(&mut self, slot: usize) {
        // A Closed outcome already dropped the descriptor, which also
        // removed it from the multiplexer
        let outcome = match self.server.read_packet(slot) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        match outcome {
            ReadOutcome::Closed { peer_pid } => {
                self.registry.remove_claims(peer_pid);
            }
            ReadOutcome::Packet {
                words,
                cred_pid,
                cred_uid,
            } => match protocol::decode(&words) {
                Ok(command) => self.handle_command(slot, command, cred_pid, cred_uid),
                Err(e) => error!("{e}"),
            },
        }
    }

    fn handle_command(&mut self, slot: usize, command: Command, cred_pid: i32, cred_uid: u32) {
        match command {
            Command::Target(targets) => self.cmd_target(&targets),
            Command::ProcPrio(proc) => self.apply_proc_prio(&proc, cred_pid, cred_uid),
            Command::ProcsPrio(procs) => {
                for proc in &procs {
                    self.apply_proc_prio(proc, cred_pid, cred_uid);
                }
            }
            Command::ProcRemove { pid } => self.cmd_procremove(pid, cred_pid, cred_uid),
            Command::ProcPurge => self.cmd_procpurge(cred_pid),
            Command::GetKillCnt {
                min_oomadj,
                max_oomadj,
            } => {
                let count = if self.use_inkernel_interface {
                    // The kernel driver does not expose kill counts
                    0
                } else {
                    self.killcnt.range_count(min_oomadj, max_oomadj)
                };
                if let Err(e) = self.server.write(slot, &protocol::reply_getkillcnt(count)) {
                    error!("Failed to report kill count: {e}");
                }
            }
            Command::Subscribe { evt_type } => self.server.subscribe(slot, evt_type),
            Command::UpdateProps => {
                let result = self.cmd_update_props();
                if let Err(e) = self.server.write(slot, &protocol::reply_update_props(result)) {
                    error!("Failed to report operation results: {e}");
                }
                if result == 0 {
                    info!("Properties reinitialized");
                } else {
                    // The new settings cannot be supported; exit so the
                    // service manager restarts us into a clean state
                    error!("New configuration is not supported. Exiting...");
                    std::process::exit(1);
                }
            }
            Command::StartMonitoring => self.cmd_start_monitoring(),
            Command::BootCompleted => {
                let result = self.cmd_boot_completed();
                if let Err(e) = self
                    .server
                    .write(slot, &protocol::reply_boot_completed(result))
                {
                    error!("Failed to report boot-completed operation results: {e}");
                }
            }
        }
    }

    fn cmd_target(&mut self, targets: &[(i32, i32)]) {
        let now = Instant::now();
        // Rate-limit minfree updates to prevent DoS through the socket
        if let Some(last) = self.last_target_update {
            if (now.saturating_duration_since(last).as_millis() as u64)
                < TARGET_UPDATE_MIN_INTERVAL_MS
            {
                error!("Ignoring frequent updates to the minfree levels");
                return;
            }
        }
        self.last_target_update = Some(now);

        self.minfree.minfree = targets.iter().map(|&(minfree, _)| i64::from(minfree)).collect();
        self.minfree.adj = targets.iter().map(|&(_, adj)| adj).collect();

        let levels: Vec<String> = targets
            .iter()
            .map(|&(minfree, adj)| format!("{minfree}:{adj}"))
            .collect();
        self.props.set(PROP_MINFREE_LEVELS, &levels.join(","));

        if self.has_inkernel_module {
            let minfree_str: Vec<String> = targets
                .iter()
                .map(|&(minfree, _)| {
                    if self.use_inkernel_interface {
                        minfree.to_string()
                    } else {
                        "0".to_string()
                    }
                })
                .collect();
            let adj_str: Vec<String> = targets
                .iter()
                .map(|&(_, adj)| {
                    if self.use_inkernel_interface {
                        adj.to_string()
                    } else {
                        "0".to_string()
                    }
                })
                .collect();
            procfs::write_file_string(
                Path::new(INKERNEL_MINFREE_PATH),
                &minfree_str.join(","),
                true,
            );
            procfs::write_file_string(Path::new(INKERNEL_ADJ_PATH), &adj_str.join(","), true);
        }
    }

    fn apply_proc_prio(&mut self, proc: &ProcPrio, cred_pid: i32, cred_uid: u32) {
        if proc.oomadj < OOM_SCORE_ADJ_MIN || proc.oomadj > OOM_SCORE_ADJ_MAX {
            error!("Invalid PROCPRIO oomadj argument {}", proc.oomadj);
            return;
        }

        // Only thread group leaders may be registered
        if let Some(status) = procfs::read_proc_status(proc.pid) {
            if status.tgid != i64::from(proc.pid) {
                error!(
                    "Attempt to register a task that is not a thread group leader (tid {}, tgid {})",
                    proc.pid, status.tgid
                );
                return;
            }
        }

        let path = PathBuf::from(format!("/proc/{}/oom_score_adj", proc.pid));
        if !procfs::write_file_string(&path, &proc.oomadj.to_string(), false) {
            // If this file does not exist the process is dead
            warn!(
                "Failed to open {}: process {} might have been killed",
                path.display(),
                proc.pid
            );
            return;
        }

        if self.use_inkernel_interface {
            return;
        }

        self.register_oom_adj_proc(proc, cred_pid, cred_uid);
    }

    fn register_oom_adj_proc(&mut self, proc: &ProcPrio, cred_pid: i32, cred_uid: u32) {
        let mut oom_adj_score = proc.oomadj;

        // Soft limits are only managed for apps, never for services
        if proc.ptype == ProcType::App && self.tun.per_app_memcg {
            let (score, soft_limit_mult) = soft_limit_policy(proc.oomadj);
            oom_adj_score = score;

            let soft_limit_path = PathBuf::from(format!(
                "/dev/memcg/apps/uid_{}/pid_{}/memory.soft_limit_in_bytes",
                proc.uid, proc.pid
            ));
            // system_server has no memcg under the apps hierarchy but must
            // still be registered; missing-file errors are suppressed for it
            let is_system_server = oom_adj_score == SYSTEM_ADJ
                && nix::unistd::User::from_name("system")
                    .ok()
                    .flatten()
                    .map(|u| u.uid.as_raw() == proc.uid)
                    .unwrap_or(false);
            procfs::write_file_string(
                &soft_limit_path,
                &(soft_limit_mult * EIGHT_MEGA).to_string(),
                !is_system_server,
            );
        }

        if self.registry.lookup(proc.pid).is_none() {
            let pidfd = if self.pidfd_supported {
                match pidfd_open(proc.pid) {
                    Ok(fd) => Some(fd),
                    Err(e) => {
                        error!("pidfd_open for pid {} failed: {e}", proc.pid);
                        return;
                    }
                }
            } else {
                None
            };
            self.registry
                .insert(proc.pid, proc.uid, oom_adj_score, cred_pid, pidfd);
        } else {
            match self.registry.try_claim(proc.pid, cred_pid) {
                Some(true) => self.registry.set_score(proc.pid, oom_adj_score),
                Some(false) => {
                    let taskname = procfs::read_cmdline_name(cred_pid)
                        .unwrap_or_else(|| "A process".to_string());
                    error!(
                        "{taskname} ({cred_uid}, {cred_pid}) attempts to modify a process registered by another client"
                    );
                }
                None => {}
            }
        }
    }

    fn cmd_procremove(&mut self, pid: i32, cred_pid: i32, cred_uid: u32) {
        if self.use_inkernel_interface {
            return;
        }
        match self.registry.remove_if_claimed(pid, cred_pid) {
            RemoveOutcome::Denied => {
                let taskname =
                    procfs::read_cmdline_name(cred_pid).unwrap_or_else(|| "A process".to_string());
                error!(
                    "{taskname} ({cred_uid}, {cred_pid}) attempts to unregister a process registered by another client"
                );
            }
            RemoveOutcome::NotFound | RemoveOutcome::Removed(_) => {}
        }
    }

    fn cmd_procpurge(&mut self, cred_pid: i32) {
        if self.use_inkernel_interface {
            return;
        }
        let purged = self.registry.purge(cred_pid);
        if !purged.is_empty() {
            info!("Purged {} process records of peer {cred_pid}", purged.len());
        }
    }

    fn cmd_update_props(&mut self) -> i32 {
        self.props.reload();
        self.tun = Tunables::load(&*self.props);
        self.reaper.enable_debug(self.tun.debug_process_killing);

        let mut result = -1;
        if !self.use_inkernel_interface && self.monitors_initialized {
            // Reinitialize monitors to apply the new settings
            self.destroy_monitors();
            if self.init_monitors() {
                result = 0;
            }
        } else {
            result = 0;
        }

        if self.tun.direct_reclaim_threshold_ms > 0 && self.memevent_source.is_none() {
            warn!("Kernel support for direct_reclaim_threshold_ms is not found");
            self.tun.direct_reclaim_threshold_ms = 0;
        }
        result
    }

    fn cmd_start_monitoring(&mut self) {
        // Registration is only needed if it was skipped at startup
        if self.monitors_initialized {
            return;
        }
        self.props.reload();
        if !self.props.get_bool(PROP_BOOT_COMPLETED, false) {
            error!("START_MONITORING cannot be handled before boot completed");
            return;
        }
        if !self.init_monitors() {
            error!("Failure to initialize monitoring. Exiting...");
            std::process::exit(1);
        }
        info!("Initialized monitors after boot completed.");
    }

    fn cmd_boot_completed(&mut self) -> i32 {
        if self.boot_completed_handled {
            return 1;
        }
        self.props.reload();
        if !self.props.get_bool(PROP_BOOT_COMPLETED, false) {
            error!("BOOT_COMPLETED cannot be handled before boot completed");
            return -1;
        }
        // The listener is initialized after boot so we never stall waiting
        // for the loader during boot-up
        if self.init_memevent_listener() {
            info!("Using memevents for direct reclaim and kswapd detection");
        } else {
            info!("Using vmstats for direct reclaim and kswapd detection");
            if self.tun.direct_reclaim_threshold_ms > 0 {
                warn!("Kernel support for direct_reclaim_threshold_ms is not found");
                self.tun.direct_reclaim_threshold_ms = 0;
            }
        }
        self.boot_completed_handled = true;
        0
    }
}

fn read_usage_file(file: &mut ProcFile) -> Option<i64> {
    let text = file.read().ok()?;
    let usage = procfs::parse_i64_prefix(text.trim())?;
    if usage == 0 {
        error!("No memory!");
        return None;
    }
    Some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_limit_policy_mapping() {
        assert_eq!(soft_limit_policy(900), (900, 0));
        assert_eq!(soft_limit_policy(800), (800, 0));
        assert_eq!(soft_limit_policy(700), (700, 0));
        // The launcher override forces perceptible with multiplier 1
        assert_eq!(soft_limit_policy(600), (200, 1));
        assert_eq!(soft_limit_policy(500), (500, 0));
        assert_eq!(soft_limit_policy(400), (400, 0));
        assert_eq!(soft_limit_policy(300), (300, 1));
        assert_eq!(soft_limit_policy(200), (200, 8));
        assert_eq!(soft_limit_policy(100), (100, 10));
        assert_eq!(soft_limit_policy(0), (0, 20));
        assert_eq!(soft_limit_policy(-900), (-900, 64));
    }

    #[test]
    fn test_token_mapping() {
        assert_eq!(data_slot_of_token(TOKEN_DATA_BASE), Some(0));
        assert_eq!(data_slot_of_token(TOKEN_DATA_BASE + 2), Some(2));
        assert_eq!(data_slot_of_token(TOKEN_DATA_BASE + 3), None);
        assert_eq!(data_slot_of_token(TOKEN_CTRL_LISTEN), None);
        assert_eq!(
            pressure_level_of_token(TOKEN_PRESSURE_BASE),
            Some(PressureLevel::Low)
        );
        assert_eq!(
            pressure_level_of_token(TOKEN_PRESSURE_BASE + 2),
            Some(PressureLevel::Critical)
        );
        assert_eq!(pressure_level_of_token(TOKEN_PRESSURE_BASE + 3), None);
    }

    #[test]
    fn test_poll_state_transitions() {
        let mut poll = PollState::new();
        let now = Instant::now();
        let src = PollSource {
            level: PressureLevel::Medium,
        };

        poll.apply(PollingUpdate::Start, src, 100, now);
        assert_eq!(poll.source, Some(src));
        assert_eq!(poll.interval_ms, 100);

        // Pause stashes the active source for a later resume
        poll.apply(PollingUpdate::Pause, src, 100, now);
        assert_eq!(poll.source, None);
        assert_eq!(poll.paused, Some(src));

        poll.apply(PollingUpdate::Resume, src, 100, now);
        assert_eq!(poll.source, Some(src));
        assert!(poll.resume_immediately);
        assert_eq!(poll.interval_ms, PSI_POLL_PERIOD_SHORT_MS);

        // The polling window expires after the PSI window elapses
        poll.resume_immediately = false;
        let later = now + Duration::from_millis(PSI_WINDOW_SIZE_MS + 500);
        poll.apply(PollingUpdate::DoNotChange, src, 100, later);
        assert_eq!(poll.source, None);
    }

    #[test]
    fn test_epoll_timeout_clamps() {
        // Values beyond the u16 range must not wrap
        let _ = epoll_timeout(0);
        let _ = epoll_timeout(100);
        let _ = epoll_timeout(u64::MAX);
    }
}
