//! Victim selection and the kill-and-wait protocol.
//!
//! `find_and_kill` walks the registry from the highest score down to the
//! engine's minimum, kills one process and returns the RSS it should free.
//! The process fd of the victim moves from its record into the single-slot
//! [`KillWatch`], which owns it until the kernel signals the process fully
//! reaped (read-readiness), the kill timeout expires, or the reaper reports
//! failure.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Instant;

use log::{debug, error, info};

use crate::config::{Tunables, OOM_SCORE_ADJ_MAX, PERCEPTIBLE_APP_ADJ};
use crate::control::protocol::KillStat;
use crate::engine::KillRequest;
use crate::procfs::{self, page_k, MemInfo};
use crate::registry::{KillCounters, Registry, VictimRef};
use crate::reaper::Reaper;

/// Registers and unregisters the watched process fd with the main loop's
/// multiplexer.
pub trait KillWaitNotifier {
    fn register(&mut self, fd: RawFd) -> std::io::Result<()>;
    fn unregister(&mut self, fd: RawFd);
}

/// A no-op notifier for contexts without a multiplexer.
pub struct NullWaitNotifier;

impl KillWaitNotifier for NullWaitNotifier {
    fn register(&mut self, _fd: RawFd) -> std::io::Result<()> {
        Ok(())
    }
    fn unregister(&mut self, _fd: RawFd) {}
}

/// Consumes the per-kill record: notifications to subscribed peers and the
/// structured kill log.
pub trait KillEventSink {
    fn kill_occurred(&mut self, stat: &KillStat);
}

pub struct NullEventSink;

impl KillEventSink for NullEventSink {
    fn kill_occurred(&mut self, _stat: &KillStat) {}
}

enum KillHandle {
    Pidfd(OwnedFd),
    Pid(i32),
}

/// The kill-in-flight state: the PID (without process-fd support) or the fd
/// currently being waited on, plus the timestamp of the kill.
#[derive(Default)]
pub struct KillWatch {
    entry: Option<KillHandle>,
    last_kill: Option<Instant>,
}

impl KillWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin waiting on a victim. An fd handle is registered with the
    /// multiplexer for read-readiness, which fires once the process is
    /// fully reaped.
    pub fn start(
        &mut self,
        pidfd: Option<OwnedFd>,
        pid: i32,
        waiter: &mut dyn KillWaitNotifier,
        debug_killing: bool,
    ) {
        if self.entry.is_some() {
            // Should not happen, but a stale wait must not leak
            error!("Attempt to wait for a kill while another wait is in progress");
            self.stop(false, waiter, debug_killing);
        }
        match pidfd {
            Some(fd) => {
                if let Err(e) = waiter.register(fd.as_raw_fd()) {
                    error!("Failed to register kill watch fd: {e}");
                    return;
                }
                self.entry = Some(KillHandle::Pidfd(fd));
            }
            None => self.entry = Some(KillHandle::Pid(pid)),
        }
    }

    /// Release the wait. `finished` distinguishes reaper completion from
    /// timeouts and failures.
    pub fn stop(&mut self, finished: bool, waiter: &mut dyn KillWaitNotifier, debug_killing: bool) {
        let entry = match self.entry.take() {
            Some(e) => e,
            None => return,
        };
        if debug_killing {
            let elapsed = self
                .last_kill
                .map(|t| t.elapsed().as_millis())
                .unwrap_or(0);
            if finished {
                info!("Process got killed in {elapsed}ms");
            } else {
                info!("Stop waiting for process kill after {elapsed}ms");
            }
        }
        if let KillHandle::Pidfd(fd) = entry {
            waiter.unregister(fd.as_raw_fd());
            // fd drops here, after the in-flight wait completed
        }
    }

    pub fn mark_kill(&mut self, now: Instant) {
        self.last_kill = Some(now);
    }

    /// Whether the last killed process still holds memory. Without process
    /// fds the decision falls back to `/proc/<pid>` existence.
    pub fn is_kill_pending(&self) -> bool {
        match &self.entry {
            None => false,
            Some(KillHandle::Pidfd(_)) => true,
            Some(KillHandle::Pid(pid)) => Path::new(&format!("/proc/{pid}")).exists(),
        }
    }

    /// Whether the multiplexer is waiting on a process fd.
    pub fn is_waiting_for_kill(&self) -> bool {
        matches!(self.entry, Some(KillHandle::Pidfd(_)))
    }

    pub fn watched_fd(&self) -> Option<RawFd> {
        match &self.entry {
            Some(KillHandle::Pidfd(fd)) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }

    fn pidfd(&self) -> Option<&OwnedFd> {
        match &self.entry {
            Some(KillHandle::Pidfd(fd)) => Some(fd),
            _ => None,
        }
    }

    pub fn elapsed_since_kill_ms(&self, now: Instant) -> Option<u64> {
        self.last_kill
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
    }
}

/// Everything a kill needs, borrowed from the daemon for one walk.
pub struct KillContext<'a> {
    pub registry: &'a Registry,
    pub reaper: &'a Reaper,
    pub watch: &'a mut KillWatch,
    pub killcnt: &'a mut KillCounters,
    pub sink: &'a mut dyn KillEventSink,
    pub waiter: &'a mut dyn KillWaitNotifier,
    pub sizer: &'a mut dyn FnMut(i32) -> Option<i64>,
    pub tun: &'a Tunables,
}

/// Kill one process. Returns the RSS of the victim in pages, or -1 when the
/// candidate was unusable (vanished, pid reused, zombie, kill failed); the
/// record is removed either way so the selector never gets stuck on it.
pub fn kill_one(
    ctx: &mut KillContext,
    victim: &VictimRef,
    min_score: i32,
    req: Option<&KillRequest>,
    mi: &MemInfo,
    now: Instant,
) -> i64 {
    let pid = victim.pid;

    let fresh = match ctx.registry.lookup(pid) {
        Some(v) if v.valid => v,
        _ => {
            ctx.registry.remove(pid);
            return -1;
        }
    };
    let status = match procfs::read_proc_status(pid) {
        Some(st) => st,
        None => {
            ctx.registry.remove(pid);
            return -1;
        }
    };
    if status.tgid != i64::from(pid) {
        error!(
            "Possible pid reuse detected (pid {pid}, tgid {})!",
            status.tgid
        );
        ctx.registry.remove(pid);
        return -1;
    }
    // Zombies carry no RSS/Swap fields
    let (rss_kb, swap_kb) = match (status.rss_kb, status.swap_kb) {
        (Some(r), Some(s)) => (r, s),
        _ => {
            ctx.registry.remove(pid);
            return -1;
        }
    };
    let taskname = match procfs::read_cmdline_name(pid) {
        Some(name) => name,
        None => {
            ctx.registry.remove(pid);
            return -1;
        }
    };

    let mut rec = match ctx.registry.remove(pid) {
        Some(rec) => rec,
        None => return -1,
    };
    ctx.watch
        .start(rec.pidfd.take(), pid, ctx.waiter, ctx.tun.debug_process_killing);

    if let Err(e) = ctx
        .reaper
        .kill(ctx.watch.pidfd(), pid, fresh.uid, false)
    {
        ctx.watch
            .stop(false, ctx.waiter, ctx.tun.debug_process_killing);
        error!("kill({pid}): {e}");
        return -1;
    }

    ctx.watch.mark_kill(now);
    ctx.killcnt.increment(fresh.oomadj);

    match req {
        Some(req) => info!(
            "Kill '{taskname}' ({pid}), uid {}, oom_score_adj {} to free {rss_kb}kB rss, {swap_kb}kB swap; reason: {}",
            fresh.uid, fresh.oomadj, req.desc
        ),
        None => info!(
            "Kill '{taskname}' ({pid}), uid {}, oom_score_adj {} to free {rss_kb}kB rss, {swap_kb}kB swap",
            fresh.uid, fresh.oomadj
        ),
    }

    let stat = KillStat {
        uid: fresh.uid as i32,
        pid,
        oom_score: fresh.oomadj,
        min_oom_score: min_score,
        free_mem_kb: mi.nr_free_pages * page_k(),
        free_swap_kb: crate::engine::free_swap(mi, ctx.tun.swap_compression_ratio) * page_k(),
        kill_reason: req.map(|r| r.reason.code()).unwrap_or(-1),
        thrashing: req.map(|r| r.thrashing as i32).unwrap_or(0),
        max_thrashing: req.map(|r| r.max_thrashing as i32).unwrap_or(0),
        rss_kb,
        swap_kb,
        taskname,
    };
    ctx.sink.kill_occurred(&stat);

    rss_kb / page_k()
}

/// Walk scores from the top down to `min_score` and kill one candidate: the
/// bucket tail by default, the heaviest by RSS when configured or once the
/// walk reaches perceptible territory (fewer, bigger victims there).
/// Returns the freed RSS in pages, 0 if nothing could be killed.
pub fn find_and_kill(
    ctx: &mut KillContext,
    min_score: i32,
    req: Option<&KillRequest>,
    mi: &MemInfo,
    now: Instant,
) -> i64 {
    let mut choose_heaviest = ctx.tun.kill_heaviest_task;
    let mut killed_size = 0i64;

    let mut score = OOM_SCORE_ADJ_MAX;
    while score >= min_score {
        if !choose_heaviest && score <= PERCEPTIBLE_APP_ADJ {
            choose_heaviest = true;
        }
        loop {
            let victim = if choose_heaviest {
                let (pick, dropped) = ctx.registry.heaviest(score, ctx.sizer);
                if !dropped.is_empty() {
                    debug!("Dropped {} stale records at score {score}", dropped.len());
                }
                pick
            } else {
                ctx.registry.tail(score)
            };
            let victim = match victim {
                Some(v) => v,
                None => break,
            };
            killed_size = kill_one(ctx, &victim, min_score, req, mi, now);
            if killed_size >= 0 {
                break;
            }
        }
        // A bucket whose candidates all failed ends the walk for this cycle:
        // the stale records are gone and the next wakeup retries cleanly
        if killed_size != 0 {
            break;
        }
        score -= 1;
    }

    killed_size.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemProperties;

    fn test_ctx<'a>(
        registry: &'a Registry,
        reaper: &'a Reaper,
        watch: &'a mut KillWatch,
        killcnt: &'a mut KillCounters,
        sink: &'a mut dyn KillEventSink,
        waiter: &'a mut dyn KillWaitNotifier,
        sizer: &'a mut dyn FnMut(i32) -> Option<i64>,
        tun: &'a Tunables,
    ) -> KillContext<'a> {
        KillContext {
            registry,
            reaper,
            watch,
            killcnt,
            sink,
            waiter,
            sizer,
            tun,
        }
    }

    struct RecordingSink {
        stats: Vec<KillStat>,
    }

    impl KillEventSink for RecordingSink {
        fn kill_occurred(&mut self, stat: &KillStat) {
            self.stats.push(stat.clone());
        }
    }

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep")
    }

    fn tunables() -> Tunables {
        Tunables::load(&MemProperties::new())
    }

    #[test]
    fn test_find_and_kill_highest_score_first() {
        let registry = Registry::new();
        let reaper = Reaper::new();
        let mut watch = KillWatch::new();
        let mut killcnt = KillCounters::new();
        let mut sink = RecordingSink { stats: Vec::new() };
        let mut waiter = NullWaitNotifier;
        let mut sizer = |pid: i32| procfs::read_statm_rss(pid);
        let tun = tunables();

        let mut high = spawn_sleeper();
        let mut mid = spawn_sleeper();
        let mut low = spawn_sleeper();
        registry.insert(high.id() as i32, 10900, 900, 1, None);
        registry.insert(mid.id() as i32, 10800, 800, 1, None);
        registry.insert(low.id() as i32, 10000, 0, 1, None);

        let mi = MemInfo::default();
        let mut ctx = test_ctx(
            &registry, &reaper, &mut watch, &mut killcnt, &mut sink, &mut waiter, &mut sizer,
            &tun,
        );
        let freed = find_and_kill(&mut ctx, 701, None, &mi, Instant::now());
        assert!(freed > 0);

        // The score-900 record was killed and removed; the others survive
        assert!(registry.lookup(high.id() as i32).is_none());
        assert!(registry.lookup(mid.id() as i32).is_some());
        assert!(registry.lookup(low.id() as i32).is_some());
        assert_eq!(killcnt.range_count(900, 900), 1);
        assert_eq!(sink.stats.len(), 1);
        assert_eq!(sink.stats[0].pid, high.id() as i32);
        assert_eq!(sink.stats[0].oom_score, 900);
        assert_eq!(sink.stats[0].min_oom_score, 701);

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(high.wait().unwrap().signal(), Some(libc::SIGKILL));
        let _ = mid.kill();
        let _ = low.kill();
        let _ = mid.wait();
        let _ = low.wait();
    }

    #[test]
    fn test_tgid_mismatch_skips_to_next_candidate() {
        // A thread id of this test process looks like a process whose
        // /proc/<pid>/status reports a different Tgid: pid-reuse protection
        // must drop it and move on to the next candidate.
        let my_pid = std::process::id() as i32;
        let tid = std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse::<i32>().ok())
            .find(|&tid| tid != my_pid);
        let tid = match tid {
            Some(t) => t,
            // Single-threaded runner; nothing to exercise
            None => return,
        };

        let registry = Registry::new();
        let reaper = Reaper::new();
        let mut watch = KillWatch::new();
        let mut killcnt = KillCounters::new();
        let mut sink = RecordingSink { stats: Vec::new() };
        let mut waiter = NullWaitNotifier;
        let mut sizer = |pid: i32| procfs::read_statm_rss(pid);
        let tun = tunables();

        let mut child = spawn_sleeper();
        registry.insert(tid, 0, 900, 1, None);
        registry.insert(child.id() as i32, 10001, 900, 1, None);

        let mi = MemInfo::default();
        let mut ctx = test_ctx(
            &registry, &reaper, &mut watch, &mut killcnt, &mut sink, &mut waiter, &mut sizer,
            &tun,
        );
        let freed = find_and_kill(&mut ctx, 0, None, &mi, Instant::now());
        assert!(freed > 0);

        // The mismatched record is gone without a kill, the real child died
        assert!(registry.lookup(tid).is_none());
        assert!(registry.lookup(child.id() as i32).is_none());
        assert_eq!(sink.stats.len(), 1);
        assert_eq!(sink.stats[0].pid, child.id() as i32);
        let _ = child.wait();
    }

    #[test]
    fn test_kill_watch_pid_fallback() {
        let mut watch = KillWatch::new();
        let mut waiter = NullWaitNotifier;
        assert!(!watch.is_kill_pending());
        assert!(!watch.is_waiting_for_kill());

        // Our own pid exists in /proc, so the wait is pending
        watch.start(None, std::process::id() as i32, &mut waiter, false);
        assert!(watch.is_kill_pending());
        // PID-based waits never hold the multiplexer
        assert!(!watch.is_waiting_for_kill());

        watch.stop(true, &mut waiter, false);
        assert!(!watch.is_kill_pending());

        // A pid that cannot exist reads as already reclaimed
        watch.start(None, i32::MAX - 2, &mut waiter, false);
        assert!(!watch.is_kill_pending());
        watch.stop(false, &mut waiter, false);
    }

    #[test]
    fn test_kill_watch_owns_pidfd_until_stop() {
        if !crate::reaper::pidfd_supported() {
            return;
        }
        let child = spawn_sleeper();
        let fd = crate::reaper::pidfd_open(child.id() as i32).unwrap();
        let raw = fd.as_raw_fd();

        let mut watch = KillWatch::new();
        let mut waiter = NullWaitNotifier;
        watch.start(Some(fd), child.id() as i32, &mut waiter, false);
        assert!(watch.is_waiting_for_kill());
        assert_eq!(watch.watched_fd(), Some(raw));
        assert!(watch.is_kill_pending());

        watch.mark_kill(Instant::now());
        assert!(watch.elapsed_since_kill_ms(Instant::now()).is_some());

        watch.stop(true, &mut waiter, false);
        assert!(!watch.is_waiting_for_kill());
        assert_eq!(watch.watched_fd(), None);

        let mut child = child;
        let _ = child.kill();
        let _ = child.wait();
    }
}
