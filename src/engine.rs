//! The memory-pressure decision engine.
//!
//! On every wakeup the engine ingests fresh meminfo/vmstat/PSI snapshots,
//! zone watermarks, swap state and reclaim activity, and classifies the
//! situation into a kill reason carrying a minimum oom_score_adj, or decides
//! that no kill is needed. All rolling state lives in [`Engine`] and every
//! invocation takes `&mut Engine`, which keeps ordering explicit and lets
//! tests drive the policy with synthetic snapshots.

use std::time::Instant;

use log::{error, info};

use crate::config::{Tunables, OOM_SCORE_ADJ_MAX, PERCEPTIBLE_APP_ADJ};
use crate::error::Result;
use crate::monitors::PressureLevel;
use crate::procfs::{page_k, MemInfo, PsiStats, VmStat, ZoneInfo};

pub const PSI_WINDOW_SIZE_MS: u64 = 1000;
pub const PSI_POLL_PERIOD_SHORT_MS: u64 = 10;
pub const PSI_POLL_PERIOD_LONG_MS: u64 = 100;
const THRASHING_RESET_INTERVAL_MS: u64 = 1000;
const WMARK_REPARSE_INTERVAL_MS: u64 = 60_000;

pub const VENDOR_KILL_REASON_BASE: i32 = 1000;
const VENDOR_KILL_REASON_MAX: i32 = 99;

/// Why a kill was requested. The discriminants are stable codes reported in
/// kill notifications and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    PressureAfterKill,
    NotResponding,
    LowSwapAndThrashing,
    LowMemAndSwap,
    LowMemAndThrashing,
    DirectReclAndThrashing,
    LowMemAndSwapUtil,
    LowFilecacheAfterThrashing,
    LowMem,
    DirectReclStuck,
    Vendor(i32),
}

impl KillReason {
    pub fn code(self) -> i32 {
        match self {
            Self::PressureAfterKill => 0,
            Self::NotResponding => 1,
            Self::LowSwapAndThrashing => 2,
            Self::LowMemAndSwap => 3,
            Self::LowMemAndThrashing => 4,
            Self::DirectReclAndThrashing => 5,
            Self::LowMemAndSwapUtil => 6,
            Self::LowFilecacheAfterThrashing => 7,
            Self::LowMem => 8,
            Self::DirectReclStuck => 9,
            Self::Vendor(code) => VENDOR_KILL_REASON_BASE + code,
        }
    }
}

/// Zone watermark bands, lowest breached first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatermarkBreach {
    Min,
    Low,
    High,
    None,
}

/// Sums of the per-zone min/low/high watermarks plus each zone's highest
/// protection value, across all populated zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneWatermarks {
    pub min_wmark: i64,
    pub low_wmark: i64,
    pub high_wmark: i64,
}

impl ZoneWatermarks {
    pub fn from_zoneinfo(zi: &ZoneInfo) -> Self {
        let mut wm = ZoneWatermarks::default();
        for node in &zi.nodes {
            for zone in &node.zones {
                if zone.present == 0 {
                    continue;
                }
                wm.min_wmark += zone.max_protection + zone.min;
                wm.low_wmark += zone.max_protection + zone.low;
                wm.high_wmark += zone.max_protection + zone.high;
            }
        }
        wm
    }

    /// The lowest breached watermark for the given free-page count.
    pub fn lowest_breached(&self, nr_free_pages: i64) -> WatermarkBreach {
        if nr_free_pages < self.min_wmark {
            WatermarkBreach::Min
        } else if nr_free_pages < self.low_wmark {
            WatermarkBreach::Low
        } else if nr_free_pages < self.high_wmark {
            WatermarkBreach::High
        } else {
            WatermarkBreach::None
        }
    }
}

/// Where fresh watermark sums come from (a zoneinfo re-parse in production,
/// a table in tests).
pub trait WatermarkSource {
    fn refresh(&mut self) -> Result<ZoneWatermarks>;
}

impl WatermarkSource for crate::procfs::ProcReaders {
    fn refresh(&mut self) -> Result<ZoneWatermarks> {
        let zi = self.read_zoneinfo()?;
        Ok(ZoneWatermarks::from_zoneinfo(&zi))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeKind {
    Event,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Psi { level: PressureLevel, wake: WakeKind },
    Vendor { reason_code: i32, min_score: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimState {
    None,
    Kswapd,
    Direct,
}

/// Reclaim begin/end timestamps maintained by the memory-event listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReclaimTimestamps {
    pub direct_reclaim_start: Option<Instant>,
    pub kswapd_start: Option<Instant>,
}

/// Wakeup bookkeeping for kill records: timestamps of the last event and the
/// last wakeups, how many polling wakeups followed the event and how many
/// were skipped because a previous kill was still reclaiming.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeupInfo {
    pub wakeup: Option<Instant>,
    pub prev_wakeup: Option<Instant>,
    pub last_event: Option<Instant>,
    pub wakeups_since_event: u32,
    pub skipped_wakeups: u32,
}

impl WakeupInfo {
    pub fn record(&mut self, now: Instant, kind: WakeKind) {
        self.prev_wakeup = self.wakeup;
        self.wakeup = Some(now);
        match kind {
            WakeKind::Event => {
                self.last_event = Some(now);
                self.wakeups_since_event = 0;
                self.skipped_wakeups = 0;
            }
            WakeKind::Polling => self.wakeups_since_event += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KillRequest {
    pub reason: KillReason,
    pub min_score: i32,
    pub desc: String,
    pub thrashing: i64,
    pub max_thrashing: i64,
    pub cut_thrashing_limit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingUpdate {
    DoNotChange,
    Start,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDirective {
    pub update: PollingUpdate,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// A kill is still in flight; skip this wakeup.
    Skip,
    /// Go ahead; the pending wait (if any) must be released first.
    Proceed { release_finished: bool },
}

pub struct EvalInput<'a> {
    pub source: EventSource,
    pub now: Instant,
    pub mi: &'a MemInfo,
    pub vs: &'a VmStat,
    pub psi_mem: Option<&'a PsiStats>,
    /// Present when the memory-event listener maintains reclaim timestamps;
    /// absent means reclaim is detected from vmstat deltas.
    pub reclaim_ts: Option<ReclaimTimestamps>,
    pub zone_refresh_supported: bool,
}

fn ms_since(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}

pub fn free_swap(mi: &MemInfo, swap_compression_ratio: i64) -> i64 {
    // With ZRAM, swap space is carved out of the very memory being reclaimed,
    // so the reported free swap is capped by what the system could actually
    // compress into easily available memory.
    if swap_compression_ratio != 0 {
        mi.free_swap.min(mi.easy_available * swap_compression_ratio)
    } else {
        mi.free_swap
    }
}

pub fn swap_utilization(mi: &MemInfo, swap_compression_ratio: i64) -> i64 {
    let swap_used = mi.total_swap - free_swap(mi, swap_compression_ratio);
    let total_swappable = mi.active_anon + mi.inactive_anon + mi.shmem + swap_used;
    if total_swappable > 0 {
        swap_used * 100 / total_swappable
    } else {
        0
    }
}

pub struct Engine {
    init_ws_refault: i64,
    prev_workingset_refault: i64,
    base_file_lru: i64,
    init_pgscan_kswapd: i64,
    init_pgscan_direct: i64,
    init_pgrefill: i64,
    killing: bool,
    thrashing_limit: i64,
    watermarks: Option<ZoneWatermarks>,
    wmark_update: Option<Instant>,
    thrashing_reset: Option<Instant>,
    prev_thrash_growth: i64,
    check_filecache: bool,
    max_thrashing: i64,
    first_kill: bool,
    prev_level: PressureLevel,
    pub wakeup: WakeupInfo,
    pub event_count: u64,
    // Inputs to the polling directive, refreshed by the last evaluation
    swap_is_low: bool,
    last_reclaim: ReclaimState,
}

impl Engine {
    pub fn new(tun: &Tunables) -> Self {
        Self {
            init_ws_refault: 0,
            prev_workingset_refault: 0,
            base_file_lru: 0,
            init_pgscan_kswapd: 0,
            init_pgscan_direct: 0,
            init_pgrefill: 0,
            killing: false,
            thrashing_limit: tun.thrashing_limit_pct as i64,
            watermarks: None,
            wmark_update: None,
            thrashing_reset: None,
            prev_thrash_growth: 0,
            check_filecache: false,
            max_thrashing: 0,
            first_kill: true,
            prev_level: PressureLevel::Low,
            wakeup: WakeupInfo::default(),
            event_count: 0,
            swap_is_low: false,
            last_reclaim: ReclaimState::None,
        }
    }

    /// Step 1: rate-limit and level-lock. A PSI event at a level lower than
    /// the previous one within the same polling window is dropped; after the
    /// window elapses a polling tick resets the stored level.
    pub fn accept_psi_event(
        &mut self,
        level: PressureLevel,
        wake: WakeKind,
        now: Instant,
        debug_killing: bool,
    ) -> bool {
        self.event_count += 1;
        if debug_killing {
            info!(
                "{} memory pressure event #{} is triggered",
                level.name(),
                self.event_count
            );
        }
        match wake {
            WakeKind::Event => {
                if level < self.prev_level {
                    if debug_killing {
                        info!("Ignoring {} pressure event; occurred too soon.", level.name());
                    }
                    return false;
                }
                self.prev_level = level;
            }
            WakeKind::Polling => self.prev_level = PressureLevel::Low,
        }
        self.wakeup.record(now, wake);
        true
    }

    pub fn note_vendor_event(&mut self, debug_killing: bool) {
        self.event_count += 1;
        if debug_killing {
            info!("vendor kill event #{} is triggered", self.event_count);
        }
    }

    /// Step 2: while a kill is in flight and the timeout has not elapsed,
    /// every wakeup is skipped so kills stay strictly serial.
    pub fn gate_kill_in_flight(
        &mut self,
        kill_pending: bool,
        elapsed_since_kill_ms: Option<u64>,
        tun: &Tunables,
    ) -> Gate {
        if kill_pending
            && (tun.kill_timeout_ms == 0
                || elapsed_since_kill_ms.unwrap_or(0) < tun.kill_timeout_ms)
        {
            self.wakeup.skipped_wakeups += 1;
            return Gate::Skip;
        }
        Gate::Proceed {
            release_finished: !kill_pending,
        }
    }

    /// Steps 3..10 (classification): decide whether to kill and with which
    /// minimum score. A Some result means the caller should invoke victim
    /// selection and then report back via [`Engine::note_kill_result`].
    pub fn evaluate(
        &mut self,
        inp: &EvalInput,
        tun: &Tunables,
        wm_source: &mut dyn WatermarkSource,
    ) -> Option<KillRequest> {
        let mi = inp.mi;
        let vs = inp.vs;
        let workingset_refault = vs.workingset_refault_resolved();

        // Step 4: reset baselines after the process killed on the previous
        // cycle released its memory
        let cycle_after_kill = self.killing;
        if self.killing {
            self.killing = false;
            self.base_file_lru = vs.nr_inactive_file + vs.nr_active_file;
            self.init_ws_refault = workingset_refault;
            self.thrashing_reset = Some(inp.now);
            self.prev_thrash_growth = 0;
        }

        // Step 5: swap and reclaim state
        let swap_low_threshold = if tun.swap_free_low_percentage > 0 {
            mi.total_swap * i64::from(tun.swap_free_low_percentage) / 100
        } else {
            0
        };
        self.swap_is_low = swap_low_threshold > 0
            && free_swap(mi, tun.swap_compression_ratio) < swap_low_threshold;

        let (in_direct_reclaim, in_kswapd_reclaim) = match inp.reclaim_ts {
            Some(ts) => (ts.direct_reclaim_start.is_some(), ts.kswapd_start.is_some()),
            None => (
                vs.pgscan_direct != self.init_pgscan_direct,
                vs.pgscan_kswapd != self.init_pgscan_kswapd || vs.pgrefill != self.init_pgrefill,
            ),
        };

        let mut direct_reclaim_duration_ms: Option<u64> = None;
        let reclaim = if in_direct_reclaim {
            self.init_pgscan_direct = vs.pgscan_direct;
            self.init_pgscan_kswapd = vs.pgscan_kswapd;
            self.init_pgrefill = vs.pgrefill;
            if let Some(ts) = inp.reclaim_ts {
                direct_reclaim_duration_ms =
                    ts.direct_reclaim_start.map(|t| ms_since(t, inp.now));
            }
            ReclaimState::Direct
        } else if in_kswapd_reclaim {
            self.init_pgscan_kswapd = vs.pgscan_kswapd;
            self.init_pgrefill = vs.pgrefill;
            ReclaimState::Kswapd
        } else if workingset_refault == self.prev_workingset_refault
            && matches!(inp.source, EventSource::Psi { .. })
        {
            // Not thrashing and not reclaiming; bail out early until these
            // stats start moving
            self.last_reclaim = ReclaimState::None;
            return None;
        } else {
            ReclaimState::None
        };
        self.last_reclaim = reclaim;
        self.prev_workingset_refault = workingset_refault;

        // Step 6: thrashing window arithmetic. When a reset window is
        // crossed the growth carries over, decayed by the number of windows
        // passed unless over-the-limit thrashing was registered in the
        // window just crossed (no eligible victim was found then, and the
        // preserved counter forces a retry once one appears).
        let mut thrashing: i64 = 0;
        let since_reset_ms = self
            .thrashing_reset
            .map(|t| ms_since(t, inp.now))
            .unwrap_or(u64::MAX);
        if since_reset_ms > THRASHING_RESET_INTERVAL_MS {
            if self.thrashing_reset.is_some() {
                self.prev_thrash_growth = (workingset_refault - self.init_ws_refault) * 100
                    / (self.base_file_lru + 1);
                let windows_passed = since_reset_ms / THRASHING_RESET_INTERVAL_MS;
                if windows_passed > 1 || self.prev_thrash_growth < self.thrashing_limit {
                    self.prev_thrash_growth = if windows_passed >= 63 {
                        0
                    } else {
                        self.prev_thrash_growth >> windows_passed
                    };
                }
            }
            self.base_file_lru = vs.nr_inactive_file + vs.nr_active_file;
            self.init_ws_refault = workingset_refault;
            self.thrashing_reset = Some(inp.now);
            self.thrashing_limit = i64::from(tun.thrashing_limit_pct);
        } else {
            thrashing =
                (workingset_refault - self.init_ws_refault) * 100 / (self.base_file_lru + 1);
        }
        thrashing += self.prev_thrash_growth;
        self.max_thrashing = self.max_thrashing.max(thrashing);

        // Step 8: critical full-stall state
        let critical_stall = inp
            .psi_mem
            .and_then(|psi| psi.full)
            .map(|full| f64::from(full.avg10) > tun.stall_limit_critical as f64)
            .unwrap_or(false);

        // Steps 7, 9, 10: watermarks and reason classification. Before the
        // first ever kill the watermarks are force-refreshed and the
        // classification re-run so a stale pre-boot snapshot cannot select a
        // victim.
        let mut force_refresh = false;
        loop {
            let watermarks = match self.ensure_watermarks(inp, wm_source, force_refresh) {
                Some(wm) => wm,
                None => return None,
            };
            let wmark = watermarks.lowest_breached(mi.nr_free_pages - mi.cma_free);

            let mut min_score_adj = 0i32;
            let mut cut_thrashing_limit = false;
            let mut reason: Option<KillReason> = None;
            let mut desc = String::new();

            match inp.source {
                EventSource::Vendor { reason_code, min_score } => {
                    if !(0..=VENDOR_KILL_REASON_MAX).contains(&reason_code) || min_score < 0 {
                        error!(
                            "Invalid vendor kill reason {reason_code}, min_oom_score_adj {min_score}"
                        );
                        return None;
                    }
                    reason = Some(KillReason::Vendor(reason_code));
                    min_score_adj = min_score;
                    desc = format!(
                        "vendor kill with the reason {}, min_score_adj {min_score}",
                        VENDOR_KILL_REASON_BASE + reason_code
                    );
                }
                EventSource::Psi { level, wake } => {
                    let event = wake == WakeKind::Event;
                    let fs_kb = free_swap(mi, tun.swap_compression_ratio) * page_k();
                    let thr_kb = swap_low_threshold * page_k();
                    let wmark_name = if wmark < WatermarkBreach::Low { "min" } else { "low" };

                    if cycle_after_kill && wmark < WatermarkBreach::Low {
                        // A process is consuming memory faster than reclaim
                        // can free even after a kill
                        reason = Some(KillReason::PressureAfterKill);
                        min_score_adj = tun.pressure_after_kill_min_score;
                        desc = "min watermark is breached even after kill".into();
                    } else if level == PressureLevel::Critical && event {
                        reason = Some(KillReason::NotResponding);
                        desc = "device is not responding".into();
                    } else if self.swap_is_low
                        && thrashing > i64::from(tun.thrashing_limit_pct)
                    {
                        reason = Some(KillReason::LowSwapAndThrashing);
                        desc = format!(
                            "device is low on swap ({fs_kb}kB < {thr_kb}kB) and thrashing ({thrashing}%)"
                        );
                        if wmark > WatermarkBreach::Min
                            && thrashing < i64::from(tun.thrashing_critical_pct)
                        {
                            min_score_adj = PERCEPTIBLE_APP_ADJ + 1;
                        }
                        self.check_filecache = true;
                    } else if self.swap_is_low && wmark < WatermarkBreach::High {
                        reason = Some(KillReason::LowMemAndSwap);
                        desc = format!(
                            "{wmark_name} watermark is breached and swap is low ({fs_kb}kB < {thr_kb}kB)"
                        );
                        if wmark > WatermarkBreach::Min
                            && thrashing < i64::from(tun.thrashing_critical_pct)
                        {
                            min_score_adj = PERCEPTIBLE_APP_ADJ + 1;
                        }
                    } else if wmark < WatermarkBreach::High && tun.swap_util_max < 100 && {
                        let util = swap_utilization(mi, tun.swap_compression_ratio);
                        if util > i64::from(tun.swap_util_max) {
                            desc = format!(
                                "{wmark_name} watermark is breached and swap utilization is high ({util}% > {}%)",
                                tun.swap_util_max
                            );
                            true
                        } else {
                            false
                        }
                    } {
                        // Too much anon memory is swapped out but swap is not
                        // low: non-swappable allocations created the pressure
                        reason = Some(KillReason::LowMemAndSwapUtil);
                    } else if wmark < WatermarkBreach::High && thrashing > self.thrashing_limit {
                        reason = Some(KillReason::LowMemAndThrashing);
                        desc = format!(
                            "{wmark_name} watermark is breached and thrashing ({thrashing}%)"
                        );
                        cut_thrashing_limit = true;
                        if thrashing < i64::from(tun.thrashing_critical_pct) {
                            min_score_adj = PERCEPTIBLE_APP_ADJ + 1;
                        }
                        self.check_filecache = true;
                    } else if reclaim == ReclaimState::Direct && thrashing > self.thrashing_limit {
                        reason = Some(KillReason::DirectReclAndThrashing);
                        desc = format!("device is in direct reclaim and thrashing ({thrashing}%)");
                        cut_thrashing_limit = true;
                        if thrashing < i64::from(tun.thrashing_critical_pct) {
                            min_score_adj = PERCEPTIBLE_APP_ADJ + 1;
                        }
                        self.check_filecache = true;
                    } else if reclaim == ReclaimState::Direct
                        && tun.direct_reclaim_threshold_ms > 0
                        && direct_reclaim_duration_ms
                            .map_or(false, |d| d > tun.direct_reclaim_threshold_ms as u64)
                    {
                        reason = Some(KillReason::DirectReclStuck);
                        desc = format!(
                            "device is stuck in direct reclaim ({}ms > {}ms)",
                            direct_reclaim_duration_ms.unwrap_or(0),
                            tun.direct_reclaim_threshold_ms
                        );
                    } else if self.check_filecache {
                        let file_lru_kb = (vs.nr_inactive_file + vs.nr_active_file) * page_k();
                        if file_lru_kb < tun.filecache_min_kb {
                            reason = Some(KillReason::LowFilecacheAfterThrashing);
                            desc = format!(
                                "filecache is low ({file_lru_kb}kB < {}kB) after thrashing",
                                tun.filecache_min_kb
                            );
                            min_score_adj = PERCEPTIBLE_APP_ADJ + 1;
                        } else {
                            // File cache has grown back, stop the scan
                            self.check_filecache = false;
                        }
                    }

                    if reason.is_none() && wmark < WatermarkBreach::High {
                        reason = Some(KillReason::LowMem);
                        desc = format!("{wmark_name} watermark is breached");
                        min_score_adj = tun.lowmem_min_oom_score;
                    }
                }
            }

            let reason = match reason {
                Some(r) => r,
                None => return None,
            };

            if self.first_kill {
                self.first_kill = false;
                force_refresh = true;
                continue;
            }

            // The stall override intentionally permits killing perceptible
            // apps when every task is blocked on memory
            if critical_stall {
                min_score_adj = 0;
            }

            return Some(KillRequest {
                reason,
                min_score: min_score_adj,
                desc,
                thrashing,
                max_thrashing: self.max_thrashing,
                cut_thrashing_limit,
            });
        }
    }

    fn ensure_watermarks(
        &mut self,
        inp: &EvalInput,
        wm_source: &mut dyn WatermarkSource,
        force: bool,
    ) -> Option<ZoneWatermarks> {
        let stale = !inp.zone_refresh_supported
            && self
                .wmark_update
                .map_or(true, |t| ms_since(t, inp.now) > WMARK_REPARSE_INTERVAL_MS);
        if force || self.watermarks.is_none() || stale {
            match wm_source.refresh() {
                Ok(wm) => {
                    self.watermarks = Some(wm);
                    self.wmark_update = Some(inp.now);
                }
                Err(e) => {
                    error!("Failed to parse zoneinfo: {e}");
                    return None;
                }
            }
        }
        self.watermarks
    }

    /// Called by the memory-event listener on a zone-refresh event.
    pub fn refresh_watermarks(&mut self, wm_source: &mut dyn WatermarkSource, now: Instant) {
        match wm_source.refresh() {
            Ok(wm) => {
                self.watermarks = Some(wm);
                self.wmark_update = Some(now);
            }
            Err(e) => error!("Failed to parse zoneinfo: {e}"),
        }
    }

    /// Step 10 bookkeeping after victim selection ran.
    pub fn note_kill_result(&mut self, req: &KillRequest, pages_freed: i64, tun: &Tunables) {
        if pages_freed > 0 {
            self.killing = true;
            self.max_thrashing = 0;
            if req.cut_thrashing_limit {
                // Keep cutting the limit until the system stops thrashing
                self.thrashing_limit =
                    self.thrashing_limit * i64::from(100 - tun.thrashing_limit_decay_pct) / 100;
            }
        }
    }

    /// Step 11: the polling directive for the main loop.
    pub fn polling_directive(&self, event: bool, waiting_for_kill: bool) -> PollDirective {
        if waiting_for_kill {
            return PollDirective {
                update: PollingUpdate::Pause,
                interval_ms: PSI_POLL_PERIOD_SHORT_MS,
            };
        }
        // Extend polling while in direct reclaim or killing; kswapd reclaim
        // can go on for a long time without real pressure, so it does not
        let update = if event || self.killing || self.last_reclaim == ReclaimState::Direct {
            PollingUpdate::Start
        } else {
            PollingUpdate::DoNotChange
        };
        let interval_ms = if self.swap_is_low || self.killing {
            PSI_POLL_PERIOD_SHORT_MS
        } else {
            PSI_POLL_PERIOD_LONG_MS
        };
        PollDirective { update, interval_ms }
    }

    #[cfg(test)]
    pub fn prev_thrash_growth(&self) -> i64 {
        self.prev_thrash_growth
    }

    #[cfg(test)]
    pub fn thrashing_limit(&self) -> i64 {
        self.thrashing_limit
    }
}

/// The legacy vmpressure-era decision path, active when the new strategy is
/// disabled. Kills are driven either by the minfree table or by per-level
/// minimum scores with memcg-usage-based upgrade/downgrade.
pub struct LegacyEngine {
    kill_skip_count: u64,
    low_pressure_min_free: i64,
    low_pressure_max_free: i64,
    last_report: Option<Instant>,
    report_skip_count: u64,
    pub wakeup: WakeupInfo,
    pub event_count: u64,
}

pub struct MinfreeTable {
    /// Free-page thresholds in pages, ascending.
    pub minfree: Vec<i64>,
    /// The score each threshold maps to.
    pub adj: Vec<i32>,
}

impl MinfreeTable {
    pub fn new() -> Self {
        Self {
            minfree: Vec::new(),
            adj: Vec::new(),
        }
    }
}

impl Default for MinfreeTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LegacyInput<'a> {
    pub level: PressureLevel,
    pub wake: WakeKind,
    pub now: Instant,
    pub mi: &'a MemInfo,
    pub totalreserve_pages: i64,
    /// memcg memory usage / mem+swap usage in bytes, when readable.
    pub mem_usage: Option<i64>,
    pub memsw_usage: Option<i64>,
}

pub struct LegacyDecision {
    pub min_score: i32,
    pub minfree: i64,
    pub other_free: i64,
    pub other_file: i64,
}

impl LegacyEngine {
    pub fn new() -> Self {
        Self {
            kill_skip_count: 0,
            low_pressure_min_free: -1,
            low_pressure_max_free: -1,
            last_report: None,
            report_skip_count: 0,
            wakeup: WakeupInfo::default(),
            event_count: 0,
        }
    }

    pub fn note_skipped(&mut self) {
        self.kill_skip_count += 1;
        self.wakeup.skipped_wakeups += 1;
    }

    pub fn flush_skip_count(&mut self) {
        if self.kill_skip_count > 0 {
            info!(
                "{} memory pressure events were skipped after a kill!",
                self.kill_skip_count
            );
            self.kill_skip_count = 0;
        }
    }

    pub fn evaluate(
        &mut self,
        inp: &LegacyInput,
        tun: &Tunables,
        minfree_table: &MinfreeTable,
    ) -> Option<LegacyDecision> {
        self.event_count += 1;
        self.wakeup.record(inp.now, inp.wake);
        let mut level = inp.level;
        let mi = inp.mi;

        if tun.use_minfree_levels {
            let other_free = mi.nr_free_pages - inp.totalreserve_pages;
            let other_file = (mi.nr_file_pages - mi.shmem - mi.unevictable - mi.swap_cached)
                .max(0);

            for (i, &minfree) in minfree_table.minfree.iter().enumerate() {
                if other_free < minfree && other_file < minfree {
                    return Some(LegacyDecision {
                        min_score: minfree_table.adj[i],
                        minfree,
                        other_free,
                        other_file,
                    });
                }
            }
            if tun.debug_process_killing && !minfree_table.minfree.is_empty() {
                info!(
                    "Ignore {} memory pressure event (free memory={}kB, cache={}kB, limit={}kB)",
                    level.name(),
                    other_free * page_k(),
                    other_file * page_k(),
                    minfree_table.minfree.last().unwrap() * page_k()
                );
            }
            return None;
        }

        if level == PressureLevel::Low {
            self.record_low_pressure_levels(mi, tun);
        }

        if tun.level_oomadj[level.index()] > OOM_SCORE_ADJ_MAX {
            // This pressure level is not monitored
            return None;
        }

        if let (Some(mem_usage), Some(memsw_usage)) = (inp.mem_usage, inp.memsw_usage) {
            if memsw_usage > 0 {
                let mem_pressure = mem_usage * 100 / memsw_usage;

                if tun.enable_pressure_upgrade && level != PressureLevel::Critical {
                    // We are swapping too much
                    if mem_pressure < tun.upgrade_pressure {
                        level = level.upgrade();
                        if tun.debug_process_killing {
                            info!("Event upgraded to {}", level.name());
                        }
                    }
                }

                // With enough free swap, ignore or downgrade the event
                if free_swap(mi, tun.swap_compression_ratio)
                    >= mi.total_swap * i64::from(tun.swap_free_low_percentage) / 100
                {
                    if mem_pressure > tun.downgrade_pressure {
                        if tun.debug_process_killing {
                            info!("Ignore {} memory pressure", level.name());
                        }
                        return None;
                    } else if level == PressureLevel::Critical
                        && mem_pressure > tun.upgrade_pressure
                    {
                        if tun.debug_process_killing {
                            info!("Downgrade critical memory pressure");
                        }
                        level = level.downgrade();
                    }
                }
            }
        }

        if !tun.low_ram_device
            && self.low_pressure_max_free != -1
            && mi.nr_free_pages >= self.low_pressure_max_free
        {
            if tun.debug_process_killing {
                info!(
                    "Ignoring pressure since more memory is available ({}) than watermark ({})",
                    mi.nr_free_pages, self.low_pressure_max_free
                );
            }
            return None;
        }

        Some(LegacyDecision {
            min_score: tun.level_oomadj[level.index()],
            minfree: 0,
            other_free: 0,
            other_file: 0,
        })
    }

    fn record_low_pressure_levels(&mut self, mi: &MemInfo, tun: &Tunables) {
        if self.low_pressure_min_free == -1 || self.low_pressure_min_free > mi.nr_free_pages {
            if tun.debug_process_killing {
                info!(
                    "Low pressure min memory update from {} to {}",
                    self.low_pressure_min_free, mi.nr_free_pages
                );
            }
            self.low_pressure_min_free = mi.nr_free_pages;
        }
        // Free memory at low-pressure events occasionally spikes when a
        // stale event arrives after memory was already freed. Ignore large
        // jumps that would skew the stats.
        if self.low_pressure_max_free == -1
            || (self.low_pressure_max_free < mi.nr_free_pages
                && (mi.nr_free_pages - self.low_pressure_max_free) * 10
                    < self.low_pressure_max_free)
        {
            if tun.debug_process_killing {
                info!(
                    "Low pressure max memory update from {} to {}",
                    self.low_pressure_max_free, mi.nr_free_pages
                );
            }
            self.low_pressure_max_free = mi.nr_free_pages;
        }
    }

    /// Rate-limit failed-kill reports to one per second.
    pub fn should_report(&mut self, pages_freed: i64, now: Instant) -> bool {
        if pages_freed == 0 {
            if let Some(last) = self.last_report {
                if ms_since(last, now) < 1000 {
                    self.report_skip_count += 1;
                    return false;
                }
            }
        }
        if self.report_skip_count > 0 {
            info!("Suppressed {} failed kill reports", self.report_skip_count);
            self.report_skip_count = 0;
        }
        self.last_report = Some(now);
        true
    }
}

impl Default for LegacyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemProperties;
    use std::time::Duration;

    struct FixedWatermarks {
        wm: ZoneWatermarks,
        refreshes: u32,
    }

    impl FixedWatermarks {
        fn new(min: i64, low: i64, high: i64) -> Self {
            Self {
                wm: ZoneWatermarks {
                    min_wmark: min,
                    low_wmark: low,
                    high_wmark: high,
                },
                refreshes: 0,
            }
        }
    }

    impl WatermarkSource for FixedWatermarks {
        fn refresh(&mut self) -> Result<ZoneWatermarks> {
            self.refreshes += 1;
            Ok(self.wm)
        }
    }

    fn tunables(pairs: &[(&str, &str)]) -> Tunables {
        Tunables::load(&MemProperties::with(pairs))
    }

    fn meminfo(nr_free: i64) -> MemInfo {
        MemInfo {
            nr_free_pages: nr_free,
            total_swap: 100_000,
            free_swap: 80_000,
            inactive_file: 20_000,
            active_anon: 10_000,
            inactive_anon: 10_000,
            shmem: 1_000,
            easy_available: nr_free + 20_000,
            ..Default::default()
        }
    }

    fn psi_event(level: PressureLevel) -> EventSource {
        EventSource::Psi {
            level,
            wake: WakeKind::Event,
        }
    }

    #[test]
    fn test_watermark_classification() {
        let wm = ZoneWatermarks {
            min_wmark: 100,
            low_wmark: 200,
            high_wmark: 300,
        };
        assert_eq!(wm.lowest_breached(50), WatermarkBreach::Min);
        assert_eq!(wm.lowest_breached(150), WatermarkBreach::Low);
        assert_eq!(wm.lowest_breached(250), WatermarkBreach::High);
        assert_eq!(wm.lowest_breached(400), WatermarkBreach::None);
        assert!(WatermarkBreach::Min < WatermarkBreach::Low);
        assert!(WatermarkBreach::High < WatermarkBreach::None);
    }

    #[test]
    fn test_kill_in_flight_gate() {
        let tun = tunables(&[]); // kill_timeout_ms = 100
        let mut engine = Engine::new(&tun);

        assert_eq!(
            engine.gate_kill_in_flight(true, Some(60), &tun),
            Gate::Skip
        );
        assert_eq!(engine.wakeup.skipped_wakeups, 1);

        // Timeout elapsed: proceed, releasing the unfinished wait
        assert_eq!(
            engine.gate_kill_in_flight(true, Some(150), &tun),
            Gate::Proceed {
                release_finished: false
            }
        );
        // Reaper already released: proceed and finish the wait
        assert_eq!(
            engine.gate_kill_in_flight(false, None, &tun),
            Gate::Proceed {
                release_finished: true
            }
        );

        // Zero timeout means wait for the reaper for as long as it takes
        let tun = tunables(&[("ro.lmk.kill_timeout_ms", "0")]);
        assert_eq!(
            engine.gate_kill_in_flight(true, Some(100_000), &tun),
            Gate::Skip
        );
    }

    #[test]
    fn test_level_lock_within_window() {
        let tun = tunables(&[]);
        let mut engine = Engine::new(&tun);
        let now = Instant::now();

        assert!(engine.accept_psi_event(PressureLevel::Critical, WakeKind::Event, now, false));
        // A lower-level event within the same window is dropped
        assert!(!engine.accept_psi_event(PressureLevel::Medium, WakeKind::Event, now, false));
        // A polling tick resets the stored level
        assert!(engine.accept_psi_event(PressureLevel::Low, WakeKind::Polling, now, false));
        assert!(engine.accept_psi_event(PressureLevel::Medium, WakeKind::Event, now, false));
    }

    #[test]
    fn test_low_mem_reason_and_min_score() {
        let tun = tunables(&[]);
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(1_000, 2_000, 3_000);
        let base = Instant::now();

        let mi = meminfo(1_500); // between min and low: WatermarkBreach::Low
        let vs = VmStat {
            nr_inactive_file: 10_000,
            nr_active_file: 10_000,
            workingset_refault_file: 10,
            pgscan_kswapd: 100,
            ..Default::default()
        };
        let req = engine
            .evaluate(
                &EvalInput {
                    source: psi_event(PressureLevel::Medium),
                    now: base,
                    mi: &mi,
                    vs: &vs,
                    psi_mem: None,
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                },
                &tun,
                &mut wm,
            )
            .unwrap();
        assert_eq!(req.reason, KillReason::LowMem);
        assert_eq!(req.min_score, 701);
        // First-ever kill forces a watermark refresh and a re-classification
        assert_eq!(wm.refreshes, 2);

        // A later evaluation refreshes nothing (zone-refresh is supported)
        let req = engine
            .evaluate(
                &EvalInput {
                    source: psi_event(PressureLevel::Medium),
                    now: base + Duration::from_millis(100),
                    mi: &mi,
                    vs: &VmStat {
                        workingset_refault_file: 20,
                        pgscan_kswapd: 200,
                        ..vs
                    },
                    psi_mem: None,
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                },
                &tun,
                &mut wm,
            )
            .unwrap();
        assert_eq!(req.reason, KillReason::LowMem);
        assert_eq!(wm.refreshes, 2);
    }

    #[test]
    fn test_not_responding_and_critical_stall_override() {
        let tun = tunables(&[]);
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(100, 200, 300);
        let mi = meminfo(10_000); // no watermark breached
        let vs = VmStat {
            workingset_refault_file: 5,
            pgscan_kswapd: 50,
            ..Default::default()
        };

        let req = engine
            .evaluate(
                &EvalInput {
                    source: psi_event(PressureLevel::Critical),
                    now: Instant::now(),
                    mi: &mi,
                    vs: &vs,
                    psi_mem: None,
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                },
                &tun,
                &mut wm,
            )
            .unwrap();
        assert_eq!(req.reason, KillReason::NotResponding);
        assert_eq!(req.min_score, 0);

        // The stall override lowers a perceptible-protected min score to 0
        let (_, req) = low_swap_thrashing_scenario(true);
        assert_eq!(req.reason, KillReason::LowSwapAndThrashing);
        assert_eq!(req.min_score, 0);
    }

    /// Two-step scenario: the first evaluation establishes the thrashing
    /// window, the second observes refault growth of 150% with low swap.
    fn low_swap_thrashing_scenario(critical_stall: bool) -> (Engine, KillRequest) {
        let tun = tunables(&[("ro.lmk.swap_free_low_percentage", "90")]);
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(100, 200, 300);
        let base = Instant::now();
        let mi = meminfo(150); // above min watermark, swap is low
        let psi = PsiStats {
            some: Default::default(),
            full: Some(crate::procfs::PsiLine {
                avg10: if critical_stall { 150.0 } else { 0.0 },
                ..Default::default()
            }),
        };

        let vs0 = VmStat {
            nr_inactive_file: 50,
            nr_active_file: 49,
            workingset_refault_file: 0,
            pgscan_kswapd: 10,
            ..Default::default()
        };
        let _ = engine.evaluate(
            &EvalInput {
                source: psi_event(PressureLevel::Medium),
                now: base,
                mi: &mi,
                vs: &vs0,
                psi_mem: Some(&psi),
                reclaim_ts: None,
                zone_refresh_supported: true,
            },
            &tun,
            &mut wm,
        );

        // 500ms later: 150 refaults over a 99-page file LRU = 150% thrashing
        let vs1 = VmStat {
            workingset_refault_file: 150,
            pgscan_kswapd: 20,
            ..vs0
        };
        let req = engine
            .evaluate(
                &EvalInput {
                    source: psi_event(PressureLevel::Medium),
                    now: base + Duration::from_millis(500),
                    mi: &mi,
                    vs: &vs1,
                    psi_mem: Some(&psi),
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                },
                &tun,
                &mut wm,
            )
            .unwrap();
        (engine, req)
    }

    #[test]
    fn test_low_swap_and_thrashing_protects_perceptible() {
        // Without the stall, the min score protects perceptible apps
        let (_, req) = low_swap_thrashing_scenario(false);
        assert_eq!(req.reason, KillReason::LowSwapAndThrashing);
        assert_eq!(req.min_score, PERCEPTIBLE_APP_ADJ + 1);
    }

    #[test]
    fn test_early_exit_when_nothing_moves() {
        let tun = tunables(&[]);
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(100, 200, 300);
        let mi = meminfo(150);
        let vs = VmStat::default();

        // No reclaim activity, refault counter unchanged: bail out even
        // though a watermark is breached
        let req = engine.evaluate(
            &EvalInput {
                source: psi_event(PressureLevel::Medium),
                now: Instant::now(),
                mi: &mi,
                vs: &vs,
                psi_mem: None,
                reclaim_ts: None,
                zone_refresh_supported: true,
            },
            &tun,
            &mut wm,
        );
        assert!(req.is_none());
    }

    #[test]
    fn test_thrashing_decay_across_windows() {
        let tun = tunables(&[]); // thrashing_limit 100
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(10, 20, 30); // never breached
        let base = Instant::now();

        // File LRU of 99 pages makes the +1 divisor exactly 100
        let vs0 = VmStat {
            nr_inactive_file: 49,
            nr_active_file: 50,
            workingset_refault_file: 0,
            pgscan_kswapd: 100,
            ..Default::default()
        };
        let mi = meminfo(10_000);
        macro_rules! inp {
            ($now:expr, $vs:expr) => {
                EvalInput {
                    source: psi_event(PressureLevel::Medium),
                    now: $now,
                    mi: &mi,
                    vs: $vs,
                    psi_mem: None,
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                }
            };
        }

        // t=0: initializes the thrashing window
        assert!(engine
            .evaluate(&inp!(base, &vs0), &tun, &mut wm)
            .is_none());
        assert_eq!(engine.prev_thrash_growth(), 0);

        // t=1100ms: refault grew to 200 -> growth 200%, preserved because a
        // single window passed while growth exceeded the limit
        let vs1 = VmStat {
            workingset_refault_file: 200,
            pgscan_kswapd: 200,
            ..vs0
        };
        let t1 = base + Duration::from_millis(1100);
        let _ = engine.evaluate(&inp!(t1, &vs1), &tun, &mut wm);
        assert_eq!(engine.prev_thrash_growth(), 200);

        // t=3200ms: same growth again over two windows -> decayed by 2
        let vs2 = VmStat {
            workingset_refault_file: 402,
            pgscan_kswapd: 300,
            ..vs0
        };
        let t2 = t1 + Duration::from_millis(2100);
        let _ = engine.evaluate(&inp!(t2, &vs2), &tun, &mut wm);
        assert_eq!(engine.prev_thrash_growth(), 202 >> 2);
    }

    #[test]
    fn test_thrashing_limit_cut_after_kill() {
        let tun = tunables(&[]); // limit 100, decay 10
        let mut engine = Engine::new(&tun);
        let req = KillRequest {
            reason: KillReason::LowMemAndThrashing,
            min_score: 201,
            desc: String::new(),
            thrashing: 150,
            max_thrashing: 150,
            cut_thrashing_limit: true,
        };
        engine.note_kill_result(&req, 5000, &tun);
        assert_eq!(engine.thrashing_limit(), 90);
        // A failed kill cuts nothing
        let mut engine = Engine::new(&tun);
        engine.note_kill_result(&req, 0, &tun);
        assert_eq!(engine.thrashing_limit(), 100);
    }

    #[test]
    fn test_vendor_kill_passthrough() {
        let tun = tunables(&[]);
        let mut engine = Engine::new(&tun);
        let mut wm = FixedWatermarks::new(10, 20, 30);
        let mi = meminfo(10_000);
        let vs = VmStat {
            workingset_refault_file: 10,
            pgscan_kswapd: 10,
            ..Default::default()
        };
        let req = engine
            .evaluate(
                &EvalInput {
                    source: EventSource::Vendor {
                        reason_code: 2,
                        min_score: 500,
                    },
                    now: Instant::now(),
                    mi: &mi,
                    vs: &vs,
                    psi_mem: None,
                    reclaim_ts: None,
                    zone_refresh_supported: true,
                },
                &tun,
                &mut wm,
            )
            .unwrap();
        assert_eq!(req.reason, KillReason::Vendor(2));
        assert_eq!(req.reason.code(), 1002);
        assert_eq!(req.min_score, 500);

        // Out-of-range reason codes are rejected
        let req = engine.evaluate(
            &EvalInput {
                source: EventSource::Vendor {
                    reason_code: -1,
                    min_score: 0,
                },
                now: Instant::now(),
                mi: &mi,
                vs: &vs,
                psi_mem: None,
                reclaim_ts: None,
                zone_refresh_supported: true,
            },
            &tun,
            &mut wm,
        );
        assert!(req.is_none());
    }

    #[test]
    fn test_polling_directive() {
        let tun = tunables(&[]);
        let engine = Engine::new(&tun);
        // Waiting for the reaper pauses polling outright
        let d = engine.polling_directive(true, true);
        assert_eq!(d.update, PollingUpdate::Pause);
        // An event starts polling at the long interval
        let d = engine.polling_directive(true, false);
        assert_eq!(d.update, PollingUpdate::Start);
        assert_eq!(d.interval_ms, PSI_POLL_PERIOD_LONG_MS);
        // A quiet polling tick leaves things alone
        let d = engine.polling_directive(false, false);
        assert_eq!(d.update, PollingUpdate::DoNotChange);
    }

    #[test]
    fn test_legacy_minfree_table_walk() {
        let props = MemProperties::with(&[("ro.lmk.use_minfree_levels", "true")]);
        let tun = Tunables::load(&props);
        let mut legacy = LegacyEngine::new();
        let table = MinfreeTable {
            minfree: vec![4096, 8192, 16384],
            adj: vec![900, 700, 300],
        };

        let mut mi = meminfo(20_000);
        mi.cached = 2_000;
        mi.nr_file_pages = 2_000;
        let inp = LegacyInput {
            level: PressureLevel::Medium,
            wake: WakeKind::Event,
            now: Instant::now(),
            mi: &mi,
            totalreserve_pages: 14_000,
            mem_usage: None,
            memsw_usage: None,
        };
        // other_free = 6000, other_file = 1000: first level with both below
        // its threshold is 8192 -> adj 700
        let d = legacy.evaluate(&inp, &tun, &table).unwrap();
        assert_eq!(d.min_score, 700);
        assert_eq!(d.minfree, 8192);

        // Plenty of memory: no level matches
        let mi = meminfo(100_000);
        let inp = LegacyInput {
            level: PressureLevel::Medium,
            wake: WakeKind::Event,
            now: Instant::now(),
            mi: &mi,
            totalreserve_pages: 1_000,
            mem_usage: None,
            memsw_usage: None,
        };
        assert!(legacy.evaluate(&inp, &tun, &table).is_none());
    }

    #[test]
    fn test_legacy_level_scores_and_downgrade() {
        let props = MemProperties::with(&[
            ("ro.lmk.low", "1001"),
            ("ro.lmk.medium", "800"),
            ("ro.lmk.critical", "0"),
            ("ro.lmk.downgrade_pressure", "90"),
        ]);
        let tun = Tunables::load(&props);
        let mut legacy = LegacyEngine::new();
        let table = MinfreeTable::new();
        let mi = meminfo(5_000);

        // Low level is not monitored (score 1001)
        let d = legacy.evaluate(
            &LegacyInput {
                level: PressureLevel::Low,
                wake: WakeKind::Event,
                now: Instant::now(),
                mi: &mi,
                totalreserve_pages: 0,
                mem_usage: None,
                memsw_usage: None,
            },
            &tun,
            &table,
        );
        assert!(d.is_none());

        // Medium maps to its configured score
        let d = legacy
            .evaluate(
                &LegacyInput {
                    level: PressureLevel::Medium,
                    wake: WakeKind::Event,
                    now: Instant::now(),
                    mi: &mi,
                    totalreserve_pages: 0,
                    mem_usage: None,
                    memsw_usage: None,
                },
                &tun,
                &table,
            )
            .unwrap();
        assert_eq!(d.min_score, 800);

        // Plenty of swap + high memcg ratio: event is ignored
        let d = legacy.evaluate(
            &LegacyInput {
                level: PressureLevel::Medium,
                wake: WakeKind::Event,
                now: Instant::now(),
                mi: &mi,
                totalreserve_pages: 0,
                mem_usage: Some(990),
                memsw_usage: Some(1000),
            },
            &tun,
            &table,
        );
        assert!(d.is_none());
    }
}
