//! Tunables and the property-store seam.
//!
//! The daemon reads its knobs from the host's property store once at startup
//! and again on every `UPDATE_PROPS` command. The store itself is platform
//! infrastructure, so it hides behind the small [`Properties`] trait; the
//! shipping implementation parses `key=value` lines from a properties file
//! while tests use the in-memory double.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{trace, warn};

use crate::lock_ext::MutexExt;

/// Property namespace for lmk tunables.
const LMK_PROP_PREFIX: &str = "ro.lmk.";

/// Default location of the property file backing [`FileProperties`].
pub const DEFAULT_PROPERTIES_PATH: &str = "/etc/lowmemd.properties";

/// Well-known properties published by the daemon.
pub const PROP_MINFREE_LEVELS: &str = "sys.lmk.minfree_levels";
pub const PROP_REPORT_KILLS: &str = "sys.lmk.reportkills";
pub const PROP_BOOT_COMPLETED: &str = "sys.boot_completed";
pub const PROP_LOW_RAM: &str = "ro.config.low_ram";
pub const PROP_PER_APP_MEMCG: &str = "ro.config.per_app_memcg";

/// Synchronous access to the host property store.
pub trait Properties: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);

    /// Pick up external changes to the store, where that is meaningful.
    fn reload(&self) {}

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            Some(other) => {
                trace!("Property {key} has non-boolean value {other:?}, using default");
                default
            }
            None => default,
        }
    }

    fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// Property store backed by a `key=value` file.
///
/// The file is parsed once at construction and on [`FileProperties::reload`].
/// `set` updates the in-memory view only: published values are delivered to
/// peers by the platform's property service, and the daemon keeps no on-disk
/// state of its own.
pub struct FileProperties {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileProperties {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = Mutex::new(Self::parse_file(&path));
        Self { path, values }
    }

    fn parse_file(path: &Path) -> HashMap<String, String> {
        let mut values = HashMap::new();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                trace!("No property file at {}: {e}", path.display());
                return values;
            }
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_owned(), value.trim().to_owned());
            } else {
                warn!("Ignoring malformed property line: {line}");
            }
        }
        values
    }
}

impl Properties for FileProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock_poisoned().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock_poisoned()
            .insert(key.to_owned(), value.to_owned());
    }

    fn reload(&self) {
        let fresh = Self::parse_file(&self.path);
        let mut values = self.values.lock_poisoned();
        // Runtime-published values survive the reload
        for (k, v) in fresh {
            values.insert(k, v);
        }
    }
}

/// In-memory property store used by tests.
#[derive(Default)]
pub struct MemProperties {
    values: Mutex<HashMap<String, String>>,
}

impl MemProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Self {
        let store = Self::new();
        for (k, v) in pairs {
            store.set(k, v);
        }
        store
    }
}

impl Properties for MemProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock_poisoned().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock_poisoned()
            .insert(key.to_owned(), value.to_owned());
    }
}

const DEF_LOW_SWAP: i32 = 10;
const DEF_THRASHING_LOWRAM: i32 = 30;
const DEF_THRASHING: i32 = 100;
const DEF_THRASHING_DECAY_LOWRAM: i32 = 50;
const DEF_THRASHING_DECAY: i32 = 10;
const DEF_PARTIAL_STALL_LOWRAM: i32 = 200;
const DEF_PARTIAL_STALL: i32 = 70;
const DEF_COMPLETE_STALL: i32 = 700;
const DEF_DIRECT_RECL_THRESH_MS: i64 = 0;
const DEF_SWAP_COMP_RATIO: i64 = 1;

pub const OOM_SCORE_ADJ_MIN: i32 = -1000;
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;
pub const PERCEPTIBLE_APP_ADJ: i32 = 200;
pub const PREVIOUS_APP_ADJ: i32 = 700;
pub const SYSTEM_ADJ: i32 = -900;

fn clamp(low: i32, high: i32, value: i32) -> i32 {
    value.max(low).min(high)
}

/// All runtime tunables. Defaults follow the platform's historical values;
/// the low-RAM alternates apply when the device is flagged as low-RAM.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub level_oomadj: [i32; 3],
    pub debug_process_killing: bool,
    pub enable_pressure_upgrade: bool,
    pub upgrade_pressure: i64,
    pub downgrade_pressure: i64,
    pub kill_heaviest_task: bool,
    pub low_ram_device: bool,
    pub kill_timeout_ms: u64,
    pub pressure_after_kill_min_score: i32,
    pub use_minfree_levels: bool,
    pub per_app_memcg: bool,
    pub swap_free_low_percentage: i32,
    pub psi_partial_stall_ms: i32,
    pub psi_complete_stall_ms: i32,
    pub thrashing_limit_pct: i32,
    pub thrashing_limit_decay_pct: i32,
    pub thrashing_critical_pct: i32,
    pub swap_util_max: i32,
    pub filecache_min_kb: i64,
    pub stall_limit_critical: i64,
    pub delay_monitors_until_boot: bool,
    pub direct_reclaim_threshold_ms: i64,
    pub swap_compression_ratio: i64,
    pub lowmem_min_oom_score: i32,
    pub use_psi: bool,
    pub use_new_strategy: bool,
}

impl Tunables {
    /// Read every tunable from the property store, applying defaults and
    /// clamping. Called at startup and on `UPDATE_PROPS`.
    pub fn load(props: &dyn Properties) -> Self {
        let lmk_bool = |name: &str, def: bool| props.get_bool(&format!("{LMK_PROP_PREFIX}{name}"), def);
        let lmk_i32 = |name: &str, def: i32| props.get_i32(&format!("{LMK_PROP_PREFIX}{name}"), def);
        let lmk_i64 = |name: &str, def: i64| props.get_i64(&format!("{LMK_PROP_PREFIX}{name}"), def);

        let low_ram_device = props.get_bool(PROP_LOW_RAM, false);
        let use_minfree_levels = lmk_bool("use_minfree_levels", false);
        let thrashing_limit_pct = lmk_i32(
            "thrashing_limit",
            if low_ram_device { DEF_THRASHING_LOWRAM } else { DEF_THRASHING },
        )
        .max(0);

        Tunables {
            // Low-level vmpressure events are disabled by default
            level_oomadj: [
                lmk_i32("low", OOM_SCORE_ADJ_MAX + 1),
                lmk_i32("medium", 800),
                lmk_i32("critical", 0),
            ],
            debug_process_killing: lmk_bool("debug", false),
            enable_pressure_upgrade: lmk_bool("critical_upgrade", false),
            upgrade_pressure: lmk_i32("upgrade_pressure", 100) as i64,
            downgrade_pressure: lmk_i32("downgrade_pressure", 100) as i64,
            kill_heaviest_task: lmk_bool("kill_heaviest_task", false),
            low_ram_device,
            kill_timeout_ms: lmk_i32("kill_timeout_ms", 100).max(0) as u64,
            pressure_after_kill_min_score: lmk_i32("pressure_after_kill_min_score", 0),
            use_minfree_levels,
            per_app_memcg: props.get_bool(PROP_PER_APP_MEMCG, low_ram_device),
            swap_free_low_percentage: clamp(
                0,
                100,
                lmk_i32("swap_free_low_percentage", DEF_LOW_SWAP),
            ),
            psi_partial_stall_ms: lmk_i32(
                "psi_partial_stall_ms",
                if low_ram_device { DEF_PARTIAL_STALL_LOWRAM } else { DEF_PARTIAL_STALL },
            ),
            psi_complete_stall_ms: lmk_i32("psi_complete_stall_ms", DEF_COMPLETE_STALL),
            thrashing_limit_pct,
            thrashing_limit_decay_pct: clamp(
                0,
                100,
                lmk_i32(
                    "thrashing_limit_decay",
                    if low_ram_device { DEF_THRASHING_DECAY_LOWRAM } else { DEF_THRASHING_DECAY },
                ),
            ),
            thrashing_critical_pct: lmk_i32(
                "thrashing_limit_critical",
                thrashing_limit_pct.saturating_mul(3),
            )
            .max(0),
            swap_util_max: clamp(0, 100, lmk_i32("swap_util_max", 100)),
            filecache_min_kb: lmk_i64("filecache_min_kb", 0),
            stall_limit_critical: lmk_i64("stall_limit_critical", 100),
            delay_monitors_until_boot: lmk_bool("delay_monitors_until_boot", false),
            direct_reclaim_threshold_ms: lmk_i64(
                "direct_reclaim_threshold_ms",
                DEF_DIRECT_RECL_THRESH_MS,
            ),
            swap_compression_ratio: lmk_i64("swap_compression_ratio", DEF_SWAP_COMP_RATIO),
            lowmem_min_oom_score: lmk_i32("lowmem_min_oom_score", PREVIOUS_APP_ADJ + 1)
                .max(PERCEPTIBLE_APP_ADJ + 1),
            use_psi: lmk_bool("use_psi", true),
            use_new_strategy: lmk_bool("use_new_strategy", low_ram_device || !use_minfree_levels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let props = MemProperties::new();
        let t = Tunables::load(&props);
        assert_eq!(t.level_oomadj, [1001, 800, 0]);
        assert_eq!(t.kill_timeout_ms, 100);
        assert_eq!(t.swap_free_low_percentage, 10);
        assert_eq!(t.thrashing_limit_pct, 100);
        assert_eq!(t.thrashing_limit_decay_pct, 10);
        assert_eq!(t.thrashing_critical_pct, 300);
        assert_eq!(t.psi_partial_stall_ms, 70);
        assert_eq!(t.psi_complete_stall_ms, 700);
        assert_eq!(t.swap_util_max, 100);
        assert_eq!(t.lowmem_min_oom_score, 701);
        assert!(t.use_psi);
        assert!(t.use_new_strategy);
        assert!(!t.use_minfree_levels);
        assert!(!t.kill_heaviest_task);
    }

    #[test]
    fn test_low_ram_alternates() {
        let props = MemProperties::with(&[(PROP_LOW_RAM, "true")]);
        let t = Tunables::load(&props);
        assert!(t.low_ram_device);
        assert!(t.per_app_memcg);
        assert_eq!(t.thrashing_limit_pct, 30);
        assert_eq!(t.thrashing_limit_decay_pct, 50);
        assert_eq!(t.thrashing_critical_pct, 90);
        assert_eq!(t.psi_partial_stall_ms, 200);
    }

    #[test]
    fn test_clamping() {
        let props = MemProperties::with(&[
            ("ro.lmk.swap_free_low_percentage", "150"),
            ("ro.lmk.thrashing_limit", "-5"),
            ("ro.lmk.thrashing_limit_decay", "-1"),
            ("ro.lmk.swap_util_max", "101"),
            ("ro.lmk.lowmem_min_oom_score", "100"),
        ]);
        let t = Tunables::load(&props);
        assert_eq!(t.swap_free_low_percentage, 100);
        assert_eq!(t.thrashing_limit_pct, 0);
        assert_eq!(t.thrashing_limit_decay_pct, 0);
        assert_eq!(t.swap_util_max, 100);
        assert_eq!(t.lowmem_min_oom_score, PERCEPTIBLE_APP_ADJ + 1);
    }

    #[test]
    fn test_strategy_selection() {
        let props = MemProperties::with(&[("ro.lmk.use_minfree_levels", "true")]);
        let t = Tunables::load(&props);
        assert!(!t.use_new_strategy);

        // Low-RAM devices use the new strategy even with minfree levels
        let props = MemProperties::with(&[
            ("ro.lmk.use_minfree_levels", "true"),
            (PROP_LOW_RAM, "true"),
        ]);
        let t = Tunables::load(&props);
        assert!(t.use_new_strategy);

        // An explicit override wins
        let props = MemProperties::with(&[
            ("ro.lmk.use_minfree_levels", "true"),
            ("ro.lmk.use_new_strategy", "true"),
        ]);
        let t = Tunables::load(&props);
        assert!(t.use_new_strategy);
    }

    #[test]
    fn test_update_props_idempotent() {
        let props = MemProperties::with(&[("ro.lmk.kill_timeout_ms", "250")]);
        let a = Tunables::load(&props);
        let b = Tunables::load(&props);
        assert_eq!(a.kill_timeout_ms, 250);
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn test_file_properties_roundtrip() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment\nro.lmk.debug=true\nro.lmk.medium = 900\nbogus-line").unwrap();
        let props = FileProperties::load(f.path());
        assert_eq!(props.get("ro.lmk.debug").as_deref(), Some("true"));
        assert_eq!(props.get("ro.lmk.medium").as_deref(), Some("900"));
        assert_eq!(props.get("bogus-line"), None);

        props.set(PROP_REPORT_KILLS, "1");
        props.reload();
        // Published values survive a reload
        assert_eq!(props.get(PROP_REPORT_KILLS).as_deref(), Some("1"));
        let t = Tunables::load(&props);
        assert!(t.debug_process_killing);
        assert_eq!(t.level_oomadj[1], 900);
    }
}
