//! Cached /proc readers and parsers.
//!
//! The files the decision engine needs (`meminfo`, `vmstat`, `zoneinfo`, the
//! PSI resource files) are read on every pressure wakeup, which is exactly
//! when the system is least able to afford allocations or new file opens.
//! [`ProcFile`] therefore keeps a persistent descriptor and a growable buffer
//! per file: the descriptor is opened once and re-read from offset 0, the
//! buffer doubles on short reads and is never shrunk.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{error, warn};

use crate::error::{Error, Result};

pub const MEMINFO_PATH: &str = "/proc/meminfo";
pub const VMSTAT_PATH: &str = "/proc/vmstat";
pub const ZONEINFO_PATH: &str = "/proc/zoneinfo";
pub const PSI_MEMORY_PATH: &str = "/proc/pressure/memory";
pub const PSI_IO_PATH: &str = "/proc/pressure/io";
pub const PSI_CPU_PATH: &str = "/proc/pressure/cpu";

const NODE_STATS_MARKER: &str = "  per-node stats";

pub fn page_size() -> i64 {
    static PAGE_SIZE: OnceLock<i64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as i64 })
}

/// Page size in kB, the unit conversion factor for meminfo fields.
pub fn page_k() -> i64 {
    page_size() / 1024
}

/// A frequently re-read proc file with a persistent descriptor and buffer.
pub struct ProcFile {
    path: PathBuf,
    file: Option<File>,
    buf: Vec<u8>,
}

impl ProcFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            // Start with one page and grow if needed
            buf: vec![0u8; page_size() as usize],
        }
    }

    /// Read the whole file from offset 0. On a short read the buffer is
    /// doubled and the read restarted; on an I/O error the descriptor is
    /// dropped so the next call reopens the file.
    pub fn read(&mut self) -> Result<&str> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
            self.file = Some(file);
        }

        let len = loop {
            let result = {
                let file = self.file.as_ref().unwrap();
                read_all(file, &mut self.buf)
            };
            match result {
                Ok(len) => {
                    if len < self.buf.len() {
                        break len;
                    }
                    // /proc files have no stat-able size; double and retry
                    let new_len = self.buf.len() * 2;
                    self.buf.resize(new_len, 0);
                }
                Err(e) => {
                    self.file = None;
                    return Err(Error::io(&self.path, e));
                }
            }
        };

        std::str::from_utf8(&self.buf[..len])
            .map_err(|_| Error::Transient(format!("{} is not valid utf-8", self.path.display())))
    }
}

/// Read from offset 0 up to `buf.len()` bytes or EOF, whichever comes first.
fn read_all(file: &File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = match file.read_at(&mut buf[filled..], filled as u64) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Parse the leading integer of a string, ignoring trailing junk.
pub fn parse_i64_prefix(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    s[..end].parse().ok()
}

/// Snapshot of /proc/meminfo. All fields are in pages (converted from kB
/// during parsing); `nr_file_pages` and `easy_available` are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub nr_free_pages: i64,
    pub cached: i64,
    pub swap_cached: i64,
    pub buffers: i64,
    pub shmem: i64,
    pub unevictable: i64,
    pub total_swap: i64,
    pub free_swap: i64,
    pub active_anon: i64,
    pub inactive_anon: i64,
    pub active_file: i64,
    pub inactive_file: i64,
    pub sreclaimable: i64,
    pub sunreclaim: i64,
    pub kernel_stack: i64,
    pub page_tables: i64,
    pub cma_free: i64,
    pub nr_file_pages: i64,
    pub easy_available: i64,
}

impl MemInfo {
    pub fn parse(text: &str, page_k: i64) -> Result<Self> {
        let mut mi = MemInfo::default();
        for line in text.lines() {
            let mut it = line.split_whitespace();
            let (name, value) = match (it.next(), it.next()) {
                (Some(n), Some(v)) => (n, v),
                _ => continue,
            };
            let field = match name {
                "MemFree:" => &mut mi.nr_free_pages,
                "Cached:" => &mut mi.cached,
                "SwapCached:" => &mut mi.swap_cached,
                "Buffers:" => &mut mi.buffers,
                "Shmem:" => &mut mi.shmem,
                "Unevictable:" => &mut mi.unevictable,
                "SwapTotal:" => &mut mi.total_swap,
                "SwapFree:" => &mut mi.free_swap,
                "Active(anon):" => &mut mi.active_anon,
                "Inactive(anon):" => &mut mi.inactive_anon,
                "Active(file):" => &mut mi.active_file,
                "Inactive(file):" => &mut mi.inactive_file,
                "SReclaimable:" => &mut mi.sreclaimable,
                "SUnreclaim:" => &mut mi.sunreclaim,
                "KernelStack:" => &mut mi.kernel_stack,
                "PageTables:" => &mut mi.page_tables,
                "CmaFree:" => &mut mi.cma_free,
                _ => continue,
            };
            let kb = parse_i64_prefix(value)
                .ok_or_else(|| Error::Transient(format!("meminfo parse error: {line}")))?;
            *field = kb / page_k;
        }
        mi.nr_file_pages = mi.cached + mi.swap_cached + mi.buffers;
        mi.easy_available = mi.nr_free_pages + mi.inactive_file;
        Ok(mi)
    }
}

/// Snapshot of the /proc/vmstat counters the engine consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStat {
    pub nr_free_pages: i64,
    pub nr_inactive_file: i64,
    pub nr_active_file: i64,
    pub workingset_refault: i64,
    pub workingset_refault_file: i64,
    pub pgscan_kswapd: i64,
    pub pgscan_direct: i64,
    pub pgscan_direct_throttle: i64,
    pub pgrefill: i64,
}

impl VmStat {
    pub fn parse(text: &str) -> Result<Self> {
        let mut vs = VmStat::default();
        for line in text.lines() {
            let mut it = line.split_whitespace();
            let (name, value) = match (it.next(), it.next()) {
                (Some(n), Some(v)) => (n, v),
                _ => continue,
            };
            let field = match name {
                "nr_free_pages" => &mut vs.nr_free_pages,
                "nr_inactive_file" => &mut vs.nr_inactive_file,
                "nr_active_file" => &mut vs.nr_active_file,
                "workingset_refault" => &mut vs.workingset_refault,
                "workingset_refault_file" => &mut vs.workingset_refault_file,
                "pgscan_kswapd" => &mut vs.pgscan_kswapd,
                "pgscan_direct" => &mut vs.pgscan_direct,
                "pgscan_direct_throttle" => &mut vs.pgscan_direct_throttle,
                "pgrefill" => &mut vs.pgrefill,
                _ => continue,
            };
            *field = parse_i64_prefix(value)
                .ok_or_else(|| Error::Transient(format!("vmstat parse error: {line}")))?;
        }
        Ok(vs)
    }

    /// The workingset refault counter, preferring the pre-5.9 name when the
    /// kernel still reports it.
    pub fn workingset_refault_resolved(&self) -> i64 {
        if self.workingset_refault != 0 {
            self.workingset_refault
        } else {
            self.workingset_refault_file
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZoneInfoZone {
    pub nr_free_pages: i64,
    pub min: i64,
    pub low: i64,
    pub high: i64,
    pub present: i64,
    pub nr_free_cma: i64,
    pub protection: Vec<i64>,
    pub max_protection: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ZoneInfoNode {
    pub id: i32,
    pub nr_inactive_file: i64,
    pub nr_active_file: i64,
    pub zones: Vec<ZoneInfoZone>,
}

#[derive(Debug, Clone, Default)]
pub struct ZoneInfo {
    pub nodes: Vec<ZoneInfoNode>,
    pub totalreserve_pages: i64,
    pub total_inactive_file: i64,
    pub total_active_file: i64,
}

impl ZoneInfo {
    pub fn parse(text: &str) -> Result<Self> {
        let mut zi = ZoneInfo::default();
        let mut lines = text.lines();
        let mut pending: Option<&str> = None;

        loop {
            let line = match pending.take().or_else(|| lines.next()) {
                Some(l) => l,
                None => break,
            };
            let (node_id, _zone_name) = match parse_zone_header(line) {
                Some(h) => h,
                None => continue,
            };

            let same_node = zi.nodes.last().map(|n| n.id) == Some(node_id);
            if !same_node {
                // Per-node stats are only present in the first populated zone
                // of each node
                match lines.next() {
                    Some(l) if l.starts_with(NODE_STATS_MARKER) => {}
                    _ => continue,
                }
                let mut node = ZoneInfoNode {
                    id: node_id,
                    ..Default::default()
                };
                if !parse_node_fields(&mut lines, &mut node) {
                    return Err(Error::Transient("zoneinfo node parse error".into()));
                }
                zi.nodes.push(node);
            }

            let mut zone = ZoneInfoZone::default();
            let stop = parse_zone_fields(&mut lines, &mut zone)?;
            let node = zi.nodes.last_mut().unwrap();
            node.zones.push(zone);
            pending = stop;
        }

        if zi.nodes.is_empty() {
            return Err(Error::Transient("zoneinfo parse error: no nodes".into()));
        }

        for node in &zi.nodes {
            for zone in &node.zones {
                zi.totalreserve_pages += zone.max_protection + zone.high;
            }
            zi.total_inactive_file += node.nr_inactive_file;
            zi.total_active_file += node.nr_active_file;
        }
        Ok(zi)
    }
}

fn parse_zone_header(line: &str) -> Option<(i32, &str)> {
    let rest = line.strip_prefix("Node ")?;
    let (id, rest) = rest.split_once(',')?;
    let name = rest.trim().strip_prefix("zone")?.trim();
    Some((id.trim().parse().ok()?, name))
}

fn parse_node_fields<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    node: &mut ZoneInfoNode,
) -> bool {
    let mut to_match = 2;
    for line in lines {
        let mut it = line.split_whitespace();
        let (name, value) = match (it.next(), it.next()) {
            (Some(n), Some(v)) => (n, v),
            _ => return false,
        };
        let field = match name {
            "nr_inactive_file" => &mut node.nr_inactive_file,
            "nr_active_file" => &mut node.nr_active_file,
            _ => continue,
        };
        match parse_i64_prefix(value) {
            Some(v) => *field = v,
            None => return false,
        }
        to_match -= 1;
        if to_match == 0 {
            return true;
        }
    }
    false
}

/// Parse one zone's fields up to the `pagesets` marker, the next zone header
/// or an unpopulated-zone short-circuit. Returns the unconsumed header line
/// when parsing stopped on one.
fn parse_zone_fields<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    zone: &mut ZoneInfoZone,
) -> Result<Option<&'a str>> {
    for line in lines {
        if parse_zone_header(line).is_some() {
            return Ok(Some(line));
        }
        let trimmed = line.trim_start();
        let mut it = trimmed.split_whitespace();
        let name = match it.next() {
            Some(n) => n,
            None => continue,
        };
        if name == "pagesets" {
            return Ok(None);
        }
        if name == "protection:" {
            let rest = trimmed["protection:".len()..].trim();
            zone.protection = rest
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .filter_map(|v| parse_i64_prefix(v.trim()))
                .collect();
            zone.max_protection = zone.protection.iter().copied().max().unwrap_or(0).max(0);
            continue;
        }
        let field = match name {
            "nr_free_pages" => &mut zone.nr_free_pages,
            "min" => &mut zone.min,
            "low" => &mut zone.low,
            "high" => &mut zone.high,
            "present" => &mut zone.present,
            "nr_free_cma" => &mut zone.nr_free_cma,
            _ => continue,
        };
        let value = match it.next() {
            Some(v) => v,
            None => continue,
        };
        *field = parse_i64_prefix(value)
            .ok_or_else(|| Error::Transient(format!("zoneinfo parse error: {line}")))?;
        if name == "present" && zone.present == 0 {
            // Unpopulated zone, nothing else to read from it
            return Ok(None);
        }
    }
    Ok(None)
}

/// One `some`/`full` line of a PSI resource file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsiLine {
    pub avg10: f32,
    pub avg60: f32,
    pub avg300: f32,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsiStats {
    pub some: PsiLine,
    pub full: Option<PsiLine>,
}

impl PsiStats {
    pub fn parse(text: &str, want_full: bool) -> Result<Self> {
        let mut stats = PsiStats::default();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("some ") {
                stats.some = parse_psi_line(rest)?;
            } else if want_full {
                if let Some(rest) = line.strip_prefix("full ") {
                    stats.full = Some(parse_psi_line(rest)?);
                }
            }
        }
        if want_full && stats.full.is_none() {
            return Err(Error::Transient("psi full line missing".into()));
        }
        Ok(stats)
    }
}

fn parse_psi_line(rest: &str) -> Result<PsiLine> {
    let mut line = PsiLine::default();
    for part in rest.split_whitespace() {
        if let Some(v) = part.strip_prefix("avg10=") {
            line.avg10 = v.parse().unwrap_or(0.0);
        } else if let Some(v) = part.strip_prefix("avg60=") {
            line.avg60 = v.parse().unwrap_or(0.0);
        } else if let Some(v) = part.strip_prefix("avg300=") {
            line.avg300 = v.parse().unwrap_or(0.0);
        } else if let Some(v) = part.strip_prefix("total=") {
            line.total = v.parse().unwrap_or(0);
        }
    }
    Ok(line)
}

/// The fields of `/proc/<pid>/status` consulted before a kill. Zombies have
/// no VmRSS/VmSwap lines.
#[derive(Debug, Clone, Copy)]
pub struct ProcStatus {
    pub tgid: i64,
    pub rss_kb: Option<i64>,
    pub swap_kb: Option<i64>,
}

pub fn read_proc_status(pid: i32) -> Option<ProcStatus> {
    let buf = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_proc_status(&buf)
}

pub fn parse_proc_status(buf: &str) -> Option<ProcStatus> {
    Some(ProcStatus {
        tgid: parse_status_tag(buf, "Tgid:")?,
        rss_kb: parse_status_tag(buf, "VmRSS:"),
        swap_kb: parse_status_tag(buf, "VmSwap:"),
    })
}

/// Find `tag` at a line start and parse the integer that follows it.
pub fn parse_status_tag(buf: &str, tag: &str) -> Option<i64> {
    for line in buf.lines() {
        if let Some(rest) = line.strip_prefix(tag) {
            return parse_i64_prefix(rest);
        }
    }
    None
}

/// RSS in pages from `/proc/<pid>/statm`, or None if the process is gone.
pub fn read_statm_rss(pid: i32) -> Option<i64> {
    let buf = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    buf.split_whitespace().nth(1).and_then(|v| v.parse().ok())
}

/// Task name from `/proc/<pid>/cmdline` (first NUL- or space-delimited token).
pub fn read_cmdline_name(pid: i32) -> Option<String> {
    let buf = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if buf.is_empty() {
        return None;
    }
    let end = buf
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// Best-effort write of a string to a file. Returns false when the file does
/// not exist, which for per-pid files means the process is gone.
pub fn write_file_string(path: &Path, s: &str, err_if_missing: bool) -> bool {
    use std::io::Write;
    let mut file = match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            if err_if_missing {
                error!("Error opening {}: {e}", path.display());
            }
            return false;
        }
    };
    match file.write_all(s.as_bytes()) {
        Ok(()) => {}
        Err(e) => error!("Error writing {}: {e}", path.display()),
    }
    true
}

/// The set of cached readers the decision paths re-read on every wakeup.
pub struct ProcReaders {
    pub meminfo: ProcFile,
    pub vmstat: ProcFile,
    pub zoneinfo: ProcFile,
    pub psi_mem: ProcFile,
    pub psi_io: ProcFile,
    pub psi_cpu: ProcFile,
}

impl Default for ProcReaders {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcReaders {
    pub fn new() -> Self {
        Self {
            meminfo: ProcFile::new(MEMINFO_PATH),
            vmstat: ProcFile::new(VMSTAT_PATH),
            zoneinfo: ProcFile::new(ZONEINFO_PATH),
            psi_mem: ProcFile::new(PSI_MEMORY_PATH),
            psi_io: ProcFile::new(PSI_IO_PATH),
            psi_cpu: ProcFile::new(PSI_CPU_PATH),
        }
    }

    pub fn read_meminfo(&mut self) -> Result<MemInfo> {
        let text = self.meminfo.read()?;
        MemInfo::parse(text, page_k())
    }

    pub fn read_vmstat(&mut self) -> Result<VmStat> {
        let text = self.vmstat.read()?;
        VmStat::parse(text)
    }

    pub fn read_zoneinfo(&mut self) -> Result<ZoneInfo> {
        let text = self.zoneinfo.read()?;
        ZoneInfo::parse(text)
    }

    pub fn read_psi_mem(&mut self) -> Result<PsiStats> {
        let text = self.psi_mem.read()?;
        PsiStats::parse(text, true)
    }

    pub fn read_psi_io(&mut self) -> Result<PsiStats> {
        let text = self.psi_io.read()?;
        PsiStats::parse(text, true)
    }

    pub fn read_psi_cpu(&mut self) -> Result<PsiStats> {
        let text = self.psi_cpu.read()?;
        PsiStats::parse(text, false)
    }

    /// Pre-read zoneinfo, the largest file we consume, so the shared buffers
    /// are sized before the first pressure event.
    pub fn warm_up(&mut self) {
        if let Err(e) = self.zoneinfo.read() {
            warn!("Failed to pre-read {ZONEINFO_PATH}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_MEMINFO: &str = "\
MemTotal:        3809036 kB
MemFree:          651548 kB
Cached:          1159012 kB
SwapCached:        10588 kB
Buffers:           52832 kB
Shmem:             21236 kB
Unevictable:        4096 kB
SwapTotal:       2097148 kB
SwapFree:        1523628 kB
Active(anon):     626272 kB
Inactive(anon):   669928 kB
Active(file):     429992 kB
Inactive(file):   610196 kB
SReclaimable:      75924 kB
SUnreclaim:        93412 kB
KernelStack:       24064 kB
PageTables:        44276 kB
CmaFree:            8192 kB
";

    #[test]
    fn test_meminfo_parse() {
        let mi = MemInfo::parse(SAMPLE_MEMINFO, 4).unwrap();
        assert_eq!(mi.nr_free_pages, 651548 / 4);
        assert_eq!(mi.total_swap, 2097148 / 4);
        assert_eq!(mi.cma_free, 8192 / 4);
        assert_eq!(
            mi.nr_file_pages,
            (1159012 + 10588 + 52832) / 4
        );
        assert_eq!(mi.easy_available, mi.nr_free_pages + mi.inactive_file);
    }

    #[test]
    fn test_vmstat_parse() {
        let text = "\
nr_free_pages 162887
nr_inactive_file 152549
nr_active_file 107498
workingset_refault_file 3941
pgscan_kswapd 503846
pgscan_direct 1954
pgrefill 101874
";
        let vs = VmStat::parse(text).unwrap();
        assert_eq!(vs.nr_free_pages, 162887);
        assert_eq!(vs.workingset_refault, 0);
        assert_eq!(vs.workingset_refault_resolved(), 3941);
        assert_eq!(vs.pgscan_direct, 1954);
    }

    #[test]
    fn test_workingset_refault_fallback() {
        // Pre-5.9 kernels report the counter under the old name
        let vs = VmStat::parse("workingset_refault 777\n").unwrap();
        assert_eq!(vs.workingset_refault_resolved(), 777);
    }

    const SAMPLE_ZONEINFO: &str = "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 1177
      nr_active_anon 387790
      nr_inactive_file 152549
      nr_active_file 107498
  pages free     3840
        min      68
        low      85
        high     102
        spanned  4095
        present  3993
        managed  3840
        protection: (0, 1877, 7862, 7862)
      nr_free_pages 3840
      nr_free_cma  0
  pagesets
    cpu: 0
              count: 0
Node 0, zone   Normal
  pages free     159047
        min      2986
        low      3732
        high     4478
        spanned  2096896
        present  2096896
        managed  2011017
        protection: (0, 0, 0, 0)
      nr_free_pages 159047
      nr_free_cma  2048
  pagesets
    cpu: 0
Node 0, zone  Movable
        min      32
        low      40
        high     48
        spanned  0
        present  0
        managed  0
";
    #[test]
    fn test_zoneinfo_parse() {
        let zi = ZoneInfo::parse(SAMPLE_ZONEINFO).unwrap();
        assert_eq!(zi.nodes.len(), 1);
        let node = &zi.nodes[0];
        assert_eq!(node.nr_inactive_file, 152549);
        assert_eq!(node.nr_active_file, 107498);
        assert_eq!(node.zones.len(), 3);
        assert_eq!(node.zones[0].min, 68);
        assert_eq!(node.zones[0].max_protection, 7862);
        assert_eq!(node.zones[1].nr_free_cma, 2048);
        // Unpopulated zone stops at `present 0`
        assert_eq!(node.zones[2].present, 0);
        assert_eq!(
            zi.totalreserve_pages,
            (7862 + 102) + 4478 + 48
        );
        assert_eq!(zi.total_inactive_file, 152549);
    }

    #[test]
    fn test_psi_parse() {
        let text = "some avg10=1.50 avg60=2.30 avg300=3.10 total=12345\n\
                    full avg10=0.50 avg60=0.80 avg300=1.20 total=6789\n";
        let psi = PsiStats::parse(text, true).unwrap();
        assert!((psi.some.avg10 - 1.50).abs() < 0.01);
        let full = psi.full.unwrap();
        assert!((full.avg10 - 0.50).abs() < 0.01);
        assert_eq!(full.total, 6789);

        let cpu = PsiStats::parse("some avg10=0.00 avg60=0.00 avg300=0.00 total=0\n", false)
            .unwrap();
        assert!(cpu.full.is_none());
    }

    #[test]
    fn test_status_tags() {
        let buf = "Name:\tcom.example.app\nTgid:\t1234\nPid:\t1234\nVmRSS:\t  65536 kB\nVmSwap:\t 1024 kB\n";
        let st = parse_proc_status(buf).unwrap();
        assert_eq!(st.tgid, 1234);
        assert_eq!(st.rss_kb, Some(65536));
        assert_eq!(st.swap_kb, Some(1024));

        // Zombies carry no VmRSS/VmSwap
        let st = parse_proc_status("Name:\tzombie\nTgid:\t99\n").unwrap();
        assert_eq!(st.tgid, 99);
        assert_eq!(st.rss_kb, None);
    }

    #[test]
    fn test_parse_i64_prefix() {
        assert_eq!(parse_i64_prefix("  1234 kB"), Some(1234));
        assert_eq!(parse_i64_prefix("-900"), Some(-900));
        assert_eq!(parse_i64_prefix("abc"), None);
        assert_eq!(parse_i64_prefix(""), None);
    }

    #[test]
    fn test_procfile_reread_and_growth() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // Larger than the initial page-sized buffer to force doubling
        let big = "x".repeat(3 * page_size() as usize) + "\n";
        f.write_all(big.as_bytes()).unwrap();
        f.flush().unwrap();

        let mut pf = ProcFile::new(f.path());
        let text = pf.read().unwrap();
        assert_eq!(text.len(), big.len());
        // Second read reuses descriptor and buffer
        let text = pf.read().unwrap();
        assert_eq!(text.len(), big.len());
    }

    #[test]
    fn test_procfile_reopens_after_error() {
        let mut pf = ProcFile::new("/nonexistent/lowmemd-test");
        assert!(pf.read().is_err());
        // Must not hold a stale descriptor
        assert!(pf.read().is_err());
    }
}
