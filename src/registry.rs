//! The process registry.
//!
//! One record per registered process, indexed two ways: a pid hash map and an
//! array of per-score buckets covering every oom_score_adj in [-1000, 1000].
//! Buckets are circular doubly-linked lists held in an arena: node indices
//! 0..2001 are the bucket sentinels, record nodes are allocated above them,
//! and links are plain `u32` indices, so insertion and removal stay O(1)
//! without any pointer aliasing.
//!
//! Locking discipline: the table is guarded by a `RwLock` that is
//! write-locked only from the main thread. The watchdog thread takes the read
//! lock to scan for a victim and may flip a record's `valid` flag (an
//! `AtomicBool`), but never touches the lists.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use log::warn;

use crate::config::{OOM_SCORE_ADJ_MAX, OOM_SCORE_ADJ_MIN};
use crate::lock_ext::RwLockExt;

pub const ADJ_SLOT_COUNT: usize = (OOM_SCORE_ADJ_MAX - OOM_SCORE_ADJ_MIN + 1) as usize;

const NIL: u32 = u32::MAX;

fn adj_to_slot(oomadj: i32) -> usize {
    debug_assert!((OOM_SCORE_ADJ_MIN..=OOM_SCORE_ADJ_MAX).contains(&oomadj));
    (oomadj - OOM_SCORE_ADJ_MIN) as usize
}

#[derive(Debug)]
pub struct ProcRecord {
    pub pid: i32,
    pub uid: u32,
    pub oomadj: i32,
    /// PID of the control-socket peer that created or adopted this record.
    /// Zero means unclaimed (the old registrant disconnected).
    pub registrant: i32,
    pub pidfd: Option<OwnedFd>,
    /// Cleared by the watchdog when it kills out-of-band; the main thread
    /// removes the record on its next pass.
    valid: AtomicBool,
}

impl ProcRecord {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// A by-value view of a record, safe to hold without the registry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimRef {
    pub pid: i32,
    pub uid: u32,
    pub oomadj: i32,
    pub has_pidfd: bool,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: u32,
    next: u32,
}

struct Table {
    nodes: Vec<Node>,
    /// records[i] belongs to node index ADJ_SLOT_COUNT + i.
    records: Vec<Option<ProcRecord>>,
    free: Vec<u32>,
    by_pid: HashMap<i32, u32>,
}

impl Table {
    fn new() -> Self {
        let nodes = (0..ADJ_SLOT_COUNT as u32)
            .map(|i| Node { prev: i, next: i })
            .collect();
        Self {
            nodes,
            records: Vec::new(),
            free: Vec::new(),
            by_pid: HashMap::new(),
        }
    }

    fn record(&self, node: u32) -> &ProcRecord {
        self.records[node as usize - ADJ_SLOT_COUNT]
            .as_ref()
            .expect("linked node without record")
    }

    fn record_mut(&mut self, node: u32) -> &mut ProcRecord {
        self.records[node as usize - ADJ_SLOT_COUNT]
            .as_mut()
            .expect("linked node without record")
    }

    fn alloc_node(&mut self, rec: ProcRecord) -> u32 {
        if let Some(node) = self.free.pop() {
            self.records[node as usize - ADJ_SLOT_COUNT] = Some(rec);
            node
        } else {
            self.records.push(Some(rec));
            self.nodes.push(Node { prev: NIL, next: NIL });
            (self.nodes.len() - 1) as u32
        }
    }

    fn free_node(&mut self, node: u32) -> ProcRecord {
        let rec = self.records[node as usize - ADJ_SLOT_COUNT]
            .take()
            .expect("double free of registry node");
        self.free.push(node);
        rec
    }

    /// Insert at the bucket head.
    fn link(&mut self, slot: usize, node: u32) {
        let head = slot as u32;
        let next = self.nodes[head as usize].next;
        self.nodes[node as usize] = Node { prev: head, next };
        self.nodes[next as usize].prev = node;
        self.nodes[head as usize].next = node;
    }

    fn unlink(&mut self, node: u32) {
        let Node { prev, next } = self.nodes[node as usize];
        self.nodes[next as usize].prev = prev;
        self.nodes[prev as usize].next = next;
    }

    fn tail_node(&self, slot: usize) -> Option<u32> {
        let prev = self.nodes[slot].prev;
        if prev == slot as u32 {
            None
        } else {
            Some(prev)
        }
    }

    fn head_node(&self, slot: usize) -> Option<u32> {
        let next = self.nodes[slot].next;
        if next == slot as u32 {
            None
        } else {
            Some(next)
        }
    }

    fn remove(&mut self, pid: i32) -> Option<ProcRecord> {
        let node = self.by_pid.remove(&pid)?;
        self.unlink(node);
        Some(self.free_node(node))
    }

    fn view(&self, node: u32) -> VictimRef {
        let rec = self.record(node);
        VictimRef {
            pid: rec.pid,
            uid: rec.uid,
            oomadj: rec.oomadj,
            has_pidfd: rec.pidfd.is_some(),
            valid: rec.is_valid(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    Denied,
    Removed(i32),
}

pub struct Registry {
    table: RwLock<Table>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::new()),
        }
    }

    /// Create a record and place it in the bucket matching its score.
    /// Refuses a duplicate pid.
    pub fn insert(
        &self,
        pid: i32,
        uid: u32,
        oomadj: i32,
        registrant: i32,
        pidfd: Option<OwnedFd>,
    ) -> bool {
        let mut table = self.table.write_poisoned();
        if table.by_pid.contains_key(&pid) {
            warn!("Attempt to insert a duplicate record for pid {pid}");
            return false;
        }
        let node = table.alloc_node(ProcRecord {
            pid,
            uid,
            oomadj,
            registrant,
            pidfd,
            valid: AtomicBool::new(true),
        });
        table.link(adj_to_slot(oomadj), node);
        table.by_pid.insert(pid, node);
        true
    }

    pub fn lookup(&self, pid: i32) -> Option<VictimRef> {
        let table = self.table.read_poisoned();
        table.by_pid.get(&pid).map(|&node| table.view(node))
    }

    /// True if `caller` already owns the record or the record is unclaimed
    /// (in which case the caller adopts it). False means another live
    /// registrant owns it and the operation must be refused.
    pub fn try_claim(&self, pid: i32, caller: i32) -> Option<bool> {
        let mut table = self.table.write_poisoned();
        let node = *table.by_pid.get(&pid)?;
        let rec = table.record_mut(node);
        if rec.registrant == caller {
            Some(true)
        } else if rec.registrant == 0 {
            rec.registrant = caller;
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Move a record to the bucket of its new score.
    pub fn set_score(&self, pid: i32, newadj: i32) {
        let mut table = self.table.write_poisoned();
        let node = match table.by_pid.get(&pid) {
            Some(&n) => n,
            None => return,
        };
        table.unlink(node);
        table.record_mut(node).oomadj = newadj;
        table.link(adj_to_slot(newadj), node);
    }

    /// Unlink from both indexes and hand the record (and its process fd)
    /// back to the caller, who decides whether the fd must outlive it.
    pub fn remove(&self, pid: i32) -> Option<ProcRecord> {
        self.table.write_poisoned().remove(pid)
    }

    pub fn remove_if_claimed(&self, pid: i32, caller: i32) -> RemoveOutcome {
        match self.try_claim(pid, caller) {
            None => RemoveOutcome::NotFound,
            Some(false) => RemoveOutcome::Denied,
            Some(true) => {
                self.remove(pid);
                RemoveOutcome::Removed(pid)
            }
        }
    }

    /// Remove every record owned by `caller` (including records it could
    /// adopt because their registrant is gone).
    pub fn purge(&self, caller: i32) -> Vec<ProcRecord> {
        let mut table = self.table.write_poisoned();
        let pids: Vec<i32> = table
            .by_pid
            .iter()
            .filter(|(_, &node)| {
                let reg = table.record(node).registrant;
                reg == caller || reg == 0
            })
            .map(|(&pid, _)| pid)
            .collect();
        pids.into_iter()
            .filter_map(|pid| table.remove(pid))
            .collect()
    }

    /// Reset the registrant of every record owned by a disconnected peer so
    /// another registrant may adopt them.
    pub fn remove_claims(&self, peer_pid: i32) {
        let mut table = self.table.write_poisoned();
        let nodes: Vec<u32> = table.by_pid.values().copied().collect();
        for node in nodes {
            let rec = table.record_mut(node);
            if rec.registrant == peer_pid {
                rec.registrant = 0;
            }
        }
    }

    /// Called from the watchdog thread. List mutation is main-thread-only,
    /// so the record is only flagged; reclaim happens later on the main
    /// thread.
    pub fn invalidate(&self, pid: i32) {
        let table = self.table.read_poisoned();
        if let Some(&node) = table.by_pid.get(&pid) {
            table.record(node).valid.store(false, Ordering::Release);
        }
    }

    pub fn tail(&self, oomadj: i32) -> Option<VictimRef> {
        let table = self.table.read_poisoned();
        table
            .tail_node(adj_to_slot(oomadj))
            .map(|node| table.view(node))
    }

    pub fn head(&self, oomadj: i32) -> Option<VictimRef> {
        let table = self.table.read_poisoned();
        table
            .head_node(adj_to_slot(oomadj))
            .map(|node| table.view(node))
    }

    /// The element preceding `pid` (towards the bucket head), or None if pid
    /// is no longer in the bucket or the list is exhausted.
    pub fn prev(&self, oomadj: i32, pid: i32) -> Option<VictimRef> {
        let table = self.table.read_poisoned();
        let slot = adj_to_slot(oomadj);
        let mut curr = table.tail_node(slot);
        while let Some(node) = curr {
            if table.record(node).pid == pid {
                let prev = table.nodes[node as usize].prev;
                if prev == slot as u32 {
                    return None;
                }
                return Some(table.view(prev));
            }
            let prev = table.nodes[node as usize].prev;
            curr = if prev == slot as u32 { None } else { Some(prev) };
        }
        None
    }

    /// Duplicate a record's process fd for use outside the lock (watchdog
    /// sync kills).
    pub fn dup_pidfd(&self, pid: i32) -> Option<OwnedFd> {
        let table = self.table.read_poisoned();
        let node = *table.by_pid.get(&pid)?;
        table.record(node).pidfd.as_ref()?.try_clone().ok()
    }

    /// The record with the largest RSS in the bucket. `sizer` reads the
    /// process size; records it fails on are presumed dead and dropped.
    /// Returns the dropped records alongside the pick so the caller can
    /// dispose of their fds outside the lock.
    pub fn heaviest(
        &self,
        oomadj: i32,
        sizer: &mut dyn FnMut(i32) -> Option<i64>,
    ) -> (Option<VictimRef>, Vec<ProcRecord>) {
        let mut table = self.table.write_poisoned();
        let slot = adj_to_slot(oomadj);
        let head = slot as u32;

        // Single-element bucket: no need to read sizes at all
        let first = table.nodes[slot].next;
        if first != head && table.nodes[first as usize].next == head {
            let view = table.view(first);
            return (Some(view), Vec::new());
        }

        let mut dropped = Vec::new();
        let mut max_size = 0i64;
        let mut max_node = None;
        let mut curr = table.nodes[slot].next;
        while curr != head {
            let next = table.nodes[curr as usize].next;
            let pid = table.record(curr).pid;
            match sizer(pid) {
                Some(size) => {
                    if size > max_size {
                        max_size = size;
                        max_node = Some(curr);
                    }
                }
                None => {
                    if let Some(rec) = table.remove(pid) {
                        dropped.push(rec);
                    }
                }
            }
            curr = next;
        }
        (max_node.map(|n| table.view(n)), dropped)
    }

    #[cfg(test)]
    pub fn bucket_pids(&self, oomadj: i32) -> Vec<i32> {
        let table = self.table.read_poisoned();
        let slot = adj_to_slot(oomadj);
        let head = slot as u32;
        let mut pids = Vec::new();
        let mut curr = table.nodes[slot].next;
        while curr != head {
            pids.push(table.record(curr).pid);
            curr = table.nodes[curr as usize].next;
        }
        pids
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.read_poisoned().by_pid.len()
    }
}

const MAX_DISTINCT_OOM_ADJ: usize = 32;
const KILLCNT_INVALID_IDX: u8 = 0xFF;

/// Per-score kill counters: a dense index array pointing into a compact
/// counter array, since only a handful of distinct scores ever get kills.
/// Counter wraparound is ignored; the running total supplies the
/// consistency check.
pub struct KillCounters {
    idx: [u8; ADJ_SLOT_COUNT],
    counts: [u16; MAX_DISTINCT_OOM_ADJ],
    next_free: usize,
    total: u32,
}

impl Default for KillCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl KillCounters {
    pub fn new() -> Self {
        Self {
            idx: [KILLCNT_INVALID_IDX; ADJ_SLOT_COUNT],
            counts: [0; MAX_DISTINCT_OOM_ADJ],
            next_free: 0,
            total: 0,
        }
    }

    pub fn increment(&mut self, oomadj: i32) {
        let slot = adj_to_slot(oomadj);
        let idx = self.idx[slot];
        if idx == KILLCNT_INVALID_IDX {
            if self.next_free < MAX_DISTINCT_OOM_ADJ {
                self.idx[slot] = self.next_free as u8;
                self.counts[self.next_free] = 1;
                self.next_free += 1;
            } else {
                warn!("Number of distinct oomadj levels exceeds {MAX_DISTINCT_OOM_ADJ}");
            }
        } else {
            self.counts[idx as usize] = self.counts[idx as usize].wrapping_add(1);
        }
        self.total = self.total.wrapping_add(1);
    }

    /// Kills within [min_oomadj, max_oomadj]. A min above the score maximum
    /// requests the total count.
    pub fn range_count(&self, min_oomadj: i32, max_oomadj: i32) -> u32 {
        if min_oomadj > max_oomadj {
            return 0;
        }
        if min_oomadj > OOM_SCORE_ADJ_MAX {
            return self.total;
        }
        let lo = min_oomadj.max(OOM_SCORE_ADJ_MIN);
        let hi = max_oomadj.min(OOM_SCORE_ADJ_MAX);
        let mut count = 0u32;
        for adj in lo..=hi {
            let idx = self.idx[adj_to_slot(adj)];
            if idx != KILLCNT_INVALID_IDX {
                count += u32::from(self.counts[idx as usize]);
            }
        }
        count
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}
