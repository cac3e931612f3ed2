//! The control-socket wire protocol.
//!
//! Packets are length-implicit frames of native-endian 32-bit words read in
//! a single `recvmsg`. The first word is the command tag; the argument count
//! is derived from the frame length and validated per command. Replies and
//! asynchronous notifications reuse the same framing with the command tag
//! echoed in the first word.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::{Error, Result};

pub const CMD_TARGET: i32 = 0;
pub const CMD_PROCPRIO: i32 = 1;
pub const CMD_PROCREMOVE: i32 = 2;
pub const CMD_PROCPURGE: i32 = 3;
pub const CMD_GETKILLCNT: i32 = 4;
pub const CMD_SUBSCRIBE: i32 = 5;
pub const CMD_PROCKILL: i32 = 6;
pub const CMD_UPDATE_PROPS: i32 = 7;
pub const CMD_STAT_KILL_OCCURRED: i32 = 8;
pub const CMD_START_MONITORING: i32 = 9;
pub const CMD_BOOT_COMPLETED: i32 = 10;
pub const CMD_PROCS_PRIO: i32 = 11;

/// Async notification kinds a peer may subscribe to.
pub const ASYNC_EVENT_KILL: i32 = 0;
pub const ASYNC_EVENT_STAT: i32 = 1;

/// Maximum entries of a TARGET request.
pub const MAX_TARGETS: usize = 6;
/// Maximum processes in one PROCS_PRIO batch.
pub const MAX_PROCS_PRIO_BATCH: usize = 64;

/// Largest frame we accept: a full PROCS_PRIO batch plus the tag.
pub const CTRL_PACKET_MAX_WORDS: usize = 1 + 4 * MAX_PROCS_PRIO_BATCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    App,
    Service,
}

impl ProcType {
    fn from_word(word: i32) -> Result<Self> {
        match word {
            0 => Ok(Self::App),
            1 => Ok(Self::Service),
            other => Err(Error::Protocol(format!("invalid process type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcPrio {
    pub pid: i32,
    pub uid: u32,
    pub oomadj: i32,
    pub ptype: ProcType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pairs of (minfree in pages, oom_score_adj).
    Target(Vec<(i32, i32)>),
    ProcPrio(ProcPrio),
    ProcRemove { pid: i32 },
    ProcPurge,
    GetKillCnt { min_oomadj: i32, max_oomadj: i32 },
    Subscribe { evt_type: i32 },
    UpdateProps,
    StartMonitoring,
    BootCompleted,
    ProcsPrio(Vec<ProcPrio>),
}

fn parse_procprio(args: &[i32]) -> Result<ProcPrio> {
    let ptype = if args.len() == 4 {
        ProcType::from_word(args[3])?
    } else {
        ProcType::App
    };
    Ok(ProcPrio {
        pid: args[0],
        uid: args[1] as u32,
        oomadj: args[2],
        ptype,
    })
}

/// Decode one inbound frame. The tag word determines the expected argument
/// count; anything else is a protocol error that only costs the one packet.
pub fn decode(words: &[i32]) -> Result<Command> {
    let (&cmd, args) = words
        .split_first()
        .ok_or_else(|| Error::Protocol("empty control packet".into()))?;
    let nargs = args.len();
    let wronglen = || Error::Protocol(format!("wrong control packet length cmd={cmd} nargs={nargs}"));

    match cmd {
        CMD_TARGET => {
            if nargs == 0 || nargs % 2 != 0 || nargs / 2 > MAX_TARGETS {
                return Err(wronglen());
            }
            Ok(Command::Target(
                args.chunks_exact(2).map(|c| (c[0], c[1])).collect(),
            ))
        }
        CMD_PROCPRIO => {
            // The process type is optional for backward compatibility
            if !(3..=4).contains(&nargs) {
                return Err(wronglen());
            }
            Ok(Command::ProcPrio(parse_procprio(args)?))
        }
        CMD_PROCREMOVE => {
            if nargs != 1 {
                return Err(wronglen());
            }
            Ok(Command::ProcRemove { pid: args[0] })
        }
        CMD_PROCPURGE => {
            if nargs != 0 {
                return Err(wronglen());
            }
            Ok(Command::ProcPurge)
        }
        CMD_GETKILLCNT => {
            if nargs != 2 {
                return Err(wronglen());
            }
            Ok(Command::GetKillCnt {
                min_oomadj: args[0],
                max_oomadj: args[1],
            })
        }
        CMD_SUBSCRIBE => {
            if nargs != 1 {
                return Err(wronglen());
            }
            Ok(Command::Subscribe { evt_type: args[0] })
        }
        CMD_PROCKILL => Err(Error::Protocol(
            "PROCKILL is outbound-only and not a valid request".into(),
        )),
        CMD_UPDATE_PROPS => {
            if nargs != 0 {
                return Err(wronglen());
            }
            Ok(Command::UpdateProps)
        }
        CMD_START_MONITORING => {
            if nargs != 0 {
                return Err(wronglen());
            }
            Ok(Command::StartMonitoring)
        }
        CMD_BOOT_COMPLETED => {
            if nargs != 0 {
                return Err(wronglen());
            }
            Ok(Command::BootCompleted)
        }
        CMD_PROCS_PRIO => {
            if nargs == 0 || nargs % 4 != 0 || nargs / 4 > MAX_PROCS_PRIO_BATCH {
                return Err(wronglen());
            }
            let procs = args
                .chunks_exact(4)
                .map(parse_procprio)
                .collect::<Result<Vec<_>>>()?;
            Ok(Command::ProcsPrio(procs))
        }
        other => Err(Error::Protocol(format!("unknown command code {other}"))),
    }
}

pub fn encode_words(words: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(words.len() * 4);
    for w in words {
        buf.extend_from_slice(&w.to_ne_bytes());
    }
    buf
}

pub fn decode_words(buf: &[u8]) -> Result<Vec<i32>> {
    if buf.is_empty() || buf.len() % 4 != 0 || buf.len() / 4 > CTRL_PACKET_MAX_WORDS {
        return Err(Error::Protocol(format!(
            "wrong control packet length {}",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

pub fn reply_getkillcnt(count: u32) -> Vec<u8> {
    encode_words(&[CMD_GETKILLCNT, count as i32])
}

pub fn reply_update_props(result: i32) -> Vec<u8> {
    encode_words(&[CMD_UPDATE_PROPS, result])
}

pub fn reply_boot_completed(result: i32) -> Vec<u8> {
    encode_words(&[CMD_BOOT_COMPLETED, result])
}

/// Unsolicited kill notification for KILL subscribers.
pub fn notif_kill(pid: i32, uid: u32, rss_kb: i64) -> Vec<u8> {
    encode_words(&[CMD_PROCKILL, pid, uid as i32, rss_kb.min(i32::MAX as i64) as i32])
}

/// Everything a STAT subscriber learns about one kill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillStat {
    pub uid: i32,
    pub pid: i32,
    pub oom_score: i32,
    pub min_oom_score: i32,
    pub free_mem_kb: i64,
    pub free_swap_kb: i64,
    pub kill_reason: i32,
    pub thrashing: i32,
    pub max_thrashing: i32,
    pub rss_kb: i64,
    pub swap_kb: i64,
    pub taskname: String,
}

/// STAT notification: twelve stat words followed by the NUL-terminated task
/// name padded to word size.
pub fn notif_stat(stat: &KillStat) -> Vec<u8> {
    let clamp = |v: i64| v.min(i32::MAX as i64) as i32;
    let mut buf = encode_words(&[
        CMD_STAT_KILL_OCCURRED,
        stat.uid,
        stat.pid,
        stat.oom_score,
        stat.min_oom_score,
        clamp(stat.free_mem_kb),
        clamp(stat.free_swap_kb),
        stat.kill_reason,
        stat.thrashing,
        stat.max_thrashing,
        clamp(stat.rss_kb),
        clamp(stat.swap_kb),
    ]);
    buf.extend_from_slice(stat.taskname.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

pub fn parse_notif_kill(words: &[i32]) -> Option<(i32, u32, i32)> {
    if words.len() == 4 && words[0] == CMD_PROCKILL {
        Some((words[1], words[2] as u32, words[3]))
    } else {
        None
    }
}

// Client-side helpers used by the CLI entry points.

pub fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

fn roundtrip(stream: &mut UnixStream, cmd: i32) -> io::Result<i32> {
    stream.write_all(&encode_words(&[cmd]))?;
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    let tag = i32::from_ne_bytes(reply[0..4].try_into().unwrap());
    if tag != cmd {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected reply tag {tag}"),
        ));
    }
    Ok(i32::from_ne_bytes(reply[4..8].try_into().unwrap()))
}

/// Ask a running daemon to re-read its tunables. Returns the daemon's
/// result word (0 on success, -1 on failure).
pub fn request_update_props(stream: &mut UnixStream) -> io::Result<i32> {
    roundtrip(stream, CMD_UPDATE_PROPS)
}

/// Notify a running daemon that boot completed. Result word: 0 handled,
/// 1 already handled earlier, -1 failure.
pub fn request_boot_completed(stream: &mut UnixStream) -> io::Result<i32> {
    roundtrip(stream, CMD_BOOT_COMPLETED)
}
