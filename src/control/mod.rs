//! The control-socket server.
//!
//! One listening stream socket plus up to three data connections from
//! framework peers. Every received message must carry the peer's credentials
//! (SCM_CREDENTIALS); a message without them drops the connection. When a
//! fourth peer connects, all existing connections are forcibly closed so the
//! newcomer gets a slot: the most important peer is expected to reconnect
//! immediately.

pub mod protocol;

use std::io::{self, IoSliceMut, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::{error, info, warn};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixCredentials};

use crate::error::{Error, Result};

pub const MAX_DATA_CONN: usize = 3;

/// Default location of the control socket.
pub const CONTROL_SOCKET_PATH: &str = "/run/lowmemd/control.socket";

struct DataConn {
    stream: UnixStream,
    peer_pid: i32,
    async_event_mask: u32,
}

#[derive(Debug)]
pub struct AcceptOutcome {
    pub slot: usize,
    /// Peers that were forcibly dropped to make room.
    pub dropped_peers: Vec<i32>,
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame and the sender's credentials.
    Packet {
        words: Vec<i32>,
        cred_pid: i32,
        cred_uid: u32,
    },
    /// The peer hung up (or sent no credentials); the slot was closed.
    Closed { peer_pid: i32 },
}

pub struct ControlServer {
    listener: UnixListener,
    slots: [Option<DataConn>; MAX_DATA_CONN],
}

impl ControlServer {
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Fatal(format!("control socket bind failed: {e}")))?;
        Ok(Self {
            listener,
            slots: [None, None, None],
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn slot_fd(&self, slot: usize) -> Option<RawFd> {
        self.slots[slot].as_ref().map(|c| c.stream.as_raw_fd())
    }

    pub fn peer_pid(&self, slot: usize) -> Option<i32> {
        self.slots[slot].as_ref().map(|c| c.peer_pid)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Accept a pending connection. Enables credential passing on the data
    /// socket; the daemon registers the returned slot with its multiplexer.
    pub fn accept(&mut self) -> Result<AcceptOutcome> {
        let mut dropped_peers = Vec::new();
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => {
                // Should not happen, but inactive connections must not
                // monopolize the data slots
                for slot in 0..MAX_DATA_CONN {
                    if let Some(pid) = self.close(slot) {
                        warn!("Dropping control connection of peer {pid} to free a slot");
                        dropped_peers.push(pid);
                    }
                }
                0
            }
        };

        let (stream, _addr) = self
            .listener
            .accept()
            .map_err(|e| Error::Transient(format!("control socket accept failed: {e}")))?;
        nix::sys::socket::setsockopt(&stream, nix::sys::socket::sockopt::PassCred, &true)
            .map_err(|e| Error::Transient(format!("enabling credential passing failed: {e}")))?;

        info!("control connection established");
        self.slots[slot] = Some(DataConn {
            stream,
            peer_pid: 0,
            async_event_mask: 0,
        });
        Ok(AcceptOutcome {
            slot,
            dropped_peers,
        })
    }

    /// Read one frame from a data connection. Credentials are mandatory:
    /// a message without them closes the connection.
    pub fn read_packet(&mut self, slot: usize) -> Result<ReadOutcome> {
        let conn = match self.slots[slot].as_mut() {
            Some(c) => c,
            None => {
                return Err(Error::Protocol(format!(
                    "read on unconnected control slot {slot}"
                )))
            }
        };

        let mut buf = [0u8; protocol::CTRL_PACKET_MAX_WORDS * 4];
        let mut cmsg_space = nix::cmsg_space!(UnixCredentials);
        let (bytes, cred) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<nix::sys::socket::UnixAddr>(
                conn.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("control data socket read failed: {e}");
                    let peer_pid = self.close(slot).unwrap_or(0);
                    return Ok(ReadOutcome::Closed { peer_pid });
                }
            };
            let mut cred: Option<UnixCredentials> = None;
            match msg.cmsgs() {
                Ok(cmsgs) => {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmCredentials(c) = cmsg {
                            cred = Some(c);
                            break;
                        }
                    }
                }
                Err(e) => error!("failed to parse control messages: {e}"),
            }
            (msg.bytes, cred)
        };

        if bytes == 0 {
            let peer_pid = self.close(slot).unwrap_or(0);
            return Ok(ReadOutcome::Closed { peer_pid });
        }
        let cred = match cred {
            Some(c) => c,
            None => {
                error!("Failed to retrieve sender credentials");
                let peer_pid = self.close(slot).unwrap_or(0);
                return Ok(ReadOutcome::Closed { peer_pid });
            }
        };

        let words = protocol::decode_words(&buf[..bytes])?;
        let conn = self.slots[slot].as_mut().unwrap();
        conn.peer_pid = cred.pid();
        Ok(ReadOutcome::Packet {
            words,
            cred_pid: cred.pid(),
            cred_uid: cred.uid(),
        })
    }

    pub fn write(&mut self, slot: usize, bytes: &[u8]) -> io::Result<()> {
        match self.slots[slot].as_mut() {
            Some(conn) => conn.stream.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "control slot not connected",
            )),
        }
    }

    /// Close a data connection and return the peer pid so the caller can
    /// reset its record claims.
    pub fn close(&mut self, slot: usize) -> Option<i32> {
        let conn = self.slots[slot].take()?;
        info!("closing control data connection");
        Some(conn.peer_pid)
    }

    pub fn subscribe(&mut self, slot: usize, evt_type: i32) {
        if !(0..32).contains(&evt_type) {
            warn!("Ignoring subscription to invalid event type {evt_type}");
            return;
        }
        if let Some(conn) = self.slots[slot].as_mut() {
            conn.async_event_mask |= 1 << evt_type;
        }
    }

    /// Send an async notification to every peer subscribed to `evt_type`.
    pub fn broadcast(&mut self, evt_type: i32, bytes: &[u8]) {
        for slot in 0..MAX_DATA_CONN {
            let subscribed = self.slots[slot]
                .as_ref()
                .map(|c| c.async_event_mask & (1 << evt_type) != 0)
                .unwrap_or(false);
            if subscribed {
                if let Err(e) = self.write(slot, bytes) {
                    error!("control data socket write failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::*;
    use std::io::Read;

    fn bind_server(dir: &Path) -> (ControlServer, std::path::PathBuf) {
        let path = dir.join("control.socket");
        let server = ControlServer::bind(&path).unwrap();
        (server, path)
    }

    #[test]
    fn test_packet_roundtrip_with_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = bind_server(dir.path());

        let mut client = UnixStream::connect(&path).unwrap();
        let outcome = server.accept().unwrap();
        assert!(outcome.dropped_peers.is_empty());

        client
            .write_all(&encode_words(&[CMD_PROCPRIO, 1234, 10001, 900, 0]))
            .unwrap();
        match server.read_packet(outcome.slot).unwrap() {
            ReadOutcome::Packet {
                words,
                cred_pid,
                cred_uid: _,
            } => {
                assert_eq!(
                    protocol::decode(&words).unwrap(),
                    Command::ProcPrio(ProcPrio {
                        pid: 1234,
                        uid: 10001,
                        oomadj: 900,
                        ptype: ProcType::App,
                    })
                );
                // The kernel fills in our own pid for a same-process client
                assert_eq!(cred_pid, std::process::id() as i32);
                assert_eq!(server.peer_pid(outcome.slot), Some(cred_pid));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_peer_disconnect_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = bind_server(dir.path());

        let client = UnixStream::connect(&path).unwrap();
        let outcome = server.accept().unwrap();
        drop(client);
        match server.read_packet(outcome.slot).unwrap() {
            ReadOutcome::Closed { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(server.slot_fd(outcome.slot).is_none());
    }

    #[test]
    fn test_fourth_peer_drops_all_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = bind_server(dir.path());

        let mut clients = Vec::new();
        for i in 0..3 {
            let mut client = UnixStream::connect(&path).unwrap();
            let outcome = server.accept().unwrap();
            assert_eq!(outcome.slot, i);
            // Register each peer's pid by sending one packet
            client.write_all(&encode_words(&[CMD_PROCPURGE])).unwrap();
            let _ = server.read_packet(outcome.slot).unwrap();
            clients.push(client);
        }

        let _fourth = UnixStream::connect(&path).unwrap();
        let outcome = server.accept().unwrap();
        assert_eq!(outcome.slot, 0);
        assert_eq!(outcome.dropped_peers.len(), 3);
        for slot in 1..MAX_DATA_CONN {
            assert!(server.slot_fd(slot).is_none());
        }
        // The newcomer starts with a clean slate
        assert_eq!(server.peer_pid(0), Some(0));
    }

    #[test]
    fn test_kill_notification_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = bind_server(dir.path());

        let mut subscriber = UnixStream::connect(&path).unwrap();
        let sub_slot = server.accept().unwrap().slot;
        let _other = UnixStream::connect(&path).unwrap();
        let other_slot = server.accept().unwrap().slot;

        server.subscribe(sub_slot, ASYNC_EVENT_KILL);
        // The unsubscribed peer gets nothing
        let _ = other_slot;

        server.broadcast(ASYNC_EVENT_KILL, &notif_kill(1234, 10001, 2048));

        let mut buf = [0u8; 16];
        subscriber.read_exact(&mut buf).unwrap();
        let words = decode_words(&buf).unwrap();
        assert_eq!(parse_notif_kill(&words), Some((1234, 10001, 2048)));
    }
}
