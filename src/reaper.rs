//! Victim termination and accelerated memory reaping.
//!
//! SIGKILL is always delivered on the calling thread (through the process fd
//! when one exists, so a recycled PID can never be hit). When the kernel
//! supports `process_mrelease`, the actual memory teardown is offloaded to a
//! small worker pool so the main loop never blocks on it; a reap failure is
//! reported back by writing the PID into a nonblocking pipe the main loop
//! multiplexes.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info};

use crate::lock_ext::MutexExt;

const REAPER_THREAD_CNT: usize = 2;

pub fn pidfd_open(pid: i32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }
}

fn pidfd_send_signal(fd: RawFd, signal: i32) -> io::Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            fd as libc::c_long,
            signal as libc::c_long,
            std::ptr::null::<libc::siginfo_t>(),
            0 as libc::c_long,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn process_mrelease(fd: RawFd) -> io::Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_process_mrelease,
            fd as libc::c_long,
            0 as libc::c_long,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Whether the kernel knows `pidfd_open` at all.
pub fn pidfd_supported() -> bool {
    match pidfd_open(std::process::id() as i32) {
        Ok(_) => true,
        Err(e) => e.raw_os_error() != Some(libc::ENOSYS),
    }
}

/// Probe for `process_mrelease`: a bad descriptor proves the syscall exists.
pub fn mrelease_supported() -> bool {
    match process_mrelease(-1) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() != Some(libc::ENOSYS),
    }
}

struct ReapTask {
    pidfd: OwnedFd,
    pid: i32,
    uid: u32,
}

struct Shared {
    queue: Mutex<VecDeque<ReapTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
    /// Write end of the kill-failure pipe, once initialized.
    notify_fd: Mutex<Option<OwnedFd>>,
    debug: AtomicBool,
}

impl Shared {
    fn notify_failure(&self, pid: i32) {
        let guard = self.notify_fd.lock_poisoned();
        if let Some(fd) = guard.as_ref() {
            if let Err(e) = nix::unistd::write(fd, &pid.to_ne_bytes()) {
                error!("thread communication write failed: {e}");
            }
        }
    }

    fn reap(&self, task: ReapTask) {
        let start = Instant::now();
        match process_mrelease(task.pidfd.as_raw_fd()) {
            Ok(()) => {
                if self.debug.load(Ordering::Relaxed) {
                    debug!(
                        "Process {} (uid {}) was reaped in {}ms",
                        task.pid,
                        task.uid,
                        start.elapsed().as_millis()
                    );
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                // Already fully gone, nothing left to release
            }
            Err(e) => {
                error!("process_mrelease {} failed: {e}", task.pid);
                self.notify_failure(task.pid);
            }
        }
    }
}

pub struct Reaper {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    reaping_supported: bool,
}

impl Reaper {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                shutdown: AtomicBool::new(false),
                notify_fd: Mutex::new(None),
                debug: AtomicBool::new(false),
            }),
            workers: Vec::new(),
            reaping_supported: mrelease_supported(),
        }
    }

    pub fn is_reaping_supported(&self) -> bool {
        self.reaping_supported
    }

    pub fn thread_cnt(&self) -> usize {
        self.workers.len()
    }

    pub fn enable_debug(&self, enable: bool) {
        self.shared.debug.store(enable, Ordering::Relaxed);
    }

    /// Start the worker pool. `notify_fd` is the write end of the failure
    /// pipe; the read end is registered with the main loop's multiplexer.
    pub fn init(&mut self, notify_fd: OwnedFd) -> bool {
        if !self.reaping_supported {
            return false;
        }
        *self.shared.notify_fd.lock_poisoned() = Some(notify_fd);
        for _ in 0..REAPER_THREAD_CNT {
            let shared = self.shared.clone();
            self.workers.push(std::thread::spawn(move || loop {
                let task = {
                    let mut queue = shared.queue.lock_poisoned();
                    loop {
                        if shared.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        match queue.pop_front() {
                            Some(task) => break task,
                            None => queue = shared.cv.wait(queue).unwrap_or_else(|e| e.into_inner()),
                        }
                    }
                };
                shared.reap(task);
            }));
        }
        true
    }

    /// Terminate a process. The signal goes out synchronously; when `sync`
    /// is false and reaping is available, memory release is queued to a
    /// worker. Returns the result of the signal delivery.
    pub fn kill(
        &self,
        pidfd: Option<&OwnedFd>,
        pid: i32,
        uid: u32,
        sync: bool,
    ) -> io::Result<()> {
        match pidfd {
            None => nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            )
            .map_err(|e| io::Error::from_raw_os_error(e as i32)),
            Some(fd) => {
                pidfd_send_signal(fd.as_raw_fd(), libc::SIGKILL)?;
                if !self.reaping_supported {
                    return Ok(());
                }
                if sync {
                    // The watchdog path reaps on the calling thread
                    if let Err(e) = process_mrelease(fd.as_raw_fd()) {
                        if e.raw_os_error() != Some(libc::ESRCH) {
                            error!("process_mrelease {pid} failed: {e}");
                        }
                    }
                    return Ok(());
                }
                if self.workers.is_empty() {
                    return Ok(());
                }
                // Workers get their own descriptor so the kill watch can
                // close the original independently
                match fd.try_clone() {
                    Ok(dup) => {
                        self.shared.queue.lock_poisoned().push_back(ReapTask {
                            pidfd: dup,
                            pid,
                            uid,
                        });
                        self.shared.cv.notify_one();
                    }
                    Err(e) => error!("Failed to duplicate pidfd for pid {pid}: {e}"),
                }
                Ok(())
            }
        }
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                info!("A reaper worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_probes_run() {
        // Results depend on the kernel; the probes must never error out
        let _ = pidfd_supported();
        let _ = mrelease_supported();
    }

    #[test]
    fn test_pidfd_open_self() {
        if !pidfd_supported() {
            return;
        }
        let fd = pidfd_open(std::process::id() as i32).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn test_kill_by_pid() {
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .expect("spawn sleep");
        let reaper = Reaper::new();
        reaper
            .kill(None, child.id() as i32, 0, true)
            .expect("kill child");
        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_kill_by_pidfd() {
        if !pidfd_supported() {
            return;
        }
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .expect("spawn sleep");
        let pidfd = pidfd_open(child.id() as i32).unwrap();
        let reaper = Reaper::new();
        reaper
            .kill(Some(&pidfd), child.id() as i32, 0, true)
            .expect("kill child");
        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_kill_dead_pid_fails() {
        let reaper = Reaper::new();
        // PID that cannot exist
        let res = reaper.kill(None, i32::MAX - 1, 0, true);
        assert!(res.is_err());
    }
}
