//! Handler watchdog.
//!
//! Every main-loop handler runs inside `start()`..`stop()`. If a handler
//! overruns its budget the watchdog thread fires the callback, which kills
//! the highest-scoring victim it can find so the memory squeeze that is
//! probably wedging the handler gets relieved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;

use crate::lock_ext::MutexExt;
use crate::registry::Registry;
use crate::reaper::Reaper;

pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(2);

struct Inner {
    deadline: Mutex<Option<Instant>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

pub struct Watchdog {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
    budget: Duration,
}

impl Watchdog {
    pub fn new(budget: Duration, callback: impl Fn() + Send + 'static) -> Self {
        let inner = Arc::new(Inner {
            deadline: Mutex::new(None),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("lowmemd-watchdog".into())
            .spawn(move || {
                let mut deadline = thread_inner.deadline.lock_poisoned();
                loop {
                    if thread_inner.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    match *deadline {
                        None => {
                            deadline = thread_inner
                                .cv
                                .wait(deadline)
                                .unwrap_or_else(|e| e.into_inner());
                        }
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                // Disarm before firing so one overrun yields
                                // exactly one forced kill
                                *deadline = None;
                                drop(deadline);
                                callback();
                                deadline = thread_inner.deadline.lock_poisoned();
                            } else {
                                let (guard, _) = thread_inner
                                    .cv
                                    .wait_timeout(deadline, d - now)
                                    .unwrap_or_else(|e| e.into_inner());
                                deadline = guard;
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn watchdog thread");
        Self {
            inner,
            handle: Some(handle),
            budget,
        }
    }

    /// Arm the watchdog for one handler invocation.
    pub fn start(&self) {
        *self.inner.deadline.lock_poisoned() = Some(Instant::now() + self.budget);
        self.inner.cv.notify_one();
    }

    /// Disarm after the handler returned in time.
    pub fn stop(&self) {
        *self.inner.deadline.lock_poisoned() = None;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The timeout callback: sweep scores from the top, synchronously kill the
/// first valid candidate and invalidate its record. List mutation stays on
/// the main thread, so the record is only flagged here.
pub fn watchdog_callback(registry: &Registry, reaper: &Reaper) {
    warn!("lowmemd watchdog timed out!");
    for oom_score in (0..=1000).rev() {
        let mut candidate = registry.tail(oom_score);
        while let Some(target) = candidate {
            if target.valid {
                let pidfd = registry.dup_pidfd(target.pid);
                if reaper
                    .kill(pidfd.as_ref(), target.pid, target.uid, true)
                    .is_ok()
                {
                    warn!(
                        "lowmemd watchdog killed process {}, oom_score_adj {oom_score}",
                        target.pid
                    );
                    registry.invalidate(target.pid);
                    return;
                }
            }
            candidate = registry.prev(oom_score, target.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_fires_once_on_overrun() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let wd = Watchdog::new(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        wd.start();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wd.stop();
    }

    #[test]
    fn test_does_not_fire_when_stopped_in_time() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let wd = Watchdog::new(Duration::from_millis(100), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            wd.start();
            std::thread::sleep(Duration::from_millis(5));
            wd.stop();
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_invalidates_highest_scored_record() {
        // A registry with unkillable pids: the reaper fails on them, the
        // sweep walks down and eventually gives up without panicking
        let registry = Registry::new();
        registry.insert(i32::MAX - 10, 0, 900, 1, None);
        let reaper = Reaper::new();
        watchdog_callback(&registry, &reaper);
        // The kill failed, so the record must remain valid
        assert!(registry.lookup(i32::MAX - 10).unwrap().valid);

        // A real child at score 900 gets killed and invalidated
        let mut child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;
        registry.insert(pid, 0, 950, 1, None);
        watchdog_callback(&registry, &reaper);
        assert!(!registry.lookup(pid).unwrap().valid);
        let _ = child.wait();
    }
}
