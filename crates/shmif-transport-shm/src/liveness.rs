//! Peer liveness: the guard thread behind the dead-man switch.
//!
//! The page's `dms` flag covers orderly shutdown and protocol kills. A peer
//! that crashes never clears it, so each side can run a guard that polls
//! the peer pid and, once it is gone, marks the segment dead locally and
//! posts every semaphore so blocked waiters re-check and return.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::sem::SemaphoreTriad;

/// Whether process `pid` still exists.
pub fn process_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence check only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

struct Shared {
    alive: AtomicBool,
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Watches a peer process from a background thread.
pub struct Guard {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Guard {
    /// Start watching `pid`, checking every `interval`.
    pub fn spawn(
        pid: libc::pid_t,
        interval: Duration,
        triad: Arc<SemaphoreTriad>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread = std::thread::Builder::new()
            .name(format!("shmif-guard-{}", pid))
            .spawn({
                let shared = shared.clone();
                move || watch(pid, interval, &shared, &triad)
            })?;

        tracing::debug!(pid, ?interval, "guard started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// False once the peer has been seen gone.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("guard thread panicked");
            }
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(pid: libc::pid_t, interval: Duration, shared: &Shared, triad: &SemaphoreTriad) {
    let mut stop = shared.stop.lock();
    while !*stop {
        if !process_alive(pid) {
            tracing::debug!(pid, "guard: peer process gone");
            shared.alive.store(false, Ordering::Release);
            triad.post_all();
            return;
        }
        shared.wake.wait_for(&mut stop, interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::test_key;
    use std::process::Command;
    use std::time::Instant;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as libc::pid_t));
        assert!(!process_alive(0));
        assert!(!process_alive(-5));
    }

    #[test]
    fn stop_is_prompt() {
        let key = test_key();
        let triad = Arc::new(SemaphoreTriad::create(&key).unwrap());
        SemaphoreTriad::unlink(&key).unwrap();

        let mut guard = Guard::spawn(
            std::process::id() as libc::pid_t,
            Duration::from_secs(60),
            triad,
        )
        .unwrap();
        assert!(guard.is_alive());

        let start = Instant::now();
        guard.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn dead_peer_posts_the_triad() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as libc::pid_t;
        child.wait().unwrap();

        let key = test_key();
        let triad = Arc::new(SemaphoreTriad::create(&key).unwrap());
        SemaphoreTriad::unlink(&key).unwrap();
        // Swallow the event semaphore's initial unit.
        assert!(triad.event.try_wait().unwrap());

        let guard = Guard::spawn(pid, Duration::from_millis(10), triad.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while guard.is_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!guard.is_alive());
        assert!(triad.event.try_wait().unwrap());
        assert!(triad.video.try_wait().unwrap());
    }
}
