//! The bounded wait primitive.
//!
//! Every blocking operation in this crate waits in steps of at most one
//! interval and re-checks liveness between steps. Whether a step is a real
//! timed semaphore wait or a try-wait/sleep loop is a per-platform
//! capability probed at runtime.

use std::time::{Duration, Instant};

use crate::key::{KeyRole, SegmentKey};
use crate::sem::NamedSemaphore;

/// Slice length for the emulated wait.
const SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedWaitSupport {
    /// `sem_timedwait` works.
    Native,
    /// Try-wait plus short sleeps.
    Emulated,
}

impl TimedWaitSupport {
    /// Create a private semaphore, unlink it, and try a zero-timeout timed
    /// wait on it. Only a clean timeout counts as support.
    pub fn probe() -> Self {
        if !cfg!(target_os = "linux") {
            return Self::Emulated;
        }

        let mut attempt = 0;
        let sem = loop {
            let name = SegmentKey::generate().name(KeyRole::Event);
            match NamedSemaphore::create(&name, 0) {
                Ok(sem) => {
                    let _ = NamedSemaphore::unlink(&name);
                    break sem;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 3 => {
                    attempt += 1;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "timed wait probe could not create semaphore");
                    return Self::Emulated;
                }
            }
        };

        match sem.timed_wait(Duration::ZERO) {
            Ok(false) => Self::Native,
            Ok(true) => {
                tracing::debug!("timed wait probe acquired an empty semaphore");
                Self::Emulated
            }
            Err(e) => {
                tracing::debug!(error = %e, "timed wait unsupported");
                Self::Emulated
            }
        }
    }
}

/// One bounded wait step.
#[derive(Debug, Clone, Copy)]
pub struct BoundedWait {
    support: TimedWaitSupport,
    interval: Duration,
}

impl BoundedWait {
    pub fn new(support: TimedWaitSupport, interval: Duration) -> Self {
        Self { support, interval }
    }

    #[inline]
    pub fn support(&self) -> TimedWaitSupport {
        self.support
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait at most one interval for a unit of `sem`. Returns whether one
    /// was acquired.
    pub fn wait(&self, sem: &NamedSemaphore) -> bool {
        match self.support {
            TimedWaitSupport::Native => match sem.timed_wait(self.interval) {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::warn!(name = %sem.name(), error = %e, "timed wait failed");
                    self.emulated(sem)
                }
            },
            TimedWaitSupport::Emulated => self.emulated(sem),
        }
    }

    fn emulated(&self, sem: &NamedSemaphore) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            match sem.try_wait() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(name = %sem.name(), error = %e, "try-wait failed");
                    std::thread::sleep(self.interval);
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }

    /// Sleep one interval. For queues with no semaphore behind them.
    pub fn pause(&self) {
        std::thread::sleep(self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::test_key;

    fn private_sem() -> NamedSemaphore {
        let name = test_key().name(KeyRole::Event);
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        NamedSemaphore::unlink(&name).unwrap();
        sem
    }

    #[test]
    fn probe_is_native_on_linux() {
        let support = TimedWaitSupport::probe();
        if cfg!(target_os = "linux") {
            assert_eq!(support, TimedWaitSupport::Native);
        } else {
            assert_eq!(support, TimedWaitSupport::Emulated);
        }
    }

    #[test]
    fn both_strategies_are_bounded() {
        for support in [TimedWaitSupport::probe(), TimedWaitSupport::Emulated] {
            let wait = BoundedWait::new(support, Duration::from_millis(15));
            let sem = private_sem();
            let start = Instant::now();
            assert!(!wait.wait(&sem));
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(10), "{:?}", elapsed);
            assert!(elapsed < Duration::from_secs(1), "{:?}", elapsed);
        }
    }

    #[test]
    fn wait_returns_early_on_post() {
        for support in [TimedWaitSupport::probe(), TimedWaitSupport::Emulated] {
            let wait = BoundedWait::new(support, Duration::from_secs(5));
            let sem = std::sync::Arc::new(private_sem());
            let poster = {
                let sem = sem.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    sem.post().unwrap();
                })
            };
            let start = Instant::now();
            assert!(wait.wait(&sem));
            assert!(start.elapsed() < Duration::from_secs(2));
            poster.join().unwrap();
        }
    }
}
