//! Named POSIX semaphores and the per-segment triad.
//!
//! Each segment has three counting semaphores: video, audio and event. They
//! carry no meaning beyond their count; the only operations are post,
//! wait and try-wait. Being named is what lets an unrelated process attach.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;

use crate::key::{KeyRole, SegmentKey};

/// A handle to one named semaphore.
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: POSIX semaphore operations are thread-safe.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore that must not already exist.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated; mode and value are passed as
        // the promoted integer types sem_open's varargs expect.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o700 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::wrap(sem, name)
    }

    /// Attach to an existing semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        Self::wrap(sem, name)
    }

    fn wrap(sem: *mut libc::sem_t, name: &str) -> io::Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        let sem = NonNull::new(sem).ok_or_else(|| io::Error::other("sem_open returned null"))?;
        Ok(Self {
            sem,
            name: name.to_owned(),
        })
    }

    /// Remove a name. A missing name is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release one unit. Never blocks.
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: self.sem is an open semaphore.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Acquire one unit if available. Returns whether one was taken.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            // SAFETY: self.sem is an open semaphore.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Acquire one unit, blocking for at most `timeout`.
    ///
    /// Returns `Ok(false)` on timeout. Platforms without `sem_timedwait`
    /// report `Unsupported`.
    #[cfg(target_os = "linux")]
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            // SAFETY: self.sem is an open semaphore; deadline is a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn timed_wait(&self, _timeout: Duration) -> io::Result<bool> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is an open semaphore, closed exactly once.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } < 0 {
            tracing::warn!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "sem_close failed"
            );
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore").field("name", &self.name).finish()
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into `now`.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

/// Which semaphore of the triad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriadRole {
    Video,
    Audio,
    Event,
}

impl TriadRole {
    pub const ALL: [TriadRole; 3] = [Self::Video, Self::Audio, Self::Event];

    fn key_role(self) -> KeyRole {
        match self {
            Self::Video => KeyRole::Video,
            Self::Audio => KeyRole::Audio,
            Self::Event => KeyRole::Event,
        }
    }

    /// Count a freshly created semaphore starts with.
    fn initial(self) -> u32 {
        match self {
            Self::Video | Self::Audio => 0,
            Self::Event => 1,
        }
    }
}

/// The video, audio and event semaphores of one segment.
#[derive(Debug)]
pub struct SemaphoreTriad {
    pub video: NamedSemaphore,
    pub audio: NamedSemaphore,
    pub event: NamedSemaphore,
}

impl SemaphoreTriad {
    /// Create all three. On partial failure the ones already created are
    /// unlinked again.
    pub fn create(key: &SegmentKey) -> io::Result<Self> {
        let mut made = Vec::with_capacity(3);
        for role in TriadRole::ALL {
            let name = key.name(role.key_role());
            match NamedSemaphore::create(&name, role.initial()) {
                Ok(sem) => made.push(sem),
                Err(e) => {
                    for sem in &made {
                        let _ = NamedSemaphore::unlink(sem.name());
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_vec(made))
    }

    /// Attach to the three semaphores of an existing segment.
    pub fn open(key: &SegmentKey) -> io::Result<Self> {
        let mut opened = Vec::with_capacity(3);
        for role in TriadRole::ALL {
            opened.push(NamedSemaphore::open(&key.name(role.key_role()))?);
        }
        Ok(Self::from_vec(opened))
    }

    fn from_vec(mut sems: Vec<NamedSemaphore>) -> Self {
        let event = sems.remove(2);
        let audio = sems.remove(1);
        let video = sems.remove(0);
        Self { video, audio, event }
    }

    /// Remove all three names. Open handles keep working.
    pub fn unlink(key: &SegmentKey) -> io::Result<()> {
        let mut first_err = None;
        for role in TriadRole::ALL {
            if let Err(e) = NamedSemaphore::unlink(&key.name(role.key_role())) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn get(&self, role: TriadRole) -> &NamedSemaphore {
        match role {
            TriadRole::Video => &self.video,
            TriadRole::Audio => &self.audio,
            TriadRole::Event => &self.event,
        }
    }

    /// Wake anything blocked on any of the three.
    pub fn post_all(&self) {
        for role in TriadRole::ALL {
            if let Err(e) = self.get(role).post() {
                tracing::warn!(name = %self.get(role).name(), error = %e, "sem_post failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::test_key;

    #[test]
    fn triad_initial_counts() {
        let key = test_key();
        let triad = SemaphoreTriad::create(&key).unwrap();
        assert!(!triad.video.try_wait().unwrap());
        assert!(!triad.audio.try_wait().unwrap());
        assert!(triad.event.try_wait().unwrap());
        assert!(!triad.event.try_wait().unwrap());
        SemaphoreTriad::unlink(&key).unwrap();
    }

    #[test]
    fn second_handle_sees_posts() {
        let key = test_key();
        let server = SemaphoreTriad::create(&key).unwrap();
        let client = SemaphoreTriad::open(&key).unwrap();
        SemaphoreTriad::unlink(&key).unwrap();

        server.video.post().unwrap();
        assert!(client.video.try_wait().unwrap());
        assert!(!client.video.try_wait().unwrap());

        client.post_all();
        assert!(server.audio.try_wait().unwrap());
    }

    #[test]
    fn exclusive_create_and_missing_unlink() {
        let key = test_key();
        let _triad = SemaphoreTriad::create(&key).unwrap();
        assert!(SemaphoreTriad::create(&key).is_err());
        SemaphoreTriad::unlink(&key).unwrap();
        SemaphoreTriad::unlink(&key).unwrap();
        assert!(SemaphoreTriad::open(&key).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timed_wait_times_out() {
        let key = test_key();
        let triad = SemaphoreTriad::create(&key).unwrap();
        SemaphoreTriad::unlink(&key).unwrap();
        let start = std::time::Instant::now();
        assert!(!triad.video.timed_wait(Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
