//! Segment limits, tunables and connection discovery.

use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::key::SegmentKey;

/// Largest video width a segment accepts.
pub const MAX_WIDTH: u32 = 4096;
/// Largest video height a segment accepts.
pub const MAX_HEIGHT: u32 = 2048;
/// Largest audio sample rate a segment accepts.
pub const MAX_SAMPLERATE: u32 = 192_000;
/// Largest audio channel count a segment accepts.
pub const MAX_CHANNELS: u32 = 8;

/// Fixed size of the audio buffer in bytes.
pub const AUDIO_BUFFER_SIZE: usize = 288_000;

/// Default cap on the total size of one segment.
pub const DEFAULT_MAX_BYTES: usize = 48_294_400;

/// Default number of slots per event ring (one of them is sacrificial).
pub const DEFAULT_RING_CAPACITY: u32 = 32;

/// Default bound on one wait step.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Default interval between peer liveness checks.
pub const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of wait steps `enqueue` spends on a full ring.
pub const DEFAULT_ENQUEUE_RETRIES: u32 = 100;

pub const ENV_MAX_BYTES: &str = "SHMIF_MAX_BYTES";
pub const ENV_WAIT_INTERVAL_MS: &str = "SHMIF_WAIT_INTERVAL_MS";
pub const ENV_GUARD_INTERVAL_MS: &str = "SHMIF_GUARD_INTERVAL_MS";
pub const ENV_ENQUEUE_RETRIES: &str = "SHMIF_ENQUEUE_RETRIES";
pub const ENV_RING_CAPACITY: &str = "SHMIF_RING_CAPACITY";
pub const ENV_SHMKEY: &str = "SHMIF_SHMKEY";
pub const ENV_SOCKIN_FD: &str = "SHMIF_SOCKIN_FD";

/// Tunables for segments created or acquired through one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Slots per event ring. Fixed for the lifetime of a segment.
    pub ring_capacity: u32,
    /// Upper bound on the total mapped size; larger resizes are rejected.
    pub max_bytes: usize,
    /// Bound on one blocking step before liveness is re-checked.
    pub wait_interval: Duration,
    /// How often the guard thread checks the peer process.
    pub guard_interval: Duration,
    /// Wait steps `enqueue` may spend on a full ring before giving up.
    pub enqueue_retries: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_bytes: DEFAULT_MAX_BYTES,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            guard_interval: DEFAULT_GUARD_INTERVAL,
            enqueue_retries: DEFAULT_ENQUEUE_RETRIES,
        }
    }
}

impl SegmentConfig {
    /// Defaults overridden by `SHMIF_*` environment variables.
    ///
    /// Unparseable or out-of-range values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, ENV_MAX_BYTES) {
            config.max_bytes = v.min(u32::MAX as usize);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_WAIT_INTERVAL_MS).filter(|ms| *ms > 0) {
            config.wait_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_GUARD_INTERVAL_MS).filter(|ms| *ms > 0) {
            config.guard_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, ENV_ENQUEUE_RETRIES) {
            config.enqueue_retries = n;
        }
        match parse_var::<u32>(&lookup, ENV_RING_CAPACITY) {
            Some(cap) if cap >= 2 => config.ring_capacity = cap,
            Some(cap) => {
                tracing::warn!(capacity = cap, "ring capacity below 2 ignored");
            }
            None => {}
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Everything a client needs to find and attach to its segment.
///
/// Produced by the server for the child it launches, or read back from the
/// environment in the child.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub key: SegmentKey,
    /// Client end of the segment's control channel.
    pub control: Option<OwnedFd>,
}

impl ConnectionInfo {
    pub fn new(key: SegmentKey, control: Option<OwnedFd>) -> Self {
        Self { key, control }
    }

    /// Read `SHMIF_SHMKEY` and `SHMIF_SOCKIN_FD` and remove them from the
    /// environment so processes spawned later do not inherit them.
    ///
    /// Returns `None` when no key was provided.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var(ENV_SHMKEY).ok();
        let fd = std::env::var(ENV_SOCKIN_FD).ok();
        std::env::remove_var(ENV_SHMKEY);
        std::env::remove_var(ENV_SOCKIN_FD);

        let key = match SegmentKey::parse(key?.trim()) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "malformed segment key in environment");
                return None;
            }
        };

        let control = fd
            .and_then(|s| s.trim().parse::<RawFd>().ok())
            .filter(|fd| *fd >= 0)
            // SAFETY: the launcher hands this descriptor to us and nothing
            // else in this process owns it.
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });

        Some(Self { key, control })
    }

    /// Environment pairs a launcher sets on the child so `from_env` finds the
    /// segment. Ownership of the control descriptor moves into the child's
    /// inherited table; the caller must clear `FD_CLOEXEC` on it before exec.
    pub fn export(self) -> Vec<(&'static str, String)> {
        let mut vars = vec![(ENV_SHMKEY, self.key.as_str().to_owned())];
        if let Some(fd) = self.control {
            vars.push((ENV_SOCKIN_FD, fd.into_raw_fd().to_string()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        assert_eq!(SegmentConfig::from_lookup(|_| None), SegmentConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = SegmentConfig::from_lookup(lookup(&[
            (ENV_MAX_BYTES, "1048576"),
            (ENV_WAIT_INTERVAL_MS, "3"),
            (ENV_GUARD_INTERVAL_MS, "250"),
            (ENV_ENQUEUE_RETRIES, "7"),
            (ENV_RING_CAPACITY, "8"),
        ]));
        assert_eq!(config.max_bytes, 1 << 20);
        assert_eq!(config.wait_interval, Duration::from_millis(3));
        assert_eq!(config.guard_interval, Duration::from_millis(250));
        assert_eq!(config.enqueue_retries, 7);
        assert_eq!(config.ring_capacity, 8);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let config = SegmentConfig::from_lookup(lookup(&[
            (ENV_MAX_BYTES, "lots"),
            (ENV_WAIT_INTERVAL_MS, "0"),
            (ENV_RING_CAPACITY, "1"),
        ]));
        assert_eq!(config, SegmentConfig::default());
    }

    #[test]
    fn max_bytes_is_capped_to_page_field() {
        let config = SegmentConfig::from_lookup(lookup(&[(ENV_MAX_BYTES, "99999999999")]));
        assert_eq!(config.max_bytes, u32::MAX as usize);
    }
}
