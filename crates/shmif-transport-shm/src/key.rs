//! Lookup keys naming a segment's shared memory object and semaphores.
//!
//! A key is a base name such as `/shmif_412_87`. The shared memory object
//! appends `m`; the semaphores append `v`, `a` and `e`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest base name accepted. Leaves room for the suffix within the
/// portable limit for POSIX named objects.
pub const MAX_KEY_LEN: usize = 30;

const PREFIX: &str = "/shmif_";

/// What a derived name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Memory,
    Video,
    Audio,
    Event,
}

impl KeyRole {
    fn suffix(self) -> char {
        match self {
            Self::Memory => 'm',
            Self::Video => 'v',
            Self::Audio => 'a',
            Self::Event => 'e',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    Empty,
    MissingSlash,
    TooLong(usize),
    InvalidChar(char),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty segment key"),
            Self::MissingSlash => write!(f, "segment key must start with '/'"),
            Self::TooLong(len) => write!(f, "segment key too long: {} > {}", len, MAX_KEY_LEN),
            Self::InvalidChar(c) => write!(f, "invalid character {:?} in segment key", c),
        }
    }
}

impl std::error::Error for KeyError {}

/// Base name of one segment's named objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey(String);

impl SegmentKey {
    /// A fresh key derived from the process id and a random component.
    ///
    /// Collisions are possible; creators retry on `EEXIST`.
    pub fn generate() -> Self {
        let pid = std::process::id();
        Self(format!("{}{}_{}", PREFIX, pid % 1000, entropy() % 1000))
    }

    /// Validate a key received from a peer or the environment.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        if !s.starts_with('/') {
            return Err(KeyError::MissingSlash);
        }
        if s.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong(s.len()));
        }
        if let Some(c) = s[1..]
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(KeyError::InvalidChar(c));
        }
        Ok(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the object playing `role` for this segment.
    pub fn name(&self, role: KeyRole) -> String {
        let mut name = String::with_capacity(self.0.len() + 1);
        name.push_str(&self.0);
        name.push(role.suffix());
        name
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key with a wider random component, so parallel tests creating objects
/// without the create-retry loop do not collide.
#[cfg(test)]
pub(crate) fn test_key() -> SegmentKey {
    SegmentKey(format!("/shmif_t{}_{}", std::process::id() % 100_000, entropy() % 1_000_000))
}

/// Mix the clock, the pid and a process-wide counter through splitmix64.
fn entropy() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut z = nanos ^ ((std::process::id() as u64) << 32) ^ count.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_parse() {
        for _ in 0..32 {
            let key = SegmentKey::generate();
            assert!(key.as_str().starts_with(PREFIX));
            assert_eq!(SegmentKey::parse(key.as_str()), Ok(key));
        }
    }

    #[test]
    fn derived_names_use_role_suffix() {
        let key = SegmentKey::parse("/shmif_1_2").unwrap();
        assert_eq!(key.name(KeyRole::Memory), "/shmif_1_2m");
        assert_eq!(key.name(KeyRole::Video), "/shmif_1_2v");
        assert_eq!(key.name(KeyRole::Audio), "/shmif_1_2a");
        assert_eq!(key.name(KeyRole::Event), "/shmif_1_2e");
    }

    #[test]
    fn hostile_keys_are_rejected() {
        assert_eq!(SegmentKey::parse(""), Err(KeyError::Empty));
        assert_eq!(SegmentKey::parse("shmif"), Err(KeyError::MissingSlash));
        assert_eq!(SegmentKey::parse("/a/../b"), Err(KeyError::InvalidChar('/')));
        assert!(matches!(
            SegmentKey::parse(&format!("/{}", "x".repeat(40))),
            Err(KeyError::TooLong(_))
        ));
    }
}
