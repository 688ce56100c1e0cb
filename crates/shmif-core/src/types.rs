//! Small value types carried inside event payloads.

use std::fmt;

/// NUL-padded fixed-capacity text field.
///
/// Text that does not fit is cut at the last UTF-8 boundary that does, so a
/// too-long message degrades instead of failing the whole event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

/// The 78-byte message field used by target and external events.
pub type Message = FixedStr<78>;

/// The 64-byte title field used by registration.
pub type Title = FixedStr<64>;

impl<const N: usize> FixedStr<N> {
    /// Capacity in bytes.
    pub const CAPACITY: usize = N;

    /// An empty field.
    pub const fn empty() -> Self {
        Self { bytes: [0; N] }
    }

    /// Build from a string, truncating at a character boundary.
    pub fn truncated(s: &str) -> Self {
        let mut end = s.len().min(N);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; N];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self { bytes }
    }

    /// Wrap raw bytes read off the wire.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Raw bytes, including NUL padding.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Length up to the first NUL.
    pub fn len(&self) -> usize {
        self.bytes.iter().position(|b| *b == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content as text. Invalid UTF-8 from a peer is replaced, not trusted.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes[..self.len()]).into_owned()
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> From<&str> for FixedStr<N> {
    fn from(s: &str) -> Self {
        Self::truncated(s)
    }
}

/// Identifier matching a resize acknowledgement to its request.
///
/// Several negotiations can be in flight for different subsystems, so the
/// requester picks the id and the acknowledger echoes it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NegotiationId(pub u32);

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "neg#{}", self.0)
    }
}

/// Buffer geometry of a segment: video dimensions plus audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub samplerate: u32,
    pub channels: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32, samplerate: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            samplerate,
            channels,
        }
    }

    /// Same audio format, different video dimensions.
    pub const fn with_size(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self
        }
    }

    /// Bytes needed for one RGBA video frame at this geometry.
    pub fn video_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(32, 32, 44_100, 2)
    }
}

/// What a segment is used for.
///
/// Primarily a hint to the server for scheduling and policy; it also picks
/// what a subsegment request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SegmentKind {
    Lwa = 0,
    NetworkServer = 1,
    NetworkClient = 2,
    Media = 3,
    Terminal = 4,
    Remoting = 5,
    Encoder = 6,
    Sensor = 7,
    Titlebar = 8,
    Cursor = 9,
    InputDevice = 10,
    Game = 11,
    Application = 12,
    Browser = 13,
    Vm = 14,
    HmdSbs = 15,
    HmdL = 16,
    HmdR = 17,
    Icon = 18,
    Debug = 19,
    Unknown = 20,
}

impl SegmentKind {
    /// Convert from the wire value. Anything out of range is `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Lwa,
            1 => Self::NetworkServer,
            2 => Self::NetworkClient,
            3 => Self::Media,
            4 => Self::Terminal,
            5 => Self::Remoting,
            6 => Self::Encoder,
            7 => Self::Sensor,
            8 => Self::Titlebar,
            9 => Self::Cursor,
            10 => Self::InputDevice,
            11 => Self::Game,
            12 => Self::Application,
            13 => Self::Browser,
            14 => Self::Vm,
            15 => Self::HmdSbs,
            16 => Self::HmdL,
            17 => Self::HmdR,
            18 => Self::Icon,
            19 => Self::Debug,
            _ => Self::Unknown,
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_truncates_on_char_boundary() {
        // 'é' is two bytes; 39 of them is 78 bytes, one more must be cut whole.
        let s = "é".repeat(40);
        let m = Message::truncated(&s);
        assert_eq!(m.len(), 78);
        assert_eq!(m.to_string_lossy(), "é".repeat(39));

        let t = Title::truncated("abc");
        assert_eq!(t.len(), 3);
        assert_eq!(t.to_string_lossy(), "abc");
    }

    #[test]
    fn fixed_str_without_nul_uses_full_capacity() {
        let f = FixedStr::<4>::from_bytes(*b"abcd");
        assert_eq!(f.len(), 4);
        assert_eq!(f.to_string_lossy(), "abcd");
    }

    #[test]
    fn segment_kind_out_of_range_is_unknown() {
        assert_eq!(SegmentKind::from_u32(9), SegmentKind::Cursor);
        assert_eq!(SegmentKind::from_u32(20), SegmentKind::Unknown);
        assert_eq!(SegmentKind::from_u32(u32::MAX), SegmentKind::Unknown);
    }

    #[test]
    fn video_bytes_overflow_is_none() {
        assert_eq!(Geometry::new(640, 480, 44_100, 2).video_bytes(), Some(640 * 480 * 4));
        if usize::BITS == 32 {
            assert_eq!(Geometry::new(u32::MAX, u32::MAX, 0, 0).video_bytes(), None);
        }
    }
}
