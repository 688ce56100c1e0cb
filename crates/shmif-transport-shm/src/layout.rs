//! Shared page layout.
//!
//! This module defines the `repr(C)` structures at the start of every
//! segment and computes where everything else lives.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  SegmentPage (64 bytes): magic, version, cookie, dms, ready flags,   │
//! │  geometry, segment_size, parent_pid, audio_used                      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  server → client ring                                                │
//! │    - RingHeader (192 bytes: front, back, capacity)                   │
//! │    - capacity × RawEvent (128 bytes each)                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  client → server ring (same shape)                                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  video buffer: width × height × 4, 64-byte aligned                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  audio buffer: AUDIO_BUFFER_SIZE bytes                               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every field has exactly one writer. The server writes the header fields
//! and geometry; `dms` may be cleared by either side; the ready flags are set
//! by the client and cleared by the server; each ring index is written only
//! by the side that owns it.

use std::sync::atomic::{AtomicU32, Ordering};

use shmif_core::{Geometry, RawEvent, EVENT_RECORD_SIZE};

use crate::config::{
    AUDIO_BUFFER_SIZE, MAX_CHANNELS, MAX_HEIGHT, MAX_SAMPLERATE, MAX_WIDTH,
};

/// Magic bytes identifying a segment.
pub const MAGIC: [u8; 8] = *b"SHMIF\0\0\0";

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Fingerprint of the structure sizes both sides compiled against.
pub const LAYOUT_COOKIE: u64 = {
    let mut c = 0xCBF2_9CE4_8422_2325u64;
    c = (c ^ core::mem::size_of::<SegmentPage>() as u64).wrapping_mul(0x100_0000_01B3);
    c = (c ^ core::mem::align_of::<SegmentPage>() as u64).wrapping_mul(0x100_0000_01B3);
    c = (c ^ core::mem::size_of::<RingHeader>() as u64).wrapping_mul(0x100_0000_01B3);
    c = (c ^ EVENT_RECORD_SIZE as u64).wrapping_mul(0x100_0000_01B3);
    c = (c ^ AUDIO_BUFFER_SIZE as u64).wrapping_mul(0x100_0000_01B3);
    (c ^ VERSION_MAJOR as u64).wrapping_mul(0x100_0000_01B3)
};

const ALIGN: usize = 64;

// =============================================================================
// Segment Page
// =============================================================================

/// Header at the start of every segment (64 bytes).
#[repr(C, align(64))]
pub struct SegmentPage {
    pub magic: [u8; 8],
    pub major: u16,
    pub minor: u16,
    pub _reserved: u32,
    pub cookie: u64,

    /// Dead-man switch: nonzero while the segment is usable.
    pub dms: AtomicU32,
    pub video_ready: AtomicU32,
    pub audio_ready: AtomicU32,

    pub width: AtomicU32,
    pub height: AtomicU32,
    pub samplerate: AtomicU32,
    pub channels: AtomicU32,

    /// Total bytes the server currently backs the object with.
    pub segment_size: AtomicU32,
    /// Pid of the server process.
    pub parent_pid: AtomicU32,
    /// Bytes of valid samples in the audio buffer.
    pub audio_used: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<SegmentPage>() == 64);

impl SegmentPage {
    /// Fill in a freshly created page. The segment starts alive.
    pub fn init(&mut self, geometry: Geometry, segment_size: u32, parent_pid: u32) {
        self.magic = MAGIC;
        self.major = VERSION_MAJOR;
        self.minor = VERSION_MINOR;
        self._reserved = 0;
        self.cookie = LAYOUT_COOKIE;
        self.video_ready = AtomicU32::new(0);
        self.audio_ready = AtomicU32::new(0);
        self.parent_pid = AtomicU32::new(parent_pid);
        self.audio_used = AtomicU32::new(0);
        self.publish_geometry(geometry, segment_size);
        self.dms = AtomicU32::new(1);
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.magic != MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.major != VERSION_MAJOR {
            return Err(LayoutError::IncompatibleVersion {
                expected: VERSION_MAJOR,
                found: self.major,
            });
        }
        if self.cookie != LAYOUT_COOKIE {
            return Err(LayoutError::CookieMismatch {
                expected: LAYOUT_COOKIE,
                found: self.cookie,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.dms.load(Ordering::Acquire) != 0
    }

    /// Pull the dead-man switch. Never set again once cleared.
    #[inline]
    pub fn release(&self) {
        self.dms.store(0, Ordering::Release);
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
            self.samplerate.load(Ordering::Acquire),
            self.channels.load(Ordering::Acquire),
        )
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size.load(Ordering::Acquire) as usize
    }

    /// Server side: make a confirmed geometry and backing size visible.
    pub fn publish_geometry(&self, geometry: Geometry, segment_size: u32) {
        self.width.store(geometry.width, Ordering::Release);
        self.height.store(geometry.height, Ordering::Release);
        self.samplerate.store(geometry.samplerate, Ordering::Release);
        self.channels.store(geometry.channels, Ordering::Release);
        self.segment_size.store(segment_size, Ordering::Release);
    }
}

// =============================================================================
// Ring Header
// =============================================================================

/// Occupancy of one direction's event queue (192 bytes).
///
/// `front` is written only by the consumer, `back` only by the producer.
/// Each sits on its own cache line.
#[repr(C, align(64))]
pub struct RingHeader {
    pub front: AtomicU32,
    _pad0: [u8; 60],
    pub back: AtomicU32,
    _pad1: [u8; 60],
    /// Advisory copy for the untrusted side. The server never reads it back.
    pub capacity: u32,
    _pad2: [u8; 60],
}

const _: () = assert!(core::mem::size_of::<RingHeader>() == 192);

impl RingHeader {
    pub fn new(capacity: u32) -> Self {
        Self {
            front: AtomicU32::new(0),
            _pad0: [0; 60],
            back: AtomicU32::new(0),
            _pad1: [0; 60],
            capacity,
            _pad2: [0; 60],
        }
    }
}

// =============================================================================
// Layout Calculations
// =============================================================================

/// Byte offsets of every region within one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub ring_capacity: u32,
    pub to_client_header: usize,
    pub to_client_events: usize,
    pub to_server_header: usize,
    pub to_server_events: usize,
    pub video: usize,
    pub video_len: usize,
    pub audio: usize,
    pub audio_len: usize,
    pub total: usize,
}

impl SegmentLayout {
    /// Offsets for a segment with the given ring capacity and geometry.
    pub fn compute(ring_capacity: u32, geometry: &Geometry) -> Result<Self, LayoutError> {
        if ring_capacity < 2 {
            return Err(LayoutError::InvalidConfig("ring capacity must be at least 2"));
        }
        let page = core::mem::size_of::<SegmentPage>();
        let ring_header = core::mem::size_of::<RingHeader>();
        let ring_events = (ring_capacity as usize)
            .checked_mul(core::mem::size_of::<RawEvent>())
            .ok_or(LayoutError::Overflow("ring events"))?;
        let video_len = geometry
            .video_bytes()
            .ok_or(LayoutError::Overflow("video buffer"))?;

        let to_client_header = page;
        let to_client_events = to_client_header + ring_header;
        let to_server_header = to_client_events
            .checked_add(ring_events)
            .map(align_up)
            .ok_or(LayoutError::Overflow("server ring"))?;
        let to_server_events = to_server_header + ring_header;
        let video = to_server_events
            .checked_add(ring_events)
            .map(align_up)
            .ok_or(LayoutError::Overflow("video offset"))?;
        let audio = video
            .checked_add(video_len)
            .map(align_up)
            .ok_or(LayoutError::Overflow("audio offset"))?;
        let total = audio
            .checked_add(AUDIO_BUFFER_SIZE)
            .ok_or(LayoutError::Overflow("total"))?;

        Ok(Self {
            ring_capacity,
            to_client_header,
            to_client_events,
            to_server_header,
            to_server_events,
            video,
            video_len,
            audio,
            audio_len: AUDIO_BUFFER_SIZE,
            total,
        })
    }
}

#[inline]
fn align_up(v: usize) -> usize {
    (v + ALIGN - 1) & !(ALIGN - 1)
}

/// Check a requested geometry against the hard platform limits.
pub fn check_geometry(geometry: &Geometry) -> Result<(), LayoutError> {
    let ok = (1..=MAX_WIDTH).contains(&geometry.width)
        && (1..=MAX_HEIGHT).contains(&geometry.height)
        && geometry.samplerate <= MAX_SAMPLERATE
        && geometry.channels <= MAX_CHANNELS;
    if ok {
        Ok(())
    } else {
        Err(LayoutError::GeometryOutOfBounds(*geometry))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    InvalidMagic,
    IncompatibleVersion { expected: u16, found: u16 },
    /// Both sides agree on the version but not on structure sizes.
    CookieMismatch { expected: u64, found: u64 },
    SegmentTooSmall { required: usize, found: usize },
    InvalidConfig(&'static str),
    GeometryOutOfBounds(Geometry),
    Overflow(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::IncompatibleVersion { expected, found } => {
                write!(f, "incompatible version: expected {}.x, found {}.x", expected, found)
            }
            Self::CookieMismatch { expected, found } => {
                write!(f, "layout cookie mismatch: expected {:#x}, found {:#x}", expected, found)
            }
            Self::SegmentTooSmall { required, found } => {
                write!(f, "segment too small: need {} bytes, got {}", required, found)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::GeometryOutOfBounds(g) => write!(
                f,
                "geometry out of bounds: {}x{} @ {} Hz x{}",
                g.width, g.height, g.samplerate, g.channels
            ),
            Self::Overflow(what) => write!(f, "segment size overflow ({})", what),
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(core::mem::size_of::<SegmentPage>(), 64);
        assert_eq!(core::mem::size_of::<RingHeader>(), 192);
    }

    #[test]
    fn default_layout_offsets() {
        let layout = SegmentLayout::compute(32, &Geometry::default()).unwrap();
        assert_eq!(layout.to_client_header, 64);
        assert_eq!(layout.to_client_events, 64 + 192);
        // 256 + 32 * 128 = 4352, already aligned.
        assert_eq!(layout.to_server_header, 4352);
        assert_eq!(layout.to_server_events, 4352 + 192);
        assert_eq!(layout.video, 4544 + 4096);
        assert_eq!(layout.video_len, 32 * 32 * 4);
        assert_eq!(layout.audio, layout.video + 4096);
        assert_eq!(layout.total, layout.audio + AUDIO_BUFFER_SIZE);
        assert_eq!(layout.video % 64, 0);
        assert_eq!(layout.audio % 64, 0);
    }

    #[test]
    fn odd_capacity_is_fine() {
        let layout = SegmentLayout::compute(7, &Geometry::new(3, 3, 0, 0)).unwrap();
        assert_eq!(layout.to_server_header % 64, 0);
        assert_eq!(layout.audio % 64, 0);
        assert!(SegmentLayout::compute(1, &Geometry::default()).is_err());
    }

    #[test]
    fn geometry_limits() {
        assert!(check_geometry(&Geometry::new(MAX_WIDTH, MAX_HEIGHT, MAX_SAMPLERATE, MAX_CHANNELS)).is_ok());
        assert!(check_geometry(&Geometry::new(MAX_WIDTH + 1, 10, 44_100, 2)).is_err());
        assert!(check_geometry(&Geometry::new(10, MAX_HEIGHT + 1, 44_100, 2)).is_err());
        assert!(check_geometry(&Geometry::new(0, 10, 44_100, 2)).is_err());
        assert!(check_geometry(&Geometry::new(10, 10, MAX_SAMPLERATE + 1, 2)).is_err());
        assert!(check_geometry(&Geometry::new(10, 10, 44_100, MAX_CHANNELS + 1)).is_err());
    }

    #[test]
    fn page_validation() {
        // SAFETY: an all-zero page is a valid bit pattern for every field.
        let mut page = unsafe { std::mem::zeroed::<SegmentPage>() };
        assert_eq!(page.validate(), Err(LayoutError::InvalidMagic));

        page.init(Geometry::default(), 4096, 42);
        assert!(page.validate().is_ok());
        assert!(page.is_alive());
        assert_eq!(page.geometry(), Geometry::default());
        assert_eq!(page.parent_pid.load(Ordering::Relaxed), 42);

        page.cookie ^= 1;
        assert!(matches!(page.validate(), Err(LayoutError::CookieMismatch { .. })));
        page.cookie ^= 1;
        page.major += 1;
        assert!(matches!(page.validate(), Err(LayoutError::IncompatibleVersion { .. })));

        page.release();
        assert!(!page.is_alive());
    }
}
