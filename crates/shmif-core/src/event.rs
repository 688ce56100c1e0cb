//! The fixed-size wire record and the tagged event it decodes into.

use bitflags::bitflags;

use crate::error::DecodeError;
use crate::external::ExternalEvent;
use crate::io::IoEvent;
use crate::target::TargetEvent;

/// Size of one wire record in bytes.
pub const EVENT_RECORD_SIZE: usize = 128;

/// Size of the payload area of a wire record.
pub const PAYLOAD_SIZE: usize = 120;

/// One event as it sits in a ring slot.
///
/// The layout is part of the protocol: both processes read and write these
/// records in place, so every field is a plain fixed-width integer or byte
/// array and the size is checked at compile time.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawEvent {
    /// One of the [`Category`] bit values.
    pub category: u16,
    /// Zero on write, ignored on read.
    pub reserved: u16,
    /// Kind within the category namespace.
    pub kind: u32,
    /// Kind-specific payload.
    pub payload: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(core::mem::size_of::<RawEvent>() == EVENT_RECORD_SIZE);

impl RawEvent {
    /// An all-zero record.
    pub const fn zeroed() -> Self {
        Self {
            category: 0,
            reserved: 0,
            kind: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }

    pub(crate) fn new(category: Category, kind: u32) -> Self {
        Self {
            category: category as u16,
            kind,
            ..Self::zeroed()
        }
    }

    /// The category, if the discriminant is a known one.
    pub fn category(&self) -> Option<Category> {
        Category::from_u16(self.category)
    }

    pub(crate) fn writer(&mut self) -> PayloadWriter<'_> {
        PayloadWriter(&mut self.payload)
    }

    pub(crate) fn reader(&self) -> PayloadReader<'_> {
        PayloadReader(&self.payload)
    }
}

impl Default for RawEvent {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for RawEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEvent")
            .field("category", &self.category)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Event category discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Category {
    System = 1,
    Io = 2,
    Timer = 4,
    Video = 8,
    Audio = 16,
    /// Server to client control.
    Target = 32,
    Frameserver = 64,
    /// Client to server notification.
    External = 128,
    Net = 256,
}

impl Category {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::System),
            2 => Some(Self::Io),
            4 => Some(Self::Timer),
            8 => Some(Self::Video),
            16 => Some(Self::Audio),
            32 => Some(Self::Target),
            64 => Some(Self::Frameserver),
            128 => Some(Self::External),
            256 => Some(Self::Net),
            _ => None,
        }
    }

    /// The mask bit for this category.
    pub fn mask(self) -> CategoryMask {
        CategoryMask::from_bits_truncate(self as u16)
    }
}

bitflags! {
    /// Set of categories a consumer is willing to accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CategoryMask: u16 {
        const SYSTEM      = 1;
        const IO          = 2;
        const TIMER       = 4;
        const VIDEO       = 8;
        const AUDIO       = 16;
        const TARGET      = 32;
        const FRAMESERVER = 64;
        const EXTERNAL    = 128;
        const NET         = 256;
    }
}

/// A decoded event, tagged by category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Io(IoEvent),
    Target(TargetEvent),
    External(ExternalEvent),
}

impl Event {
    /// Interpret a wire record.
    pub fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let category = raw
            .category()
            .ok_or(DecodeError::UnknownCategory(raw.category))?;
        match category {
            Category::Io => IoEvent::decode(raw).map(Self::Io),
            Category::Target => TargetEvent::decode(raw).map(Self::Target),
            Category::External => ExternalEvent::decode(raw).map(Self::External),
            Category::System
            | Category::Timer
            | Category::Video
            | Category::Audio
            | Category::Frameserver
            | Category::Net => Err(DecodeError::UnsupportedCategory(category)),
        }
    }

    /// Produce the wire record for this event.
    pub fn encode(&self) -> RawEvent {
        match self {
            Self::Io(ev) => ev.encode(),
            Self::Target(ev) => ev.encode(),
            Self::External(ev) => ev.encode(),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Io(_) => Category::Io,
            Self::Target(_) => Category::Target,
            Self::External(_) => Category::External,
        }
    }

    /// Whether this event travels together with an OS-level descriptor.
    pub fn carries_descriptor(&self) -> bool {
        match self {
            Self::Target(ev) => ev.handle().is_some(),
            Self::Io(_) | Self::External(_) => false,
        }
    }
}

impl From<TargetEvent> for Event {
    fn from(ev: TargetEvent) -> Self {
        Self::Target(ev)
    }
}

impl From<ExternalEvent> for Event {
    fn from(ev: ExternalEvent) -> Self {
        Self::External(ev)
    }
}

impl From<IoEvent> for Event {
    fn from(ev: IoEvent) -> Self {
        Self::Io(ev)
    }
}

/// Typed writes into a payload at fixed offsets.
///
/// Offsets are compile-time constants of each kind's layout, so an
/// out-of-range offset is a bug in this crate rather than peer input.
pub(crate) struct PayloadWriter<'a>(&'a mut [u8; PAYLOAD_SIZE]);

impl PayloadWriter<'_> {
    pub(crate) fn bytes(&mut self, at: usize, v: &[u8]) -> &mut Self {
        self.0[at..at + v.len()].copy_from_slice(v);
        self
    }

    pub(crate) fn u8(&mut self, at: usize, v: u8) -> &mut Self {
        self.0[at] = v;
        self
    }

    pub(crate) fn u16(&mut self, at: usize, v: u16) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }

    pub(crate) fn i16(&mut self, at: usize, v: i16) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }

    pub(crate) fn u32(&mut self, at: usize, v: u32) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }

    pub(crate) fn i32(&mut self, at: usize, v: i32) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }

    pub(crate) fn u64(&mut self, at: usize, v: u64) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }

    pub(crate) fn f32(&mut self, at: usize, v: f32) -> &mut Self {
        self.bytes(at, &v.to_ne_bytes())
    }
}

/// Typed reads out of a payload at fixed offsets.
pub(crate) struct PayloadReader<'a>(&'a [u8; PAYLOAD_SIZE]);

impl PayloadReader<'_> {
    pub(crate) fn array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.0[at..at + N]);
        out
    }

    pub(crate) fn u8(&self, at: usize) -> u8 {
        self.0[at]
    }

    pub(crate) fn bool(&self, at: usize) -> bool {
        self.0[at] != 0
    }

    pub(crate) fn u16(&self, at: usize) -> u16 {
        u16::from_ne_bytes(self.array(at))
    }

    pub(crate) fn i16(&self, at: usize) -> i16 {
        i16::from_ne_bytes(self.array(at))
    }

    pub(crate) fn u32(&self, at: usize) -> u32 {
        u32::from_ne_bytes(self.array(at))
    }

    pub(crate) fn i32(&self, at: usize) -> i32 {
        i32::from_ne_bytes(self.array(at))
    }

    pub(crate) fn u64(&self, at: usize) -> u64 {
        u64::from_ne_bytes(self.array(at))
    }

    pub(crate) fn f32(&self, at: usize) -> f32 {
        f32::from_ne_bytes(self.array(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExternalEvent, Geometry, NegotiationId, TargetEvent};

    #[test]
    fn unknown_category_is_rejected() {
        let mut raw = RawEvent::zeroed();
        raw.category = 3;
        assert_eq!(Event::decode(&raw), Err(DecodeError::UnknownCategory(3)));
    }

    #[test]
    fn engine_internal_categories_are_unsupported() {
        let mut raw = RawEvent::zeroed();
        raw.category = Category::Timer as u16;
        assert_eq!(
            Event::decode(&raw),
            Err(DecodeError::UnsupportedCategory(Category::Timer))
        );
    }

    #[test]
    fn category_matches_encoded_discriminant() {
        let ev: Event = ExternalEvent::Resize {
            negotiation: NegotiationId(7),
            geometry: Geometry::new(640, 480, 48_000, 2),
        }
        .into();
        let raw = ev.encode();
        assert_eq!(raw.category(), Some(Category::External));
        assert_eq!(Event::decode(&raw), Ok(ev));
    }

    #[test]
    fn mask_bits_match_category_values() {
        assert_eq!(Category::Target.mask(), CategoryMask::TARGET);
        assert_eq!(Category::Net.mask().bits(), 256);
        let accepted = CategoryMask::IO | CategoryMask::EXTERNAL;
        assert!(accepted.contains(Category::External.mask()));
        assert!(!accepted.contains(Category::Target.mask()));
        assert!(!Event::from(TargetEvent::Exit).carries_descriptor());
    }
}
