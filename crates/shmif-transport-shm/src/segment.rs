//! Machinery shared by both ends of a segment.
//!
//! A [`SegmentCore`] owns one mapping plus its semaphores and knows which
//! side of the segment it is on. That decides which ring it produces into,
//! which it consumes from, and how far it believes indices the peer wrote.
//! The server and client endpoints wrap a core and add their half of the
//! protocol.

use std::fmt;
use std::io;
use std::sync::Arc;

use shmif_core::{Category, CategoryMask, DecodeError, Event, Geometry, RawEvent};

use crate::key::{KeyError, SegmentKey};
use crate::layout::{LayoutError, RingHeader, SegmentLayout, SegmentPage};
use crate::lifecycle::{DeathCause, Lifecycle, LifecycleError, SegmentState};
use crate::liveness::Guard;
use crate::mapping::ShmMapping;
use crate::ring::{EventRing, RingError, RingStatus, Trust};
use crate::sem::SemaphoreTriad;
use crate::wait::BoundedWait;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by segment operations.
///
/// `Dead` is the end-of-stream result: once a segment has reported it,
/// every further operation reports it again with the same cause.
#[derive(Debug)]
pub enum SegmentError {
    Io(io::Error),
    Layout(LayoutError),
    Ring(RingError),
    Lifecycle(LifecycleError),
    Key(KeyError),
    Decode(DecodeError),
    /// The segment is gone.
    Dead(DeathCause),
    /// The operation needs an active segment.
    NotActive(SegmentState),
    /// This side may not produce events of that category.
    WrongCategory(Category),
    /// A descriptor-carrying event with an attached slot must go through
    /// the descriptor path.
    DescriptorRequired,
    /// Only descriptor-carrying kinds can have a descriptor attached.
    NotDescriptorCarrying,
    /// The segment was set up without a control channel.
    NoControlChannel,
    /// Every generated key was already taken.
    KeyExhausted,
    /// The event is not one this operation accepts.
    UnexpectedEvent,
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::Ring(e) => write!(f, "ring error: {}", e),
            Self::Lifecycle(e) => write!(f, "lifecycle error: {}", e),
            Self::Key(e) => write!(f, "key error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Dead(cause) => write!(f, "segment dead: {}", cause),
            Self::NotActive(state) => write!(f, "segment not active ({})", state),
            Self::WrongCategory(c) => write!(f, "category {:?} not allowed from this side", c),
            Self::DescriptorRequired => write!(f, "attached descriptor slot needs a descriptor"),
            Self::NotDescriptorCarrying => write!(f, "event kind does not carry a descriptor"),
            Self::NoControlChannel => write!(f, "segment has no control channel"),
            Self::KeyExhausted => write!(f, "could not find a free segment key"),
            Self::UnexpectedEvent => write!(f, "unexpected event"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Ring(e) => Some(e),
            Self::Lifecycle(e) => Some(e),
            Self::Key(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SegmentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LayoutError> for SegmentError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<RingError> for SegmentError {
    fn from(e: RingError) -> Self {
        Self::Ring(e)
    }
}

impl From<LifecycleError> for SegmentError {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<KeyError> for SegmentError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<DecodeError> for SegmentError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl SegmentError {
    /// Whether this is the end-of-stream result.
    #[inline]
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead(_))
    }

    /// Whether the producer ran out of ring space.
    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Ring(RingError::Full))
    }
}

// =============================================================================
// Core
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Server,
    Client,
}

impl Side {
    fn trust(self) -> Trust {
        match self {
            Self::Server => Trust::Trusted,
            Self::Client => Trust::Untrusted,
        }
    }

    /// Categories this side may enqueue.
    pub(crate) fn produces(self) -> CategoryMask {
        match self {
            Self::Server => CategoryMask::TARGET | CategoryMask::IO,
            Self::Client => CategoryMask::EXTERNAL | CategoryMask::IO,
        }
    }

    /// Categories this side accepts from its peer.
    pub(crate) fn accepts(self) -> CategoryMask {
        match self {
            Self::Server => Self::Client.produces(),
            Self::Client => Self::Server.produces(),
        }
    }
}

pub(crate) struct SegmentCore {
    pub(crate) key: SegmentKey,
    pub(crate) mapping: ShmMapping,
    pub(crate) layout: SegmentLayout,
    pub(crate) geometry: Geometry,
    pub(crate) triad: Arc<SemaphoreTriad>,
    pub(crate) wait: BoundedWait,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) guard: Option<Guard>,
    side: Side,
    out_back: u32,
    in_front: u32,
    enqueue_retries: u32,
}

impl SegmentCore {
    /// Wrap a mapping whose page and ring headers are initialized and whose
    /// length covers `layout`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        side: Side,
        key: SegmentKey,
        mapping: ShmMapping,
        layout: SegmentLayout,
        geometry: Geometry,
        triad: Arc<SemaphoreTriad>,
        wait: BoundedWait,
        enqueue_retries: u32,
    ) -> Self {
        let mut core = Self {
            key,
            mapping,
            layout,
            geometry,
            triad,
            wait,
            lifecycle: Lifecycle::new(),
            guard: None,
            side,
            out_back: 0,
            in_front: 0,
            enqueue_retries,
        };
        // A client may attach to a ring that already carried traffic (a
        // migration target, or a re-acquire); start from what is published.
        if side == Side::Client {
            core.out_back = core.outgoing().published_back();
            core.in_front = core.incoming().published_front();
        }
        core
    }

    #[inline]
    pub(crate) fn page(&self) -> &SegmentPage {
        // SAFETY: every mapping handed to `new` is at least one page long,
        // starts with an initialized SegmentPage and stays mapped while the
        // core lives. Remaps keep the page at offset 0.
        unsafe { &*(self.mapping.as_ptr() as *const SegmentPage) }
    }

    fn ring(&self, header: usize, events: usize) -> EventRing {
        let base = self.mapping.as_ptr();
        // SAFETY: both offsets come from the adopted layout, which lies
        // within the mapping; the header was initialized by the server.
        unsafe {
            EventRing::from_raw(
                base.add(header) as *mut RingHeader,
                base.add(events) as *mut RawEvent,
                self.layout.ring_capacity,
                self.side.trust(),
            )
        }
    }

    /// The ring this side produces into.
    pub(crate) fn outgoing(&self) -> EventRing {
        match self.side {
            Side::Server => self.ring(self.layout.to_client_header, self.layout.to_client_events),
            Side::Client => self.ring(self.layout.to_server_header, self.layout.to_server_events),
        }
    }

    /// The ring this side consumes from.
    pub(crate) fn incoming(&self) -> EventRing {
        match self.side {
            Side::Server => self.ring(self.layout.to_server_header, self.layout.to_server_events),
            Side::Client => self.ring(self.layout.to_client_header, self.layout.to_client_events),
        }
    }

    pub(crate) fn ring_status(&self) -> (RingStatus, RingStatus) {
        (self.outgoing().status(), self.incoming().status())
    }

    #[inline]
    pub(crate) fn state(&self) -> SegmentState {
        self.lifecycle.state()
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.lifecycle.is_dead()
            && self.page().is_alive()
            && self.guard.as_ref().map_or(true, Guard::is_alive)
    }

    /// `Ok` while the segment is usable. Otherwise the segment is moved to
    /// `Dead` (if it was not already) and the end-of-stream result returned.
    pub(crate) fn ensure_alive(&mut self) -> Result<(), SegmentError> {
        if let SegmentState::Dead(cause) = self.state() {
            return Err(SegmentError::Dead(cause));
        }
        let guard_dead = self.guard.as_ref().is_some_and(|g| !g.is_alive());
        if !self.page().is_alive() || guard_dead {
            tracing::debug!(key = %self.key, guard_dead, "peer gone");
            self.kill(DeathCause::PeerGone);
            return Err(SegmentError::Dead(DeathCause::PeerGone));
        }
        Ok(())
    }

    /// Pull the dead-man switch, wake every waiter and go `Dead`.
    pub(crate) fn kill(&mut self, cause: DeathCause) {
        if self.lifecycle.is_dead() {
            return;
        }
        self.page().release();
        self.triad.post_all();
        self.lifecycle.kill(cause);
    }

    fn ring_failure(&mut self, err: RingError) -> SegmentError {
        match err {
            RingError::Full => SegmentError::Ring(err),
            RingError::IndexOutOfBounds { index, capacity } => {
                tracing::warn!(key = %self.key, index, capacity, "peer wrote an out-of-range ring index");
                self.kill(DeathCause::ProtocolViolation);
                SegmentError::Dead(DeathCause::ProtocolViolation)
            }
        }
    }

    /// Reject events this side is not allowed to produce.
    pub(crate) fn check_outgoing(&self, event: &Event) -> Result<(), SegmentError> {
        let category = event.category();
        if !self.side.produces().contains(category.mask()) {
            return Err(SegmentError::WrongCategory(category));
        }
        Ok(())
    }

    /// Enqueue without waiting. Returns the free slots left.
    pub(crate) fn try_push(&mut self, raw: &RawEvent) -> Result<u32, SegmentError> {
        self.ensure_alive()?;
        let ring = self.outgoing();
        match ring.try_push(&mut self.out_back, raw) {
            Ok(free) => Ok(free),
            Err(e) => Err(self.ring_failure(e)),
        }
    }

    /// Enqueue, pausing on a full ring for at most the retry budget.
    pub(crate) fn push(&mut self, raw: &RawEvent) -> Result<u32, SegmentError> {
        let mut retries = self.enqueue_retries;
        loop {
            match self.try_push(raw) {
                Err(e) if e.is_full() && retries > 0 => {
                    retries -= 1;
                    self.wait.pause();
                }
                Err(e) if e.is_full() => {
                    tracing::debug!(key = %self.key, retries = self.enqueue_retries, "enqueue gave up on a full ring");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Wait within the retry budget until the outgoing ring has a free
    /// slot. A descriptor may only be sent once the event that announces it
    /// is certain to fit.
    pub(crate) fn reserve(&mut self) -> Result<(), SegmentError> {
        let mut retries = self.enqueue_retries;
        loop {
            self.ensure_alive()?;
            let free = match self.outgoing().free_slots(self.out_back) {
                Ok(free) => free,
                Err(e) => return Err(self.ring_failure(e)),
            };
            if free > 0 {
                return Ok(());
            }
            if retries == 0 {
                return Err(SegmentError::Ring(RingError::Full));
            }
            retries -= 1;
            self.wait.pause();
        }
    }

    /// Dequeue one raw record.
    ///
    /// Records already queued are still delivered after the peer pulled the
    /// dead-man switch; only an empty ring reports the death.
    pub(crate) fn pop(&mut self) -> Result<Option<RawEvent>, SegmentError> {
        if let SegmentState::Dead(cause) = self.state() {
            return Err(SegmentError::Dead(cause));
        }
        let ring = self.incoming();
        match ring.pop(&mut self.in_front) {
            Ok(Some(raw)) => Ok(Some(raw)),
            Ok(None) => self.ensure_alive().map(|()| None),
            Err(e) => Err(self.ring_failure(e)),
        }
    }

    /// Whether a record still queued behind the consumer matches `pred`.
    pub(crate) fn queued(&mut self, pred: impl FnMut(&RawEvent) -> bool) -> Result<bool, SegmentError> {
        let ring = self.incoming();
        ring.any_pending(self.in_front, pred)
            .map_err(|e| self.ring_failure(e))
    }

    // ===== Buffers =====

    fn region(&self, offset: usize, len: usize) -> *mut u8 {
        debug_assert!(offset + len <= self.mapping.len());
        // SAFETY: the adopted layout always fits inside the mapping.
        unsafe { self.mapping.as_ptr().add(offset) }
    }

    pub(crate) fn video(&self) -> &[u8] {
        let ptr = self.region(self.layout.video, self.layout.video_len);
        // SAFETY: in-bounds region of a live mapping.
        unsafe { std::slice::from_raw_parts(ptr, self.layout.video_len) }
    }

    pub(crate) fn video_mut(&mut self) -> &mut [u8] {
        let ptr = self.region(self.layout.video, self.layout.video_len);
        // SAFETY: in-bounds region of a live mapping, borrowed mutably
        // through `self`.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.layout.video_len) }
    }

    pub(crate) fn audio(&self) -> &[u8] {
        let ptr = self.region(self.layout.audio, self.layout.audio_len);
        // SAFETY: in-bounds region of a live mapping.
        unsafe { std::slice::from_raw_parts(ptr, self.layout.audio_len) }
    }

    pub(crate) fn audio_mut(&mut self) -> &mut [u8] {
        let ptr = self.region(self.layout.audio, self.layout.audio_len);
        // SAFETY: in-bounds region of a live mapping, borrowed mutably
        // through `self`.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.layout.audio_len) }
    }

    /// Buffers may only be touched at the confirmed geometry.
    pub(crate) fn ensure_buffers(&mut self) -> Result<(), SegmentError> {
        self.ensure_alive()?;
        if !self.lifecycle.buffers_usable() {
            return Err(SegmentError::NotActive(self.state()));
        }
        Ok(())
    }
}

impl Drop for SegmentCore {
    fn drop(&mut self) {
        if !self.lifecycle.is_dead() {
            tracing::debug!(key = %self.key, side = ?self.side, "segment dropped");
            self.kill(DeathCause::Exit);
        }
    }
}

impl fmt::Debug for SegmentCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentCore")
            .field("key", &self.key)
            .field("side", &self.side)
            .field("state", &self.state())
            .field("geometry", &self.geometry)
            .field("mapped", &self.mapping.len())
            .finish_non_exhaustive()
    }
}

/// Occupancy of both rings of a segment, from one side's point of view.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStatus {
    pub state: SegmentState,
    pub outgoing: RingStatus,
    pub incoming: RingStatus,
    pub mapped: usize,
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "segment: {} ({} bytes mapped)", self.state, self.mapped)?;
        writeln!(f, "  outgoing: {}", self.outgoing)?;
        write!(f, "  incoming: {}", self.incoming)
    }
}

impl SegmentCore {
    pub(crate) fn status(&self) -> SegmentStatus {
        let (outgoing, incoming) = self.ring_status();
        SegmentStatus {
            state: self.state(),
            outgoing,
            incoming,
            mapped: self.mapping.len(),
        }
    }
}
