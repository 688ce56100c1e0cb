//! The frameserver end of a segment.
//!
//! The client attaches to a segment the server created, announces itself,
//! and from then on consumes target events and produces external ones.
//! Indices it reads back from the page are reduced modulo the ring
//! capacity rather than validated; a server attacking its own client gains
//! nothing.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use shmif_core::{
    slot_word, Category, Event, ExternalEvent, Geometry, NegotiationId, RawEvent,
    ResizeRejectReason, SegmentKind, TargetEvent, TargetKind, Title,
};

use crate::channel::ClientChannel;
use crate::config::ConnectionInfo;
use crate::context::TransportContext;
use crate::key::{KeyRole, SegmentKey};
use crate::layout::{check_geometry, LayoutError, RingHeader, SegmentLayout, SegmentPage};
use crate::lifecycle::{DeathCause, SegmentState};
use crate::liveness::Guard;
use crate::mapping::ShmMapping;
use crate::segment::{SegmentCore, SegmentError, SegmentStatus, Side};
use crate::sem::SemaphoreTriad;

bitflags! {
    /// Policy for [`ClientSegment::acquire`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AcquireFlags: u32 {
        /// Leave the shared memory and semaphore names in place.
        const DONT_UNLINK   = 1 << 0;
        /// Do not start a guard thread on the server process.
        const DISABLE_GUARD = 1 << 1;
        /// Exit the process instead of returning an acquisition error.
        const FATAL_FAIL    = 1 << 2;
        /// Do not send the registration event; the caller will.
        const NO_REGISTER   = 1 << 3;
    }
}

bitflags! {
    /// Which buffers [`ClientSegment::signal`] hands to the server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalMask: u32 {
        const VIDEO    = 1 << 0;
        const AUDIO    = 1 << 1;
        /// Return right after signalling instead of waiting for the
        /// server to release the buffers.
        const NONBLOCK = 1 << 2;
    }
}

/// Errors from [`ClientSegment::migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateError {
    /// The connection points at the segment already in use.
    BadArgument,
    /// The new segment could not be acquired or never became active.
    NoConnection,
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArgument => write!(f, "bad migration target"),
            Self::NoConnection => write!(f, "could not connect to migration target"),
        }
    }
}

impl std::error::Error for MigrateError {}

/// Fill for a video buffer whose contents could not be carried over by a
/// migration, so the loss is visible.
const LOST_FRAME_PIXEL: [u8; 4] = [90, 60, 60, 255];

/// One event from the server, with its descriptor if the event carried
/// one.
#[derive(Debug)]
pub struct Received {
    pub event: Event,
    pub handle: Option<OwnedFd>,
}

pub struct ClientSegment {
    core: SegmentCore,
    ctx: TransportContext,
    kind: SegmentKind,
    flags: AcquireFlags,
    title: Title,
    guid: [u64; 2],
    channel: Option<ClientChannel>,
    backlog: VecDeque<Received>,
    pending_resize: Option<NegotiationId>,
    next_negotiation: u32,
    next_request: u32,
}

impl ClientSegment {
    /// Attach to the segment described by `conn` and register as `kind`.
    #[tracing::instrument(level = "debug", skip(ctx, conn), fields(key = %conn.key))]
    pub fn acquire(
        ctx: &TransportContext,
        conn: ConnectionInfo,
        kind: SegmentKind,
        flags: AcquireFlags,
    ) -> Result<Self, SegmentError> {
        match Self::attach(ctx, conn, kind, flags) {
            Ok(segment) => Ok(segment),
            Err(e) if flags.contains(AcquireFlags::FATAL_FAIL) => {
                tracing::error!(error = %e, "could not acquire segment");
                std::process::exit(1);
            }
            Err(e) => Err(e),
        }
    }

    fn attach(
        ctx: &TransportContext,
        conn: ConnectionInfo,
        kind: SegmentKind,
        flags: AcquireFlags,
    ) -> Result<Self, SegmentError> {
        let key = conn.key;
        let shm_name = key.name(KeyRole::Memory);
        let mapping = ShmMapping::open(&shm_name)?;

        let headers = std::mem::size_of::<SegmentPage>() + std::mem::size_of::<RingHeader>();
        if mapping.len() < headers {
            return Err(LayoutError::SegmentTooSmall {
                required: headers,
                found: mapping.len(),
            }
            .into());
        }

        // SAFETY: the mapping is at least a page plus a ring header long;
        // both are plain integers and atomics, valid for any bit pattern.
        let (page, capacity) = unsafe {
            let base = mapping.as_ptr();
            let page = &*(base as *const SegmentPage);
            let header = base.add(std::mem::size_of::<SegmentPage>()) as *const RingHeader;
            (page, std::ptr::read_volatile(std::ptr::addr_of!((*header).capacity)))
        };
        page.validate()?;
        if !page.is_alive() {
            return Err(SegmentError::Dead(DeathCause::PeerGone));
        }
        let geometry = page.geometry();
        let parent_pid = page.parent_pid.load(Ordering::Acquire);
        check_geometry(&geometry)?;
        let layout = SegmentLayout::compute(capacity, &geometry)?;
        if layout.total > mapping.len() {
            return Err(LayoutError::SegmentTooSmall {
                required: layout.total,
                found: mapping.len(),
            }
            .into());
        }

        let triad = Arc::new(SemaphoreTriad::open(&key)?);
        if !flags.contains(AcquireFlags::DONT_UNLINK) {
            if let Err(e) = ShmMapping::unlink(&shm_name) {
                tracing::warn!(%key, error = %e, "could not unlink shared memory");
            }
            if let Err(e) = SemaphoreTriad::unlink(&key) {
                tracing::warn!(%key, error = %e, "could not unlink semaphores");
            }
        }

        let mut core = SegmentCore::new(
            Side::Client,
            key,
            mapping,
            layout,
            geometry,
            triad,
            ctx.bounded_wait(),
            ctx.config().enqueue_retries,
        );
        core.lifecycle.map()?;

        if !flags.contains(AcquireFlags::DISABLE_GUARD) {
            let pid = libc::pid_t::try_from(parent_pid).unwrap_or(0);
            core.guard = Some(Guard::spawn(
                pid,
                ctx.config().guard_interval,
                core.triad.clone(),
            )?);
        }

        let channel = conn.control.map(ClientChannel::from_fd).transpose()?;

        let mut segment = Self {
            core,
            ctx: ctx.clone(),
            kind,
            flags,
            title: Title::empty(),
            guid: [0; 2],
            channel,
            backlog: VecDeque::new(),
            pending_resize: None,
            next_negotiation: 1,
            next_request: 1,
        };

        if !flags.contains(AcquireFlags::NO_REGISTER) {
            segment.enqueue(segment.registration())?;
        }

        tracing::info!(
            key = %segment.core.key,
            width = geometry.width,
            height = geometry.height,
            capacity,
            "segment acquired"
        );
        Ok(segment)
    }

    #[inline]
    pub fn key(&self) -> &SegmentKey {
        &self.core.key
    }

    #[inline]
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> AcquireFlags {
        self.flags
    }

    #[inline]
    pub fn state(&self) -> SegmentState {
        self.core.state()
    }

    /// Title and GUID of the last registration sent.
    pub fn identity(&self) -> (Title, [u64; 2]) {
        (self.title, self.guid)
    }

    /// Set the title and GUID announced when this client registers with a
    /// migration target.
    pub fn set_identity(&mut self, title: Title, guid: [u64; 2]) {
        self.title = title;
        self.guid = guid;
    }

    fn registration(&self) -> ExternalEvent {
        ExternalEvent::Register {
            kind: self.kind,
            title: self.title,
            guid: self.guid,
        }
    }

    /// Keep the identity of registrations sent by the caller.
    fn remember(&mut self, event: &Event) {
        if let Event::External(ExternalEvent::Register { title, guid, .. }) = event {
            self.title = *title;
            self.guid = *guid;
        }
    }

    /// The geometry the buffers currently have.
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.core.geometry
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub fn status(&self) -> SegmentStatus {
        self.core.status()
    }

    // ===== Receiving =====

    /// Dequeue the next server event without blocking.
    pub fn poll(&mut self) -> Result<Option<Received>, SegmentError> {
        if let Some(received) = self.backlog.pop_front() {
            return Ok(Some(received));
        }
        loop {
            let Some(raw) = self.core.pop()? else {
                return Ok(None);
            };
            if let Some(received) = self.accept(&raw)? {
                return Ok(Some(received));
            }
        }
    }

    /// Dequeue, blocking on the event semaphore one bounded step at a
    /// time. Returns the end-of-stream result within one step of the
    /// server going away.
    pub fn wait(&mut self) -> Result<Received, SegmentError> {
        loop {
            if let Some(received) = self.poll()? {
                return Ok(received);
            }
            let wait = self.core.wait;
            wait.wait(&self.core.triad.event);
        }
    }

    fn accept(&mut self, raw: &RawEvent) -> Result<Option<Received>, SegmentError> {
        // Pull an announced descriptor before looking at the payload, so a
        // record that fails to decode does not leave it queued for the
        // next one.
        let handle = match slot_word(raw) {
            Some(word) if word >= 0 => match self.take_descriptor() {
                Ok(fd) => Some(fd),
                Err(e) => {
                    tracing::warn!(key = %self.core.key, kind = raw.kind, error = %e, "announced descriptor missing, dropping event");
                    return Ok(None);
                }
            },
            _ => None,
        };

        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(key = %self.core.key, error = %e, "dropping undecodable server event");
                return Ok(None);
            }
        };
        if !Side::Client.accepts().contains(event.category().mask()) {
            tracing::warn!(key = %self.core.key, category = ?event.category(), "dropping event in foreign category");
            return Ok(None);
        }

        if let Event::Target(target) = event {
            if !self.handle_target(target)? {
                return Ok(None);
            }
        }
        Ok(Some(Received { event, handle }))
    }

    fn take_descriptor(&self) -> Result<OwnedFd, SegmentError> {
        let channel = self.channel.as_ref().ok_or(SegmentError::NoControlChannel)?;
        Ok(channel.recv_descriptor()?)
    }

    /// Act on protocol events. Returns false for events that are swallowed.
    fn handle_target(&mut self, event: TargetEvent) -> Result<bool, SegmentError> {
        match event {
            TargetEvent::DisplayHint { .. } => {
                let newer = self.core.queued(|raw| {
                    raw.category() == Some(Category::Target)
                        && raw.kind == TargetKind::DisplayHint as u32
                })?;
                if newer {
                    tracing::trace!(key = %self.core.key, "display hint superseded");
                    return Ok(false);
                }
            }
            TargetEvent::Exit => {
                tracing::debug!(key = %self.core.key, "server requested exit");
                self.core.kill(DeathCause::Exit);
            }
            TargetEvent::Activate => {
                if self.state() == SegmentState::Pending {
                    self.core.lifecycle.activate()?;
                } else {
                    tracing::debug!(key = %self.core.key, state = %self.state(), "ignoring repeated activation");
                }
            }
            TargetEvent::ResizeAck {
                negotiation,
                geometry,
            } => {
                if self.pending_resize != Some(negotiation) {
                    tracing::warn!(key = %self.core.key, %negotiation, "acknowledgement for no outstanding resize");
                } else if let Err(e) = self.adopt(geometry) {
                    tracing::error!(key = %self.core.key, error = %e, "could not adopt acknowledged geometry");
                    self.core.kill(DeathCause::ResizeFailed);
                    return Err(SegmentError::Dead(DeathCause::ResizeFailed));
                }
            }
            TargetEvent::ResizeReject {
                negotiation,
                reason,
            } => {
                if self.pending_resize == Some(negotiation) {
                    self.pending_resize = None;
                    tracing::debug!(key = %self.core.key, %negotiation, ?reason, "resize rejected");
                    if reason == ResizeRejectReason::AllocationFailed {
                        self.core.kill(DeathCause::ResizeFailed);
                    } else {
                        self.core.lifecycle.finish_resize()?;
                    }
                } else {
                    tracing::warn!(key = %self.core.key, %negotiation, "rejection for no outstanding resize");
                }
            }
            TargetEvent::NewSegment { tag, .. } if tag != 0 => self.resolve_request(tag, true),
            TargetEvent::ReqFail { tag } => self.resolve_request(tag, false),
            _ => {}
        }
        Ok(true)
    }

    fn resolve_request(&mut self, tag: u32, accepted: bool) {
        if let Err(e) = self.core.lifecycle.resolve_subsegment(tag, accepted) {
            tracing::warn!(key = %self.core.key, tag, error = %e, "ignoring subsegment answer");
        }
    }

    /// Move to the acknowledged geometry, remapping if the server changed
    /// the backing size.
    fn adopt(&mut self, geometry: Geometry) -> Result<(), SegmentError> {
        check_geometry(&geometry)?;
        let layout = SegmentLayout::compute(self.core.layout.ring_capacity, &geometry)?;
        let size = self.core.page().segment_size();
        if size != self.core.mapping.len() {
            self.core.mapping.remap(size)?;
        }
        if layout.total > self.core.mapping.len() {
            return Err(LayoutError::SegmentTooSmall {
                required: layout.total,
                found: self.core.mapping.len(),
            }
            .into());
        }
        self.core.layout = layout;
        self.core.geometry = geometry;
        self.pending_resize = None;
        self.core.lifecycle.finish_resize()?;
        tracing::debug!(
            key = %self.core.key,
            width = geometry.width,
            height = geometry.height,
            size,
            "geometry adopted"
        );
        Ok(())
    }

    // ===== Sending =====

    fn ring(&self) {
        if let Some(channel) = &self.channel {
            channel.ring();
        }
    }

    /// Enqueue, waiting out a full ring within the retry budget. Returns
    /// the free slots left.
    pub fn enqueue(&mut self, event: impl Into<Event>) -> Result<u32, SegmentError> {
        let event = event.into();
        self.core.check_outgoing(&event)?;
        let free = self.core.push(&event.encode())?;
        self.remember(&event);
        self.ring();
        Ok(free)
    }

    /// Enqueue or fail immediately with a full-ring error.
    pub fn try_enqueue(&mut self, event: impl Into<Event>) -> Result<u32, SegmentError> {
        let event = event.into();
        self.core.check_outgoing(&event)?;
        let free = self.core.try_push(&event.encode())?;
        self.remember(&event);
        self.ring();
        Ok(free)
    }

    // ===== Negotiation =====

    /// Ask for new buffer geometry under a fresh negotiation id.
    ///
    /// Buffers are unavailable until the answer arrives.
    pub fn request_resize(&mut self, geometry: Geometry) -> Result<NegotiationId, SegmentError> {
        let negotiation = NegotiationId(self.next_negotiation);
        self.next_negotiation = self.next_negotiation.wrapping_add(1).max(1);
        self.request_resize_as(negotiation, geometry)?;
        Ok(negotiation)
    }

    /// Ask for new buffer geometry under a given negotiation id, such as
    /// the one of a display hint being followed.
    #[tracing::instrument(level = "debug", skip(self), fields(key = %self.core.key))]
    pub fn request_resize_as(
        &mut self,
        negotiation: NegotiationId,
        geometry: Geometry,
    ) -> Result<(), SegmentError> {
        self.core.ensure_alive()?;
        if self.state() != SegmentState::Active {
            return Err(SegmentError::NotActive(self.state()));
        }
        self.core.lifecycle.begin_resize()?;
        self.pending_resize = Some(negotiation);
        if let Err(e) = self.enqueue(ExternalEvent::Resize {
            negotiation,
            geometry,
        }) {
            self.pending_resize = None;
            if !e.is_dead() {
                self.core.lifecycle.finish_resize()?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Ask the server for an additional segment. Returns the request id the
    /// answer will carry.
    pub fn request_subsegment(
        &mut self,
        kind: SegmentKind,
        width: u16,
        height: u16,
    ) -> Result<u32, SegmentError> {
        self.core.ensure_alive()?;
        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(1);
        self.core.lifecycle.request_subsegment(id)?;
        if let Err(e) = self.enqueue(ExternalEvent::SegReq {
            id,
            kind,
            width,
            height,
        }) {
            if let Err(rollback) = self.core.lifecycle.resolve_subsegment(id, false) {
                tracing::warn!(key = %self.core.key, id, error = %rollback, "could not withdraw unsent subsegment request");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Attach to the segment announced by a NEWSEGMENT event.
    pub fn accept_subsegment(
        &self,
        received: Received,
        flags: AcquireFlags,
    ) -> Result<ClientSegment, SegmentError> {
        let Event::Target(TargetEvent::NewSegment { kind, key, .. }) = received.event else {
            return Err(SegmentError::UnexpectedEvent);
        };
        let control = received.handle.ok_or(SegmentError::NoControlChannel)?;
        let key = SegmentKey::parse(&key.to_string_lossy())?;
        ClientSegment::acquire(&self.ctx, ConnectionInfo::new(key, Some(control)), kind, flags)
    }

    // ===== Buffers =====

    /// The video buffer at the confirmed geometry. Unavailable while a
    /// resize is outstanding.
    pub fn video_buffer_mut(&mut self) -> Result<&mut [u8], SegmentError> {
        self.core.ensure_buffers()?;
        Ok(self.core.video_mut())
    }

    pub fn audio_buffer_mut(&mut self) -> Result<&mut [u8], SegmentError> {
        self.core.ensure_buffers()?;
        Ok(self.core.audio_mut())
    }

    /// Record how many bytes of the audio buffer hold samples.
    pub fn set_audio_used(&mut self, bytes: usize) {
        let bytes = bytes.min(self.core.layout.audio_len) as u32;
        self.core.page().audio_used.store(bytes, Ordering::Release);
    }

    /// Hand the buffers in `mask` to the server and, unless `NONBLOCK` is
    /// set, wait until it has released them.
    pub fn signal(&mut self, mask: SignalMask) -> Result<(), SegmentError> {
        self.core.ensure_buffers()?;
        let page = self.core.page();
        if mask.contains(SignalMask::VIDEO) {
            page.video_ready.store(1, Ordering::Release);
        }
        if mask.contains(SignalMask::AUDIO) {
            page.audio_ready.store(1, Ordering::Release);
        }
        self.ring();
        if mask.contains(SignalMask::NONBLOCK) {
            return Ok(());
        }

        loop {
            let page = self.core.page();
            let video = mask.contains(SignalMask::VIDEO) && page.video_ready.load(Ordering::Acquire) != 0;
            let audio = mask.contains(SignalMask::AUDIO) && page.audio_ready.load(Ordering::Acquire) != 0;
            if !video && !audio {
                return Ok(());
            }
            self.core.ensure_alive()?;
            let wait = self.core.wait;
            let sem = if video {
                &self.core.triad.video
            } else {
                &self.core.triad.audio
            };
            wait.wait(sem);
        }
    }

    // ===== Migration =====

    /// Move to another segment, such as one offered by a restarted server.
    ///
    /// The client registers with its current title and GUID, then asks for
    /// its current geometry. Buffer contents are carried over when the new
    /// buffers have the same size; a video buffer that does not is filled
    /// with a marker colour instead. The new segment is fully active before
    /// the current one is released, so there is never a moment without a
    /// usable segment. Events that arrive on the new segment meanwhile are
    /// kept for the next poll.
    #[tracing::instrument(level = "debug", skip(self, conn), fields(from = %self.core.key, to = %conn.key))]
    pub fn migrate(&mut self, conn: ConnectionInfo) -> Result<(), MigrateError> {
        if conn.key == self.core.key {
            return Err(MigrateError::BadArgument);
        }

        let flags = (self.flags | AcquireFlags::NO_REGISTER) - AcquireFlags::FATAL_FAIL;
        let mut next = ClientSegment::acquire(&self.ctx, conn, self.kind, flags).map_err(|e| {
            tracing::warn!(error = %e, "migration target unavailable");
            MigrateError::NoConnection
        })?;
        next.flags = self.flags;
        next.set_identity(self.title, self.guid);
        if let Err(e) = next.enqueue(next.registration()) {
            tracing::warn!(error = %e, "could not register with migration target");
            return Err(MigrateError::NoConnection);
        }

        let deadline = Instant::now() + self.ctx.config().guard_interval;
        let mut early = Vec::new();
        next.settle(deadline, None, &mut early, |s| s.state() == SegmentState::Active)?;

        if next.geometry() != self.geometry() {
            match next.request_resize(self.geometry()) {
                Ok(negotiation) => next.settle(deadline, Some(negotiation), &mut early, |s| {
                    s.pending_resize.is_none()
                })?,
                Err(e) => tracing::warn!(error = %e, "could not restore geometry after migration"),
            }
        }
        next.backlog.extend(early);
        next.carry_buffers(self);

        self.core.kill(DeathCause::Migrated);
        std::mem::swap(self, &mut next);
        tracing::info!(key = %self.core.key, "migrated");
        Ok(())
    }

    /// Poll until `done` holds, setting aside everything but the activation
    /// and the answer to `restore`.
    fn settle(
        &mut self,
        deadline: Instant,
        restore: Option<NegotiationId>,
        early: &mut Vec<Received>,
        done: impl Fn(&Self) -> bool,
    ) -> Result<(), MigrateError> {
        while !done(&*self) {
            if Instant::now() >= deadline {
                tracing::warn!(state = %self.state(), "migration target did not settle in time");
                return Err(MigrateError::NoConnection);
            }
            match self.poll() {
                Ok(Some(received)) => {
                    if !is_handshake(&received.event, restore) {
                        early.push(received);
                    }
                }
                Ok(None) => {
                    let wait = self.core.wait;
                    wait.wait(&self.core.triad.event);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "migration target failed during handshake");
                    return Err(MigrateError::NoConnection);
                }
            }
        }
        Ok(())
    }

    /// Copy the buffers of `previous` where the sizes allow it.
    fn carry_buffers(&mut self, previous: &ClientSegment) {
        let (from, to) = (previous.core.video(), self.core.video_mut());
        if from.len() == to.len() {
            to.copy_from_slice(from);
        } else {
            tracing::warn!(old = from.len(), new = to.len(), "video buffer size changed, frame lost");
            for pixel in to.chunks_exact_mut(LOST_FRAME_PIXEL.len()) {
                pixel.copy_from_slice(&LOST_FRAME_PIXEL);
            }
        }

        let (from, to) = (previous.core.audio(), self.core.audio_mut());
        if from.len() == to.len() {
            to.copy_from_slice(from);
        } else {
            tracing::warn!(old = from.len(), new = to.len(), "audio buffer size changed, samples lost");
        }
    }
}

fn is_handshake(event: &Event, restore: Option<NegotiationId>) -> bool {
    match event {
        Event::Target(TargetEvent::Activate) => true,
        Event::Target(
            TargetEvent::ResizeAck { negotiation, .. } | TargetEvent::ResizeReject { negotiation, .. },
        ) => restore == Some(*negotiation),
        _ => false,
    }
}

impl fmt::Debug for ClientSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSegment")
            .field("core", &self.core)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}
