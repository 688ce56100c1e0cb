//! The display-server end of a segment.
//!
//! The server creates and owns everything: the shared memory object, the
//! semaphore triad and the control channel. It trusts nothing the client
//! wrote to the page; every peer-owned ring index is validated and every
//! geometry it acts on is one it computed itself.

use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::Ordering;

use shmif_core::{
    Event, ExternalEvent, Geometry, HandleSlot, Message, NegotiationId, RawEvent,
    ResizeRejectReason, SegmentKind, TargetEvent,
};

use crate::channel::{self, ServerChannel};
use crate::config::{ConnectionInfo, MAX_HEIGHT, MAX_WIDTH};
use crate::context::TransportContext;
use crate::key::{KeyRole, SegmentKey};
use crate::layout::{check_geometry, LayoutError, RingHeader, SegmentLayout, SegmentPage};
use crate::lifecycle::{DeathCause, SegmentState};
use crate::liveness::Guard;
use crate::mapping::ShmMapping;
use crate::segment::{SegmentCore, SegmentError, SegmentStatus, Side};
use crate::sem::SemaphoreTriad;

/// Attempts at finding an unused key before giving up.
const KEY_ATTEMPTS: usize = 10;

/// Dimension used when a subsegment hint is missing or out of range.
const FALLBACK_DIMENSION: u32 = 32;

/// A shrink is only carried out if it gives back at least 1/SHRINK_DIVISOR
/// of the current size.
const SHRINK_DIVISOR: usize = 5;

// =============================================================================
// Subsegment Policy
// =============================================================================

/// A client's request for an additional segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsegmentRequest {
    pub id: u32,
    pub kind: SegmentKind,
    pub width: u16,
    pub height: u16,
}

/// Decides whether a subsegment request is granted.
pub trait SubsegmentPolicy: Send {
    fn accept(&mut self, request: &SubsegmentRequest) -> bool;
}

/// Refuses every request. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl SubsegmentPolicy for RejectAll {
    fn accept(&mut self, _request: &SubsegmentRequest) -> bool {
        false
    }
}

impl<F> SubsegmentPolicy for F
where
    F: FnMut(&SubsegmentRequest) -> bool + Send,
{
    fn accept(&mut self, request: &SubsegmentRequest) -> bool {
        self(request)
    }
}

// =============================================================================
// Server Segment
// =============================================================================

pub struct ServerSegment {
    core: SegmentCore,
    ctx: TransportContext,
    kind: SegmentKind,
    channel: ServerChannel,
    connection: Option<ConnectionInfo>,
    policy: Box<dyn SubsegmentPolicy>,
    accepted: Vec<ServerSegment>,
    next_negotiation: u32,
}

impl ServerSegment {
    /// Allocate a new segment in the `Pending` state.
    ///
    /// The connection details for the client are available once through
    /// [`take_connection`](Self::take_connection).
    #[tracing::instrument(level = "debug", skip(ctx))]
    pub fn create(
        ctx: &TransportContext,
        kind: SegmentKind,
        geometry: Geometry,
    ) -> Result<Self, SegmentError> {
        let config = ctx.config();
        check_geometry(&geometry)?;
        let layout = SegmentLayout::compute(config.ring_capacity, &geometry)?;
        if layout.total > config.max_bytes {
            return Err(LayoutError::InvalidConfig("initial geometry exceeds the size limit").into());
        }
        let segment_size =
            u32::try_from(layout.total).map_err(|_| LayoutError::Overflow("segment size"))?;

        let (key, mapping, triad) = allocate(layout.total)?;

        let base = mapping.as_ptr();
        // SAFETY: the mapping is fresh, exclusively ours and `layout.total`
        // bytes long; the page and both ring headers lie within it at
        // 64-byte aligned offsets.
        unsafe {
            (*(base as *mut SegmentPage)).init(geometry, segment_size, std::process::id());
            std::ptr::write(
                base.add(layout.to_client_header) as *mut RingHeader,
                RingHeader::new(layout.ring_capacity),
            );
            std::ptr::write(
                base.add(layout.to_server_header) as *mut RingHeader,
                RingHeader::new(layout.ring_capacity),
            );
        }

        let mut core = SegmentCore::new(
            Side::Server,
            key.clone(),
            mapping,
            layout,
            geometry,
            std::sync::Arc::new(triad),
            ctx.bounded_wait(),
            config.enqueue_retries,
        );
        core.lifecycle.map()?;

        let (channel, client_end) = channel::pair()?;

        tracing::info!(%key, size = layout.total, capacity = layout.ring_capacity, "segment created");
        Ok(Self {
            core,
            ctx: ctx.clone(),
            kind,
            channel,
            connection: Some(ConnectionInfo::new(key, Some(client_end))),
            policy: Box::new(RejectAll),
            accepted: Vec::new(),
            next_negotiation: 1,
        })
    }

    /// What the client needs to attach. Available once.
    pub fn take_connection(&mut self) -> Option<ConnectionInfo> {
        self.connection.take()
    }

    pub fn set_policy(&mut self, policy: impl SubsegmentPolicy + 'static) {
        self.policy = Box::new(policy);
    }

    /// Start a guard thread watching the client process.
    pub fn watch_peer(&mut self, pid: libc::pid_t) -> std::io::Result<()> {
        let guard = Guard::spawn(pid, self.ctx.config().guard_interval, self.core.triad.clone())?;
        self.core.guard = Some(guard);
        Ok(())
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
    pub fn state(&self) -> SegmentState {
        self.core.state()
    }

    /// The confirmed geometry.
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

    /// Dequeue the next client event without blocking.
    ///
    /// Registration, resize and subsegment requests are acted on before
    /// they are returned. Records that fail to decode, arrive in a category
    /// the client may not produce, or arrive before registration are
    /// dropped.
    pub fn poll(&mut self) -> Result<Option<Event>, SegmentError> {
        loop {
            let Some(raw) = self.core.pop()? else {
                return Ok(None);
            };
            if let Some(event) = self.accept(&raw)? {
                return Ok(Some(event));
            }
        }
    }

    /// Dequeue, pausing one wait interval at a time while the ring is empty.
    pub fn wait(&mut self) -> Result<Event, SegmentError> {
        loop {
            if let Some(event) = self.poll()? {
                return Ok(event);
            }
            // Nobody awaits the doorbell here; keep the socket from filling.
            self.channel.drain();
            self.core.wait.pause();
        }
    }

    /// Resolve when the client rang the doorbell or one wait interval has
    /// passed, whichever comes first.
    pub async fn readable(&mut self) -> Result<(), SegmentError> {
        self.core.ensure_alive()?;
        let interval = self.core.wait.interval();
        match tokio::time::timeout(interval, self.channel.readable()).await {
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) | Err(_) => Ok(()),
        }
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn recv(&mut self) -> Result<Event, SegmentError> {
        loop {
            if let Some(event) = self.poll()? {
                return Ok(event);
            }
            self.readable().await?;
        }
    }

    fn accept(&mut self, raw: &RawEvent) -> Result<Option<Event>, SegmentError> {
        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(key = %self.core.key, error = %e, "dropping undecodable client event");
                return Ok(None);
            }
        };
        if !Side::Server.accepts().contains(event.category().mask()) {
            tracing::warn!(key = %self.core.key, category = ?event.category(), "dropping event in foreign category");
            return Ok(None);
        }

        let Event::External(external) = event else {
            return Ok(self.is_registered().then_some(event));
        };

        match external {
            ExternalEvent::Register { kind, .. } if self.state() == SegmentState::Pending => {
                // Stay Pending until the client is certain to hear about it;
                // it can register again once it has drained the ring.
                self.enqueue(TargetEvent::Activate)?;
                self.core.lifecycle.activate()?;
                tracing::debug!(key = %self.core.key, ?kind, "client registered");
            }
            _ if !self.is_registered() => {
                tracing::warn!(key = %self.core.key, kind = ?external.kind(), "dropping event before registration");
                return Ok(None);
            }
            ExternalEvent::Register { .. } => {
                tracing::debug!(key = %self.core.key, "repeated registration");
            }
            ExternalEvent::Resize {
                negotiation,
                geometry,
            } => self.handle_resize(negotiation, geometry)?,
            ExternalEvent::SegReq {
                id,
                kind,
                width,
                height,
            } => self.handle_segreq(SubsegmentRequest {
                id,
                kind,
                width,
                height,
            })?,
            _ => {}
        }
        Ok(Some(event))
    }

    fn is_registered(&self) -> bool {
        !matches!(self.state(), SegmentState::Pending | SegmentState::Unmapped)
    }

    // ===== Negotiation =====

    #[tracing::instrument(level = "debug", skip(self), fields(key = %self.core.key))]
    fn handle_resize(
        &mut self,
        negotiation: NegotiationId,
        requested: Geometry,
    ) -> Result<(), SegmentError> {
        let reason = match self.resize_to(requested) {
            Ok(()) => {
                self.enqueue(TargetEvent::ResizeAck {
                    negotiation,
                    geometry: requested,
                })?;
                return Ok(());
            }
            Err(reason) => reason,
        };

        tracing::debug!(?reason, "resize rejected");
        self.enqueue(TargetEvent::ResizeReject {
            negotiation,
            reason,
        })?;
        if reason == ResizeRejectReason::AllocationFailed {
            self.core.kill(DeathCause::ResizeFailed);
        }
        Ok(())
    }

    fn resize_to(&mut self, requested: Geometry) -> Result<(), ResizeRejectReason> {
        if self.state() != SegmentState::Active {
            return Err(ResizeRejectReason::NotActive);
        }
        check_geometry(&requested).map_err(|_| ResizeRejectReason::OutOfBounds)?;
        let layout = SegmentLayout::compute(self.core.layout.ring_capacity, &requested)
            .map_err(|_| ResizeRejectReason::OutOfBounds)?;
        if layout.total > self.ctx.config().max_bytes {
            return Err(ResizeRejectReason::TooLarge);
        }
        self.core
            .lifecycle
            .begin_resize()
            .map_err(|_| ResizeRejectReason::NotActive)?;

        let current = self.core.mapping.len();
        let small_shrink =
            layout.total <= current && (current - layout.total) * SHRINK_DIVISOR < current;
        if !small_shrink {
            if let Err(e) = self.core.mapping.resize(layout.total) {
                tracing::error!(key = %self.core.key, error = %e, size = layout.total, "could not resize segment");
                return Err(ResizeRejectReason::AllocationFailed);
            }
        }
        let mapped = u32::try_from(self.core.mapping.len())
            .map_err(|_| ResizeRejectReason::AllocationFailed)?;

        self.core.layout = layout;
        self.core.geometry = requested;
        self.core.page().publish_geometry(requested, mapped);
        self.core
            .lifecycle
            .finish_resize()
            .map_err(|_| ResizeRejectReason::NotActive)?;

        tracing::debug!(
            key = %self.core.key,
            width = requested.width,
            height = requested.height,
            size = mapped,
            "segment resized"
        );
        Ok(())
    }

    fn handle_segreq(&mut self, request: SubsegmentRequest) -> Result<(), SegmentError> {
        if !self.policy.accept(&request) {
            tracing::debug!(key = %self.core.key, id = request.id, kind = ?request.kind, "subsegment refused");
            self.enqueue(TargetEvent::ReqFail { tag: request.id })?;
            return Ok(());
        }

        let spawned = self.spawn(
            request.kind,
            request.width as i32,
            request.height as i32,
            false,
            request.id,
        );
        match spawned {
            Ok(child) => {
                self.accepted.push(child);
                Ok(())
            }
            Err(e) if e.is_dead() => Err(e),
            Err(e) => {
                tracing::warn!(key = %self.core.key, id = request.id, error = %e, "could not allocate subsegment");
                self.enqueue(TargetEvent::ReqFail { tag: request.id })?;
                Ok(())
            }
        }
    }

    /// Subsegments granted through the policy since the last call.
    pub fn take_subsegments(&mut self) -> Vec<ServerSegment> {
        std::mem::take(&mut self.accepted)
    }

    /// Push an unsolicited subsegment to the client.
    ///
    /// Width and height are hints; anything not positive or above the
    /// limits becomes 32. `output` marks a server-to-client data flow.
    pub fn spawn_subsegment(
        &mut self,
        kind: SegmentKind,
        width: i32,
        height: i32,
        output: bool,
    ) -> Result<ServerSegment, SegmentError> {
        self.spawn(kind, width, height, output, 0)
    }

    fn spawn(
        &mut self,
        kind: SegmentKind,
        width: i32,
        height: i32,
        output: bool,
        tag: u32,
    ) -> Result<ServerSegment, SegmentError> {
        self.core.ensure_alive()?;
        let geometry = self.core.geometry.with_size(
            clamp_hint(width, MAX_WIDTH),
            clamp_hint(height, MAX_HEIGHT),
        );
        let mut child = ServerSegment::create(&self.ctx, kind, geometry)?;
        let control = child
            .take_connection()
            .and_then(|conn| conn.control)
            .ok_or(SegmentError::NoControlChannel)?;

        let event = TargetEvent::NewSegment {
            handle: HandleSlot::Attached,
            output,
            kind,
            tag,
            key: Message::truncated(child.key().as_str()),
        };
        self.push_handle(event, control)?;
        tracing::debug!(key = %self.core.key, child = %child.key(), tag, ?kind, "subsegment pushed");
        Ok(child)
    }

    /// Ask the client to resize. It answers with a resize request carrying
    /// the returned negotiation id if it follows the hint.
    pub fn display_hint(&mut self, width: u32, height: u32) -> Result<NegotiationId, SegmentError> {
        let negotiation = NegotiationId(self.next_negotiation);
        self.next_negotiation = self.next_negotiation.wrapping_add(1).max(1);
        self.enqueue(TargetEvent::DisplayHint {
            width,
            height,
            negotiation,
        })?;
        Ok(negotiation)
    }

    // ===== Sending =====

    fn check_sendable(&self, event: &Event) -> Result<(), SegmentError> {
        self.core.check_outgoing(event)?;
        if let Event::Target(target) = event {
            if target.handle() == Some(HandleSlot::Attached) {
                return Err(SegmentError::DescriptorRequired);
            }
        }
        Ok(())
    }

    fn wake_client(&self) {
        if let Err(e) = self.core.triad.event.post() {
            tracing::warn!(key = %self.core.key, error = %e, "could not post event semaphore");
        }
    }

    /// Enqueue, waiting out a full ring within the retry budget. Returns
    /// the free slots left.
    pub fn enqueue(&mut self, event: impl Into<Event>) -> Result<u32, SegmentError> {
        let event = event.into();
        self.check_sendable(&event)?;
        let free = self.core.push(&event.encode())?;
        self.wake_client();
        Ok(free)
    }

    /// Enqueue or fail immediately with a full-ring error.
    pub fn try_enqueue(&mut self, event: impl Into<Event>) -> Result<u32, SegmentError> {
        let event = event.into();
        self.check_sendable(&event)?;
        let free = self.core.try_push(&event.encode())?;
        self.wake_client();
        Ok(free)
    }

    /// Send a descriptor-carrying event together with its descriptor.
    ///
    /// The descriptor goes out on the control channel first, and only once
    /// the ring is known to have room for the event, so the client never
    /// sees an attached slot without its descriptor queued.
    pub fn push_handle(&mut self, event: TargetEvent, fd: impl AsFd) -> Result<u32, SegmentError> {
        if event.handle().is_none() {
            return Err(SegmentError::NotDescriptorCarrying);
        }
        let event = Event::Target(event.with_handle(HandleSlot::Attached));
        self.core.reserve()?;
        self.channel.send_descriptor(fd.as_fd().as_raw_fd())?;
        let free = self.core.push(&event.encode())?;
        self.wake_client();
        Ok(free)
    }

    // ===== Buffers =====

    /// Hand a signalled video frame to `f`, then release it back to the
    /// client. `None` if no frame is pending or the segment is not active.
    pub fn take_video_frame<R>(
        &mut self,
        f: impl FnOnce(&[u8], Geometry) -> R,
    ) -> Result<Option<R>, SegmentError> {
        self.core.ensure_alive()?;
        let ready = self.core.page().video_ready.load(Ordering::Acquire) != 0;
        if !self.core.lifecycle.buffers_usable() || !ready {
            return Ok(None);
        }
        let out = f(self.core.video(), self.core.geometry);
        self.core.page().video_ready.store(0, Ordering::Release);
        if let Err(e) = self.core.triad.video.post() {
            tracing::warn!(key = %self.core.key, error = %e, "could not post video semaphore");
        }
        Ok(Some(out))
    }

    /// Hand the valid part of a signalled audio buffer to `f`, then release
    /// it back to the client.
    pub fn take_audio_frame<R>(
        &mut self,
        f: impl FnOnce(&[u8], Geometry) -> R,
    ) -> Result<Option<R>, SegmentError> {
        self.core.ensure_alive()?;
        let page = self.core.page();
        if !self.core.lifecycle.buffers_usable() || page.audio_ready.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let used = (page.audio_used.load(Ordering::Acquire) as usize).min(self.core.layout.audio_len);
        let out = f(&self.core.audio()[..used], self.core.geometry);

        let page = self.core.page();
        page.audio_used.store(0, Ordering::Release);
        page.audio_ready.store(0, Ordering::Release);
        if let Err(e) = self.core.triad.audio.post() {
            tracing::warn!(key = %self.core.key, error = %e, "could not post audio semaphore");
        }
        Ok(Some(out))
    }

    // ===== Teardown =====

    /// Tell the client to exit, then pull the dead-man switch.
    pub fn terminate(&mut self) {
        if self.core.lifecycle.is_dead() {
            return;
        }
        match self.core.try_push(&Event::Target(TargetEvent::Exit).encode()) {
            Ok(_) => self.wake_client(),
            Err(e) => tracing::debug!(key = %self.core.key, error = %e, "exit event not delivered"),
        }
        self.core.kill(DeathCause::Exit);
        tracing::info!(key = %self.core.key, "segment terminated");
    }
}

impl Drop for ServerSegment {
    fn drop(&mut self) {
        self.core.kill(DeathCause::Exit);
        let key = &self.core.key;
        if let Err(e) = ShmMapping::unlink(&key.name(KeyRole::Memory)) {
            tracing::warn!(%key, error = %e, "could not unlink shared memory");
        }
        if let Err(e) = SemaphoreTriad::unlink(key) {
            tracing::warn!(%key, error = %e, "could not unlink semaphores");
        }
    }
}

impl std::fmt::Debug for ServerSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSegment")
            .field("core", &self.core)
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Find a free key and create the shared memory object and semaphores
/// under it.
fn allocate(len: usize) -> Result<(SegmentKey, ShmMapping, SemaphoreTriad), SegmentError> {
    for _ in 0..KEY_ATTEMPTS {
        let key = SegmentKey::generate();
        let shm_name = key.name(KeyRole::Memory);
        let mapping = match ShmMapping::create(&shm_name, len) {
            Ok(mapping) => mapping,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        match SemaphoreTriad::create(&key) {
            Ok(triad) => return Ok((key, mapping, triad)),
            Err(e) => {
                let _ = ShmMapping::unlink(&shm_name);
                if e.kind() != std::io::ErrorKind::AlreadyExists {
                    return Err(e.into());
                }
            }
        }
    }
    Err(SegmentError::KeyExhausted)
}

fn clamp_hint(value: i32, max: u32) -> u32 {
    match u32::try_from(value) {
        Ok(v) if v > 0 && v <= max => v,
        _ => FALLBACK_DIMENSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::mpsc;
    use std::time::Duration;

    use shmif_core::Title;

    use crate::client::{AcquireFlags, ClientSegment};
    use crate::config::SegmentConfig;

    fn quick(guard_interval: Duration) -> TransportContext {
        TransportContext::new(SegmentConfig {
            wait_interval: Duration::from_millis(2),
            guard_interval,
            ..SegmentConfig::default()
        })
    }

    /// Acquire a client for `server` and complete registration.
    fn attach_registered(ctx: &TransportContext, server: &mut ServerSegment) -> ClientSegment {
        let conn = server.take_connection().unwrap();
        let mut client =
            ClientSegment::acquire(ctx, conn, SegmentKind::Application, AcquireFlags::empty()).unwrap();
        assert!(server.poll().unwrap().is_some());
        client.poll().unwrap().unwrap();
        assert_eq!(client.state(), SegmentState::Active);
        client
    }

    /// Run `client.wait()` on another thread; the receiver fires when it
    /// returns.
    fn blocked_waiter(
        mut client: ClientSegment,
    ) -> (mpsc::Receiver<()>, std::thread::JoinHandle<Result<Event, SegmentError>>) {
        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let result = client.wait().map(|received| received.event);
            let _ = tx.send(());
            result
        });
        (rx, waiter)
    }

    #[test]
    fn hints_are_clamped() {
        assert_eq!(clamp_hint(0, MAX_WIDTH), 32);
        assert_eq!(clamp_hint(-4, MAX_WIDTH), 32);
        assert_eq!(clamp_hint(MAX_WIDTH as i32 + 1, MAX_WIDTH), 32);
        assert_eq!(clamp_hint(640, MAX_WIDTH), 640);
        assert_eq!(clamp_hint(MAX_HEIGHT as i32, MAX_HEIGHT), MAX_HEIGHT);
    }

    #[test]
    fn create_rejects_bad_geometry() {
        let ctx = TransportContext::default();
        let err = ServerSegment::create(&ctx, SegmentKind::Application, Geometry::new(0, 10, 44_100, 2))
            .unwrap_err();
        assert!(matches!(err, SegmentError::Layout(LayoutError::GeometryOutOfBounds(_))));
    }

    #[test]
    fn created_segment_is_pending_and_unlinked_on_drop() {
        let ctx = TransportContext::default();
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();
        assert_eq!(server.state(), SegmentState::Pending);
        assert!(server.is_alive());

        let conn = server.take_connection().unwrap();
        assert!(conn.control.is_some());
        assert!(server.take_connection().is_none());

        let key = server.key().clone();
        drop(server);
        assert!(ShmMapping::open(&key.name(KeyRole::Memory)).is_err());
        assert!(SemaphoreTriad::open(&key).is_err());
    }

    #[test]
    fn enqueue_refuses_client_categories_and_bare_attached_slots() {
        let ctx = TransportContext::default();
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();

        let err = server
            .enqueue(ExternalEvent::Message { text: Message::truncated("hi") })
            .unwrap_err();
        assert!(matches!(err, SegmentError::WrongCategory(_)));

        let err = server
            .enqueue(TargetEvent::Store { handle: HandleSlot::Attached })
            .unwrap_err();
        assert!(matches!(err, SegmentError::DescriptorRequired));

        // An empty slot is a valid "nothing to transfer".
        server
            .enqueue(TargetEvent::Store { handle: HandleSlot::Empty })
            .unwrap();

        let err = server
            .push_handle(TargetEvent::Pause, std::io::stdin())
            .unwrap_err();
        assert!(matches!(err, SegmentError::NotDescriptorCarrying));
    }

    #[test]
    fn server_fills_to_capacity_minus_one_then_gives_up() {
        let ctx = TransportContext::new(crate::config::SegmentConfig {
            ring_capacity: 4,
            enqueue_retries: 2,
            wait_interval: std::time::Duration::from_millis(1),
            ..Default::default()
        });
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();

        assert_eq!(server.enqueue(TargetEvent::Pause).unwrap(), 2);
        assert_eq!(server.enqueue(TargetEvent::Pause).unwrap(), 1);
        assert_eq!(server.enqueue(TargetEvent::Pause).unwrap(), 0);
        assert!(server.enqueue(TargetEvent::Pause).unwrap_err().is_full());
        assert!(server.try_enqueue(TargetEvent::Pause).unwrap_err().is_full());
        assert!(server.is_alive());
    }

    #[test]
    fn out_of_range_client_index_kills_the_segment() {
        let ctx = TransportContext::default();
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();

        let capacity = server.core.layout.ring_capacity;
        // SAFETY: the header lies within the mapping at the layout offset.
        let header = unsafe {
            &*(server.core.mapping.as_ptr().add(server.core.layout.to_server_header)
                as *const RingHeader)
        };
        header.back.store(capacity + 7, Ordering::Release);

        let err = server.poll().unwrap_err();
        assert!(matches!(err, SegmentError::Dead(DeathCause::ProtocolViolation)));
        assert!(!server.core.page().is_alive());
        assert_eq!(server.state(), SegmentState::Dead(DeathCause::ProtocolViolation));
    }

    #[test]
    fn activation_waits_for_room_in_the_ring() {
        let ctx = TransportContext::new(SegmentConfig {
            ring_capacity: 4,
            enqueue_retries: 0,
            ..SegmentConfig::default()
        });
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();
        for _ in 0..3 {
            server.enqueue(TargetEvent::Pause).unwrap();
        }
        let conn = server.take_connection().unwrap();
        let mut client =
            ClientSegment::acquire(&ctx, conn, SegmentKind::Application, AcquireFlags::DISABLE_GUARD)
                .unwrap();

        // No room for ACTIVATE: the registration is refused, not half done.
        assert!(server.poll().unwrap_err().is_full());
        assert_eq!(server.state(), SegmentState::Pending);

        for _ in 0..3 {
            let received = client.poll().unwrap().unwrap();
            assert_eq!(received.event, Event::Target(TargetEvent::Pause));
        }
        assert_eq!(client.state(), SegmentState::Pending);

        client
            .enqueue(ExternalEvent::Register {
                kind: SegmentKind::Application,
                title: Title::empty(),
                guid: [0; 2],
            })
            .unwrap();
        assert!(matches!(
            server.poll().unwrap(),
            Some(Event::External(ExternalEvent::Register { .. }))
        ));
        assert_eq!(server.state(), SegmentState::Active);
        let activated = client.poll().unwrap().unwrap();
        assert_eq!(activated.event, Event::Target(TargetEvent::Activate));
        assert_eq!(client.state(), SegmentState::Active);
    }

    #[test]
    fn cleared_switch_ends_a_wait_without_any_post() {
        let ctx = quick(Duration::from_secs(2));
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();
        let client = attach_registered(&ctx, &mut server);
        let (returned, waiter) = blocked_waiter(client);
        std::thread::sleep(Duration::from_millis(20));

        // Only the page flag changes; no semaphore is touched.
        server.core.page().release();

        returned
            .recv_timeout(Duration::from_secs(1))
            .expect("client still blocked after the switch was cleared");
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(SegmentError::Dead(DeathCause::PeerGone))));
        assert!(!server.core.lifecycle.is_dead());
    }

    #[test]
    fn guard_ends_a_wait_when_the_server_process_exits() {
        let guard_interval = Duration::from_millis(20);
        let ctx = quick(guard_interval);
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();

        // The client watches whatever pid the page names.
        let mut stand_in = Command::new("sleep").arg("30").spawn().unwrap();
        server.core.page().parent_pid.store(stand_in.id(), Ordering::Release);

        let client = attach_registered(&ctx, &mut server);
        let (returned, waiter) = blocked_waiter(client);
        std::thread::sleep(Duration::from_millis(20));
        assert!(server.core.page().is_alive());

        stand_in.kill().unwrap();
        stand_in.wait().unwrap();

        returned
            .recv_timeout(guard_interval + Duration::from_secs(1))
            .expect("client still blocked after the server process exited");
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(SegmentError::Dead(DeathCause::PeerGone))));
    }
}
