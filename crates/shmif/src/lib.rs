//! shmif: shared-memory transport between a display server and the isolated
//! clients (frameservers) it launches.
//!
//! # Server side
//!
//! ```ignore
//! use shmif::prelude::*;
//!
//! let ctx = TransportContext::from_env();
//! let mut segment = ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default())?;
//!
//! // Hand the key and control descriptor to the child process.
//! let vars = segment.take_connection().unwrap().export();
//!
//! loop {
//!     match segment.recv().await? {
//!         Event::External(ExternalEvent::Ident { text }) => println!("{}", text),
//!         other => tracing::debug!(?other, "client event"),
//!     }
//!     segment.take_video_frame(|frame, geometry| present(frame, geometry))?;
//! }
//! ```
//!
//! # Client side
//!
//! ```ignore
//! use shmif::prelude::*;
//!
//! let ctx = TransportContext::from_env();
//! let conn = ConnectionInfo::from_env().expect("launched without a segment");
//! let mut segment = ClientSegment::acquire(&ctx, conn, SegmentKind::Game, AcquireFlags::empty())?;
//!
//! while let Ok(received) = segment.wait() {
//!     if let Event::Target(TargetEvent::Exit) = received.event {
//!         break;
//!     }
//!     draw(segment.video_buffer_mut()?);
//!     segment.signal(SignalMask::VIDEO)?;
//! }
//! ```
//!
//! # Error Handling
//!
//! Segment operations return `Result<_, SegmentError>`. A dead segment is
//! the end of the stream, not a crash:
//!
//! ```ignore
//! match segment.poll() {
//!     Ok(Some(event)) => handle(event),
//!     Ok(None) => {}
//!     Err(SegmentError::Dead(cause)) => return Ok(cause),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

// Re-export the event model
pub use shmif_core::{
    // Wire record and decoding
    Category,
    CategoryMask,
    DecodeError,
    Event,
    RawEvent,
    EVENT_RECORD_SIZE,
    // Event kinds
    DeviceKind,
    ExternalEvent,
    ExternalKind,
    IoData,
    IoEvent,
    IoKind,
    ResizeRejectReason,
    TargetEvent,
    TargetKind,
    // Payload types
    FixedStr,
    Geometry,
    Message,
    NegotiationId,
    SegmentKind,
    Title,
    // Descriptor classification
    HandleSlot,
};

// Re-export the segment endpoints
pub use shmif_transport_shm::{
    AcquireFlags, ClientSegment, ConnectionInfo, DeathCause, MigrateError, Received,
    RejectAll, SegmentConfig, SegmentError, SegmentKey, SegmentState, SegmentStatus,
    ServerSegment, SignalMask, SubsegmentPolicy, SubsegmentRequest, TransportContext,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use shmif::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AcquireFlags, ClientSegment, ConnectionInfo, Event, ExternalEvent, Geometry,
        SegmentError, SegmentKind, ServerSegment, SignalMask, TargetEvent, TransportContext,
    };
}

/// The full shared memory transport, for callers that need the lower
/// layers: page layout, rings, semaphores, guards.
pub mod transport {
    pub mod shm {
        pub use shmif_transport_shm::*;
    }
}

/// Acquire the segment this process was launched with.
///
/// Reads the connection and configuration from the environment, as set by
/// [`ConnectionInfo::export`] on the server side. `None` if the process was
/// started without a segment.
pub fn acquire_from_env(
    kind: SegmentKind,
    flags: AcquireFlags,
) -> Option<Result<ClientSegment, SegmentError>> {
    let conn = ConnectionInfo::from_env()?;
    let ctx = TransportContext::from_env();
    Some(ClientSegment::acquire(&ctx, conn, kind, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_connection_is_acquired_once() {
        std::env::remove_var(shmif_transport_shm::ENV_SHMKEY);
        assert!(acquire_from_env(SegmentKind::Application, AcquireFlags::empty()).is_none());

        let ctx = TransportContext::default();
        let mut server =
            ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default()).unwrap();
        let mut conn = server.take_connection().unwrap();
        // The control descriptor stays with this process; only the key is
        // exported.
        let control = conn.control.take();
        for (name, value) in conn.export() {
            std::env::set_var(name, value);
        }

        let mut client = acquire_from_env(SegmentKind::Application, AcquireFlags::DISABLE_GUARD)
            .unwrap()
            .unwrap();
        assert!(std::env::var(shmif_transport_shm::ENV_SHMKEY).is_err());
        assert_eq!(client.key(), server.key());

        assert!(matches!(
            server.poll().unwrap(),
            Some(Event::External(ExternalEvent::Register { .. }))
        ));
        assert_eq!(
            client.poll().unwrap().map(|r| r.event),
            Some(Event::Target(TargetEvent::Activate))
        );
        drop(control);

        // The variables were consumed by the first acquire.
        assert!(acquire_from_env(SegmentKind::Application, AcquireFlags::empty()).is_none());
    }
}
