//! shmif-transport-shm: shared memory segments between a display server and
//! its clients.
//!
//! A segment is one shared memory object holding a control page, two event
//! rings and the video and audio buffers, plus a triad of named semaphores
//! and a Unix socketpair for descriptors and doorbell rings.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Segment page (64 bytes): magic, dead-man switch, geometry          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Server → client ring: header + capacity × 128-byte records         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Client → server ring: header + capacity × 128-byte records         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Video buffer (width × height × 4)                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Audio buffer                                                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server creates segments with [`ServerSegment::create`] and hands the
//! resulting [`ConnectionInfo`] to the client process, which attaches with
//! [`ClientSegment::acquire`]. Either side pulling the dead-man switch, or
//! the guard thread noticing the other process is gone, ends the segment;
//! every blocking operation notices within one wait interval.

mod channel;
mod client;
mod config;
mod context;
mod key;
pub mod layout;
mod lifecycle;
mod liveness;
mod mapping;
mod ring;
mod segment;
mod sem;
mod server;
mod wait;

pub use client::{AcquireFlags, ClientSegment, MigrateError, Received, SignalMask};
pub use config::{
    ConnectionInfo, SegmentConfig, AUDIO_BUFFER_SIZE, DEFAULT_ENQUEUE_RETRIES,
    DEFAULT_GUARD_INTERVAL, DEFAULT_MAX_BYTES, DEFAULT_RING_CAPACITY, DEFAULT_WAIT_INTERVAL,
    ENV_ENQUEUE_RETRIES, ENV_GUARD_INTERVAL_MS, ENV_MAX_BYTES, ENV_RING_CAPACITY, ENV_SHMKEY,
    ENV_SOCKIN_FD, ENV_WAIT_INTERVAL_MS, MAX_CHANNELS, MAX_HEIGHT, MAX_SAMPLERATE, MAX_WIDTH,
};
pub use context::TransportContext;
pub use key::{KeyError, KeyRole, SegmentKey, MAX_KEY_LEN};
pub use layout::{LayoutError, SegmentLayout};
pub use lifecycle::{DeathCause, Lifecycle, LifecycleError, SegmentState, SubsegmentState};
pub use liveness::{process_alive, Guard};
pub use mapping::ShmMapping;
pub use ring::{EventRing, RingError, RingStatus, Trust};
pub use segment::{SegmentError, SegmentStatus};
pub use sem::{NamedSemaphore, SemaphoreTriad, TriadRole};
pub use server::{RejectAll, ServerSegment, SubsegmentPolicy, SubsegmentRequest};
pub use wait::{BoundedWait, TimedWaitSupport};

#[cfg(test)]
mod conformance_tests {
    use super::*;
    use shmif_core::{Event, Geometry, NegotiationId, SegmentKind};
    use shmif_testkit::{ClientEnd, Endpoint, EndpointError, SegmentFactory, ServerEnd, TestError};

    fn endpoint_error(e: SegmentError) -> EndpointError {
        if e.is_full() {
            EndpointError::Full
        } else if e.is_dead() {
            EndpointError::Dead
        } else {
            EndpointError::Other(e.to_string())
        }
    }

    impl Endpoint for ServerSegment {
        fn try_send(&mut self, event: Event) -> Result<(), EndpointError> {
            self.try_enqueue(event).map(drop).map_err(endpoint_error)
        }

        fn poll(&mut self) -> Result<Option<Event>, EndpointError> {
            ServerSegment::poll(self).map_err(endpoint_error)
        }

        fn is_alive(&self) -> bool {
            ServerSegment::is_alive(self)
        }
    }

    impl ServerEnd for ServerSegment {
        fn display_hint(&mut self, width: u32, height: u32) -> Result<NegotiationId, EndpointError> {
            ServerSegment::display_hint(self, width, height).map_err(endpoint_error)
        }

        fn terminate(&mut self) {
            ServerSegment::terminate(self)
        }
    }

    impl Endpoint for ClientSegment {
        fn try_send(&mut self, event: Event) -> Result<(), EndpointError> {
            self.try_enqueue(event).map(drop).map_err(endpoint_error)
        }

        fn poll(&mut self) -> Result<Option<Event>, EndpointError> {
            ClientSegment::poll(self)
                .map(|received| received.map(|r| r.event))
                .map_err(endpoint_error)
        }

        fn is_alive(&self) -> bool {
            ClientSegment::is_alive(self)
        }
    }

    impl ClientEnd for ClientSegment {
        fn wait(&mut self) -> Result<Event, EndpointError> {
            ClientSegment::wait(self)
                .map(|r| r.event)
                .map_err(endpoint_error)
        }

        fn geometry(&self) -> Geometry {
            ClientSegment::geometry(self)
        }

        fn request_resize(&mut self, geometry: Geometry) -> Result<NegotiationId, EndpointError> {
            ClientSegment::request_resize(self, geometry).map_err(endpoint_error)
        }

        fn request_subsegment(
            &mut self,
            kind: SegmentKind,
            width: u16,
            height: u16,
        ) -> Result<u32, EndpointError> {
            ClientSegment::request_subsegment(self, kind, width, height).map_err(endpoint_error)
        }
    }

    struct ShmFactory;

    impl SegmentFactory for ShmFactory {
        type Server = ServerSegment;
        type Client = ClientSegment;

        async fn connect_pair(capacity: u32) -> Result<(ServerSegment, ClientSegment), TestError> {
            shmif_testkit::init_tracing();
            let setup = |e: SegmentError| TestError::Setup(e.to_string());

            let ctx = TransportContext::new(SegmentConfig {
                ring_capacity: capacity,
                enqueue_retries: 0,
                ..SegmentConfig::default()
            });
            let mut server =
                ServerSegment::create(&ctx, SegmentKind::Application, Geometry::default())
                    .map_err(setup)?;
            let conn = server
                .take_connection()
                .ok_or_else(|| TestError::Setup("no connection info".into()))?;
            let mut client =
                ClientSegment::acquire(&ctx, conn, SegmentKind::Application, AcquireFlags::empty())
                    .map_err(setup)?;

            server.recv().await.map_err(setup)?;
            while client.state() != SegmentState::Active {
                if client.poll().map_err(setup)?.is_none() {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            }
            Ok((server, client))
        }
    }

    #[tokio::test]
    async fn fifo_both_directions() {
        shmif_testkit::run_fifo_both_directions::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn capacity_is_one_less() {
        shmif_testkit::run_capacity_is_one_less::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn wraparound() {
        shmif_testkit::run_wraparound::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn queued_events_survive_exit() {
        shmif_testkit::run_queued_events_survive_exit::<ShmFactory>().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_peer_unblocks_wait() {
        shmif_testkit::run_dead_peer_unblocks_wait::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn resize_round_trip() {
        shmif_testkit::run_resize_round_trip::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn subsegment_reject() {
        shmif_testkit::run_subsegment_reject::<ShmFactory>().await;
    }

    #[tokio::test]
    async fn display_hints_coalesce() {
        shmif_testkit::run_display_hints_coalesce::<ShmFactory>().await;
    }
}
