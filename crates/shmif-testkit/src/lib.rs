//! shmif-testkit: Conformance scenarios for shmif segment implementations.
//!
//! Provides the `SegmentFactory` trait, a minimal view of both segment ends,
//! and shared scenarios every implementation must pass.
//!
//! # Usage
//!
//! ```ignore
//! use shmif_testkit::{SegmentFactory, TestError};
//!
//! struct MyFactory;
//!
//! impl SegmentFactory for MyFactory {
//!     type Server = MyServer;
//!     type Client = MyClient;
//!
//!     async fn connect_pair(capacity: u32) -> Result<(MyServer, MyClient), TestError> {
//!         /* create, acquire and register */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn fifo_both_directions() {
//!     shmif_testkit::run_fifo_both_directions::<MyFactory>().await;
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use shmif_core::{
    Event, ExternalEvent, Geometry, NegotiationId, ResizeRejectReason, SegmentKind, TargetEvent,
};

/// Polls before a scenario gives up waiting for an event.
const POLL_ATTEMPTS: usize = 2000;
const POLL_STEP: Duration = Duration::from_millis(1);

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Segment creation or acquisition failed.
    Setup(String),
    /// An endpoint operation failed.
    Endpoint(EndpointError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Endpoint(e) => write!(f, "endpoint error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<EndpointError> for TestError {
    fn from(e: EndpointError) -> Self {
        TestError::Endpoint(e)
    }
}

/// What the scenarios need to tell apart when an endpoint operation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The outgoing ring had no free slot.
    Full,
    /// The segment is dead; the end-of-stream result.
    Dead,
    Other(String),
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::Full => write!(f, "ring full"),
            EndpointError::Dead => write!(f, "segment dead"),
            EndpointError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Operations shared by both ends of a segment.
pub trait Endpoint: Send + 'static {
    /// Enqueue without waiting for space.
    fn try_send(&mut self, event: Event) -> Result<(), EndpointError>;

    /// Dequeue without blocking.
    fn poll(&mut self) -> Result<Option<Event>, EndpointError>;

    fn is_alive(&self) -> bool;
}

/// The display-server end.
pub trait ServerEnd: Endpoint {
    /// Suggest new dimensions to the client.
    fn display_hint(&mut self, width: u32, height: u32) -> Result<NegotiationId, EndpointError>;

    /// Send the exit event and pull the dead-man switch.
    fn terminate(&mut self);
}

/// The client end.
pub trait ClientEnd: Endpoint {
    /// Block for the next event. Must return within a bounded time once the
    /// server is gone.
    fn wait(&mut self) -> Result<Event, EndpointError>;

    fn geometry(&self) -> Geometry;

    fn request_resize(&mut self, geometry: Geometry) -> Result<NegotiationId, EndpointError>;

    fn request_subsegment(
        &mut self,
        kind: SegmentKind,
        width: u16,
        height: u16,
    ) -> Result<u32, EndpointError>;
}

/// Factory trait for creating segment pairs for testing.
pub trait SegmentFactory: Send + Sync + 'static {
    type Server: ServerEnd;
    type Client: ClientEnd;

    /// Create a segment whose rings have `capacity` slots, attach a client
    /// to it, and complete registration on both ends.
    fn connect_pair(
        capacity: u32,
    ) -> impl Future<Output = Result<(Self::Server, Self::Client), TestError>> + Send;
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

/// Poll until an event arrives, sleeping briefly between attempts.
async fn next_event<E: Endpoint>(endpoint: &mut E) -> Result<Event, TestError> {
    for _ in 0..POLL_ATTEMPTS {
        if let Some(event) = endpoint.poll()? {
            return Ok(event);
        }
        tokio::time::sleep(POLL_STEP).await;
    }
    tracing::warn!(attempts = POLL_ATTEMPTS, "gave up waiting for an event");
    Err(TestError::Assertion("no event arrived".into()))
}

async fn expect_event<E: Endpoint>(endpoint: &mut E, expected: Event) -> Result<(), TestError> {
    let got = next_event(endpoint).await?;
    ensure(got == expected, || format!("expected {:?}, got {:?}", expected, got))
}

fn step(n: i32) -> Event {
    TargetEvent::StepFrame { count: n, id: 0 }.into()
}

fn state_size(n: u32) -> Event {
    ExternalEvent::StateSize { size: n }.into()
}

// ============================================================================
// Test scenarios
// ============================================================================

/// Events come out in the order they went in, in both directions.
pub async fn run_fifo_both_directions<F: SegmentFactory>() {
    if let Err(e) = run_fifo_both_directions_inner::<F>().await {
        panic!("run_fifo_both_directions failed: {}", e);
    }
}

async fn run_fifo_both_directions_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(16).await?;

    for i in 0..10 {
        server.try_send(step(i))?;
        client.try_send(state_size(i as u32))?;
    }
    for i in 0..10 {
        expect_event(&mut client, step(i)).await?;
        expect_event(&mut server, state_size(i as u32)).await?;
    }
    ensure(client.poll()?.is_none(), || "client ring not drained".into())?;
    ensure(server.poll()?.is_none(), || "server ring not drained".into())
}

/// A ring of capacity N holds N-1 events; the next enqueue fails without
/// touching what is queued.
pub async fn run_capacity_is_one_less<F: SegmentFactory>() {
    if let Err(e) = run_capacity_is_one_less_inner::<F>().await {
        panic!("run_capacity_is_one_less failed: {}", e);
    }
}

async fn run_capacity_is_one_less_inner<F: SegmentFactory>() -> Result<(), TestError> {
    const CAPACITY: u32 = 8;
    let (mut server, mut client) = F::connect_pair(CAPACITY).await?;

    for i in 0..(CAPACITY - 1) as i32 {
        server.try_send(step(i))?;
    }
    let overflow = server.try_send(step(99));
    ensure(overflow == Err(EndpointError::Full), || {
        format!("expected a full ring, got {:?}", overflow)
    })?;
    ensure(server.is_alive(), || "full ring killed the segment".into())?;

    for i in 0..(CAPACITY - 1) as i32 {
        expect_event(&mut client, step(i)).await?;
    }
    ensure(client.poll()?.is_none(), || "event beyond capacity arrived".into())?;

    // Room again once drained.
    server.try_send(step(100))?;
    expect_event(&mut client, step(100)).await
}

/// Indices wrap around the ring many times without losing or reordering
/// events.
pub async fn run_wraparound<F: SegmentFactory>() {
    if let Err(e) = run_wraparound_inner::<F>().await {
        panic!("run_wraparound failed: {}", e);
    }
}

async fn run_wraparound_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(4).await?;

    let mut next = 0;
    for round in 0..12 {
        let batch = 1 + round % 3;
        for i in 0..batch {
            server.try_send(step(next + i))?;
            client.try_send(state_size((next + i) as u32))?;
        }
        for i in 0..batch {
            expect_event(&mut client, step(next + i)).await?;
            expect_event(&mut server, state_size((next + i) as u32)).await?;
        }
        next += batch;
    }
    Ok(())
}

/// Events queued before the server exits are still delivered, followed by
/// the exit event and then the end-of-stream result.
pub async fn run_queued_events_survive_exit<F: SegmentFactory>() {
    if let Err(e) = run_queued_events_survive_exit_inner::<F>().await {
        panic!("run_queued_events_survive_exit failed: {}", e);
    }
}

async fn run_queued_events_survive_exit_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(16).await?;

    for i in 0..3 {
        server.try_send(step(i))?;
    }
    server.terminate();
    ensure(!server.is_alive(), || "server alive after terminate".into())?;

    for i in 0..3 {
        expect_event(&mut client, step(i)).await?;
    }
    expect_event(&mut client, TargetEvent::Exit.into()).await?;
    let after = client.poll();
    ensure(after == Err(EndpointError::Dead), || {
        format!("expected end of stream, got {:?}", after)
    })?;
    ensure(!client.is_alive(), || "client alive after exit".into())
}

/// A client blocked on an empty ring returns promptly once the server is
/// gone.
pub async fn run_dead_peer_unblocks_wait<F: SegmentFactory>() {
    if let Err(e) = run_dead_peer_unblocks_wait_inner::<F>().await {
        panic!("run_dead_peer_unblocks_wait failed: {}", e);
    }
}

async fn run_dead_peer_unblocks_wait_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (server, mut client) = F::connect_pair(16).await?;

    let waiter = tokio::task::spawn_blocking(move || client.wait());
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .map_err(|_| TestError::Assertion("client still blocked after server went away".into()))?
        .map_err(|e| TestError::Setup(format!("waiter panicked: {}", e)))?;
    ensure(result == Err(EndpointError::Dead), || {
        format!("expected end of stream, got {:?}", result)
    })
}

/// An in-bounds resize is acknowledged and adopted; an out-of-bounds one is
/// rejected and leaves the segment untouched.
pub async fn run_resize_round_trip<F: SegmentFactory>() {
    if let Err(e) = run_resize_round_trip_inner::<F>().await {
        panic!("run_resize_round_trip failed: {}", e);
    }
}

async fn run_resize_round_trip_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(16).await?;
    let original = client.geometry();

    let wanted = original.with_size(640, 480);
    let negotiation = client.request_resize(wanted)?;
    expect_event(
        &mut server,
        ExternalEvent::Resize {
            negotiation,
            geometry: wanted,
        }
        .into(),
    )
    .await?;
    expect_event(
        &mut client,
        TargetEvent::ResizeAck {
            negotiation,
            geometry: wanted,
        }
        .into(),
    )
    .await?;
    ensure(client.geometry() == wanted, || {
        format!("client kept {:?} after acknowledgement", client.geometry())
    })?;

    let too_wide = wanted.with_size(100_000, 10);
    let negotiation = client.request_resize(too_wide)?;
    next_event(&mut server).await?;
    expect_event(
        &mut client,
        TargetEvent::ResizeReject {
            negotiation,
            reason: ResizeRejectReason::OutOfBounds,
        }
        .into(),
    )
    .await?;
    ensure(client.geometry() == wanted, || "rejected resize changed geometry".into())?;
    ensure(client.is_alive() && server.is_alive(), || {
        "rejected resize killed the segment".into()
    })?;

    // Negotiation is over; the next request goes through again.
    client.request_resize(original)?;
    Ok(())
}

/// A refused subsegment request is answered with its own id.
pub async fn run_subsegment_reject<F: SegmentFactory>() {
    if let Err(e) = run_subsegment_reject_inner::<F>().await {
        panic!("run_subsegment_reject failed: {}", e);
    }
}

async fn run_subsegment_reject_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(16).await?;

    let id = client.request_subsegment(SegmentKind::Debug, 64, 64)?;
    next_event(&mut server).await?;
    expect_event(&mut client, TargetEvent::ReqFail { tag: id }.into()).await?;

    let again = client.request_subsegment(SegmentKind::Debug, 64, 64)?;
    ensure(again != id, || "request id reused".into())
}

/// Display hints still queued behind a newer one are skipped.
pub async fn run_display_hints_coalesce<F: SegmentFactory>() {
    if let Err(e) = run_display_hints_coalesce_inner::<F>().await {
        panic!("run_display_hints_coalesce failed: {}", e);
    }
}

async fn run_display_hints_coalesce_inner<F: SegmentFactory>() -> Result<(), TestError> {
    let (mut server, mut client) = F::connect_pair(16).await?;

    server.display_hint(100, 100)?;
    server.try_send(step(1))?;
    server.display_hint(200, 200)?;
    let last = server.display_hint(300, 300)?;

    expect_event(&mut client, step(1)).await?;
    expect_event(
        &mut client,
        TargetEvent::DisplayHint {
            width: 300,
            height: 300,
            negotiation: last,
        }
        .into(),
    )
    .await?;
    ensure(client.poll()?.is_none(), || "superseded hint delivered".into())
}
