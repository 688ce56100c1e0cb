//! Two-party model of resize negotiation.
//!
//! Both ends run the real `Lifecycle` and the real geometry checks and
//! layout computation; only the shared page and the rings are replaced by
//! in-memory queues. The server side follows the segment's sizing rules:
//! hard limits, the byte ceiling, and skipping shrinks that give back too
//! little to be worth a remap.

use std::collections::{HashMap, VecDeque};

use shmif_core::{Geometry, ResizeRejectReason};
use shmif_transport_shm::layout::check_geometry;
use shmif_transport_shm::{Lifecycle, SegmentLayout, SegmentState, DEFAULT_RING_CAPACITY};

/// Shrinks giving back less than 1/SHRINK_DIVISOR of the mapping keep it.
const SHRINK_DIVISOR: usize = 5;

/// A byte ceiling small enough that generated sizes cross it.
pub const MODEL_MAX_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub enum NegotiationOp {
    /// The client asks for new dimensions on its own.
    ClientRequest { width: u16, height: u16 },
    /// The server suggests dimensions; the client follows when it reads it.
    ServerHint { width: u16, height: u16 },
    /// The server handles one queued message.
    ServerPoll,
    /// The client handles one queued message.
    ClientPoll,
}

#[derive(Debug)]
enum ToServer {
    Resize { id: u32, geometry: Geometry },
}

#[derive(Debug)]
enum ToClient {
    Ack { id: u32, geometry: Geometry },
    Reject { id: u32, reason: ResizeRejectReason },
    Hint { width: u32, height: u32 },
}

struct ClientModel {
    lifecycle: Lifecycle,
    geometry: Geometry,
    pending: Option<u32>,
    next_id: u32,
}

impl ClientModel {
    fn new() -> Result<Self, String> {
        let mut lifecycle = Lifecycle::new();
        lifecycle.map().map_err(|e| e.to_string())?;
        lifecycle.activate().map_err(|e| e.to_string())?;
        Ok(Self {
            lifecycle,
            geometry: Geometry::default(),
            pending: None,
            next_id: 1,
        })
    }

    /// Start a request; `None` if one is already outstanding.
    fn request(&mut self) -> Option<u32> {
        self.lifecycle.begin_resize().ok()?;
        let id = self.next_id;
        self.next_id += 1;
        self.pending = Some(id);
        Some(id)
    }
}

struct ServerModel {
    geometry: Geometry,
    mapped: usize,
}

impl ServerModel {
    fn new() -> Result<Self, String> {
        let geometry = Geometry::default();
        let layout = SegmentLayout::compute(DEFAULT_RING_CAPACITY, &geometry).map_err(|e| e.to_string())?;
        Ok(Self {
            geometry,
            mapped: layout.total,
        })
    }

    fn resize(&mut self, requested: Geometry) -> Result<(), ResizeRejectReason> {
        check_geometry(&requested).map_err(|_| ResizeRejectReason::OutOfBounds)?;
        let layout = SegmentLayout::compute(DEFAULT_RING_CAPACITY, &requested)
            .map_err(|_| ResizeRejectReason::OutOfBounds)?;
        if layout.total > MODEL_MAX_BYTES {
            return Err(ResizeRejectReason::TooLarge);
        }
        let small_shrink =
            layout.total <= self.mapped && (self.mapped - layout.total) * SHRINK_DIVISOR < self.mapped;
        if !small_shrink {
            self.mapped = layout.total;
        }
        self.geometry = requested;
        Ok(())
    }
}

struct World {
    client: ClientModel,
    server: ServerModel,
    to_server: VecDeque<ToServer>,
    to_client: VecDeque<ToClient>,
    /// Answers seen per request id.
    answers: HashMap<u32, u32>,
}

impl World {
    fn client_request(&mut self, width: u32, height: u32) {
        let geometry = self.client.geometry.with_size(width, height);
        if let Some(id) = self.client.request() {
            self.answers.insert(id, 0);
            self.to_server.push_back(ToServer::Resize { id, geometry });
        }
    }

    fn server_poll(&mut self) {
        let Some(ToServer::Resize { id, geometry }) = self.to_server.pop_front() else {
            return;
        };
        let answer = match self.server.resize(geometry) {
            Ok(()) => ToClient::Ack {
                id,
                geometry: self.server.geometry,
            },
            Err(reason) => ToClient::Reject { id, reason },
        };
        self.to_client.push_back(answer);
    }

    fn client_poll(&mut self) -> Result<(), String> {
        let Some(message) = self.to_client.pop_front() else {
            return Ok(());
        };
        match message {
            ToClient::Ack { id, geometry } => {
                self.answer(id)?;
                if self.server.geometry != geometry {
                    return Err(format!("ack {} carries {:?}, server has {:?}", id, geometry, self.server.geometry));
                }
                self.client.geometry = geometry;
                self.client.lifecycle.finish_resize().map_err(|e| e.to_string())?;
            }
            ToClient::Reject { id, reason } => {
                self.answer(id)?;
                if reason == ResizeRejectReason::AllocationFailed {
                    return Err(format!("request {}: allocation failure without allocation", id));
                }
                self.client.lifecycle.finish_resize().map_err(|e| e.to_string())?;
            }
            ToClient::Hint { width, height } => self.client_request(width, height),
        }
        Ok(())
    }

    fn answer(&mut self, id: u32) -> Result<(), String> {
        if self.client.pending != Some(id) {
            return Err(format!("answer for {} while {:?} is pending", id, self.client.pending));
        }
        self.client.pending = None;
        let count = self.answers.entry(id).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Err(format!("request {} answered {} times", id, count));
        }
        Ok(())
    }

    fn verify(&self, op_idx: usize) -> Result<(), String> {
        let state = self.client.lifecycle.state();
        let expected = if self.client.pending.is_some() {
            SegmentState::Resizing
        } else {
            SegmentState::Active
        };
        if state != expected {
            return Err(format!(
                "after op {}: client {} with pending {:?}",
                op_idx, state, self.client.pending
            ));
        }
        if self.client.lifecycle.buffers_usable() == self.client.pending.is_some() {
            return Err(format!("after op {}: buffers usable mid-resize", op_idx));
        }

        let outstanding = self.to_server.len()
            + self
                .to_client
                .iter()
                .filter(|m| !matches!(m, ToClient::Hint { .. }))
                .count();
        if outstanding > 1 {
            return Err(format!("after op {}: {} resizes in flight", op_idx, outstanding));
        }

        let geometry = self.server.geometry;
        check_geometry(&geometry).map_err(|e| format!("after op {}: server geometry {}", op_idx, e))?;
        let layout = SegmentLayout::compute(DEFAULT_RING_CAPACITY, &geometry).map_err(|e| e.to_string())?;
        if layout.total > MODEL_MAX_BYTES {
            return Err(format!("after op {}: {} bytes over the ceiling", op_idx, layout.total));
        }
        if self.server.mapped < layout.total {
            return Err(format!(
                "after op {}: mapped {} but layout needs {}",
                op_idx, self.server.mapped, layout.total
            ));
        }
        Ok(())
    }
}

/// Execute a sequence of operations, then let both sides drain, verifying
/// invariants throughout.
pub fn execute_and_verify(ops: &[NegotiationOp]) -> Result<(), String> {
    let mut world = World {
        client: ClientModel::new()?,
        server: ServerModel::new()?,
        to_server: VecDeque::new(),
        to_client: VecDeque::new(),
        answers: HashMap::new(),
    };

    for (i, op) in ops.iter().enumerate() {
        match *op {
            NegotiationOp::ClientRequest { width, height } => {
                world.client_request(u32::from(width), u32::from(height))
            }
            NegotiationOp::ServerHint { width, height } => world.to_client.push_back(ToClient::Hint {
                width: u32::from(width),
                height: u32::from(height),
            }),
            NegotiationOp::ServerPoll => world.server_poll(),
            NegotiationOp::ClientPoll => world.client_poll()?,
        }
        world.verify(i)?;
    }

    // Quiescence: hints can start new requests, which always finish.
    while !world.to_server.is_empty() || !world.to_client.is_empty() {
        world.server_poll();
        world.client_poll()?;
        world.verify(ops.len())?;
    }

    if world.client.geometry != world.server.geometry {
        return Err(format!(
            "quiescent with client at {:?} and server at {:?}",
            world.client.geometry, world.server.geometry
        ));
    }
    if let Some((id, count)) = world.answers.iter().find(|(_, count)| **count != 1) {
        return Err(format!("request {} answered {} times", id, count));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_and_rejected_requests() {
        let ops = [
            NegotiationOp::ClientRequest { width: 640, height: 480 },
            NegotiationOp::ClientRequest { width: 800, height: 600 },
            NegotiationOp::ServerPoll,
            NegotiationOp::ClientPoll,
            NegotiationOp::ClientRequest { width: 0, height: 480 },
            NegotiationOp::ServerPoll,
            NegotiationOp::ClientPoll,
            NegotiationOp::ClientRequest { width: 4096, height: 2048 },
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn hints_turn_into_requests() {
        let ops = [
            NegotiationOp::ServerHint { width: 320, height: 200 },
            NegotiationOp::ServerHint { width: 1024, height: 768 },
            NegotiationOp::ClientPoll,
            NegotiationOp::ClientPoll,
            NegotiationOp::ServerPoll,
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn small_shrink_keeps_the_mapping() {
        let mut server = ServerModel::new().unwrap();
        server.resize(Geometry::default().with_size(1000, 1000)).unwrap();
        let big = server.mapped;
        server.resize(Geometry::default().with_size(990, 990)).unwrap();
        assert_eq!(server.mapped, big);
        server.resize(Geometry::default().with_size(100, 100)).unwrap();
        assert!(server.mapped < big);
    }
}
