//! Differential model of the event ring.
//!
//! A real `EventRing` over heap memory runs next to a `VecDeque`. On top of
//! the honest producer and consumer, a hostile peer may scribble the
//! consumer-owned `front` index on the page, which is what the producer's
//! trust mode has to defend against.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use shmif_core::{Event, RawEvent, TargetEvent};
use shmif_transport_shm::layout::RingHeader;
use shmif_transport_shm::{EventRing, RingError, Trust};

/// Smallest capacity with a usable slot.
pub const MIN_CAPACITY: u32 = 2;
/// Largest capacity the harnesses use (small to hit wraparound often).
pub const MAX_CAPACITY: u32 = 64;

/// Ring storage on the heap, standing in for the shared mapping.
pub struct HeapRing {
    header: Box<RingHeader>,
    slots: Vec<RawEvent>,
    capacity: u32,
}

impl HeapRing {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            header: Box::new(RingHeader::new(capacity)),
            slots: vec![RawEvent::zeroed(); capacity as usize],
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// A view of the ring. Views stay valid while `self` lives.
    pub fn view(&mut self, trust: Trust) -> EventRing {
        let header: *mut RingHeader = &mut *self.header;
        // SAFETY: the header is initialized, `slots` holds `capacity`
        // records, and both are owned by `self`, which outlives every view
        // in this module.
        unsafe { EventRing::from_raw(header, self.slots.as_mut_ptr(), self.capacity, trust) }
    }

    /// What a hostile consumer can do: overwrite its published index.
    pub fn scribble_front(&self, value: u32) {
        self.header.front.store(value, Ordering::Release);
    }
}

fn record(id: u32) -> RawEvent {
    Event::Target(TargetEvent::StepFrame {
        count: id as i32,
        id: 0,
    })
    .encode()
}

fn id_of(raw: &RawEvent) -> Option<u32> {
    match Event::decode(raw) {
        Ok(Event::Target(TargetEvent::StepFrame { count, .. })) => Some(count as u32),
        _ => None,
    }
}

/// Operations that can be performed on the ring.
#[derive(Clone, Copy, Debug)]
pub enum RingOp {
    Push(u32),
    Pop,
    /// The consumer overwrites its published index with this value.
    Scribble(u32),
}

/// Execute a sequence of operations and verify invariants.
///
/// `producer_trust` is how the producer treats the consumer-owned index;
/// the consumer always uses the opposite mode.
pub fn execute_and_verify(capacity: u32, producer_trust: Trust, ops: &[RingOp]) -> Result<(), String> {
    let mut heap = HeapRing::new(capacity);
    let capacity = heap.capacity();
    let consumer_trust = match producer_trust {
        Trust::Trusted => Trust::Untrusted,
        Trust::Untrusted => Trust::Trusted,
    };
    let producer = heap.view(producer_trust);
    let consumer = heap.view(consumer_trust);

    let mut back = 0u32;
    let mut front = 0u32;
    let mut expected: VecDeque<u32> = VecDeque::new();
    // The page front no longer matches the consumer's own index.
    let mut scribbled: Option<u32> = None;
    // Contents can no longer be predicted; only bounds are checked.
    let mut tainted = false;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            RingOp::Push(id) => match producer.try_push(&mut back, &record(id)) {
                Ok(free) => {
                    if let Some(v) = scribbled.filter(|v| *v >= capacity) {
                        if producer_trust == Trust::Trusted {
                            return Err(format!("op {}: trusted push accepted front {}", i, v));
                        }
                    }
                    if !tainted {
                        expected.push_back(id);
                        if expected.len() > (capacity - 1) as usize {
                            return Err(format!("op {}: {} records in a ring of {}", i, expected.len(), capacity));
                        }
                        let want = capacity - 1 - expected.len() as u32;
                        if free != want {
                            return Err(format!("op {}: push reported {} free, expected {}", i, free, want));
                        }
                    }
                }
                Err(RingError::Full) => {
                    if !tainted && expected.len() != (capacity - 1) as usize {
                        return Err(format!(
                            "op {}: full with {} of {} usable slots taken",
                            i,
                            expected.len(),
                            capacity - 1
                        ));
                    }
                }
                Err(RingError::IndexOutOfBounds { index, .. }) => {
                    let legit = producer_trust == Trust::Trusted
                        && index >= capacity
                        && scribbled == Some(index);
                    if !legit {
                        return Err(format!("op {}: unexpected index violation at {}", i, index));
                    }
                }
            },
            RingOp::Pop => match consumer.pop(&mut front) {
                Ok(Some(raw)) => {
                    // Popping republishes the consumer's real index.
                    scribbled = None;
                    if !tainted {
                        let got = id_of(&raw);
                        let want = expected.pop_front();
                        if got != want {
                            return Err(format!("op {}: popped {:?}, expected {:?}", i, got, want));
                        }
                    }
                }
                Ok(None) => {
                    if !tainted && !expected.is_empty() {
                        return Err(format!("op {}: empty with {} queued", i, expected.len()));
                    }
                }
                Err(e) => return Err(format!("op {}: honest producer index rejected: {}", i, e)),
            },
            RingOp::Scribble(value) => {
                heap.scribble_front(value);
                scribbled = (value != front).then_some(value);
                // A trusted producer refuses out-of-range values outright;
                // anything else it acts on moves its idea of free space.
                let refused = producer_trust == Trust::Trusted && value >= capacity;
                if scribbled.is_some() && !refused {
                    tainted = true;
                }
            }
        }

        verify_ring_invariants(&producer, capacity, back, front, &expected, tainted, scribbled, i)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn verify_ring_invariants(
    ring: &EventRing,
    capacity: u32,
    back: u32,
    front: u32,
    expected: &VecDeque<u32>,
    tainted: bool,
    scribbled: Option<u32>,
    op_idx: usize,
) -> Result<(), String> {
    // Private indices never leave the ring, whatever the peer wrote.
    if back >= capacity || front >= capacity {
        return Err(format!(
            "after op {}: index out of range (front {}, back {}, capacity {})",
            op_idx, front, back, capacity
        ));
    }

    // The published back is always the producer's own.
    if ring.published_back() != back {
        return Err(format!(
            "after op {}: published back {} but producer holds {}",
            op_idx,
            ring.published_back(),
            back
        ));
    }

    let status = ring.status();
    if status.len > capacity - 1 {
        return Err(format!("after op {}: status len {} over {}", op_idx, status.len, capacity - 1));
    }

    if !tainted && scribbled.is_none() && status.len as usize != expected.len() {
        return Err(format!(
            "after op {}: status len {} but {} expected",
            op_idx,
            status.len,
            expected.len()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_to_capacity_minus_one() {
        let mut ops: Vec<RingOp> = (0..4).map(RingOp::Push).collect();
        ops.extend([RingOp::Pop, RingOp::Push(4), RingOp::Push(5)]);
        ops.extend(std::iter::repeat(RingOp::Pop).take(5));
        execute_and_verify(4, Trust::Trusted, &ops).unwrap();
    }

    #[test]
    fn trusted_producer_refuses_out_of_range_front() {
        let ops = [
            RingOp::Push(1),
            RingOp::Scribble(1000),
            RingOp::Push(2),
            RingOp::Pop,
            RingOp::Push(3),
            RingOp::Pop,
        ];
        execute_and_verify(8, Trust::Trusted, &ops).unwrap();
    }

    #[test]
    fn untrusted_producer_survives_garbage() {
        let mut ops = vec![RingOp::Scribble(u32::MAX)];
        for i in 0..40 {
            ops.push(RingOp::Push(i));
            if i % 3 == 0 {
                ops.push(RingOp::Scribble(i * 7919));
                ops.push(RingOp::Pop);
            }
        }
        execute_and_verify(8, Trust::Untrusted, &ops).unwrap();
    }

    #[test]
    fn wraps_many_times() {
        let mut ops = Vec::new();
        for round in 0..20 {
            for i in 0..3 {
                ops.push(RingOp::Push(round * 3 + i));
            }
            ops.extend([RingOp::Pop; 3]);
        }
        execute_and_verify(4, Trust::Trusted, &ops).unwrap();
    }
}
