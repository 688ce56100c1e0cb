//! Bolero fuzzer for the event ring against a hostile consumer.
//!
//! Properties tested:
//! - FIFO ordering is preserved while both sides are honest
//! - At most capacity - 1 records are ever queued
//! - Private indices stay below capacity whatever the peer writes
//! - A trusted producer rejects out-of-range indices instead of using them

use bolero::check;
use shmif_fuzz::ring_model::{execute_and_verify, RingOp, MAX_CAPACITY, MIN_CAPACITY};
use shmif_transport_shm::Trust;

fn main() {
    check!()
        .with_type::<(u8, bool, Vec<(u8, u32)>)>()
        .for_each(|(capacity_byte, trusted, ops_data)| {
            // Any capacity, not only powers of two.
            let capacity = (*capacity_byte as u32 % (MAX_CAPACITY - MIN_CAPACITY + 1)) + MIN_CAPACITY;
            let trust = if *trusted { Trust::Trusted } else { Trust::Untrusted };

            // Scribbles are rare so most runs stay predictable.
            let ops: Vec<RingOp> = ops_data
                .iter()
                .map(|(kind, value)| match kind % 16 {
                    0 => RingOp::Scribble(*value),
                    1..=7 => RingOp::Push(*value),
                    _ => RingOp::Pop,
                })
                .collect();

            if let Err(e) = execute_and_verify(capacity, trust, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use shmif_fuzz::ring_model::{execute_and_verify, RingOp};
    use shmif_transport_shm::Trust;

    #[test]
    fn fuzz_ring_basic() {
        let ops = vec![
            RingOp::Push(1),
            RingOp::Push(2),
            RingOp::Pop,
            RingOp::Push(3),
            RingOp::Pop,
            RingOp::Pop,
        ];
        execute_and_verify(4, Trust::Trusted, &ops).unwrap();
    }

    #[test]
    fn fuzz_ring_scribbled_front() {
        let ops = vec![
            RingOp::Push(1),
            RingOp::Scribble(3),
            RingOp::Push(2),
            RingOp::Scribble(u32::MAX),
            RingOp::Push(3),
            RingOp::Pop,
        ];
        execute_and_verify(5, Trust::Untrusted, &ops).unwrap();
        execute_and_verify(5, Trust::Trusted, &ops).unwrap();
    }
}
