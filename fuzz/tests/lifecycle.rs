//! Bolero fuzzer for the segment lifecycle.
//!
//! Properties tested:
//! - Every transition agrees with the reference table
//! - Dead is terminal and keeps its first cause
//! - Buffers are usable exactly while Active
//! - Subsegment requests resolve once

use bolero::check;
use shmif_fuzz::lifecycle_model::{execute_and_verify, LifecycleOp, CAUSES};

fn main() {
    check!()
        .with_type::<Vec<(u8, u8, bool)>>()
        .for_each(|ops_data| {
            let ops: Vec<LifecycleOp> = ops_data
                .iter()
                .map(|(kind, arg, flag)| {
                    // Few ids, so requests collide and resolve often.
                    let id = u32::from(*arg % 4);
                    match kind % 8 {
                        0 => LifecycleOp::Map,
                        1 => LifecycleOp::Activate,
                        2 => LifecycleOp::BeginResize,
                        3 => LifecycleOp::FinishResize,
                        4 if *flag => LifecycleOp::Kill(CAUSES[*arg as usize % CAUSES.len()]),
                        4 | 5 => LifecycleOp::Request(id),
                        _ => LifecycleOp::Resolve {
                            id,
                            accepted: *flag,
                        },
                    }
                })
                .collect();

            if let Err(e) = execute_and_verify(&ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use shmif_fuzz::lifecycle_model::{execute_and_verify, LifecycleOp};
    use shmif_transport_shm::DeathCause;

    #[test]
    fn fuzz_lifecycle_basic() {
        let ops = vec![
            LifecycleOp::Map,
            LifecycleOp::Activate,
            LifecycleOp::Request(0),
            LifecycleOp::Request(0),
            LifecycleOp::BeginResize,
            LifecycleOp::Resolve { id: 0, accepted: false },
            LifecycleOp::Request(0),
            LifecycleOp::Kill(DeathCause::ResizeFailed),
            LifecycleOp::FinishResize,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
