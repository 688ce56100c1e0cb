//! Bolero fuzzer for resize negotiation between server and client.
//!
//! Properties tested:
//! - At most one resize is in flight, and buffers are unusable meanwhile
//! - Every request is answered exactly once, with its own id
//! - The server never exceeds the hard limits or the byte ceiling
//! - Both sides agree on the geometry once all messages are handled

use bolero::check;
use shmif_fuzz::negotiation_model::{execute_and_verify, NegotiationOp};

fn main() {
    check!()
        .with_type::<Vec<(u8, u16, u16)>>()
        .for_each(|ops_data| {
            let ops: Vec<NegotiationOp> = ops_data
                .iter()
                .map(|(kind, width, height)| {
                    // Mostly plausible sizes, occasionally anything.
                    let (width, height) = if kind & 0x80 == 0 {
                        (width % 2048, height % 1024)
                    } else {
                        (*width, *height)
                    };
                    match kind % 4 {
                        0 => NegotiationOp::ClientRequest { width, height },
                        1 => NegotiationOp::ServerHint { width, height },
                        2 => NegotiationOp::ServerPoll,
                        _ => NegotiationOp::ClientPoll,
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
    use shmif_fuzz::negotiation_model::{execute_and_verify, NegotiationOp};

    #[test]
    fn fuzz_negotiation_basic() {
        let ops = vec![
            NegotiationOp::ServerHint { width: 640, height: 480 },
            NegotiationOp::ClientRequest { width: 100, height: 100 },
            NegotiationOp::ServerPoll,
            NegotiationOp::ClientPoll,
            NegotiationOp::ClientPoll,
            NegotiationOp::ServerPoll,
            NegotiationOp::ClientPoll,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
