//! Reference model of the segment lifecycle, run against the real
//! `Lifecycle`.
//!
//! The reference is the transition table written out as a `match`; the
//! harness applies the same operations to both and requires identical
//! results and states after every step.

use std::collections::HashMap;

use shmif_transport_shm::{DeathCause, Lifecycle, SegmentState, SubsegmentState};

pub const CAUSES: [DeathCause; 5] = [
    DeathCause::Exit,
    DeathCause::PeerGone,
    DeathCause::ProtocolViolation,
    DeathCause::ResizeFailed,
    DeathCause::Migrated,
];

/// Operations that can be applied to a lifecycle.
#[derive(Clone, Copy, Debug)]
pub enum LifecycleOp {
    Map,
    Activate,
    BeginResize,
    FinishResize,
    Kill(DeathCause),
    Request(u32),
    Resolve { id: u32, accepted: bool },
}

/// The table itself.
#[derive(Debug, Default)]
pub struct LifecycleModel {
    state: SegmentState,
    requests: HashMap<u32, SubsegmentState>,
}

impl LifecycleModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Apply `op`; `false` if the table does not allow it.
    pub fn apply(&mut self, op: LifecycleOp) -> bool {
        use SegmentState::*;

        let next = match (self.state, op) {
            (Unmapped, LifecycleOp::Map) => Pending,
            (Pending, LifecycleOp::Activate) => Active,
            (Active, LifecycleOp::BeginResize) => Resizing,
            (Resizing, LifecycleOp::FinishResize) => Active,
            (Dead(first), LifecycleOp::Kill(_)) => Dead(first),
            (_, LifecycleOp::Kill(cause)) => Dead(cause),
            (Active | Resizing, LifecycleOp::Request(id)) => {
                if self.requests.get(&id) == Some(&SubsegmentState::Requested) {
                    return false;
                }
                self.requests.insert(id, SubsegmentState::Requested);
                return true;
            }
            (_, LifecycleOp::Resolve { id, accepted }) => {
                return match self.requests.get_mut(&id) {
                    Some(state @ SubsegmentState::Requested) => {
                        *state = if accepted {
                            SubsegmentState::Accepted
                        } else {
                            SubsegmentState::Rejected
                        };
                        true
                    }
                    _ => false,
                };
            }
            _ => return false,
        };
        self.state = next;
        true
    }

    pub fn request(&self, id: u32) -> Option<SubsegmentState> {
        self.requests.get(&id).copied()
    }
}

fn apply_real(lifecycle: &mut Lifecycle, op: LifecycleOp) -> bool {
    match op {
        LifecycleOp::Map => lifecycle.map().is_ok(),
        LifecycleOp::Activate => lifecycle.activate().is_ok(),
        LifecycleOp::BeginResize => lifecycle.begin_resize().is_ok(),
        LifecycleOp::FinishResize => lifecycle.finish_resize().is_ok(),
        LifecycleOp::Kill(cause) => {
            lifecycle.kill(cause);
            true
        }
        LifecycleOp::Request(id) => lifecycle.request_subsegment(id).is_ok(),
        LifecycleOp::Resolve { id, accepted } => lifecycle.resolve_subsegment(id, accepted).is_ok(),
    }
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(ops: &[LifecycleOp]) -> Result<(), String> {
    let mut real = Lifecycle::new();
    let mut model = LifecycleModel::new();
    let mut first_death: Option<DeathCause> = None;

    for (i, op) in ops.iter().enumerate() {
        let before = real.state();
        let ok_real = apply_real(&mut real, *op);
        let ok_model = model.apply(*op);

        if ok_real != ok_model {
            return Err(format!(
                "op {} ({:?}) from {}: real {} but table {}",
                i,
                op,
                before,
                if ok_real { "allowed" } else { "refused" },
                if ok_model { "allows" } else { "refuses" }
            ));
        }
        if real.state() != model.state() {
            return Err(format!(
                "op {} ({:?}): real in {} but table in {}",
                i,
                op,
                real.state(),
                model.state()
            ));
        }

        // Dead is terminal and keeps its first cause.
        if let Some(first) = first_death {
            if real.state() != SegmentState::Dead(first) {
                return Err(format!("op {}: left Dead({}) for {}", i, first, real.state()));
            }
        } else if let SegmentState::Dead(cause) = real.state() {
            first_death = Some(cause);
        }

        if real.buffers_usable() != (real.state() == SegmentState::Active) {
            return Err(format!("op {}: buffers usable in {}", i, real.state()));
        }

        if let LifecycleOp::Request(id) | LifecycleOp::Resolve { id, .. } = op {
            if real.subsegment(*id) != model.request(*id) {
                return Err(format!(
                    "op {}: request {} is {:?} but table has {:?}",
                    i,
                    id,
                    real.subsegment(*id),
                    model.request(*id)
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_happy_path() {
        let ops = [
            LifecycleOp::Map,
            LifecycleOp::Activate,
            LifecycleOp::BeginResize,
            LifecycleOp::Request(1),
            LifecycleOp::FinishResize,
            LifecycleOp::Resolve { id: 1, accepted: true },
            LifecycleOp::Kill(DeathCause::Exit),
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn illegal_moves_are_refused_alike() {
        let ops = [
            LifecycleOp::Activate,
            LifecycleOp::FinishResize,
            LifecycleOp::Request(3),
            LifecycleOp::Map,
            LifecycleOp::Map,
            LifecycleOp::BeginResize,
            LifecycleOp::Resolve { id: 9, accepted: false },
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn first_cause_sticks() {
        let ops = [
            LifecycleOp::Map,
            LifecycleOp::Kill(DeathCause::PeerGone),
            LifecycleOp::Kill(DeathCause::Exit),
            LifecycleOp::Activate,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
