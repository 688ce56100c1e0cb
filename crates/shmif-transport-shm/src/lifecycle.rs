//! Segment lifecycle and negotiation state.
//!
//! ```text
//!  Unmapped ──map──▶ Pending ──activate──▶ Active ◀──finish──┐
//!                       │                    │ begin_resize   │
//!                       │                    ▼                │
//!                       │                 Resizing ───────────┘
//!                       └───────── kill ─────┴────▶ Dead(cause)
//! ```
//!
//! `Dead` is terminal and remembers the first cause. Subsegment requests
//! are tracked by id alongside the main state.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeathCause {
    /// Explicit termination event.
    Exit,
    /// Dead-man switch or guard noticed the peer is gone.
    PeerGone,
    /// The peer broke the protocol badly enough to stop trusting it.
    ProtocolViolation,
    /// A resize could not be carried out and the old buffers are gone.
    ResizeFailed,
    /// The client moved to another segment.
    Migrated,
}

impl fmt::Display for DeathCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exit => "exit",
            Self::PeerGone => "peer gone",
            Self::ProtocolViolation => "protocol violation",
            Self::ResizeFailed => "resize failed",
            Self::Migrated => "migrated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SegmentState {
    #[default]
    Unmapped,
    Pending,
    Active,
    Resizing,
    Dead(DeathCause),
}

impl SegmentState {
    #[inline]
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead(_))
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped => f.write_str("unmapped"),
            Self::Pending => f.write_str("pending"),
            Self::Active => f.write_str("active"),
            Self::Resizing => f.write_str("resizing"),
            Self::Dead(cause) => write!(f, "dead ({})", cause),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsegmentState {
    Requested,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    InvalidTransition {
        from: SegmentState,
        to: SegmentState,
    },
    /// No subsegment request with this id is outstanding.
    UnknownRequest(u32),
    /// A request with this id is already outstanding.
    DuplicateRequest(u32),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {} -> {}", from, to)
            }
            Self::UnknownRequest(id) => write!(f, "no outstanding subsegment request {}", id),
            Self::DuplicateRequest(id) => write!(f, "subsegment request {} already outstanding", id),
        }
    }
}

impl std::error::Error for LifecycleError {}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: SegmentState,
    subsegments: HashMap<u32, SubsegmentState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    fn transition(&mut self, from: SegmentState, to: SegmentState) -> Result<(), LifecycleError> {
        let current = self.state();
        if current != from {
            return Err(LifecycleError::InvalidTransition { from: current, to });
        }
        tracing::debug!(from = %current, to = %to, "segment state");
        self.state = to;
        Ok(())
    }

    /// Unmapped → Pending.
    pub fn map(&mut self) -> Result<(), LifecycleError> {
        self.transition(SegmentState::Unmapped, SegmentState::Pending)
    }

    /// Pending → Active.
    pub fn activate(&mut self) -> Result<(), LifecycleError> {
        self.transition(SegmentState::Pending, SegmentState::Active)
    }

    /// Active → Resizing.
    pub fn begin_resize(&mut self) -> Result<(), LifecycleError> {
        self.transition(SegmentState::Active, SegmentState::Resizing)
    }

    /// Resizing → Active, whether the new geometry was accepted or the old
    /// one stays.
    pub fn finish_resize(&mut self) -> Result<(), LifecycleError> {
        self.transition(SegmentState::Resizing, SegmentState::Active)
    }

    /// Any state → Dead. Idempotent; the first cause sticks.
    pub fn kill(&mut self, cause: DeathCause) {
        if let SegmentState::Dead(first) = self.state() {
            tracing::trace!(%first, ignored = %cause, "segment already dead");
            return;
        }
        tracing::debug!(from = %self.state(), %cause, "segment dead");
        self.state = SegmentState::Dead(cause);
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state().is_dead()
    }

    /// Whether buffers may be read or written at the current geometry.
    #[inline]
    pub fn buffers_usable(&self) -> bool {
        self.state() == SegmentState::Active
    }

    /// Record an outgoing subsegment request. Valid while Active or Resizing.
    pub fn request_subsegment(&mut self, id: u32) -> Result<(), LifecycleError> {
        let state = self.state();
        if !matches!(state, SegmentState::Active | SegmentState::Resizing) {
            return Err(LifecycleError::InvalidTransition {
                from: state,
                to: state,
            });
        }
        if self.subsegments.get(&id) == Some(&SubsegmentState::Requested) {
            return Err(LifecycleError::DuplicateRequest(id));
        }
        self.subsegments.insert(id, SubsegmentState::Requested);
        Ok(())
    }

    /// Requested → Accepted | Rejected.
    pub fn resolve_subsegment(&mut self, id: u32, accepted: bool) -> Result<(), LifecycleError> {
        match self.subsegments.get_mut(&id) {
            Some(state @ SubsegmentState::Requested) => {
                *state = if accepted {
                    SubsegmentState::Accepted
                } else {
                    SubsegmentState::Rejected
                };
                Ok(())
            }
            _ => Err(LifecycleError::UnknownRequest(id)),
        }
    }

    pub fn subsegment(&self, id: u32) -> Option<SubsegmentState> {
        self.subsegments.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.state(), SegmentState::Unmapped);
        lc.map().unwrap();
        lc.activate().unwrap();
        assert!(lc.buffers_usable());
        lc.begin_resize().unwrap();
        assert!(!lc.buffers_usable());
        lc.finish_resize().unwrap();
        assert_eq!(lc.state(), SegmentState::Active);
    }

    #[test]
    fn resize_needs_active() {
        let mut lc = Lifecycle::new();
        lc.map().unwrap();
        assert_eq!(
            lc.begin_resize(),
            Err(LifecycleError::InvalidTransition {
                from: SegmentState::Pending,
                to: SegmentState::Resizing
            })
        );
        assert!(lc.activate().is_ok());
        assert!(lc.activate().is_err());
    }

    #[test]
    fn dead_is_terminal_and_keeps_first_cause() {
        let mut lc = Lifecycle::new();
        lc.map().unwrap();
        lc.kill(DeathCause::PeerGone);
        lc.kill(DeathCause::Exit);
        assert_eq!(lc.state(), SegmentState::Dead(DeathCause::PeerGone));
        assert!(lc.activate().is_err());
        assert!(lc.map().is_err());
    }

    #[test]
    fn subsegment_flow() {
        let mut lc = Lifecycle::new();
        assert!(lc.request_subsegment(1).is_err());
        lc.map().unwrap();
        lc.activate().unwrap();

        lc.request_subsegment(1).unwrap();
        lc.request_subsegment(2).unwrap();
        assert_eq!(lc.request_subsegment(1), Err(LifecycleError::DuplicateRequest(1)));

        lc.resolve_subsegment(1, true).unwrap();
        lc.resolve_subsegment(2, false).unwrap();
        assert_eq!(lc.subsegment(1), Some(SubsegmentState::Accepted));
        assert_eq!(lc.subsegment(2), Some(SubsegmentState::Rejected));

        assert_eq!(lc.resolve_subsegment(2, true), Err(LifecycleError::UnknownRequest(2)));
        assert_eq!(lc.resolve_subsegment(9, true), Err(LifecycleError::UnknownRequest(9)));
    }
}
