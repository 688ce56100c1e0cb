//! Which events travel with an OS-level descriptor.
//!
//! Descriptors themselves never cross the shared page; they ride a separate
//! control channel. The record only carries a slot word in `ioevs[0]`
//! telling the receiver whether one is waiting for it. The sender's value in
//! that word is not a descriptor number in the receiver's table.

use crate::event::{Category, RawEvent};
use crate::target::TargetKind;

/// Slot value meaning "operation available, no descriptor attached".
pub const BADFD: i32 = -1;

/// Wire value written for an attached descriptor.
pub(crate) const ATTACHED: i32 = 0;

/// Presence of a descriptor alongside a descriptor-carrying event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleSlot {
    /// A descriptor was pushed on the control channel before this event.
    Attached,
    /// The operation is available but there is no data to go with it.
    /// A valid state, not an error.
    Empty,
}

impl HandleSlot {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            Self::Attached => ATTACHED,
            Self::Empty => BADFD,
        }
    }

    pub(crate) fn from_wire(v: i32) -> Option<Self> {
        match v {
            BADFD => Some(Self::Empty),
            v if v >= 0 => Some(Self::Attached),
            _ => None,
        }
    }

    #[inline]
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Attached)
    }
}

/// Classify a raw record without decoding its payload.
///
/// Only target-category STORE, RESTORE, BCHUNK_IN, BCHUNK_OUT, DEVICE_NODE,
/// FONTHINT and NEWSEGMENT carry a descriptor.
pub fn is_descriptor_carrying(raw: &RawEvent) -> bool {
    if raw.category() != Some(Category::Target) {
        return false;
    }
    matches!(
        TargetKind::from_u32(raw.kind),
        Some(
            TargetKind::Store
                | TargetKind::Restore
                | TargetKind::BchunkIn
                | TargetKind::BchunkOut
                | TargetKind::DeviceNode
                | TargetKind::FontHint
                | TargetKind::NewSegment
        )
    )
}

/// Read the slot word of a descriptor-carrying record.
///
/// Returns `None` for records outside the allow-list. A consumer uses this
/// before decoding so a descriptor announced by an undecodable record is
/// still drained from the control channel.
pub fn slot_word(raw: &RawEvent) -> Option<i32> {
    is_descriptor_carrying(raw).then(|| raw.reader().i32(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, Message, SegmentKind, TargetEvent};

    #[test]
    fn allow_list_is_exact() {
        let carrying = [
            TargetEvent::Store { handle: HandleSlot::Attached },
            TargetEvent::Restore { handle: HandleSlot::Empty },
            TargetEvent::BchunkIn {
                handle: HandleSlot::Attached,
                extensions: Message::truncated("png;jpg"),
            },
            TargetEvent::BchunkOut {
                handle: HandleSlot::Attached,
                extensions: Message::empty(),
            },
            TargetEvent::DeviceNode { handle: HandleSlot::Attached, kind: 1 },
            TargetEvent::FontHint {
                handle: HandleSlot::Empty,
                size_pt: 12.0,
                hinting: 0,
            },
            TargetEvent::NewSegment {
                handle: HandleSlot::Empty,
                output: false,
                kind: SegmentKind::Cursor,
                tag: 1,
                key: Message::truncated("/shmif_1_2"),
            },
        ];
        for ev in carrying {
            let raw = Event::Target(ev).encode();
            assert!(is_descriptor_carrying(&raw), "{:?}", ev);
            assert!(Event::Target(ev).carries_descriptor());
        }

        for ev in [TargetEvent::Exit, TargetEvent::FdTransfer, TargetEvent::Activate] {
            assert!(!is_descriptor_carrying(&Event::Target(ev).encode()));
        }
    }

    #[test]
    fn empty_slot_is_a_distinct_valid_state() {
        let raw = Event::Target(TargetEvent::Store { handle: HandleSlot::Empty }).encode();
        assert_eq!(slot_word(&raw), Some(BADFD));
        assert_eq!(
            Event::decode(&raw),
            Ok(Event::Target(TargetEvent::Store { handle: HandleSlot::Empty }))
        );
    }

    #[test]
    fn negative_slot_other_than_badfd_is_rejected() {
        let mut raw = Event::Target(TargetEvent::Restore { handle: HandleSlot::Attached }).encode();
        raw.payload[..4].copy_from_slice(&(-7i32).to_ne_bytes());
        assert_eq!(
            Event::decode(&raw),
            Err(crate::DecodeError::InvalidHandleSlot(-7))
        );
    }
}
