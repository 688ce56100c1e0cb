//! Target events: commands from the server to the client.
//!
//! Payload layout:
//!
//! ```text
//! offset  0..24   ioevs[6]   i32 / f32 words
//! offset 24..28   code       i32 (negotiation id where relevant)
//! offset 28..106  message    78 bytes, NUL padded
//! ```

use crate::error::DecodeError;
use crate::event::{Category, RawEvent};
use crate::handle::HandleSlot;
use crate::types::{Geometry, Message, NegotiationId, SegmentKind};

const IOEVS: usize = 0;
const CODE: usize = 24;
const MESSAGE: usize = 28;

#[inline]
const fn ioev(i: usize) -> usize {
    IOEVS + i * 4
}

/// Target command kinds and their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TargetKind {
    Exit = 0,
    FrameSkip = 1,
    StepFrame = 2,
    CoreOpt = 3,
    FdTransfer = 4,
    Store = 5,
    Restore = 6,
    BchunkIn = 7,
    BchunkOut = 8,
    Reset = 9,
    Pause = 10,
    Unpause = 11,
    SeekTime = 12,
    DisplayHint = 13,
    SetIoDev = 14,
    Attenuate = 15,
    AudDelay = 16,
    NewSegment = 17,
    ReqFail = 18,
    BufferFail = 19,
    DeviceNode = 20,
    FontHint = 21,
    Activate = 22,
    ResizeAck = 23,
    ResizeReject = 24,
}

impl TargetKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Exit,
            1 => Self::FrameSkip,
            2 => Self::StepFrame,
            3 => Self::CoreOpt,
            4 => Self::FdTransfer,
            5 => Self::Store,
            6 => Self::Restore,
            7 => Self::BchunkIn,
            8 => Self::BchunkOut,
            9 => Self::Reset,
            10 => Self::Pause,
            11 => Self::Unpause,
            12 => Self::SeekTime,
            13 => Self::DisplayHint,
            14 => Self::SetIoDev,
            15 => Self::Attenuate,
            16 => Self::AudDelay,
            17 => Self::NewSegment,
            18 => Self::ReqFail,
            19 => Self::BufferFail,
            20 => Self::DeviceNode,
            21 => Self::FontHint,
            22 => Self::Activate,
            23 => Self::ResizeAck,
            24 => Self::ResizeReject,
            _ => return None,
        })
    }
}

/// Why a resize request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResizeRejectReason {
    /// Width, height, samplerate or channel count outside the platform limits.
    OutOfBounds = 1,
    /// The resulting segment would exceed the configured byte limit.
    TooLarge = 2,
    /// The backing region could not be resized.
    AllocationFailed = 3,
    /// The segment is not in a state that accepts resizing.
    NotActive = 4,
}

impl ResizeRejectReason {
    fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::OutOfBounds),
            2 => Some(Self::TooLarge),
            3 => Some(Self::AllocationFailed),
            4 => Some(Self::NotActive),
            _ => None,
        }
    }
}

/// A server to client command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetEvent {
    /// Terminate. The dead-man switch follows shortly after.
    Exit,
    FrameSkip { mode: i32 },
    StepFrame { count: i32, id: i32 },
    CoreOpt { index: i32, value: Message },
    /// Legacy prelude announcing that a descriptor follows.
    FdTransfer,
    /// Serialize state into the attached descriptor.
    Store { handle: HandleSlot },
    /// Restore state from the attached descriptor.
    Restore { handle: HandleSlot },
    BchunkIn { handle: HandleSlot, extensions: Message },
    BchunkOut { handle: HandleSlot, extensions: Message },
    Reset { level: i32 },
    Pause,
    Unpause,
    SeekTime { relative: bool, seconds: f32 },
    /// Suggested dimensions; the client answers with its own resize request
    /// carrying the same negotiation id if it wants to follow the hint.
    DisplayHint {
        width: u32,
        height: u32,
        negotiation: NegotiationId,
    },
    SetIoDev { port: i32, device: i32 },
    Attenuate { gain: f32 },
    AudDelay { video_ms: i32, audio_ms: i32 },
    /// A new segment is ready to be acquired with `key`.
    NewSegment {
        handle: HandleSlot,
        /// Server-to-client data flow (recording) instead of client-to-server.
        output: bool,
        kind: SegmentKind,
        /// The request id echoed back, 0 for unsolicited segments.
        tag: u32,
        key: Message,
    },
    /// A subsegment request was refused.
    ReqFail { tag: u32 },
    BufferFail,
    DeviceNode { handle: HandleSlot, kind: i32 },
    FontHint {
        handle: HandleSlot,
        size_pt: f32,
        hinting: i32,
    },
    /// The registration was accepted; the segment is live.
    Activate,
    ResizeAck {
        negotiation: NegotiationId,
        geometry: Geometry,
    },
    ResizeReject {
        negotiation: NegotiationId,
        reason: ResizeRejectReason,
    },
}

impl TargetEvent {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Exit => TargetKind::Exit,
            Self::FrameSkip { .. } => TargetKind::FrameSkip,
            Self::StepFrame { .. } => TargetKind::StepFrame,
            Self::CoreOpt { .. } => TargetKind::CoreOpt,
            Self::FdTransfer => TargetKind::FdTransfer,
            Self::Store { .. } => TargetKind::Store,
            Self::Restore { .. } => TargetKind::Restore,
            Self::BchunkIn { .. } => TargetKind::BchunkIn,
            Self::BchunkOut { .. } => TargetKind::BchunkOut,
            Self::Reset { .. } => TargetKind::Reset,
            Self::Pause => TargetKind::Pause,
            Self::Unpause => TargetKind::Unpause,
            Self::SeekTime { .. } => TargetKind::SeekTime,
            Self::DisplayHint { .. } => TargetKind::DisplayHint,
            Self::SetIoDev { .. } => TargetKind::SetIoDev,
            Self::Attenuate { .. } => TargetKind::Attenuate,
            Self::AudDelay { .. } => TargetKind::AudDelay,
            Self::NewSegment { .. } => TargetKind::NewSegment,
            Self::ReqFail { .. } => TargetKind::ReqFail,
            Self::BufferFail => TargetKind::BufferFail,
            Self::DeviceNode { .. } => TargetKind::DeviceNode,
            Self::FontHint { .. } => TargetKind::FontHint,
            Self::Activate => TargetKind::Activate,
            Self::ResizeAck { .. } => TargetKind::ResizeAck,
            Self::ResizeReject { .. } => TargetKind::ResizeReject,
        }
    }

    /// The descriptor slot, for kinds on the descriptor allow-list.
    pub fn handle(&self) -> Option<HandleSlot> {
        match self {
            Self::Store { handle }
            | Self::Restore { handle }
            | Self::BchunkIn { handle, .. }
            | Self::BchunkOut { handle, .. }
            | Self::DeviceNode { handle, .. }
            | Self::FontHint { handle, .. }
            | Self::NewSegment { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Same event with the descriptor slot replaced.
    ///
    /// Kinds outside the allow-list are returned unchanged.
    pub fn with_handle(mut self, slot: HandleSlot) -> Self {
        match &mut self {
            Self::Store { handle }
            | Self::Restore { handle }
            | Self::BchunkIn { handle, .. }
            | Self::BchunkOut { handle, .. }
            | Self::DeviceNode { handle, .. }
            | Self::FontHint { handle, .. }
            | Self::NewSegment { handle, .. } => *handle = slot,
            _ => {}
        }
        self
    }

    pub(crate) fn encode(&self) -> RawEvent {
        let mut raw = RawEvent::new(Category::Target, self.kind() as u32);
        if let Some(slot) = self.handle() {
            raw.writer().i32(ioev(0), slot.to_wire());
        }
        let mut w = raw.writer();
        match *self {
            Self::Exit
            | Self::FdTransfer
            | Self::Pause
            | Self::Unpause
            | Self::BufferFail
            | Self::Activate
            | Self::Store { .. }
            | Self::Restore { .. } => {}
            Self::FrameSkip { mode } => {
                w.i32(ioev(0), mode);
            }
            Self::StepFrame { count, id } => {
                w.i32(ioev(0), count).i32(ioev(1), id);
            }
            Self::CoreOpt { index, value } => {
                w.i32(ioev(0), index).bytes(MESSAGE, value.as_bytes());
            }
            Self::BchunkIn { extensions, .. } | Self::BchunkOut { extensions, .. } => {
                w.bytes(MESSAGE, extensions.as_bytes());
            }
            Self::Reset { level } => {
                w.i32(ioev(0), level);
            }
            Self::SeekTime { relative, seconds } => {
                w.i32(ioev(0), relative as i32).f32(ioev(1), seconds);
            }
            Self::DisplayHint {
                width,
                height,
                negotiation,
            } => {
                w.u32(ioev(0), width)
                    .u32(ioev(1), height)
                    .u32(CODE, negotiation.0);
            }
            Self::SetIoDev { port, device } => {
                w.i32(ioev(0), port).i32(ioev(1), device);
            }
            Self::Attenuate { gain } => {
                w.f32(ioev(0), gain);
            }
            Self::AudDelay { video_ms, audio_ms } => {
                w.i32(ioev(0), video_ms).i32(ioev(1), audio_ms);
            }
            Self::NewSegment {
                output,
                kind,
                tag,
                key,
                ..
            } => {
                w.i32(ioev(1), output as i32)
                    .u32(ioev(2), kind.as_u32())
                    .u32(ioev(3), tag)
                    .bytes(MESSAGE, key.as_bytes());
            }
            Self::ReqFail { tag } => {
                w.u32(ioev(0), tag);
            }
            Self::DeviceNode { kind, .. } => {
                w.i32(ioev(1), kind);
            }
            Self::FontHint {
                size_pt, hinting, ..
            } => {
                w.f32(ioev(2), size_pt).i32(ioev(3), hinting);
            }
            Self::ResizeAck {
                negotiation,
                geometry,
            } => {
                w.u32(ioev(0), geometry.width)
                    .u32(ioev(1), geometry.height)
                    .u32(ioev(2), geometry.samplerate)
                    .u32(ioev(3), geometry.channels)
                    .u32(CODE, negotiation.0);
            }
            Self::ResizeReject {
                negotiation,
                reason,
            } => {
                w.i32(ioev(0), reason as i32).u32(CODE, negotiation.0);
            }
        }
        raw
    }

    pub(crate) fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let kind = TargetKind::from_u32(raw.kind).ok_or(DecodeError::UnknownKind {
            category: Category::Target,
            kind: raw.kind,
        })?;
        let r = raw.reader();
        let slot = || {
            let v = r.i32(ioev(0));
            HandleSlot::from_wire(v).ok_or(DecodeError::InvalidHandleSlot(v))
        };
        let message = || Message::from_bytes(r.array(MESSAGE));

        Ok(match kind {
            TargetKind::Exit => Self::Exit,
            TargetKind::FrameSkip => Self::FrameSkip {
                mode: r.i32(ioev(0)),
            },
            TargetKind::StepFrame => Self::StepFrame {
                count: r.i32(ioev(0)),
                id: r.i32(ioev(1)),
            },
            TargetKind::CoreOpt => Self::CoreOpt {
                index: r.i32(ioev(0)),
                value: message(),
            },
            TargetKind::FdTransfer => Self::FdTransfer,
            TargetKind::Store => Self::Store { handle: slot()? },
            TargetKind::Restore => Self::Restore { handle: slot()? },
            TargetKind::BchunkIn => Self::BchunkIn {
                handle: slot()?,
                extensions: message(),
            },
            TargetKind::BchunkOut => Self::BchunkOut {
                handle: slot()?,
                extensions: message(),
            },
            TargetKind::Reset => Self::Reset {
                level: r.i32(ioev(0)),
            },
            TargetKind::Pause => Self::Pause,
            TargetKind::Unpause => Self::Unpause,
            TargetKind::SeekTime => Self::SeekTime {
                relative: r.i32(ioev(0)) != 0,
                seconds: r.f32(ioev(1)),
            },
            TargetKind::DisplayHint => Self::DisplayHint {
                width: r.u32(ioev(0)),
                height: r.u32(ioev(1)),
                negotiation: NegotiationId(r.u32(CODE)),
            },
            TargetKind::SetIoDev => Self::SetIoDev {
                port: r.i32(ioev(0)),
                device: r.i32(ioev(1)),
            },
            TargetKind::Attenuate => Self::Attenuate {
                gain: r.f32(ioev(0)),
            },
            TargetKind::AudDelay => Self::AudDelay {
                video_ms: r.i32(ioev(0)),
                audio_ms: r.i32(ioev(1)),
            },
            TargetKind::NewSegment => Self::NewSegment {
                handle: slot()?,
                output: r.i32(ioev(1)) != 0,
                kind: SegmentKind::from_u32(r.u32(ioev(2))),
                tag: r.u32(ioev(3)),
                key: message(),
            },
            TargetKind::ReqFail => Self::ReqFail {
                tag: r.u32(ioev(0)),
            },
            TargetKind::BufferFail => Self::BufferFail,
            TargetKind::DeviceNode => Self::DeviceNode {
                handle: slot()?,
                kind: r.i32(ioev(1)),
            },
            TargetKind::FontHint => Self::FontHint {
                handle: slot()?,
                size_pt: r.f32(ioev(2)),
                hinting: r.i32(ioev(3)),
            },
            TargetKind::Activate => Self::Activate,
            TargetKind::ResizeAck => Self::ResizeAck {
                negotiation: NegotiationId(r.u32(CODE)),
                geometry: Geometry::new(
                    r.u32(ioev(0)),
                    r.u32(ioev(1)),
                    r.u32(ioev(2)),
                    r.u32(ioev(3)),
                ),
            },
            TargetKind::ResizeReject => Self::ResizeReject {
                negotiation: NegotiationId(r.u32(CODE)),
                reason: ResizeRejectReason::from_i32(r.i32(ioev(0))).ok_or(
                    DecodeError::InvalidField {
                        kind: "RESIZE_REJECT",
                        field: "reason",
                    },
                )?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[test]
    fn unknown_target_kind_is_rejected() {
        let mut raw = Event::Target(TargetEvent::Exit).encode();
        raw.kind = 99;
        assert_eq!(
            Event::decode(&raw),
            Err(DecodeError::UnknownKind {
                category: Category::Target,
                kind: 99
            })
        );
    }

    #[test]
    fn new_segment_keeps_tag_kind_and_key() {
        let ev = TargetEvent::NewSegment {
            handle: HandleSlot::Attached,
            output: true,
            kind: SegmentKind::Encoder,
            tag: 0xdead,
            key: Message::truncated("/shmif_12_345"),
        };
        let raw = Event::Target(ev).encode();
        match Event::decode(&raw) {
            Ok(Event::Target(TargetEvent::NewSegment {
                handle,
                output,
                kind,
                tag,
                key,
            })) => {
                assert_eq!(handle, HandleSlot::Attached);
                assert!(output);
                assert_eq!(kind, SegmentKind::Encoder);
                assert_eq!(tag, 0xdead);
                assert_eq!(key.to_string_lossy(), "/shmif_12_345");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn resize_reject_with_bogus_reason_is_invalid() {
        let mut raw = Event::Target(TargetEvent::ResizeReject {
            negotiation: NegotiationId(3),
            reason: ResizeRejectReason::TooLarge,
        })
        .encode();
        raw.payload[..4].copy_from_slice(&77i32.to_ne_bytes());
        assert!(matches!(
            Event::decode(&raw),
            Err(DecodeError::InvalidField { field: "reason", .. })
        ));
    }

    #[test]
    fn with_handle_only_touches_carrying_kinds() {
        let store = TargetEvent::Store {
            handle: HandleSlot::Empty,
        }
        .with_handle(HandleSlot::Attached);
        assert_eq!(store.handle(), Some(HandleSlot::Attached));
        assert_eq!(TargetEvent::Pause.with_handle(HandleSlot::Attached), TargetEvent::Pause);
    }
}
