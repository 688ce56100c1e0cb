//! External events: notifications from the client to the server.
//!
//! Payload layout: `source: i64` at offset 0, kind-specific fields from
//! offset 8. Every kind fits in the 120-byte payload.

use crate::error::DecodeError;
use crate::event::{Category, RawEvent};
use crate::types::{FixedStr, Geometry, Message, NegotiationId, SegmentKind, Title};

const SOURCE: usize = 0;
const BODY: usize = 8;

/// External notification kinds and their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExternalKind {
    Message = 0,
    CoreOpt = 1,
    Ident = 2,
    Failure = 3,
    BufferStream = 4,
    FrameStatus = 5,
    StreamInfo = 6,
    StreamStatus = 7,
    StateSize = 8,
    Resource = 9,
    FlushAud = 10,
    SegReq = 11,
    KeyInput = 12,
    CursorInput = 13,
    CursorHint = 14,
    Register = 15,
    Resize = 16,
}

impl ExternalKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Message,
            1 => Self::CoreOpt,
            2 => Self::Ident,
            3 => Self::Failure,
            4 => Self::BufferStream,
            5 => Self::FrameStatus,
            6 => Self::StreamInfo,
            7 => Self::StreamStatus,
            8 => Self::StateSize,
            9 => Self::Resource,
            10 => Self::FlushAud,
            11 => Self::SegReq,
            12 => Self::KeyInput,
            13 => Self::CursorInput,
            14 => Self::CursorHint,
            15 => Self::Register,
            16 => Self::Resize,
            _ => return None,
        })
    }
}

/// A client to server notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExternalEvent {
    Message { text: Message },
    CoreOpt { text: Message },
    Ident { text: Message },
    /// The previous descriptor operation failed.
    Failure { text: Message },
    BufferStream { pitch: u32, format: i32 },
    FrameStatus {
        framenumber: u32,
        pts: u64,
        acquired: u64,
        fhint: f32,
    },
    StreamInfo {
        lang: [u8; 3],
        streamid: u8,
        datakind: u8,
    },
    StreamStatus {
        timestr: FixedStr<9>,
        timelim: FixedStr<9>,
        completion: f32,
        streaming: bool,
        frameno: u32,
    },
    /// Serialization is possible and needs this many bytes.
    StateSize { size: u32 },
    Resource { text: Message },
    FlushAud,
    /// Ask for an additional segment of `kind`; `id` is echoed back in the
    /// NEWSEGMENT or REQFAIL answer.
    SegReq {
        id: u32,
        kind: SegmentKind,
        width: u16,
        height: u16,
    },
    KeyInput { id: u8, keysym: i32, active: bool },
    CursorInput {
        id: u8,
        x: u32,
        y: u32,
        buttons: [u8; 5],
    },
    CursorHint { text: Message },
    /// Identify the segment; moves a pending segment towards activation.
    Register {
        kind: SegmentKind,
        title: Title,
        guid: [u64; 2],
    },
    /// Ask for new buffer geometry.
    Resize {
        negotiation: NegotiationId,
        geometry: Geometry,
    },
}

impl ExternalEvent {
    pub fn kind(&self) -> ExternalKind {
        match self {
            Self::Message { .. } => ExternalKind::Message,
            Self::CoreOpt { .. } => ExternalKind::CoreOpt,
            Self::Ident { .. } => ExternalKind::Ident,
            Self::Failure { .. } => ExternalKind::Failure,
            Self::BufferStream { .. } => ExternalKind::BufferStream,
            Self::FrameStatus { .. } => ExternalKind::FrameStatus,
            Self::StreamInfo { .. } => ExternalKind::StreamInfo,
            Self::StreamStatus { .. } => ExternalKind::StreamStatus,
            Self::StateSize { .. } => ExternalKind::StateSize,
            Self::Resource { .. } => ExternalKind::Resource,
            Self::FlushAud => ExternalKind::FlushAud,
            Self::SegReq { .. } => ExternalKind::SegReq,
            Self::KeyInput { .. } => ExternalKind::KeyInput,
            Self::CursorInput { .. } => ExternalKind::CursorInput,
            Self::CursorHint { .. } => ExternalKind::CursorHint,
            Self::Register { .. } => ExternalKind::Register,
            Self::Resize { .. } => ExternalKind::Resize,
        }
    }

    pub(crate) fn encode(&self) -> RawEvent {
        let mut raw = RawEvent::new(Category::External, self.kind() as u32);
        let mut w = raw.writer();
        w.u64(SOURCE, 0);
        match *self {
            Self::Message { text }
            | Self::CoreOpt { text }
            | Self::Ident { text }
            | Self::Failure { text }
            | Self::Resource { text }
            | Self::CursorHint { text } => {
                w.bytes(BODY, text.as_bytes());
            }
            Self::BufferStream { pitch, format } => {
                w.u32(BODY, pitch).i32(BODY + 4, format);
            }
            Self::FrameStatus {
                framenumber,
                pts,
                acquired,
                fhint,
            } => {
                w.u32(BODY, framenumber)
                    .u64(BODY + 8, pts)
                    .u64(BODY + 16, acquired)
                    .f32(BODY + 24, fhint);
            }
            Self::StreamInfo {
                lang,
                streamid,
                datakind,
            } => {
                w.bytes(BODY, &lang).u8(BODY + 3, streamid).u8(BODY + 4, datakind);
            }
            Self::StreamStatus {
                timestr,
                timelim,
                completion,
                streaming,
                frameno,
            } => {
                w.bytes(BODY, timestr.as_bytes())
                    .bytes(BODY + 9, timelim.as_bytes())
                    .f32(BODY + 20, completion)
                    .u8(BODY + 24, streaming as u8)
                    .u32(BODY + 28, frameno);
            }
            Self::StateSize { size } => {
                w.u32(BODY, size);
            }
            Self::FlushAud => {}
            Self::SegReq {
                id,
                kind,
                width,
                height,
            } => {
                w.u32(BODY, id)
                    .u32(BODY + 4, kind.as_u32())
                    .u16(BODY + 8, width)
                    .u16(BODY + 10, height);
            }
            Self::KeyInput { id, keysym, active } => {
                w.u8(BODY, id).i32(BODY + 4, keysym).u8(BODY + 8, active as u8);
            }
            Self::CursorInput { id, x, y, buttons } => {
                w.u8(BODY, id)
                    .u32(BODY + 4, x)
                    .u32(BODY + 8, y)
                    .bytes(BODY + 12, &buttons);
            }
            Self::Register { kind, title, guid } => {
                w.u32(BODY, kind.as_u32())
                    .bytes(BODY + 4, title.as_bytes())
                    .u64(BODY + 72, guid[0])
                    .u64(BODY + 80, guid[1]);
            }
            Self::Resize {
                negotiation,
                geometry,
            } => {
                w.u32(BODY, negotiation.0)
                    .u32(BODY + 4, geometry.width)
                    .u32(BODY + 8, geometry.height)
                    .u32(BODY + 12, geometry.samplerate)
                    .u32(BODY + 16, geometry.channels);
            }
        }
        raw
    }

    pub(crate) fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let kind = ExternalKind::from_u32(raw.kind).ok_or(DecodeError::UnknownKind {
            category: Category::External,
            kind: raw.kind,
        })?;
        let r = raw.reader();
        let text = || Message::from_bytes(r.array(BODY));

        Ok(match kind {
            ExternalKind::Message => Self::Message { text: text() },
            ExternalKind::CoreOpt => Self::CoreOpt { text: text() },
            ExternalKind::Ident => Self::Ident { text: text() },
            ExternalKind::Failure => Self::Failure { text: text() },
            ExternalKind::Resource => Self::Resource { text: text() },
            ExternalKind::CursorHint => Self::CursorHint { text: text() },
            ExternalKind::BufferStream => Self::BufferStream {
                pitch: r.u32(BODY),
                format: r.i32(BODY + 4),
            },
            ExternalKind::FrameStatus => Self::FrameStatus {
                framenumber: r.u32(BODY),
                pts: r.u64(BODY + 8),
                acquired: r.u64(BODY + 16),
                fhint: r.f32(BODY + 24),
            },
            ExternalKind::StreamInfo => Self::StreamInfo {
                lang: r.array(BODY),
                streamid: r.u8(BODY + 3),
                datakind: r.u8(BODY + 4),
            },
            ExternalKind::StreamStatus => Self::StreamStatus {
                timestr: FixedStr::from_bytes(r.array(BODY)),
                timelim: FixedStr::from_bytes(r.array(BODY + 9)),
                completion: r.f32(BODY + 20),
                streaming: r.bool(BODY + 24),
                frameno: r.u32(BODY + 28),
            },
            ExternalKind::StateSize => Self::StateSize { size: r.u32(BODY) },
            ExternalKind::FlushAud => Self::FlushAud,
            ExternalKind::SegReq => Self::SegReq {
                id: r.u32(BODY),
                kind: SegmentKind::from_u32(r.u32(BODY + 4)),
                width: r.u16(BODY + 8),
                height: r.u16(BODY + 10),
            },
            ExternalKind::KeyInput => Self::KeyInput {
                id: r.u8(BODY),
                keysym: r.i32(BODY + 4),
                active: r.bool(BODY + 8),
            },
            ExternalKind::CursorInput => Self::CursorInput {
                id: r.u8(BODY),
                x: r.u32(BODY + 4),
                y: r.u32(BODY + 8),
                buttons: r.array(BODY + 12),
            },
            ExternalKind::Register => Self::Register {
                kind: SegmentKind::from_u32(r.u32(BODY)),
                title: Title::from_bytes(r.array(BODY + 4)),
                guid: [r.u64(BODY + 72), r.u64(BODY + 80)],
            },
            ExternalKind::Resize => Self::Resize {
                negotiation: NegotiationId(r.u32(BODY)),
                geometry: Geometry::new(
                    r.u32(BODY + 4),
                    r.u32(BODY + 8),
                    r.u32(BODY + 12),
                    r.u32(BODY + 16),
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[test]
    fn register_keeps_title_and_guid() {
        let ev = ExternalEvent::Register {
            kind: SegmentKind::Terminal,
            title: Title::truncated("term"),
            guid: [0x1122_3344_5566_7788, 42],
        };
        assert_eq!(Event::decode(&Event::External(ev).encode()), Ok(Event::External(ev)));
    }

    #[test]
    fn segreq_with_unknown_kind_decodes_as_unknown() {
        let mut raw = Event::External(ExternalEvent::SegReq {
            id: 5,
            kind: SegmentKind::Cursor,
            width: 16,
            height: 16,
        })
        .encode();
        raw.payload[BODY + 4..BODY + 8].copy_from_slice(&1000u32.to_ne_bytes());
        match Event::decode(&raw) {
            Ok(Event::External(ExternalEvent::SegReq { id, kind, .. })) => {
                assert_eq!(id, 5);
                assert_eq!(kind, SegmentKind::Unknown);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn long_message_is_truncated_not_rejected() {
        let long = "x".repeat(200);
        let ev = ExternalEvent::Message {
            text: Message::truncated(&long),
        };
        match Event::decode(&Event::External(ev).encode()) {
            Ok(Event::External(ExternalEvent::Message { text })) => {
                assert_eq!(text.len(), Message::CAPACITY)
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
