//! Input events. Either side may produce these; the server forwards user
//! input to the client and the client can inject synthesized input back.

use crate::error::DecodeError;
use crate::event::{Category, RawEvent};

const DEVKIND: usize = 0;
const DATATYPE: usize = 1;
const PTS: usize = 4;
const DATA: usize = 8;

/// Top-level input kind, carried in the record's kind word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IoKind {
    Button = 0,
    AxisMove = 1,
    Touch = 2,
}

impl IoKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Button),
            1 => Some(Self::AxisMove),
            2 => Some(Self::Touch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceKind {
    Keyboard = 0,
    Mouse = 1,
    GameDev = 2,
    TouchDisp = 3,
}

impl DeviceKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Keyboard),
            1 => Some(Self::Mouse),
            2 => Some(Self::GameDev),
            3 => Some(Self::TouchDisp),
            _ => None,
        }
    }
}

/// Maximum number of axis samples in one analog event.
pub const MAX_AXIS_VALUES: usize = 4;

/// Device-specific input data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IoData {
    Digital {
        active: bool,
        devid: u8,
        subid: u8,
    },
    Analog {
        gotrel: bool,
        devid: u8,
        subid: u8,
        nvalues: u8,
        axisval: [i16; MAX_AXIS_VALUES],
    },
    Touch {
        devid: u8,
        subid: u8,
        x: i16,
        y: i16,
        pressure: f32,
        size: f32,
    },
    /// Keyboard input already mapped to a symbol.
    Translated {
        active: bool,
        devid: u8,
        subid: u16,
        keysym: u16,
        modifiers: u16,
        scancode: u8,
    },
}

impl IoData {
    fn tag(&self) -> u8 {
        match self {
            Self::Digital { .. } => 0,
            Self::Analog { .. } => 1,
            Self::Touch { .. } => 2,
            Self::Translated { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoEvent {
    pub kind: IoKind,
    pub devkind: DeviceKind,
    /// Presentation timestamp in milliseconds.
    pub pts: u32,
    pub data: IoData,
}

impl IoEvent {
    pub(crate) fn encode(&self) -> RawEvent {
        let mut raw = RawEvent::new(Category::Io, self.kind as u32);
        let mut w = raw.writer();
        w.u8(DEVKIND, self.devkind as u8)
            .u8(DATATYPE, self.data.tag())
            .u32(PTS, self.pts);
        match self.data {
            IoData::Digital {
                active,
                devid,
                subid,
            } => {
                w.u8(DATA, active as u8).u8(DATA + 1, devid).u8(DATA + 2, subid);
            }
            IoData::Analog {
                gotrel,
                devid,
                subid,
                nvalues,
                axisval,
            } => {
                w.u8(DATA, gotrel as u8)
                    .u8(DATA + 1, devid)
                    .u8(DATA + 2, subid)
                    .u8(DATA + 3, nvalues);
                for (i, v) in axisval.iter().enumerate() {
                    w.i16(DATA + 4 + i * 2, *v);
                }
            }
            IoData::Touch {
                devid,
                subid,
                x,
                y,
                pressure,
                size,
            } => {
                w.u8(DATA, devid)
                    .u8(DATA + 1, subid)
                    .i16(DATA + 2, x)
                    .i16(DATA + 4, y)
                    .f32(DATA + 8, pressure)
                    .f32(DATA + 12, size);
            }
            IoData::Translated {
                active,
                devid,
                subid,
                keysym,
                modifiers,
                scancode,
            } => {
                w.u8(DATA, active as u8)
                    .u8(DATA + 1, devid)
                    .u16(DATA + 2, subid)
                    .u16(DATA + 4, keysym)
                    .u16(DATA + 6, modifiers)
                    .u8(DATA + 8, scancode);
            }
        }
        raw
    }

    pub(crate) fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let kind = IoKind::from_u32(raw.kind).ok_or(DecodeError::UnknownKind {
            category: Category::Io,
            kind: raw.kind,
        })?;
        let r = raw.reader();
        let devkind = DeviceKind::from_u8(r.u8(DEVKIND)).ok_or(DecodeError::InvalidField {
            kind: "io",
            field: "devkind",
        })?;

        let data = match r.u8(DATATYPE) {
            0 => IoData::Digital {
                active: r.bool(DATA),
                devid: r.u8(DATA + 1),
                subid: r.u8(DATA + 2),
            },
            1 => {
                let nvalues = r.u8(DATA + 3);
                if nvalues as usize > MAX_AXIS_VALUES {
                    return Err(DecodeError::InvalidField {
                        kind: "io",
                        field: "nvalues",
                    });
                }
                let mut axisval = [0i16; MAX_AXIS_VALUES];
                for (i, v) in axisval.iter_mut().enumerate() {
                    *v = r.i16(DATA + 4 + i * 2);
                }
                IoData::Analog {
                    gotrel: r.bool(DATA),
                    devid: r.u8(DATA + 1),
                    subid: r.u8(DATA + 2),
                    nvalues,
                    axisval,
                }
            }
            2 => IoData::Touch {
                devid: r.u8(DATA),
                subid: r.u8(DATA + 1),
                x: r.i16(DATA + 2),
                y: r.i16(DATA + 4),
                pressure: r.f32(DATA + 8),
                size: r.f32(DATA + 12),
            },
            3 => IoData::Translated {
                active: r.bool(DATA),
                devid: r.u8(DATA + 1),
                subid: r.u16(DATA + 2),
                keysym: r.u16(DATA + 4),
                modifiers: r.u16(DATA + 6),
                scancode: r.u8(DATA + 8),
            },
            _ => {
                return Err(DecodeError::InvalidField {
                    kind: "io",
                    field: "datatype",
                })
            }
        };

        Ok(Self {
            kind,
            devkind,
            pts: r.u32(PTS),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    fn key(active: bool) -> IoEvent {
        IoEvent {
            kind: IoKind::Button,
            devkind: DeviceKind::Keyboard,
            pts: 1234,
            data: IoData::Translated {
                active,
                devid: 0,
                subid: 38,
                keysym: 97,
                modifiers: 0x40,
                scancode: 30,
            },
        }
    }

    #[test]
    fn translated_key_survives_the_wire() {
        let ev = Event::Io(key(true));
        assert_eq!(Event::decode(&ev.encode()), Ok(ev));
    }

    #[test]
    fn analog_with_too_many_values_is_rejected() {
        let mut raw = Event::Io(IoEvent {
            kind: IoKind::AxisMove,
            devkind: DeviceKind::GameDev,
            pts: 0,
            data: IoData::Analog {
                gotrel: false,
                devid: 1,
                subid: 0,
                nvalues: 2,
                axisval: [100, -100, 0, 0],
            },
        })
        .encode();
        raw.payload[DATA + 3] = 9;
        assert_eq!(
            Event::decode(&raw),
            Err(DecodeError::InvalidField {
                kind: "io",
                field: "nvalues"
            })
        );
    }

    #[test]
    fn unknown_device_kind_is_rejected() {
        let mut raw = Event::Io(key(false)).encode();
        raw.payload[DEVKIND] = 77;
        assert!(matches!(
            Event::decode(&raw),
            Err(DecodeError::InvalidField { field: "devkind", .. })
        ));
    }
}
