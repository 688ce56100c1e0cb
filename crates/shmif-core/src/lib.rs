//! shmif-core: the event model shared by both ends of a segment.
//!
//! Every message crossing a segment is a [`RawEvent`]: a fixed-size,
//! fixed-layout record with a category discriminant, a kind, and a payload
//! area made of plain integers and byte arrays. Nothing here knows about
//! shared memory; the transport crate moves `RawEvent`s, this crate gives
//! them meaning.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────────────────────────┐
//! │ category │ reserved │   kind   │ payload (120 bytes)           │
//! │   u16    │   u16    │   u32    │ layout selected by cat + kind │
//! └──────────┴──────────┴──────────┴───────────────────────────────┘
//! ```
//!
//! Decoding goes through [`Event::decode`], which yields a tagged variant per
//! category so interpretation is an exhaustive `match`, never a raw
//! discriminant plus reinterpreted bytes.

#![forbid(unsafe_code)]

mod error;
mod event;
mod external;
mod handle;
mod io;
mod target;
mod types;

pub use error::DecodeError;
pub use event::{Category, CategoryMask, Event, RawEvent, EVENT_RECORD_SIZE, PAYLOAD_SIZE};
pub use external::{ExternalEvent, ExternalKind};
pub use handle::{is_descriptor_carrying, slot_word, HandleSlot, BADFD};
pub use io::{DeviceKind, IoData, IoEvent, IoKind};
pub use target::{ResizeRejectReason, TargetEvent, TargetKind};
pub use types::{FixedStr, Geometry, Message, NegotiationId, SegmentKind, Title};
