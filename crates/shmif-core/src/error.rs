//! Errors raised while interpreting wire records.

use crate::event::Category;

/// A wire record that cannot be turned into an [`Event`](crate::Event).
///
/// None of these are fatal on their own: the consumer discards the record
/// and decides whether the peer deserves harsher treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The category field is not one of the known bit values.
    UnknownCategory(u16),
    /// The category exists but has no meaning on a segment.
    UnsupportedCategory(Category),
    /// The kind is out of range for its category.
    UnknownKind { category: Category, kind: u32 },
    /// A descriptor slot held a negative value other than [`BADFD`](crate::BADFD).
    InvalidHandleSlot(i32),
    /// A payload field is outside the range its kind allows.
    InvalidField {
        kind: &'static str,
        field: &'static str,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCategory(c) => write!(f, "unknown event category {:#x}", c),
            Self::UnsupportedCategory(c) => {
                write!(f, "event category {:?} is not carried over a segment", c)
            }
            Self::UnknownKind { category, kind } => {
                write!(f, "unknown kind {} for category {:?}", kind, category)
            }
            Self::InvalidHandleSlot(v) => write!(f, "invalid descriptor slot value {}", v),
            Self::InvalidField { kind, field } => {
                write!(f, "field `{}` out of range for {}", field, kind)
            }
        }
    }
}

impl std::error::Error for DecodeError {}
