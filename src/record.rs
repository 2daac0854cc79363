//! Data model shared between the engine and its parser/emitter collaborators.
//!
//! Field payloads are stored as raw bytes rather than typed values: the
//! parser owns interpretation, the engine only routes bytes to codecs. `Int`
//! values are little-endian `i32` groups, `Real` values are `f32` bit
//! patterns, a set `Flag` is a single `1` byte, `Char`/`String` are verbatim.

/// The fixed database tuple of one variant record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDesc {
    pub chrom: String,
    pub pos: i64,
    pub id: String,
    pub ref_allele: String,
    pub alt: String,
    pub qual: String,
}

/// Field kind: one value per variant, or one value per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Info,
    Format,
}

/// Declared value type of a key, driving codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Flag,
    Int,
    Real,
    Char,
    String,
}

/// Schema entry for one INFO/FORMAT key. The key table is fixed at the start
/// of compression and serialized into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDesc {
    pub key_id: u32,
    pub kind: KeyKind,
    pub value_type: ValueType,
    /// Declared number of values per entry; 0 means variable.
    pub arity: u32,
}

/// One field payload of one variant. `present` is part of the record and
/// survives a round-trip: a present value may legitimately be empty
/// (string-typed fields), which is not the same as an absent field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValue {
    pub present: bool,
    pub data: Vec<u8>,
}

impl FieldValue {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn new(data: Vec<u8>) -> Self {
        Self {
            present: true,
            data,
        }
    }
}

impl KeyKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            KeyKind::Info => 0,
            KeyKind::Format => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(KeyKind::Info),
            1 => Some(KeyKind::Format),
            _ => None,
        }
    }
}

impl ValueType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ValueType::Flag => 0,
            ValueType::Int => 1,
            ValueType::Real => 2,
            ValueType::Char => 3,
            ValueType::String => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ValueType::Flag),
            1 => Some(ValueType::Int),
            2 => Some(ValueType::Real),
            3 => Some(ValueType::Char),
            4 => Some(ValueType::String),
            _ => None,
        }
    }
}
