//! Error types for pickle decoding/encoding, the text bridge and the
//! archive container.

use thiserror::Error;

use crate::registry::TypeKind;

/// Coarse error classes, one per failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: malformed or truncated opcode stream
    Decode,
    /// E002: document violates the tag grammar
    TextFormat,
    /// E003: archive missing an entry or corrupt
    Container,
    /// E004: a type identifier was used with two incompatible kinds
    Registry,
    /// E005: graph cannot be written as an opcode stream
    Encode,
}

impl ErrorCode {
    /// Returns the error code string (e.g., "E001").
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::Decode => "E001",
            ErrorCode::TextFormat => "E002",
            ErrorCode::Container => "E003",
            ErrorCode::Registry => "E004",
            ErrorCode::Encode => "E005",
        }
    }
}

/// A type identifier was refined to a kind incompatible with the one it
/// already has.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[E004] {module}.{name} is already {existing}, cannot use it as {requested}")]
pub struct RegistryInconsistency {
    pub module: String,
    pub name: String,
    pub existing: TypeKind,
    pub requested: TypeKind,
}

// =============================================================================
// DECODING
// =============================================================================

/// Error during pickle decoding, located by the byte offset of the opcode
/// that failed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[E001] at byte {offset}: {kind}")]
pub struct DecodeError {
    pub offset: usize,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn new(offset: usize, kind: DecodeErrorKind) -> Self {
        Self { offset, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of input while reading {context}")]
    UnexpectedEof { context: &'static str },

    #[error("unknown opcode 0x{opcode:02x}")]
    UnknownOpcode { opcode: u8 },

    #[error("unsupported opcode {name}")]
    UnsupportedOpcode { name: &'static str },

    #[error("unsupported protocol {protocol}")]
    UnsupportedProtocol { protocol: u8 },

    #[error("stack underflow in {opcode}")]
    StackUnderflow { opcode: &'static str },

    #[error("{opcode} without a matching MARK")]
    MissingMark { opcode: &'static str },

    #[error("memo key {key} not found")]
    MemoMiss { key: u64 },

    #[error("{opcode} expected {expected}, found {found}")]
    TypeMismatch {
        opcode: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid {context} literal {text:?}")]
    InvalidLiteral { context: &'static str, text: String },

    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    #[error("{field} length {len} exceeds maximum {max}")]
    LengthExceedsLimit {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("stream ended without STOP")]
    MissingStop,

    #[error("STOP reached with {depth} values and {marks} open marks on the stack")]
    UnbalancedStop { depth: usize, marks: usize },

    #[error("{module}.{name} ({kind}) cannot take state of shape {found}")]
    StateShape {
        module: String,
        name: String,
        kind: TypeKind,
        found: &'static str,
    },

    #[error("{callable} cannot be called with the given arguments")]
    BadReduce { callable: String },

    #[error(transparent)]
    Registry(#[from] RegistryInconsistency),
}

// =============================================================================
// TEXT
// =============================================================================

/// Error while reading or writing the tagged JSON document, located by the
/// path of the offending node (e.g. `/log/3/state/hp`).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[E002] at {path}: {kind}")]
pub struct TextFormatError {
    pub path: String,
    pub kind: TextErrorKind,
}

impl TextFormatError {
    pub fn new(path: impl Into<String>, kind: TextErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TextErrorKind {
    #[error("{tag} record is missing {key:?}")]
    MissingKey { tag: &'static str, key: &'static str },

    #[error("unexpected key {key:?} in {tag} record")]
    UnexpectedKey { tag: &'static str, key: String },

    #[error("{context} must be {expected}, found {found}")]
    Expected {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid {context} {text:?}")]
    InvalidLiteral { context: &'static str, text: String },

    #[error("id {id} is anchored twice")]
    DuplicateId { id: u64 },

    #[error("reference to id {id} which is not anchored before it")]
    DanglingRef { id: u64 },

    #[error("{module}.{name} ({kind}) cannot take state of shape {found}")]
    StateShape {
        module: String,
        name: String,
        kind: TypeKind,
        found: &'static str,
    },

    #[error("nesting exceeds {max} levels")]
    NestingTooDeep { max: usize },

    #[error(transparent)]
    Registry(#[from] RegistryInconsistency),

    #[error("unsupported document version {version}")]
    UnsupportedVersion { version: u64 },
}

// =============================================================================
// ENCODING
// =============================================================================

/// Error during pickle encoding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("[E005] protocol {protocol} cannot be written (supported: 2..=5)")]
    UnsupportedProtocol { protocol: u8 },

    #[error("[E005] nesting exceeds {max} levels")]
    NestingTooDeep { max: usize },

    #[error("[E005] node {node} is reachable from its own members before it can be memoized")]
    UnsupportedCycle { node: usize },

    #[error("[E005] node {node} does not exist in the graph")]
    DanglingNode { node: usize },

    #[error("[E005] {module}.{name} cannot be written as a GLOBAL at protocol {protocol}")]
    InvalidGlobal {
        module: String,
        name: String,
        protocol: u8,
    },

    #[error("[E005] {context} must refer to a {expected} node")]
    MalformedState {
        context: &'static str,
        expected: &'static str,
    },
}

// =============================================================================
// CONTAINER
// =============================================================================

/// Error reading or writing the save archive.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("[E003] archive has no {name:?} entry")]
    MissingEntry { name: String },

    #[error("[E003] corrupt archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("[E003] {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// CONVERSION
// =============================================================================

/// Any failure of an end-to-end conversion.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Text(#[from] TextFormatError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Registry(#[from] RegistryInconsistency),

    #[error("[E002] unreadable JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Decode(_) => ErrorCode::Decode,
            Error::Encode(_) => ErrorCode::Encode,
            Error::Text(_) | Error::Json(_) => ErrorCode::TextFormat,
            Error::Container(_) => ErrorCode::Container,
            Error::Registry(_) => ErrorCode::Registry,
        }
    }
}
