//! Protocol constants and safety limits.
//!
//! The decoder treats every save file as untrusted input: stack depth, memo
//! size and literal lengths are bounded so a corrupt stream fails with a
//! [`DecodeError`](crate::error::DecodeError) instead of exhausting memory.

/// Highest pickle protocol the decoder understands.
pub const MAX_PROTOCOL: u8 = 5;

/// Lowest protocol the encoder will emit.
///
/// Protocols 0 and 1 have no `NEWOBJ`, so instances cannot be rebuilt
/// with the two-phase shell-then-state pattern.
pub const MIN_ENCODE_PROTOCOL: u8 = 2;

/// Protocol written by default. Ren'Py writes protocol 2 and loads it on
/// every supported Python version.
pub const DEFAULT_PROTOCOL: u8 = 2;

/// Name of the archive entry holding the pickled game state.
pub const LOG_ENTRY: &str = "log";

/// Name of the archive entry holding save metadata.
pub const METADATA_ENTRY: &str = "json";

/// Version of the JSON document envelope.
pub const DOCUMENT_VERSION: u32 = 1;

/// Maximum number of values on the operand stack (all marks combined).
pub const MAX_STACK_DEPTH: usize = 1 << 20;

/// Maximum number of memo entries.
pub const MAX_MEMO_ENTRIES: usize = 1 << 24;

/// Maximum byte length of a single string/bytes literal (256 MiB).
pub const MAX_LITERAL_LEN: usize = 256 * 1024 * 1024;

/// Maximum byte length of an arbitrary-precision integer literal.
pub const MAX_LONG_BYTES: usize = 64 * 1024;

/// Maximum nesting depth for the recursive encoders (binary and text).
pub const MAX_NESTING: usize = 1_000;

/// Number of items per `APPENDS`/`SETITEMS`/`ADDITEMS` batch, as CPython.
pub const BATCH_SIZE: usize = 1000;
