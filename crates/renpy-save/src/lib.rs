//! Lossless conversion of Ren'Py save games between their pickled form and
//! an editable JSON document.
//!
//! A Ren'Py save is a zip archive whose `log` entry is a pickle stream of
//! the whole game state. This crate decodes that stream into an object graph
//! without running any game code, renders the graph as tagged JSON, and
//! writes an edited document back into a copy of the original archive.
//!
//! # Overview
//!
//! - Classes named by the stream are never imported. They are recorded in a
//!   [`TypeRegistry`] and classified by how the stream uses them (list-like,
//!   dict-like, set-like or plain).
//! - Shared and cyclic references survive both directions: identity lives in
//!   the [`Graph`] arena and is anchored with ids in the JSON form.
//! - Values JSON cannot express (tuples, sets, bytes, big integers,
//!   non-string keys) are carried by single-key tag objects.
//!
//! # Quick Start
//!
//! ```rust
//! use renpy_save::{decode_pickle_global, encode_pickle, from_text, to_text};
//! use renpy_save::{EncodeOptions, TextOptions, TypeRegistry};
//!
//! // {'a': [1, 2, 3]} pickled at protocol 2
//! let log = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(K\x01K\x02K\x03es.";
//!
//! let decoded = decode_pickle_global(log).unwrap();
//! let doc = to_text(&decoded.graph, &decoded.root, &TextOptions::default()).unwrap();
//! assert_eq!(doc, serde_json::json!({"a": [1, 2, 3]}));
//!
//! let (graph, root) = from_text(&doc, TypeRegistry::global()).unwrap();
//! let bytes = encode_pickle(&graph, &root, &EncodeOptions::default()).unwrap();
//! assert_eq!(&bytes[..2], b"\x80\x02");
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Dynamic type registry
//! - [`model`]: Object graph (values, nodes, instance state)
//! - [`codec`]: Pickle opcode stream decoding/encoding
//! - [`text`]: Tagged JSON form and the document envelope
//! - [`archive`]: Save archive (zip) access
//! - [`convert`]: End-to-end archive/document conversions
//! - [`error`]: Error types
//! - [`limits`]: Protocol constants and decoding limits
//!
//! # Security
//!
//! Save files are untrusted input. The decoder never executes anything a
//! stream names; it only records it:
//! - Stack, memo and literal sizes are bounded
//! - Persistent ids, extension registry codes and out-of-band buffers are
//!   rejected
//! - Malformed streams fail with the byte offset of the offending opcode

pub mod archive;
pub mod codec;
pub mod convert;
pub mod error;
pub mod limits;
pub mod model;
pub mod registry;
pub mod text;

// Re-export commonly used types at crate root
pub use archive::{Metadata, SaveArchive};
pub use codec::{decode_pickle, decode_pickle_global, encode_pickle, DecodeOptions, Decoded, EncodeOptions};
pub use convert::{
    decode_save_file, document_to_save, encode_save_file, parse_document, save_to_document, write_document,
};
pub use error::{
    ContainerError, DecodeError, DecodeErrorKind, EncodeError, Error, ErrorCode, RegistryInconsistency,
    TextErrorKind, TextFormatError,
};
pub use model::{Constructor, Graph, Instance, Node, NodeId, State, Value, ValueMap, ValueSet};
pub use registry::{TypeHandle, TypeKind, TypeRegistry};
pub use text::{from_text, to_text, SaveDocument, TextOptions};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
