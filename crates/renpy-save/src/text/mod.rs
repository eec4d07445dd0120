//! The tagged JSON form of an object graph.
//!
//! JSON has no tuples, sets, non-string keys, bytes, big integers or
//! identity, so those are carried by single-key tag objects:
//!
//! | graph value | JSON |
//! |---|---|
//! | list | array |
//! | dict with plain string keys | object |
//! | any other dict | `{"pairs": [[k, v], ...]}` |
//! | tuple / set | `{"tuple": [...]}` / `{"set": [...]}` |
//! | integer outside 64 bits | `{"int": "<decimal>"}` |
//! | NaN / infinities | `{"float": "nan" \| "inf" \| "-inf"}` |
//! | bytes | `{"bytes": "<hex>"}` |
//! | class object | `{"global": [module, name]}` |
//! | instance | `{"class": name, "module": module, "state": ...}` |
//!
//! Instance records may also carry `"kind"` (the list, dict or set kind
//! learned for a type the registry does not declare), and `"args"` or
//! `"newargs"` (the arguments of a `cls(*args)` or `cls.__new__(cls, *args)`
//! construction that comes before the state).
//!
//! Nodes reached more than once are anchored on first occurrence, with an
//! inline `"id"` on instances and `{"id": n, "value": ...}` around anything
//! else, and written as `{"ref": n}` afterwards.

mod decode;
mod encode;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::archive::Metadata;
use crate::error::{TextErrorKind, TextFormatError};
use crate::limits::{DEFAULT_PROTOCOL, DOCUMENT_VERSION};

pub use decode::from_text;
pub(crate) use decode::from_text_at;
pub use encode::to_text;

/// Keys that turn a JSON object into a single-key tag.
pub(crate) const SINGLE_KEY_TAGS: &[&str] = &["ref", "int", "float", "bytes", "global", "tuple", "set", "pairs"];

pub(crate) const CLASS: &str = "class";
pub(crate) const MODULE: &str = "module";
pub(crate) const STATE: &str = "state";
pub(crate) const ID: &str = "id";
pub(crate) const VALUE: &str = "value";
pub(crate) const KIND: &str = "kind";
pub(crate) const ARGS: &str = "args";
pub(crate) const NEWARGS: &str = "newargs";

/// Returns true if an object with these keys would be read back as
/// something other than a plain string-keyed dict.
pub(crate) fn is_reserved(keys: &[&str]) -> bool {
    if keys.iter().any(|&k| k == CLASS || k == MODULE) {
        return true;
    }
    match keys {
        [key] => SINGLE_KEY_TAGS.contains(key),
        [a, b] => matches!((*a, *b), (ID, VALUE) | (VALUE, ID)),
        _ => false,
    }
}

/// Options for rendering a graph as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOptions {
    /// Render dicts whose keys are all `None`, bools, numbers or strings as
    /// plain objects, stringifying the keys.
    ///
    /// Easier to read and edit, but lossy: `{1: x}` comes back as
    /// `{"1": x}`.
    pub stringify_keys: bool,
}

impl TextOptions {
    /// Creates default (lossless) options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options that stringify primitive dict keys.
    pub fn stringified_keys() -> Self {
        Self {
            stringify_keys: true,
        }
    }
}

/// The JSON document written for a save: the log graph plus what is needed
/// to write it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveDocument {
    /// Document format version.
    pub renpy_save: u32,
    /// Protocol of the source stream, and the default for writing back.
    pub protocol: u8,
    /// The archive's `json` entry, passed through untouched.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// The `json` entry's text when it is not valid JSON. Never set
    /// together with `metadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_text: Option<String>,
    /// The tagged form of the log graph.
    pub log: serde_json::Value,
}

impl SaveDocument {
    pub fn new(protocol: u8, metadata: Option<Metadata>, log: serde_json::Value) -> Self {
        let mut doc = Self {
            renpy_save: DOCUMENT_VERSION,
            protocol,
            metadata: None,
            metadata_text: None,
            log,
        };
        doc.set_archive_metadata(metadata);
        doc
    }

    /// The metadata to write into the archive, if the document has any.
    pub fn archive_metadata(&self) -> Option<Metadata> {
        match (&self.metadata, &self.metadata_text) {
            (Some(value), _) => Some(Metadata::Json(value.clone())),
            (None, Some(text)) => Some(Metadata::Raw(text.clone())),
            (None, None) => None,
        }
    }

    pub fn set_archive_metadata(&mut self, metadata: Option<Metadata>) {
        (self.metadata, self.metadata_text) = match metadata {
            Some(Metadata::Json(value)) => (Some(value), None),
            Some(Metadata::Raw(text)) => (None, Some(text)),
            None => (None, None),
        };
    }

    /// Reads a document. JSON without a `renpy_save` key is taken as a bare
    /// log graph, as written by earlier tools.
    pub fn from_json(value: serde_json::Value) -> Result<Self, TextFormatError> {
        let is_envelope = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("renpy_save"));
        if !is_envelope {
            return Ok(Self::new(DEFAULT_PROTOCOL, None, value));
        }

        let version = value.get("renpy_save").and_then(|v| v.as_u64());
        match version {
            Some(v) if v == u64::from(DOCUMENT_VERSION) => {}
            Some(version) => {
                return Err(TextFormatError::new(
                    "/renpy_save",
                    TextErrorKind::UnsupportedVersion { version },
                ));
            }
            None => {
                return Err(TextFormatError::new(
                    "/renpy_save",
                    TextErrorKind::Expected {
                        context: "document version",
                        expected: "unsigned integer",
                        found: json_kind(&value["renpy_save"]),
                    },
                ));
            }
        }
        let doc: Self = serde_json::from_value(value).map_err(|e| {
            TextFormatError::new(
                "",
                TextErrorKind::InvalidLiteral {
                    context: "document envelope",
                    text: e.to_string(),
                },
            )
        })?;
        if doc.metadata.is_some() && doc.metadata_text.is_some() {
            return Err(TextFormatError::new(
                "/metadata_text",
                TextErrorKind::UnexpectedKey {
                    tag: "document envelope",
                    key: "metadata_text".to_owned(),
                },
            ));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::json!({
            "renpy_save": self.renpy_save,
            "protocol": self.protocol,
            "metadata": self.metadata,
        });
        if let Some(text) = &self.metadata_text {
            out["metadata_text"] = serde_json::Value::from(text.as_str());
        }
        out["log"] = self.log.clone();
        out
    }
}

/// Name of a JSON value's type, for error messages.
pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// JSON-pointer-like location inside a document, e.g. `/log/3/state/hp`.
#[derive(Debug, Default)]
pub(crate) struct Path {
    buf: String,
}

impl Path {
    pub(crate) fn new(root: &str) -> Self {
        Self {
            buf: root.to_owned(),
        }
    }

    /// Appends a segment and returns the length to truncate back to.
    pub(crate) fn push(&mut self, segment: impl fmt::Display) -> usize {
        use fmt::Write;

        let len = self.buf.len();
        let _ = write!(self.buf, "/{segment}");
        len
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub(crate) fn error(&self, kind: TextErrorKind) -> TextFormatError {
        let path = if self.buf.is_empty() { "/" } else { self.buf.as_str() };
        TextFormatError::new(path, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_keys() {
        let reserved = |keys: &[&str]| is_reserved(keys);
        assert!(reserved(&["class"]));
        assert!(reserved(&["a", "module"]));
        assert!(reserved(&["tuple"]));
        assert!(reserved(&["value", "id"]));
        assert!(!reserved(&["id"]));
        assert!(!reserved(&["tuple", "set"]));
        assert!(!reserved(&["id", "value", "x"]));
        assert!(!reserved(&[]));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let doc = SaveDocument::new(
            2,
            Some(Metadata::Json(json!({"_save_name": "Chapter 1"}))),
            json!([1, 2]),
        );
        let parsed = SaveDocument::from_json(doc.to_json()).unwrap();
        assert_eq!(parsed, doc);
        assert!(doc.to_json().get("metadata_text").is_none());
    }

    #[test]
    fn test_metadata_text_is_separate() {
        let raw = SaveDocument::new(2, Some(Metadata::Raw("not json".into())), json!(null));
        assert_eq!(raw.metadata, None);
        let parsed = SaveDocument::from_json(raw.to_json()).unwrap();
        assert_eq!(parsed.archive_metadata(), Some(Metadata::Raw("not json".into())));

        // A JSON string is metadata, not text.
        let string = SaveDocument::new(2, Some(Metadata::Json(json!("x"))), json!(null));
        let parsed = SaveDocument::from_json(string.to_json()).unwrap();
        assert_eq!(parsed.archive_metadata(), Some(Metadata::Json(json!("x"))));

        let err = SaveDocument::from_json(json!({
            "renpy_save": 1, "protocol": 2, "metadata": {}, "metadata_text": "x", "log": null
        }))
        .unwrap_err();
        assert_eq!(err.path, "/metadata_text");
    }

    #[test]
    fn test_bare_graph_document() {
        let doc = SaveDocument::from_json(json!({"a": 1})).unwrap();
        assert_eq!(doc.protocol, DEFAULT_PROTOCOL);
        assert_eq!(doc.metadata, None);
        assert_eq!(doc.log, json!({"a": 1}));
    }

    #[test]
    fn test_envelope_errors() {
        let err = SaveDocument::from_json(json!({"renpy_save": 7, "protocol": 2, "log": null})).unwrap_err();
        assert_eq!(err.kind, TextErrorKind::UnsupportedVersion { version: 7 });
        assert_eq!(err.path, "/renpy_save");

        let err = SaveDocument::from_json(json!({"renpy_save": 1, "protocol": 2})).unwrap_err();
        assert!(matches!(err.kind, TextErrorKind::InvalidLiteral { context: "document envelope", .. }));
    }

    #[test]
    fn test_path() {
        let mut path = Path::new("/log");
        let mark = path.push(3);
        path.push("state");
        assert_eq!(path.error(TextErrorKind::NestingTooDeep { max: 1 }).path, "/log/3/state");
        path.truncate(mark);
        assert_eq!(path.error(TextErrorKind::NestingTooDeep { max: 1 }).path, "/log");
        assert_eq!(Path::default().error(TextErrorKind::NestingTooDeep { max: 1 }).path, "/");
    }
}
