//! End-to-end conversions between save archives and JSON documents.
//!
//! Archives are assembled in memory; an output file is written once, only
//! after every step succeeded.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::archive::SaveArchive;
use crate::codec::{decode_pickle_global, encode_pickle, EncodeOptions};
use crate::error::{ContainerError, Error};
use crate::registry::TypeRegistry;
use crate::text::{from_text_at, to_text, SaveDocument, TextOptions};

/// Decodes the `log` entry of `archive` into a document.
pub fn save_to_document(archive: &mut SaveArchive, options: &TextOptions) -> Result<SaveDocument, Error> {
    let log = archive.log_bytes()?;
    let decoded = decode_pickle_global(&log)?;
    let text = to_text(&decoded.graph, &decoded.root, options)?;
    let metadata = archive.metadata()?;
    info!(
        protocol = decoded.protocol,
        nodes = decoded.graph.len(),
        "decoded save log"
    );
    Ok(SaveDocument::new(decoded.protocol, metadata, text))
}

/// Encodes `document` and returns the bytes of `template` with its `log`
/// (and metadata, if the document carries any) replaced.
///
/// `protocol` overrides the one recorded in the document.
pub fn document_to_save(
    document: &SaveDocument,
    template: &mut SaveArchive,
    protocol: Option<u8>,
) -> Result<Vec<u8>, Error> {
    let (graph, root) = from_text_at(&document.log, TypeRegistry::global(), "/log")?;
    let options = EncodeOptions::with_protocol(protocol.unwrap_or(document.protocol));
    let log = encode_pickle(&graph, &root, &options)?;
    debug!(protocol = options.protocol, len = log.len(), "encoded save log");
    let out = template.rewrite(&log, document.archive_metadata().as_ref())?;
    info!(nodes = graph.len(), len = out.len(), "built save archive");
    Ok(out)
}

/// Parses a JSON document of any nesting depth.
///
/// Depth is bounded later by the graph decoder, with a located error.
pub fn parse_document(bytes: &[u8]) -> Result<SaveDocument, Error> {
    let mut de = serde_json::Deserializer::from_slice(bytes);
    de.disable_recursion_limit();
    let value = serde_json::Value::deserialize(&mut de)?;
    de.end()?;
    Ok(SaveDocument::from_json(value)?)
}

/// Serializes a document, pretty-printed unless `compact`.
pub fn write_document(document: &SaveDocument, compact: bool) -> Result<Vec<u8>, Error> {
    let value = document.to_json();
    let mut out = if compact {
        serde_json::to_vec(&value)?
    } else {
        serde_json::to_vec_pretty(&value)?
    };
    out.push(b'\n');
    Ok(out)
}

/// Reads the save at `path` and returns its document.
pub fn decode_save_file(path: impl AsRef<Path>, options: &TextOptions) -> Result<SaveDocument, Error> {
    let mut archive = SaveArchive::open(path)?;
    save_to_document(&mut archive, options)
}

/// Reads the document at `json`, rebuilds the save from `template` and
/// writes it to `output`.
pub fn encode_save_file(
    json: impl AsRef<Path>,
    template: impl AsRef<Path>,
    output: impl AsRef<Path>,
    protocol: Option<u8>,
) -> Result<(), Error> {
    let document = parse_document(&std::fs::read(json.as_ref()).map_err(ContainerError::from)?)?;
    let mut template = SaveArchive::open(template)?;
    let bytes = document_to_save(&document, &mut template, protocol)?;
    std::fs::write(output.as_ref(), bytes).map_err(ContainerError::from)?;
    info!(output = %output.as_ref().display(), "wrote save");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::error::TextErrorKind;
    use serde_json::json;

    // {'a': [1, 2, 3]} at protocol 2, as written by CPython.
    const SIMPLE_LOG: &[u8] = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(K\x01K\x02K\x03es.";

    // The same dict as written back: strings are not memoized.
    const REWRITTEN_LOG: &[u8] = b"\x80\x02}q\x00X\x01\x00\x00\x00a]q\x01(K\x01K\x02K\x03es.";

    #[test]
    fn test_save_to_document() {
        let bytes = build_zip(&[("log", SIMPLE_LOG), ("json", br#"{"_save_name": "x"}"#)]);
        let mut archive = SaveArchive::from_bytes(bytes).unwrap();
        let doc = save_to_document(&mut archive, &TextOptions::default()).unwrap();
        assert_eq!(doc.protocol, 2);
        assert_eq!(doc.metadata, Some(json!({"_save_name": "x"})));
        assert_eq!(doc.log, json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn test_document_to_save_roundtrip() {
        let bytes = build_zip(&[("log", SIMPLE_LOG), ("screenshot.png", b"png")]);
        let mut archive = SaveArchive::from_bytes(bytes).unwrap();
        let doc = SaveDocument::new(2, None, json!({"a": [1, 2, 3]}));
        let out = document_to_save(&doc, &mut archive, None).unwrap();

        let mut rebuilt = SaveArchive::from_bytes(out).unwrap();
        assert_eq!(rebuilt.log_bytes().unwrap(), REWRITTEN_LOG);
        assert_eq!(rebuilt.read_entry("screenshot.png").unwrap(), b"png");
    }

    #[test]
    fn test_metadata_text_roundtrip() {
        let bytes = build_zip(&[("log", SIMPLE_LOG), ("json", b"{broken")]);
        let mut archive = SaveArchive::from_bytes(bytes).unwrap();
        let doc = save_to_document(&mut archive, &TextOptions::default()).unwrap();
        assert_eq!(doc.metadata, None);
        assert_eq!(doc.metadata_text.as_deref(), Some("{broken"));

        let doc = parse_document(&write_document(&doc, false).unwrap()).unwrap();
        let out = document_to_save(&doc, &mut archive, None).unwrap();
        let mut rebuilt = SaveArchive::from_bytes(out).unwrap();
        assert_eq!(rebuilt.read_entry("json").unwrap(), b"{broken");
    }

    #[test]
    fn test_missing_log_entry() {
        let bytes = build_zip(&[("json", b"{}")]);
        let mut archive = SaveArchive::from_bytes(bytes).unwrap();
        let err = save_to_document(&mut archive, &TextOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Container(ContainerError::MissingEntry { .. })));
    }

    #[test]
    fn test_text_errors_are_located_under_log() {
        let bytes = build_zip(&[("log", SIMPLE_LOG)]);
        let mut archive = SaveArchive::from_bytes(bytes).unwrap();
        let doc = SaveDocument::new(2, None, json!([{"ref": 0}]));
        let Err(Error::Text(err)) = document_to_save(&doc, &mut archive, None) else {
            panic!("expected a text error");
        };
        assert_eq!(err.path, "/log/0");
        assert_eq!(err.kind, TextErrorKind::DanglingRef { id: 0 });
    }

    #[test]
    fn test_parse_document_deep_nesting() {
        let depth = 200;
        let text = format!("{}0{}", "[".repeat(depth), "]".repeat(depth));
        let doc = parse_document(text.as_bytes()).unwrap();
        assert_eq!(doc.metadata, None);

        assert!(matches!(parse_document(b"[1, 2"), Err(Error::Json(_))));
        assert!(matches!(parse_document(b"[] []"), Err(Error::Json(_))));
    }

    #[test]
    fn test_write_document() {
        let doc = SaveDocument::new(4, None, json!({"b": 1, "a": 2}));
        let out = write_document(&doc, true).unwrap();
        assert_eq!(
            out,
            b"{\"renpy_save\":1,\"protocol\":4,\"metadata\":null,\"log\":{\"b\":1,\"a\":2}}\n"
        );
        assert_eq!(parse_document(&out).unwrap(), doc);
    }

    #[test]
    fn test_file_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("1-1-LT1.save");
        std::fs::write(&save, build_zip(&[("log", SIMPLE_LOG), ("json", b"{}")])).unwrap();

        let doc = decode_save_file(&save, &TextOptions::default()).unwrap();
        let json = dir.path().join("save.json");
        std::fs::write(&json, write_document(&doc, false).unwrap()).unwrap();

        let output = dir.path().join("out.save");
        encode_save_file(&json, &save, &output, Some(3)).unwrap();
        let mut rebuilt = SaveArchive::open(&output).unwrap();
        assert_eq!(&rebuilt.log_bytes().unwrap()[..2], b"\x80\x03");

        let missing = dir.path().join("missing.json");
        let err = encode_save_file(&missing, &save, dir.path().join("never.save"), None).unwrap_err();
        assert!(matches!(err, Error::Container(ContainerError::Io(_))));
        assert!(!dir.path().join("never.save").exists());
    }
}
