//! The save archive: a zip holding the pickled `log`, a `json` metadata
//! entry and whatever else the game put there (screenshot, version files).

use std::io::{Cursor, Read, Write};
use std::path::Path;

use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::ContainerError;
use crate::limits::{LOG_ENTRY, METADATA_ENTRY};

/// Contents of the `json` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    /// The entry parsed as JSON.
    Json(serde_json::Value),
    /// Text that is not valid JSON, kept as it was.
    Raw(String),
}

impl Metadata {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Metadata::Json(value) => Some(value),
            Metadata::Raw(_) => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        Ok(match self {
            Metadata::Json(value) => serde_json::to_vec(value).map_err(std::io::Error::from)?,
            Metadata::Raw(text) => text.clone().into_bytes(),
        })
    }
}

/// An opened save archive, held in memory.
pub struct SaveArchive {
    zip: ZipArchive<Cursor<Vec<u8>>>,
}

impl SaveArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let bytes = std::fs::read(path.as_ref())?;
        debug!(path = %path.as_ref().display(), len = bytes.len(), "read save archive");
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ContainerError> {
        Ok(Self {
            zip: ZipArchive::new(Cursor::new(bytes))?,
        })
    }

    /// Entry names in archive order.
    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(str::to_owned).collect()
    }

    /// Reads and inflates one entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ContainerError> {
        let mut file = match self.zip.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(ContainerError::MissingEntry {
                    name: name.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    /// The pickled game state.
    pub fn log_bytes(&mut self) -> Result<Vec<u8>, ContainerError> {
        self.read_entry(LOG_ENTRY)
    }

    /// The metadata entry, or `None` if the archive has none.
    ///
    /// An entry that is not valid JSON comes back as [`Metadata::Raw`].
    pub fn metadata(&mut self) -> Result<Option<Metadata>, ContainerError> {
        let bytes = match self.read_entry(METADATA_ENTRY) {
            Ok(bytes) => bytes,
            Err(ContainerError::MissingEntry { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let metadata = match serde_json::from_slice(&bytes) {
            Ok(value) => Metadata::Json(value),
            Err(e) => {
                debug!(error = %e, "metadata entry is not JSON, keeping its text");
                Metadata::Raw(String::from_utf8_lossy(&bytes).into_owned())
            }
        };
        Ok(Some(metadata))
    }

    /// Builds a new archive with `log` replaced.
    ///
    /// Every other entry is copied without recompression. When `metadata`
    /// is given it replaces the `json` entry.
    pub fn rewrite(&mut self, log: &[u8], metadata: Option<&Metadata>) -> Result<Vec<u8>, ContainerError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut copied = 0usize;
        for i in 0..self.zip.len() {
            let file = self.zip.by_index_raw(i)?;
            let name = file.name();
            if name == LOG_ENTRY || (metadata.is_some() && name == METADATA_ENTRY) {
                continue;
            }
            writer.raw_copy_file(file)?;
            copied += 1;
        }

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file(LOG_ENTRY, options)?;
        writer.write_all(log)?;

        if let Some(metadata) = metadata {
            let text = metadata.to_bytes()?;
            writer.start_file(METADATA_ENTRY, options)?;
            writer.write_all(&text)?;
        }

        let out = writer.finish()?.into_inner();
        debug!(copied, log_len = log.len(), len = out.len(), "rewrote save archive");
        Ok(out)
    }
}
