//! The reference archive-side collaborator: reads the ZIP container a
//! checkpoint ships as. New code with no direct teacher analogue — the
//! teacher has no ZIP or tensor-storage handling — grounded on the `zip`
//! crate's standard read idiom.

pub mod storage;

use std::io::{Read, Seek};

use zip::ZipArchive;

use crate::error::{PickleError, Result};

/// A checkpoint archive: a ZIP file containing `data.pkl`, one `data/<key>`
/// entry per tensor storage, and optionally a `byteorder` marker.
pub struct CheckpointArchive<R> {
    zip: ZipArchive<R>,
}

impl<R: Read + Seek> CheckpointArchive<R> {
    pub fn open(reader: R) -> Result<Self> {
        let zip = ZipArchive::new(reader)
            .map_err(|e| PickleError::Malformed(format!("not a valid zip archive: {}", e)))?;
        Ok(Self { zip })
    }

    fn find_name(&self, suffix: &str) -> Result<String> {
        self.zip
            .file_names()
            .find(|name| name.ends_with(suffix))
            .map(|name| name.to_string())
            .ok_or_else(|| PickleError::Malformed(format!("archive has no entry ending in {}", suffix)))
    }

    pub fn read_by_suffix(&mut self, suffix: &str) -> Result<Vec<u8>> {
        let name = self.find_name(suffix)?;
        let mut file = self
            .zip
            .by_name(&name)
            .map_err(|e| PickleError::Malformed(e.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| PickleError::Malformed(e.to_string()))?;
        Ok(buf)
    }

    pub fn data_pkl(&mut self) -> Result<Vec<u8>> {
        self.read_by_suffix("data.pkl")
    }

    /// `"little"` or `"big"`, or `None` if the archive carries no
    /// `byteorder` marker (older checkpoints assume little-endian).
    pub fn byte_order(&mut self) -> Result<Option<String>> {
        match self.read_by_suffix("byteorder") {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(_) => Ok(None),
        }
    }

    pub fn storage_bytes(&mut self, key: &str) -> Result<Vec<u8>> {
        self.read_by_suffix(&format!("data/{}", key))
    }
}
