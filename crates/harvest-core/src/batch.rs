//! HarvestBatch: one page of harvested records plus its continuation token.
//!
//! Each record's payload is staged as a standalone XML document, either in
//! memory or as a temp file, so the crosswalk can consume records one at a
//! time without the whole response ever being held at once.

use crate::error::{HarvestError, Result};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Where the splitter stages record payloads.
#[derive(Debug, Clone, Default)]
pub enum Staging {
    /// Keep each payload in a `Vec<u8>`
    #[default]
    Memory,
    /// Write each payload to its own temp file in this directory
    Directory(PathBuf),
}

impl Staging {
    /// Open a writer for a fresh payload.
    pub(crate) fn open(&self) -> Result<StageWriter> {
        match self {
            Staging::Memory => Ok(StageWriter::Memory(Vec::new())),
            Staging::Directory(dir) => {
                let file = tempfile::Builder::new()
                    .prefix("record-")
                    .suffix(".xml")
                    .tempfile_in(dir)
                    .map_err(|e| HarvestError::Staging(format!("{}: {}", dir.display(), e)))?;
                Ok(StageWriter::File(file))
            }
        }
    }
}

/// Sink for one record payload while it is being re-serialized.
pub(crate) enum StageWriter {
    Memory(Vec<u8>),
    File(NamedTempFile),
}

impl StageWriter {
    pub(crate) fn finish(self) -> Result<StagedBlob> {
        match self {
            StageWriter::Memory(bytes) => Ok(StagedBlob::Memory(bytes)),
            StageWriter::File(mut file) => {
                file.flush()
                    .map_err(|e| HarvestError::Staging(e.to_string()))?;
                Ok(StagedBlob::File(file))
            }
        }
    }
}

impl Write for StageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StageWriter::Memory(bytes) => bytes.write(buf),
            StageWriter::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StageWriter::Memory(_) => Ok(()),
            StageWriter::File(file) => file.flush(),
        }
    }
}

/// A staged record payload. File-backed blobs are deleted on drop.
#[derive(Debug)]
pub enum StagedBlob {
    Memory(Vec<u8>),
    File(NamedTempFile),
}

impl StagedBlob {
    /// Read the whole payload.
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            StagedBlob::Memory(bytes) => Ok(bytes.clone()),
            StagedBlob::File(file) => {
                let mut bytes = Vec::new();
                file.reopen()
                    .and_then(|mut f| f.read_to_end(&mut bytes))
                    .map_err(|e| HarvestError::Staging(e.to_string()))?;
                Ok(bytes)
            }
        }
    }
}

impl From<Vec<u8>> for StagedBlob {
    fn from(bytes: Vec<u8>) -> Self {
        StagedBlob::Memory(bytes)
    }
}

/// One harvested record: the remote identifier and its staged payload.
#[derive(Debug)]
pub struct HarvestedRecord {
    pub external_id: String,
    pub blob: StagedBlob,
}

/// One page of results from a single protocol call.
#[derive(Debug, Default)]
pub struct HarvestBatch {
    records: Vec<HarvestedRecord>,
    /// Identifiers the node reported as deleted on this page
    pub deleted: Vec<String>,
    /// Opaque cursor for the next page; `None` ends the sequence
    pub continuation_token: Option<String>,
}

impl HarvestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, external_id: String, blob: StagedBlob) {
        self.records.push(HarvestedRecord { external_id, blob });
    }

    pub fn records(&self) -> &[HarvestedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether another page follows this one.
    pub fn has_more(&self) -> bool {
        self.continuation_token.is_some()
    }
}

impl IntoIterator for HarvestBatch {
    type Item = HarvestedRecord;
    type IntoIter = std::vec::IntoIter<HarvestedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_batch_order_and_token() {
        let mut batch = HarvestBatch::new();
        batch.push("b".into(), b"<b/>".to_vec().into());
        batch.push("a".into(), b"<a/>".to_vec().into());
        assert_eq!(batch.len(), 2);
        assert!(!batch.has_more());

        batch.continuation_token = Some("next".into());
        assert!(batch.has_more());

        let ids: Vec<_> = batch.into_iter().map(|r| r.external_id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_directory_staging_roundtrip_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let staging = Staging::Directory(dir.path().to_path_buf());

        let mut writer = staging.open().unwrap();
        writer.write_all(b"<x>payload</x>").unwrap();
        let blob = writer.finish().unwrap();

        assert_eq!(blob.read().unwrap(), b"<x>payload</x>");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(blob);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_directory_staging_missing_dir() {
        let staging = Staging::Directory(PathBuf::from("/nonexistent/staging/dir"));
        assert!(matches!(staging.open(), Err(HarvestError::Staging(_))));
    }
}
