//! Disk data source header.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use vmap_types::MapMetadata;

pub(super) const HEADER_FILE: &str = "header.bin";

const MAGIC: [u8; 4] = *b"VMAP";
const FORMAT_VERSION: u32 = 2;

/// Small fixed record naming the committed state of the other files.
///
/// Everything in the leaf log past `leaf_log_len` is unreachable: either
/// the tail of an interrupted save or, in a snapshot, bytes appended after
/// the snapshot was taken.
///
/// `log_generation` names the leaf log and path index files in use.
/// Compaction writes the next generation beside the current one and
/// switches over by rewriting the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct DiskHeader {
    magic: [u8; 4],
    format_version: u32,
    pub metadata: MapMetadata,
    pub leaf_log_len: u64,
    pub garbage_bytes: u64,
    pub log_generation: u64,
}

impl DiskHeader {
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            metadata: MapMetadata::EMPTY,
            leaf_log_len: 0,
            garbage_bytes: 0,
            log_generation: 0,
        }
    }

    /// Read the header, or `None` if the directory holds no data source yet.
    pub fn read(directory: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(directory.join(HEADER_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let header: Self = bincode::deserialize(&bytes)?;
        if header.magic != MAGIC {
            return Err(StorageError::Corrupt(format!(
                "bad header magic {:?} in {}",
                header.magic,
                directory.display()
            )));
        }
        if header.format_version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        if !header.metadata.is_complete() {
            return Err(StorageError::Corrupt(format!(
                "header describes an impossible tree shape {:?}",
                header.metadata
            )));
        }
        Ok(Some(header))
    }

    /// Replace the header through a temporary file and a rename.
    pub fn write(&self, directory: &Path, sync: bool) -> Result<()> {
        let tmp = directory.join(format!("{HEADER_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(&bincode::serialize(self)?)?;
        if sync {
            file.sync_data()?;
        }
        fs::rename(tmp, directory.join(HEADER_FILE))?;
        Ok(())
    }

    /// Fraction of the leaf log no longer referenced.
    pub fn garbage_ratio(&self) -> f64 {
        if self.leaf_log_len == 0 {
            0.0
        } else {
            self.garbage_bytes as f64 / self.leaf_log_len as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_header_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskHeader::read(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = DiskHeader::new();
        header.metadata = MapMetadata::for_size(5);
        header.leaf_log_len = 400;
        header.garbage_bytes = 100;
        header.log_generation = 3;
        header.write(dir.path(), false).unwrap();

        let read = DiskHeader::read(dir.path()).unwrap().unwrap();
        assert_eq!(read, header);
        assert_eq!(read.garbage_ratio(), 0.25);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut header = DiskHeader::new();
        header.magic = *b"NOPE";
        header.write(dir.path(), false).unwrap();
        assert!(matches!(
            DiskHeader::read(dir.path()),
            Err(StorageError::Corrupt(_))
        ));
    }
}
