//! Append-only leaf record log.
//!
//! Each entry is a little-endian `u32` body length followed by the bincode
//! encoding of a [`LeafRecord`]. Entries are never rewritten in place; a
//! replaced or deleted record becomes garbage until the next compaction.

use crate::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use vmap_types::LeafRecord;

const LEN_PREFIX: usize = 4;

#[derive(Debug)]
pub(super) struct LeafLog {
    file: File,
    max_record_size: u32,
}

impl LeafLog {
    pub fn open(path: &Path, max_record_size: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            max_record_size,
        })
    }

    /// Open `path` as an empty log, discarding anything it held.
    pub fn create(path: &Path, max_record_size: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            max_record_size,
        })
    }

    /// Append the encoding of `leaf` to `buf`, returning the entry length.
    pub fn encode_into(&self, leaf: &LeafRecord, buf: &mut Vec<u8>) -> Result<u32> {
        let body = bincode::serialize(leaf)?;
        if body.len() > self.max_record_size as usize {
            return Err(StorageError::RecordTooLarge {
                size: body.len(),
                limit: self.max_record_size,
            });
        }
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok((LEN_PREFIX + body.len()) as u32)
    }

    /// Raw bytes of the entry at `offset`, length prefix included.
    pub fn read_entry(&self, offset: u64) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LEN_PREFIX];
        self.file.read_exact_at(&mut prefix, offset)?;
        let len = u32::from_le_bytes(prefix);
        if len > self.max_record_size {
            return Err(StorageError::Corrupt(format!(
                "leaf log entry at {offset} claims {len} bytes"
            )));
        }
        let mut entry = vec![0u8; LEN_PREFIX + len as usize];
        entry[..LEN_PREFIX].copy_from_slice(&prefix);
        self.file
            .read_exact_at(&mut entry[LEN_PREFIX..], offset + LEN_PREFIX as u64)?;
        Ok(entry)
    }

    /// Decode the entry at `offset`, returning the record and entry length.
    pub fn read(&self, offset: u64) -> Result<(LeafRecord, u32)> {
        let entry = self.read_entry(offset)?;
        let leaf: LeafRecord = bincode::deserialize(&entry[LEN_PREFIX..])
            .map_err(|e| StorageError::Corrupt(format!("leaf log entry at {offset}: {e}")))?;
        Ok((leaf, entry.len() as u32))
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all_at(bytes, offset)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Copy the first `len` bytes into a fresh file at `target`.
    pub fn copy_prefix(&self, target: &Path, len: u64) -> io::Result<()> {
        let mut out = File::create(target)?;
        let mut reader = FileRef(&self.file, 0).take(len);
        io::copy(&mut reader, &mut out)?;
        Ok(())
    }
}

/// Positional reader over a shared file handle.
struct FileRef<'a>(&'a File, u64);

impl Read for FileRef<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.read_at(buf, self.1)?;
        self.1 += n as u64;
        Ok(n)
    }
}
