//! Fixed-width slot files indexed by tree path.
//!
//! Slot `i` of a file with width `W` lives at byte offset `i * W`. Reads past
//! the end of the file see an unwritten slot. Writes of many slots are sorted
//! and coalesced into one positional write per contiguous run.

use crate::HashSlot;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;
use vmap_types::Hash;

/// Slots written per call when filling a large range.
const FILL_CHUNK: u64 = 4096;

#[derive(Debug)]
struct SlotFile<const W: usize> {
    file: File,
}

impl<const W: usize> SlotFile<W> {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Open `path` as an empty slot file, discarding anything it held.
    fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Current bytes of slots `start..=end_inclusive` that exist on disk.
    fn preimage(&self, start: u64, end_inclusive: u64) -> io::Result<Preimage> {
        let offset = Self::offset(start)?;
        let end = Self::offset(end_inclusive)?
            .saturating_add(W as u64)
            .min(self.len()?);
        let mut bytes = vec![0u8; end.saturating_sub(offset) as usize];
        self.file.read_exact_at(&mut bytes, offset)?;
        Ok(Preimage { offset, bytes })
    }

    fn offset(index: u64) -> io::Result<u64> {
        index.checked_mul(W as u64).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, format!("slot {index} out of range"))
        })
    }

    fn read(&self, index: u64) -> io::Result<Option<[u8; W]>> {
        let mut buf = [0u8; W];
        match self.file.read_exact_at(&mut buf, Self::offset(index)?) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_many(&self, mut slots: Vec<(u64, [u8; W])>) -> io::Result<()> {
        slots.sort_by_key(|(index, _)| *index);
        // Later writes to the same slot win.
        slots.reverse();
        slots.dedup_by_key(|(index, _)| *index);
        slots.reverse();

        let mut run_start = 0u64;
        let mut run: Vec<u8> = Vec::new();
        for (index, bytes) in slots {
            let contiguous = !run.is_empty() && index == run_start + (run.len() / W) as u64;
            if !contiguous {
                if !run.is_empty() {
                    self.file.write_all_at(&run, Self::offset(run_start)?)?;
                    run.clear();
                }
                run_start = index;
            }
            run.extend_from_slice(&bytes);
        }
        if !run.is_empty() {
            self.file.write_all_at(&run, Self::offset(run_start)?)?;
        }
        Ok(())
    }

    fn fill(&self, start: u64, end_inclusive: u64, value: [u8; W]) -> io::Result<()> {
        let mut index = start;
        while index <= end_inclusive {
            let count = (end_inclusive - index + 1).min(FILL_CHUNK);
            let buf: Vec<u8> = value.repeat(count as usize);
            self.file.write_all_at(&buf, Self::offset(index)?)?;
            index += count;
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Bytes a slot file held at `offset` before a write replaced them.
#[derive(Debug)]
struct Preimage {
    offset: u64,
    bytes: Vec<u8>,
}

/// Slot contents overwritten while a snapshot copies the index files.
///
/// Writing the recorded bytes back over the copies, newest first, turns a
/// copy taken during concurrent saves into the files as they were when the
/// capture started.
#[derive(Debug, Default)]
pub(super) struct SlotCapture {
    paths: Vec<Preimage>,
    hashes: Vec<Preimage>,
}

impl SlotCapture {
    pub fn hashes_before(
        &mut self,
        index: &HashIndex,
        start: u64,
        end_inclusive: u64,
    ) -> io::Result<()> {
        self.hashes.push(index.slots.preimage(start, end_inclusive)?);
        Ok(())
    }

    pub fn paths_before(
        &mut self,
        index: &PathIndex,
        start: u64,
        end_inclusive: u64,
    ) -> io::Result<()> {
        self.paths.push(index.slots.preimage(start, end_inclusive)?);
        Ok(())
    }

    /// Roll copies of the index files back to the captured state and cut
    /// them to the lengths they had then.
    pub fn restore(self, paths: (&Path, u64), hashes: (&Path, u64)) -> io::Result<()> {
        rewind(paths.0, paths.1, self.paths)?;
        rewind(hashes.0, hashes.1, self.hashes)
    }
}

fn rewind(target: &Path, len: u64, preimages: Vec<Preimage>) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(target)?;
    for preimage in preimages.into_iter().rev() {
        file.write_all_at(&preimage.bytes, preimage.offset)?;
    }
    file.set_len(len)
}

const HASH_SLOT: usize = 33;
const TAG_PRESENT: u8 = 1;
const TAG_DELETED: u8 = 2;

/// Node hashes by path. Each slot is a tag byte followed by the hash.
#[derive(Debug)]
pub(super) struct HashIndex {
    slots: SlotFile<HASH_SLOT>,
}

impl HashIndex {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            slots: SlotFile::open(path)?,
        })
    }

    pub fn get(&self, path: u64) -> io::Result<HashSlot> {
        let Some(slot) = self.slots.read(path)? else {
            return Ok(HashSlot::Unwritten);
        };
        match slot[0] {
            TAG_PRESENT => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&slot[1..]);
                Ok(HashSlot::Present(Hash::from_raw(hash)))
            }
            TAG_DELETED => Ok(HashSlot::Deleted),
            _ => Ok(HashSlot::Unwritten),
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        self.slots.len()
    }

    pub fn put_many(&self, records: impl Iterator<Item = (u64, Hash)>) -> io::Result<()> {
        let slots = records
            .map(|(path, hash)| {
                let mut slot = [0u8; HASH_SLOT];
                slot[0] = TAG_PRESENT;
                slot[1..].copy_from_slice(hash.as_bytes());
                (path, slot)
            })
            .collect();
        self.slots.write_many(slots)
    }

    pub fn delete_range(&self, start: u64, end_inclusive: u64) -> io::Result<()> {
        let mut tombstone = [0u8; HASH_SLOT];
        tombstone[0] = TAG_DELETED;
        self.slots.fill(start, end_inclusive, tombstone)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.slots.sync()
    }
}

/// Leaf log offsets by path. A slot holds `offset + 1`; zero means empty.
#[derive(Debug)]
pub(super) struct PathIndex {
    slots: SlotFile<8>,
}

impl PathIndex {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            slots: SlotFile::open(path)?,
        })
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            slots: SlotFile::create(path)?,
        })
    }

    pub fn len(&self) -> io::Result<u64> {
        self.slots.len()
    }

    pub fn get(&self, path: u64) -> io::Result<Option<u64>> {
        Ok(self
            .slots
            .read(path)?
            .map(u64::from_le_bytes)
            .and_then(|stored| stored.checked_sub(1)))
    }

    pub fn set_many(&self, entries: impl Iterator<Item = (u64, Option<u64>)>) -> io::Result<()> {
        let slots = entries
            .map(|(path, offset)| (path, offset.map_or(0, |o| o + 1).to_le_bytes()))
            .collect();
        self.slots.write_many(slots)
    }

    pub fn clear_range(&self, start: u64, end_inclusive: u64) -> io::Result<()> {
        self.slots.fill(start, end_inclusive, [0u8; 8])
    }

    pub fn sync(&self) -> io::Result<()> {
        self.slots.sync()
    }
}
