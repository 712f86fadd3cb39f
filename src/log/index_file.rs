// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sparse offset index of a segment.
//!
//! Each entry maps a record's offset relative to the segment start to the
//! byte position of its frame in the data file. Entries are appended in
//! increasing order of both fields, so lookups are a binary search for the
//! greatest entry not after the target.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{AppError, AppResult};

pub const INDEX_ENTRY_SIZE: usize = 8;

/// Index of a closed segment, trimmed to its valid entries.
#[derive(Debug)]
pub struct ReadOnlyIndexFile {
    mmap: Option<Mmap>,
    entries: usize,
}

/// Index of the active segment, pre-allocated to its maximum size.
#[derive(Debug)]
pub struct WritableIndexFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    entries: usize,
    max_entry_count: usize,
}

impl ReadOnlyIndexFile {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::options().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let entries = len / INDEX_ENTRY_SIZE;
        if entries == 0 {
            return Ok(Self {
                mmap: None,
                entries: 0,
            });
        }

        // SAFETY: closed index files are never written again while mapped.
        let mmap = unsafe { MmapOptions::new().len(entries * INDEX_ENTRY_SIZE).map(&file)? };
        Ok(Self {
            mmap: Some(mmap),
            entries,
        })
    }

    pub fn lookup(&self, target_offset: u32) -> Option<(u32, u32)> {
        match &self.mmap {
            Some(mmap) => binary_search_index(&mmap[..], self.entries, target_offset),
            None => Some((0, 0)),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn last_entry(&self) -> Option<(u32, u32)> {
        let mmap = self.mmap.as_ref()?;
        entry_at(&mmap[..], self.entries.checked_sub(1)?)
    }

    /// Entries must strictly increase in both fields and point inside the
    /// data file. An index left untrimmed by a crash fails this check.
    pub fn is_consistent(&self, data_len: u64) -> bool {
        let Some(mmap) = &self.mmap else {
            return true;
        };
        let mut previous: Option<(u32, u32)> = None;
        for i in 0..self.entries {
            let Some((offset, position)) = entry_at(&mmap[..], i) else {
                return false;
            };
            if position as u64 >= data_len {
                return false;
            }
            if let Some((prev_offset, prev_position)) = previous {
                if offset <= prev_offset || position <= prev_position {
                    return false;
                }
            }
            previous = Some((offset, position));
        }
        true
    }

    /// Iterates every entry, used by the dump tool.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.entries).filter_map(move |i| self.mmap.as_ref().and_then(|m| entry_at(&m[..], i)))
    }
}

impl WritableIndexFile {
    /// Creates (or resets) the index file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, max_size: usize) -> AppResult<Self> {
        let max_entry_count = max_size / INDEX_ENTRY_SIZE;
        if max_entry_count == 0 {
            return Err(AppError::InvalidValue(format!(
                "index file size {} can not hold a single entry",
                max_size
            )));
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.set_len((max_entry_count * INDEX_ENTRY_SIZE) as u64)?;

        // SAFETY: the mapping is owned by this struct and the file is only
        // resized again after the mapping has been dropped.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            mmap,
            entries: 0,
            max_entry_count,
        })
    }

    pub fn add_entry(&mut self, relative_offset: u32, position: u32) -> AppResult<()> {
        if self.is_full() {
            return Err(AppError::InvalidOperation(format!(
                "index file {} is full",
                self.path.display()
            )));
        }

        let offset = self.entries * INDEX_ENTRY_SIZE;
        self.mmap[offset..offset + 4].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[offset + 4..offset + 8].copy_from_slice(&position.to_be_bytes());
        self.entries += 1;
        Ok(())
    }

    pub fn lookup(&self, target_offset: u32) -> Option<(u32, u32)> {
        binary_search_index(&self.mmap[..], self.entries, target_offset)
    }

    /// Drops every entry pointing at or past `position`.
    pub fn truncate_to_position(&mut self, position: u32) {
        while self.entries > 0 {
            match entry_at(&self.mmap[..], self.entries - 1) {
                Some((_, entry_position)) if entry_position >= position => self.entries -= 1,
                _ => break,
            }
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        self.mmap
            .flush()
            .map_err(|e| AppError::DetailedIoError(format!("flush index file error: {}", e)))
    }

    pub fn is_full(&self) -> bool {
        self.entries + 1 > self.max_entry_count
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn last_entry(&self) -> Option<(u32, u32)> {
        entry_at(&self.mmap[..], self.entries.checked_sub(1)?)
    }

    /// Flushes, trims the file to its valid entries and maps it read-only.
    pub fn into_readonly(self) -> AppResult<ReadOnlyIndexFile> {
        self.mmap.flush()?;
        let Self {
            path,
            file,
            mmap,
            entries,
            ..
        } = self;
        drop(mmap);
        file.set_len((entries * INDEX_ENTRY_SIZE) as u64)?;
        file.sync_all()?;
        drop(file);
        ReadOnlyIndexFile::open(path)
    }
}

fn entry_at(slice: &[u8], index: usize) -> Option<(u32, u32)> {
    let offset = index * INDEX_ENTRY_SIZE;
    let entry = slice.get(offset..offset + INDEX_ENTRY_SIZE)?;
    let relative_offset = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
    let position = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);
    Some((relative_offset, position))
}

/// Binary search for the greatest entry whose offset is not after
/// `target_offset`. With no such entry the search falls back to the start
/// of the segment.
fn binary_search_index(slice: &[u8], entries: usize, target_offset: u32) -> Option<(u32, u32)> {
    if entries == 0 {
        return Some((0, 0));
    }

    let (first_offset, _) = entry_at(slice, 0)?;
    if target_offset < first_offset {
        return Some((0, 0));
    }

    let mut left = 0;
    let mut right = entries - 1;
    while left < right {
        let mid = left + (right - left + 1) / 2;
        let (entry_offset, _) = entry_at(slice, mid)?;
        if entry_offset > target_offset {
            right = mid - 1;
        } else {
            left = mid;
        }
    }
    entry_at(slice, left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lookup_finds_floor_entry() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut index = WritableIndexFile::create(dir.path().join("0.index"), 1024)?;
        assert_eq!(index.lookup(5), Some((0, 0)));

        index.add_entry(10, 400)?;
        index.add_entry(20, 800)?;
        index.add_entry(30, 1200)?;

        assert_eq!(index.lookup(3), Some((0, 0)));
        assert_eq!(index.lookup(10), Some((10, 400)));
        assert_eq!(index.lookup(19), Some((10, 400)));
        assert_eq!(index.lookup(25), Some((20, 800)));
        assert_eq!(index.lookup(1000), Some((30, 1200)));
        Ok(())
    }

    #[test]
    fn full_index_rejects_entries() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut index = WritableIndexFile::create(dir.path().join("0.index"), 2 * INDEX_ENTRY_SIZE)?;
        index.add_entry(1, 10)?;
        index.add_entry(2, 20)?;
        assert!(index.is_full());
        assert!(index.add_entry(3, 30).is_err());
        Ok(())
    }

    #[test]
    fn readonly_conversion_trims_unused_space() -> AppResult<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("0.index");
        let mut index = WritableIndexFile::create(&path, 4096)?;
        index.add_entry(5, 100)?;
        index.add_entry(9, 300)?;

        let readonly = index.into_readonly()?;
        assert_eq!(std::fs::metadata(&path)?.len(), 2 * INDEX_ENTRY_SIZE as u64);
        assert_eq!(readonly.entries(), 2);
        assert_eq!(readonly.last_entry(), Some((9, 300)));
        assert_eq!(readonly.lookup(7), Some((5, 100)));

        let reopened = ReadOnlyIndexFile::open(&path)?;
        assert_eq!(reopened.lookup(100), Some((9, 300)));
        assert!(reopened.is_consistent(1000));
        assert!(!reopened.is_consistent(300));
        assert_eq!(reopened.iter().collect::<Vec<_>>(), vec![(5, 100), (9, 300)]);
        Ok(())
    }

    #[test]
    fn empty_readonly_index_falls_back_to_start() -> AppResult<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("0.index");
        let readonly = WritableIndexFile::create(&path, 64)?.into_readonly()?;
        assert_eq!(readonly.entries(), 0);
        assert_eq!(readonly.lookup(42), Some((0, 0)));
        assert_eq!(readonly.last_entry(), None);
        Ok(())
    }

    #[test]
    fn truncation_drops_entries_past_position() -> AppResult<()> {
        let dir = TempDir::new()?;
        let mut index = WritableIndexFile::create(dir.path().join("0.index"), 1024)?;
        index.add_entry(4, 100)?;
        index.add_entry(8, 200)?;
        index.add_entry(12, 300)?;

        index.truncate_to_position(200);
        assert_eq!(index.entries(), 1);
        assert_eq!(index.lookup(50), Some((4, 100)));
        Ok(())
    }
}
