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

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use tracing::{info, trace};

use super::OffsetStorageInfo;
use crate::message::TopicPartition;
use crate::AppResult;

/// Durable home of committed offsets.
pub trait OffsetStorage: Send + Sync + Debug {
    fn load_offset(
        &self,
        group: &str,
        topic_partition: &TopicPartition,
    ) -> AppResult<Option<OffsetStorageInfo>>;

    /// Every stored offset record of `group`.
    fn load_group_offsets(&self, group: &str) -> AppResult<Vec<OffsetStorageInfo>>;

    /// Persists all records in one atomic batch.
    fn commit_offsets(&self, offsets: &[OffsetStorageInfo]) -> AppResult<()>;
}

/// Offsets kept in RocksDB under `offset:<group>:<topic>-<partition>` with
/// a JSON value.
pub struct RocksDbOffsetStorage {
    path: PathBuf,
    db: DB,
}

impl Debug for RocksDbOffsetStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbOffsetStorage")
            .field("path", &self.path)
            .finish()
    }
}

impl RocksDbOffsetStorage {
    const OFFSET_PREFIX: &'static str = "offset";

    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        info!(path = %path.as_ref().display(), "offset storage opened");
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            db,
        })
    }

    pub fn offset_db_key(group: &str, topic_partition: &TopicPartition) -> String {
        format!("{}:{}:{}", Self::OFFSET_PREFIX, group, topic_partition)
    }

    fn group_prefix(group: &str) -> String {
        format!("{}:{}:", Self::OFFSET_PREFIX, group)
    }
}

impl OffsetStorage for RocksDbOffsetStorage {
    fn load_offset(
        &self,
        group: &str,
        topic_partition: &TopicPartition,
    ) -> AppResult<Option<OffsetStorageInfo>> {
        let key = Self::offset_db_key(group, topic_partition);
        match self.db.get(&key)? {
            Some(value) => {
                let info: OffsetStorageInfo = serde_json::from_slice(&value)?;
                trace!(key = %key, offset = info.offset, "offset loaded");
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn load_group_offsets(&self, group: &str) -> AppResult<Vec<OffsetStorageInfo>> {
        let prefix = Self::group_prefix(group);
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut offsets = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            // the prefix of `g1` also covers keys of a group named `g1:x`
            let info: OffsetStorageInfo = serde_json::from_slice(&value)?;
            if info.group == group {
                offsets.push(info);
            }
        }
        Ok(offsets)
    }

    fn commit_offsets(&self, offsets: &[OffsetStorageInfo]) -> AppResult<()> {
        let mut batch = WriteBatch::default();
        for info in offsets {
            let key = Self::offset_db_key(&info.group, &info.topic_partition());
            batch.put(key.as_bytes(), serde_json::to_vec(info)?);
        }
        self.db.write(batch)?;
        trace!(count = offsets.len(), "offsets committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn offsets_round_trip_through_rocksdb() -> AppResult<()> {
        let dir = TempDir::new()?;
        let tp0 = TopicPartition::new("orders", 0);
        let tp1 = TopicPartition::new("orders", 1);
        {
            let storage = RocksDbOffsetStorage::open(dir.path())?;
            assert_eq!(storage.load_offset("g1", &tp0)?, None);
            storage.commit_offsets(&[
                OffsetStorageInfo::new("g1", &tp0, 40, 1),
                OffsetStorageInfo::new("g1", &tp1, 7, 1),
                OffsetStorageInfo::new("g10", &tp0, 99, 1),
                OffsetStorageInfo::new("g1:x", &tp0, 12, 1),
            ])?;
        }

        let storage = RocksDbOffsetStorage::open(dir.path())?;
        let loaded = storage.load_offset("g1", &tp0)?.map(|info| info.offset);
        assert_eq!(loaded, Some(40));

        let group = storage.load_group_offsets("g1")?;
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|info| info.group == "g1" && !info.first_create));
        let colon_group = storage.load_group_offsets("g1:x")?;
        assert_eq!(colon_group.len(), 1);
        assert_eq!(colon_group[0].offset, 12);
        Ok(())
    }
}
