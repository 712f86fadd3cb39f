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

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::MessageStore;
use crate::log::segment::Segment;
use crate::log::{INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX};
use crate::message::TopicPartition;
use crate::service::StoreConfig;
use crate::{AppError, AppResult};

impl MessageStore {
    /// Opens the store of `topic_partition` under `base_dir`, recovering any
    /// segments a previous run left behind.
    ///
    /// Segments entirely below `recovery_point` were flushed before the last
    /// checkpoint and load through their index; the rest are re-scanned.
    /// An empty directory starts a fresh log at offset 0.
    ///
    /// # Errors
    ///
    /// `IllegalState` when the recovered segments do not form one contiguous
    /// offset range.
    pub fn open(
        topic_partition: &TopicPartition,
        base_dir: impl AsRef<Path>,
        config: &StoreConfig,
        recovery_point: i64,
    ) -> AppResult<Self> {
        let dir = topic_partition.partition_dir(base_dir);
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::DetailedIoError(format!(
                "create partition directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let starts = Self::scan_segment_files(&dir)?;
        let mut segments = BTreeMap::new();
        if starts.is_empty() {
            let segment = Segment::create(topic_partition, &dir, 0, config)?;
            segments.insert(0, Arc::new(segment));
        } else {
            let starts: Vec<i64> = starts.into_iter().collect();
            for (i, start) in starts.iter().enumerate() {
                let next_start = starts.get(i + 1).copied();
                let is_last = next_start.is_none();
                let full_scan = next_start.map_or(true, |next| next > recovery_point);
                let segment =
                    Segment::recover(topic_partition, &dir, *start, config, full_scan, is_last)?;

                if let Some(next) = next_start {
                    if segment.get_last() != next {
                        return Err(AppError::IllegalState(format!(
                            "segment {} of {} ends at {} but the next one starts at {}",
                            start,
                            topic_partition,
                            segment.get_last(),
                            next
                        )));
                    }
                }
                segments.insert(*start, Arc::new(segment));
            }
        }

        let store = Self::from_segments(topic_partition, dir, config, segments);
        info!(
            %topic_partition,
            min_offset = store.min_offset(),
            max_offset = store.max_offset(),
            segments = store.segment_count(),
            recovery_point,
            "message store opened"
        );
        Ok(store)
    }

    /// Start offsets of the data files in `dir`. Index files without a data
    /// file are removed.
    fn scan_segment_files(dir: &Path) -> AppResult<BTreeSet<i64>> {
        let mut log_starts = BTreeSet::new();
        let mut index_starts = BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                warn!(file = %path.display(), "skip unknown file in partition directory");
                continue;
            };
            let Ok(start) = stem.parse::<i64>() else {
                warn!(file = %path.display(), "skip unknown file in partition directory");
                continue;
            };
            match ext {
                LOG_FILE_SUFFIX => {
                    log_starts.insert(start);
                }
                INDEX_FILE_SUFFIX => {
                    index_starts.insert(start, path);
                }
                _ => warn!(file = %path.display(), "skip unknown file in partition directory"),
            }
        }

        for (start, path) in index_starts {
            if !log_starts.contains(&start) {
                warn!(file = %path.display(), "removing index file without data file");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(log_starts)
    }
}
