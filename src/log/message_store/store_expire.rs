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

use tracing::{debug, warn};

use super::MessageStore;

impl MessageStore {
    /// One pass of the retention sweep at time `now`.
    ///
    /// Closed segments are checked oldest first and marked expired while
    /// their newest record is past the retention window. Expired segments
    /// without outstanding views are then dropped from the front of the log
    /// and their files deleted; a segment still referenced, or whose files
    /// could not be removed, stays for the next sweep. Returns the number of
    /// segments deleted.
    pub fn check_and_delete_expired(&self, now: i64) -> usize {
        let retention_ms = self.config.retention_ms as i64;
        if retention_ms <= 0 {
            return 0;
        }

        let candidates: Vec<_> = self
            .segments
            .read()
            .values()
            .filter(|segment| !segment.is_mutable())
            .cloned()
            .collect();
        for segment in &candidates {
            if segment.check_and_set_expired(now, retention_ms) == 0 {
                break;
            }
        }

        let removed = {
            let mut segments = self.segments.write();
            let mut removed = Vec::new();
            while let Some(entry) = segments.first_entry() {
                let segment = entry.get();
                if !segment.is_expired() || segment.is_mutable() {
                    break;
                }
                if segment.ref_count() > 0 {
                    debug!(
                        topic_partition = %self.topic_partition,
                        segment = segment.get_start(),
                        refs = segment.ref_count(),
                        "expired segment still referenced, deferring delete"
                    );
                    break;
                }
                removed.push(entry.remove());
            }
            removed
        };

        let mut deleted = 0;
        for segment in removed {
            match segment.delete() {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(
                        topic_partition = %self.topic_partition,
                        segment = segment.get_start(),
                        error = %e,
                        "delete expired segment failed, retrying next sweep"
                    );
                    self.segments.write().insert(segment.get_start(), segment);
                }
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::now_ms;
    use crate::message::TopicPartition;
    use crate::service::StoreConfig;
    use crate::{AppError, AppResult};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn rolling_store(dir: &TempDir) -> AppResult<MessageStore> {
        let config = StoreConfig {
            segment_max_size: 200,
            retention_ms: 1_000,
            ..StoreConfig::default()
        };
        let store = MessageStore::open(&TopicPartition::new("metrics", 1), dir.path(), &config, 0)?;
        for i in 0..30 {
            store.append(&[Bytes::from(format!("sample-{:03}", i))])?;
        }
        Ok(store)
    }

    #[test]
    fn expired_segments_are_deleted_oldest_first() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = rolling_store(&dir)?;
        let before = store.segment_count();
        assert!(before >= 3);

        assert_eq!(store.check_and_delete_expired(now_ms()), 0);
        let deleted = store.check_and_delete_expired(now_ms() + 10_000);
        assert_eq!(deleted, before - 1);
        assert_eq!(store.segment_count(), 1);

        let active = store.active_segment()?;
        assert_eq!(store.min_offset(), active.get_start());
        assert_eq!(store.max_offset(), 30);
        Ok(())
    }

    #[test]
    fn referenced_segment_survives_until_released() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = rolling_store(&dir)?;
        let first = store.segments()[0].clone();
        let active_start = store.active_segment()?.get_start();

        let view = store.read(0, 1)?;
        assert_eq!(store.check_and_delete_expired(now_ms() + 10_000), 0);
        assert!(first.is_expired());
        assert!(first.file_path().exists());
        assert!(matches!(
            store.read(0, 1),
            Err(AppError::OffsetOutOfRange { earliest, .. }) if earliest == active_start
        ));

        drop(view);
        assert!(store.check_and_delete_expired(now_ms() + 10_000) > 0);
        assert!(!first.file_path().exists());
        Ok(())
    }
}
