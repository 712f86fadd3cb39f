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

//! Write path of a message store: append, roll, flush and repair.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::MessageStore;
use crate::log::now_ms;
use crate::log::segment::Segment;
use crate::message::encoded_size;
use crate::{AppError, AppResult};

impl MessageStore {
    /// Appends a batch of records and returns the offset of the first one.
    ///
    /// Rolls the active segment first when the batch would push it past the
    /// size limit, when it is older than the roll interval or when its index
    /// is full. Any I/O failure marks the partition unwritable; until
    /// [`repair`](Self::repair) succeeds every append fails with
    /// `StoreUnavailable`.
    pub fn append(&self, payloads: &[Bytes]) -> AppResult<i64> {
        let _writer = self.write_lock.lock();
        if self.closed.load() {
            return Err(AppError::StoreUnavailable(format!(
                "{} is closed",
                self.topic_partition
            )));
        }
        if !self.writable.load() {
            return Err(AppError::StoreUnavailable(format!(
                "{} is not writable",
                self.topic_partition
            )));
        }
        if let Some(oversized) = payloads
            .iter()
            .find(|p| p.len() > self.config.max_record_size)
        {
            return Err(AppError::InvalidValue(format!(
                "record of {} bytes exceeds max record size {}",
                oversized.len(),
                self.config.max_record_size
            )));
        }

        let now = now_ms();
        let incoming: u64 = payloads.iter().map(|p| encoded_size(p) as u64).sum();
        let mut active = self.active_segment()?;
        if self.need_roll(&active, incoming, now) {
            active = self.roll(&active).map_err(|e| self.fail_partition(e))?;
        }

        match active.append(payloads, now) {
            Ok(first_offset) => Ok(first_offset),
            Err(e @ AppError::InvalidValue(_)) | Err(e @ AppError::SegmentClosed { .. }) => Err(e),
            Err(e) => Err(self.fail_partition(e)),
        }
    }

    fn need_roll(&self, active: &Segment, incoming: u64, now: i64) -> bool {
        let size = active.get_cached_size();
        if size == 0 {
            return false;
        }
        let max_size = self.config.segment_max_size.min(u32::MAX as u64);
        let interval = self.config.segment_roll_interval_ms as i64;

        let too_big = size + incoming > max_size;
        let too_old = interval > 0 && now - active.created_time() >= interval;
        let index_full = active.index_full();
        if too_big || too_old || index_full {
            trace!(
                topic_partition = %self.topic_partition,
                segment = active.get_start(),
                size,
                incoming,
                too_old,
                index_full,
                "rolling active segment"
            );
            return true;
        }
        false
    }

    /// Closes `active` and makes a new segment starting at its end the
    /// active one. Caller holds the write lock.
    fn roll(&self, active: &Arc<Segment>) -> AppResult<Arc<Segment>> {
        let next_start = active.get_last();
        let segment = Arc::new(Segment::create(
            &self.topic_partition,
            &self.dir,
            next_start,
            &self.config,
        )?);

        if let Err(e) = active.close() {
            if let Err(cleanup) = segment.delete() {
                warn!(
                    topic_partition = %self.topic_partition,
                    segment = next_start,
                    error = %cleanup,
                    "can not remove segment of failed roll"
                );
            }
            return Err(e);
        }
        self.segments.write().insert(next_start, segment.clone());
        self.last_flush_time.store(now_ms(), Ordering::Release);

        debug!(
            topic_partition = %self.topic_partition,
            closed = active.get_start(),
            new_segment = next_start,
            "rolled segment"
        );
        Ok(segment)
    }

    /// Flushes the active segment and returns the durable end offset.
    ///
    /// Non-forced flushes only sync once enough dirty bytes piled up or the
    /// flush interval has passed since the last sync.
    pub fn flush(&self, force: bool) -> AppResult<i64> {
        let active = self.active_segment()?;
        let now = now_ms();
        let interval_due =
            now - self.last_flush_time.load(Ordering::Acquire) >= self.config.flush_interval_ms as i64;
        let before = active.get_commit_last();

        let commit_last = active
            .flush(force || interval_due)
            .map_err(|e| self.fail_partition(e))?;
        if commit_last != before || interval_due {
            self.last_flush_time.store(now, Ordering::Release);
        }
        Ok(commit_last)
    }

    /// Brings an unwritable partition back: drops whatever the active
    /// segment holds past its last successful flush and re-enables appends.
    pub fn repair(&self) -> AppResult<i64> {
        let _writer = self.write_lock.lock();
        if self.closed.load() {
            return Err(AppError::StoreUnavailable(format!(
                "{} is closed",
                self.topic_partition
            )));
        }
        let active = self.active_segment()?;
        active.truncate_to_commit()?;
        if !active.is_closed() {
            active.set_mutable(true);
        }
        self.writable.store(true);
        info!(
            topic_partition = %self.topic_partition,
            max_offset = active.get_last(),
            "partition repaired"
        );
        Ok(active.get_last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TopicPartition;
    use crate::service::StoreConfig;
    use tempfile::TempDir;

    fn store(dir: &TempDir, config: StoreConfig) -> AppResult<MessageStore> {
        MessageStore::open(&TopicPartition::new("events", 0), dir.path(), &config, 0)
    }

    #[test]
    fn oversized_record_is_rejected() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                max_record_size: 8,
                ..StoreConfig::default()
            },
        )?;
        assert!(matches!(
            store.append(&[Bytes::from_static(b"way too large")]),
            Err(AppError::InvalidValue(_))
        ));
        assert!(store.is_writable());
        assert_eq!(store.max_offset(), 0);
        Ok(())
    }

    #[test]
    fn time_based_roll_starts_new_segment() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                segment_roll_interval_ms: 1,
                ..StoreConfig::default()
            },
        )?;
        store.append(&[Bytes::from_static(b"a")])?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.append(&[Bytes::from_static(b"b")])?, 1);

        let segments = store.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].get_start(), 1);
        assert!(segments[0].is_closed());
        Ok(())
    }

    #[test]
    fn full_index_forces_a_roll() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                index_file_size: 16,
                index_interval_bytes: 1,
                ..StoreConfig::default()
            },
        )?;
        for _ in 0..6 {
            store.append(&[Bytes::from_static(b"payload")])?;
        }
        assert!(store.segment_count() > 1);
        assert_eq!(store.max_offset(), 6);
        Ok(())
    }

    #[test]
    fn flush_advances_commit_offset() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                flush_dirty_bytes: u64::MAX,
                flush_interval_ms: 3_600_000,
                ..StoreConfig::default()
            },
        )?;
        store.append(&[Bytes::from_static(b"one"), Bytes::from_static(b"two")])?;

        assert_eq!(store.flush(false)?, 0);
        assert_eq!(store.commit_offset(), 0);
        assert_eq!(store.flush(true)?, 2);
        assert_eq!(store.flush(true)?, 2);
        assert_eq!(store.commit_offset(), 2);
        Ok(())
    }

    #[test]
    fn repair_discards_unflushed_tail() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                flush_dirty_bytes: u64::MAX,
                flush_interval_ms: 3_600_000,
                ..StoreConfig::default()
            },
        )?;
        store.append(&[Bytes::from_static(b"durable")])?;
        store.flush(true)?;
        store.append(&[Bytes::from_static(b"volatile")])?;

        assert_eq!(store.repair()?, 1);
        assert_eq!(store.max_offset(), 1);
        assert_eq!(store.append(&[Bytes::from_static(b"next")])?, 1);
        Ok(())
    }
    #[test]
    fn failed_roll_makes_partition_unwritable_until_repair() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                segment_max_size: 64,
                ..StoreConfig::default()
            },
        )?;
        store.append(&[Bytes::from_static(b"first")])?;
        store.flush(true)?;

        let moved = dir.path().join("moved-away");
        std::fs::rename(store.dir(), &moved)?;
        let large = Bytes::from(vec![b'x'; 50]);
        let first = store.append(&[large.clone()]);
        assert!(matches!(first, Err(AppError::StoreUnavailable(_))));
        let second = store.append(&[Bytes::from_static(b"y")]);
        assert!(matches!(second, Err(AppError::StoreUnavailable(_))));
        assert!(!store.is_writable());
        assert_eq!(store.read(0, 1024)?.record_count(), 1);

        std::fs::rename(&moved, store.dir())?;
        assert_eq!(store.repair()?, 1);
        assert_eq!(store.append(&[large])?, 1);
        assert_eq!(store.segment_count(), 2);
        Ok(())
    }

    #[test]
    fn repair_restores_appends_on_active_segment() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(&dir, StoreConfig::default())?;
        store.append(&[Bytes::from_static(b"kept")])?;
        store.flush(true)?;

        // state left behind by a roll whose close failed
        store.active_segment()?.set_mutable(false);
        store.writable.store(false);

        assert_eq!(store.repair()?, 1);
        assert!(store.active_segment()?.is_mutable());
        assert_eq!(store.append(&[Bytes::from_static(b"next")])?, 1);
        Ok(())
    }

    #[test]
    fn reads_run_alongside_appends_and_rolls() -> AppResult<()> {
        let dir = TempDir::new()?;
        let store = store(
            &dir,
            StoreConfig {
                segment_max_size: 256,
                index_interval_bytes: 32,
                ..StoreConfig::default()
            },
        )?;
        let total = 300;

        std::thread::scope(|scope| -> AppResult<()> {
            let writer = scope.spawn(|| -> AppResult<()> {
                for i in 0..total {
                    store.append(&[Bytes::from(format!("rec-{:05}", i))])?;
                }
                Ok(())
            });

            let mut next = 0i64;
            while next < total {
                let view = store.read(next, 128)?;
                for record in view.records()? {
                    assert_eq!(record.offset, next);
                    assert_eq!(record.payload, Bytes::from(format!("rec-{:05}", next)));
                    next += 1;
                }
            }
            match writer.join() {
                Ok(result) => result,
                Err(_) => panic!("writer thread panicked"),
            }
        })?;

        assert!(store.segment_count() > 2);
        assert_eq!(store.max_offset(), total);
        Ok(())
    }
}
