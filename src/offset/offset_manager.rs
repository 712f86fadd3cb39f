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

//! In-memory offset state with periodic persistence.
//!
//! Every `(group, topic, partition)` key holds its committed offset and a
//! booked delta: the number of records handed out since the last commit.
//! The served offset, where the consumer reads next, is their sum.
//!
//! The commit policy of a key is bound by the first `get_offset` (or
//! `book_offset`) after `load_offset`; calls that disagree with the bound
//! policy fail with `PolicyMismatch`. Under manual commit booked deltas
//! accumulate until `commit_offset`. Under auto commit the booked delta is
//! the last delivered batch, replaced by each `book_offset` and committed
//! by the next `get_offset` reporting it consumed, or right away when the
//! batch was empty.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use super::{OffsetBoundary, OffsetStorage, OffsetStorageInfo, ReadPosition, ReadStatus};
use crate::log::now_ms;
use crate::message::TopicPartition;
use crate::service::OffsetConfig;
use crate::{AppError, AppResult, Shutdown};

const PERSIST_CHUNK: usize = 256;

#[derive(Debug)]
struct OffsetState {
    info: OffsetStorageInfo,
    booked_delta: i64,
    /// `Some(true)` manual commit, `Some(false)` auto commit
    policy: Option<bool>,
    dirty: bool,
    version: u64,
}

impl OffsetState {
    fn served(&self) -> i64 {
        self.info.offset + self.booked_delta
    }

    fn set_committed(&mut self, offset: i64) -> i64 {
        self.info.offset = offset;
        self.info.last_update_ms = now_ms();
        self.dirty = true;
        self.version += 1;
        offset
    }

    /// Folds the booked delta into the committed offset when `is_consumed`,
    /// drops it otherwise.
    fn commit(&mut self, is_consumed: bool) -> i64 {
        let delta = std::mem::take(&mut self.booked_delta);
        let delta = if is_consumed { delta } else { 0 };
        if delta == 0 && !self.info.first_create {
            return self.info.offset;
        }
        self.set_committed(self.info.offset + delta)
    }

    fn bind_policy(&mut self, is_man_commit: bool, key: &OffsetKey) -> AppResult<()> {
        match self.policy {
            None => {
                self.policy = Some(is_man_commit);
                Ok(())
            }
            Some(bound) if bound == is_man_commit => Ok(()),
            Some(bound) => Err(AppError::PolicyMismatch(format!(
                "group {} on {} uses {} commit, called with {} commit",
                key.group,
                key.topic_partition,
                policy_name(bound),
                policy_name(is_man_commit)
            ))),
        }
    }
}

fn policy_name(is_man_commit: bool) -> &'static str {
    if is_man_commit {
        "manual"
    } else {
        "auto"
    }
}

#[derive(Debug)]
struct OffsetEntry {
    state: Mutex<OffsetState>,
    /// served offset, readable without taking the lock
    served_hint: AtomicI64,
}

impl OffsetEntry {
    fn new(info: OffsetStorageInfo) -> Self {
        let served = info.offset;
        let dirty = info.first_create;
        Self {
            state: Mutex::new(OffsetState {
                info,
                booked_delta: 0,
                policy: None,
                dirty,
                version: 0,
            }),
            served_hint: AtomicI64::new(served),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OffsetState> {
        self.state.lock()
    }

    fn publish(&self, state: &OffsetState) {
        self.served_hint.store(state.served(), Ordering::Release);
    }
}

struct OffsetKey<'a> {
    group: &'a str,
    topic_partition: TopicPartition,
}

/// Admin view of one partition's offsets for a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOffset {
    pub topic_partition: TopicPartition,
    pub committed: i64,
    pub served: i64,
}

type GroupOffsets = DashMap<TopicPartition, Arc<OffsetEntry>>;

#[derive(Debug)]
pub struct OffsetManager {
    broker_id: i32,
    config: OffsetConfig,
    storage: Arc<dyn OffsetStorage>,
    groups: DashMap<String, Arc<GroupOffsets>>,
    stopped: AtomicCell<bool>,
}

impl OffsetManager {
    pub fn new(broker_id: i32, config: OffsetConfig, storage: Arc<dyn OffsetStorage>) -> Self {
        Self {
            broker_id,
            config,
            storage,
            groups: DashMap::new(),
            stopped: AtomicCell::new(false),
        }
    }

    fn check_running(&self) -> AppResult<()> {
        if self.stopped.load() {
            return Err(AppError::IllegalState("offset manager is closed".into()));
        }
        Ok(())
    }

    fn group_offsets_map(&self, group: &str) -> Arc<GroupOffsets> {
        if let Some(offsets) = self.groups.get(group) {
            return offsets.clone();
        }
        self.groups.entry(group.to_string()).or_default().clone()
    }

    fn find_entry(&self, group: &str, topic_partition: &TopicPartition) -> Option<Arc<OffsetEntry>> {
        let offsets = self.groups.get(group)?.clone();
        let entry = offsets.get(topic_partition)?.clone();
        Some(entry)
    }

    /// Entry of the key, loaded from storage or created at
    /// `default_offset` when unknown.
    fn entry_or_load(
        &self,
        key: &OffsetKey,
        default_offset: impl FnOnce() -> i64,
    ) -> AppResult<Arc<OffsetEntry>> {
        let offsets = self.group_offsets_map(key.group);
        if let Some(entry) = offsets.get(&key.topic_partition) {
            return Ok(entry.clone());
        }
        let entry = offsets
            .entry(key.topic_partition.clone())
            .or_try_insert_with(|| -> AppResult<Arc<OffsetEntry>> {
                let info = match self.storage.load_offset(key.group, &key.topic_partition)? {
                    Some(mut stored) => {
                        stored.first_create = false;
                        stored
                    }
                    None => OffsetStorageInfo::new(
                        key.group,
                        &key.topic_partition,
                        default_offset(),
                        self.broker_id,
                    ),
                };
                Ok(Arc::new(OffsetEntry::new(info)))
            })?;
        Ok(entry.clone())
    }

    /// Starts a consumption session of `group` on the partition.
    ///
    /// A stored offset from an earlier session is resumed; otherwise the
    /// key starts at the store's min offset (`Normal`) or max offset. An
    /// explicit `req_offset`, clamped to the store's bounds, overrides the
    /// start, and `FromMaxAlways` always starts at the max offset. Any
    /// booked window is dropped and the commit policy is unbound.
    pub fn load_offset(
        &self,
        store: &dyn OffsetBoundary,
        group: &str,
        topic: &str,
        partition: i32,
        read_status: ReadStatus,
        req_offset: Option<i64>,
    ) -> AppResult<OffsetStorageInfo> {
        self.check_running()?;
        let key = OffsetKey {
            group,
            topic_partition: TopicPartition::new(topic, partition),
        };
        let entry = self.entry_or_load(&key, || match read_status {
            ReadStatus::Normal => store.min_offset(),
            ReadStatus::FromMax | ReadStatus::FromMaxAlways => store.max_offset(),
        })?;

        let mut state = entry.lock();
        state.booked_delta = 0;
        state.policy = None;

        let req_offset = req_offset.filter(|offset| *offset >= 0);
        let (min_offset, max_offset) = (store.min_offset(), store.max_offset());
        if read_status == ReadStatus::FromMaxAlways {
            state.set_committed(max_offset);
        } else if let Some(requested) = req_offset {
            state.set_committed(requested.min(max_offset).max(min_offset));
        }
        entry.publish(&state);

        info!(
            group,
            topic_partition = %key.topic_partition,
            ?read_status,
            ?req_offset,
            offset = state.info.offset,
            first_create = state.info.first_create,
            "load offset"
        );
        Ok(state.info.clone())
    }

    /// Where the consumer reads next.
    ///
    /// Manual commit serves the committed offset plus the booked window.
    /// Auto commit first commits the last booked batch when
    /// `last_consumed`, then serves the committed offset. A served offset
    /// below the store's min offset moves up to it; one past the max offset
    /// is pulled back when `update_consumer_offsets` is set. Under manual
    /// commit that only shrinks the booked window, unless the committed
    /// offset itself is past the max offset.
    pub fn get_offset(
        &self,
        store: &dyn OffsetBoundary,
        group: &str,
        topic: &str,
        partition: i32,
        is_man_commit: bool,
        last_consumed: bool,
    ) -> AppResult<ReadPosition> {
        self.check_running()?;
        let key = OffsetKey {
            group,
            topic_partition: TopicPartition::new(topic, partition),
        };
        let entry = self.entry_or_load(&key, || 0)?;
        let mut state = entry.lock();
        state.bind_policy(is_man_commit, &key)?;

        let mut requested = if is_man_commit {
            state.served()
        } else if last_consumed {
            state.commit(true)
        } else {
            state.info.offset
        };

        let (min_offset, max_offset) = (store.min_offset(), store.max_offset());
        let mut at_tail = false;
        if requested >= max_offset {
            if requested > max_offset && self.config.update_consumer_offsets {
                warn!(
                    group,
                    topic_partition = %key.topic_partition,
                    requested,
                    max_offset,
                    "served offset past max offset, pulled back"
                );
                // a manual-commit window shrinks to the max offset; only
                // commit_offset confirms records
                if is_man_commit && state.info.offset <= max_offset {
                    state.booked_delta = max_offset - state.info.offset;
                } else {
                    state.booked_delta = 0;
                    state.set_committed(max_offset);
                }
                requested = max_offset;
            }
            at_tail = true;
        } else if requested < min_offset {
            debug!(
                group,
                topic_partition = %key.topic_partition,
                requested,
                min_offset,
                "served offset below min offset, moved up"
            );
            state.booked_delta = 0;
            requested = state.set_committed(min_offset);
        }
        entry.publish(&state);

        trace!(
            group,
            topic_partition = %key.topic_partition,
            is_man_commit,
            last_consumed,
            offset = requested,
            at_tail,
            "get offset"
        );
        Ok(ReadPosition {
            offset: requested,
            at_tail,
        })
    }

    /// Records that `read_delta` more records were delivered.
    pub fn book_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        read_delta: i64,
        is_man_commit: bool,
        is_msg_empty: bool,
    ) -> AppResult<()> {
        self.check_running()?;
        if read_delta < 0 {
            return Err(AppError::InvalidValue(format!(
                "negative read delta {}",
                read_delta
            )));
        }
        if read_delta == 0 {
            return Ok(());
        }
        let key = OffsetKey {
            group,
            topic_partition: TopicPartition::new(topic, partition),
        };
        let entry = self.entry_or_load(&key, || 0)?;
        let mut state = entry.lock();
        state.bind_policy(is_man_commit, &key)?;

        if is_man_commit {
            state.booked_delta += read_delta;
        } else {
            state.booked_delta = read_delta;
            if is_msg_empty {
                state.commit(true);
            }
        }
        entry.publish(&state);

        trace!(
            group,
            topic_partition = %key.topic_partition,
            read_delta,
            is_man_commit,
            is_msg_empty,
            served = state.served(),
            "book offset"
        );
        Ok(())
    }

    /// Confirms (`is_consumed`) or discards the booked window and returns
    /// the committed offset. A discarded window is redelivered by the next
    /// `get_offset`.
    pub fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        is_consumed: bool,
    ) -> AppResult<i64> {
        self.check_running()?;
        let key = OffsetKey {
            group,
            topic_partition: TopicPartition::new(topic, partition),
        };
        let entry = self.entry_or_load(&key, || 0)?;
        let mut state = entry.lock();
        let committed = state.commit(is_consumed);
        entry.publish(&state);

        debug!(
            group,
            topic_partition = %key.topic_partition,
            is_consumed,
            committed,
            "commit offset"
        );
        Ok(committed)
    }

    /// Administrative override of the committed offset. The offset is
    /// clamped to the store's bounds, any booked window is dropped, and the
    /// applied offset is returned.
    pub fn reset_offset(
        &self,
        store: &dyn OffsetBoundary,
        group: &str,
        topic: &str,
        partition: i32,
        new_offset: i64,
        operator: &str,
    ) -> AppResult<i64> {
        self.check_running()?;
        let key = OffsetKey {
            group,
            topic_partition: TopicPartition::new(topic, partition),
        };
        let (min_offset, max_offset) = (store.min_offset(), store.max_offset());
        let applied = new_offset.min(max_offset).max(min_offset);

        let entry = self.entry_or_load(&key, || applied)?;
        let mut state = entry.lock();
        let previous = state.served();
        state.booked_delta = 0;
        state.set_committed(applied);
        entry.publish(&state);

        info!(
            group,
            topic_partition = %key.topic_partition,
            operator,
            requested = new_offset,
            applied,
            previous,
            "reset offset"
        );
        Ok(applied)
    }

    /// Last served offset, for monitoring only.
    pub fn get_tmp_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.find_entry(group, &TopicPartition::new(topic, partition))
            .map(|entry| entry.served_hint.load(Ordering::Acquire))
    }

    /// Committed offset from memory, or from storage for keys not loaded.
    pub fn get_committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> AppResult<Option<i64>> {
        let topic_partition = TopicPartition::new(topic, partition);
        if let Some(entry) = self.find_entry(group, &topic_partition) {
            return Ok(Some(entry.lock().info.offset));
        }
        Ok(self
            .storage
            .load_offset(group, &topic_partition)?
            .map(|info| info.offset))
    }

    pub fn group_offsets(&self, group: &str) -> Vec<GroupOffset> {
        let Some(offsets) = self.groups.get(group).map(|offsets| offsets.clone()) else {
            return Vec::new();
        };
        let mut result: Vec<GroupOffset> = offsets
            .iter()
            .map(|entry| {
                let state = entry.value().lock();
                GroupOffset {
                    topic_partition: entry.key().clone(),
                    committed: state.info.offset,
                    served: state.served(),
                }
            })
            .collect();
        result.sort_by(|a, b| a.topic_partition.cmp(&b.topic_partition));
        result
    }

    /// Persists the group's committed offsets on `topics` (all topics when
    /// empty) and forgets them in memory. Stored records are kept.
    pub fn unsubscribe(&self, group: &str, topics: &[String]) -> AppResult<()> {
        self.check_running()?;
        let Some(offsets) = self.groups.get(group).map(|offsets| offsets.clone()) else {
            return Ok(());
        };
        let selected: Vec<(TopicPartition, Arc<OffsetEntry>)> = offsets
            .iter()
            .filter(|entry| topics.is_empty() || topics.iter().any(|t| t == entry.key().topic()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let infos: Vec<OffsetStorageInfo> = selected
            .iter()
            .map(|(_, entry)| entry.lock().info.clone())
            .collect();
        self.storage.commit_offsets(&infos)?;

        for (topic_partition, _) in &selected {
            offsets.remove(topic_partition);
        }
        self.groups.remove_if(group, |_, offsets| offsets.is_empty());
        info!(group, partitions = selected.len(), "group unsubscribed");
        Ok(())
    }

    /// Persists every key whose committed offset changed since it was last
    /// stored. Keys stay dirty when storage fails, so the next cycle
    /// retries them.
    pub fn flush_offsets(&self) -> AppResult<usize> {
        self.persist_dirty(None)
    }

    fn persist_dirty(&self, deadline: Option<Instant>) -> AppResult<usize> {
        let mut pending: Vec<(Arc<OffsetEntry>, u64, OffsetStorageInfo)> = Vec::new();
        for group in self.groups.iter() {
            for entry in group.value().iter() {
                let state = entry.value().lock();
                if state.dirty {
                    pending.push((entry.value().clone(), state.version, state.info.clone()));
                }
            }
        }

        let mut persisted = 0;
        for chunk in pending.chunks(PERSIST_CHUNK) {
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                warn!(
                    unpersisted = pending.len() - persisted,
                    "offset persistence deadline passed"
                );
                break;
            }
            let infos: Vec<OffsetStorageInfo> =
                chunk.iter().map(|(_, _, info)| info.clone()).collect();
            self.storage.commit_offsets(&infos)?;
            for (entry, version, _) in chunk {
                let mut state = entry.lock();
                state.info.first_create = false;
                if state.version == *version {
                    state.dirty = false;
                }
            }
            persisted += chunk.len();
        }
        if persisted > 0 {
            trace!(persisted, "offsets persisted");
        }
        Ok(persisted)
    }

    /// Stops the service: commits pending auto-commit batches and persists
    /// committed offsets, giving up after `wait_ms`. Booked windows of
    /// manual-commit keys are not committed; they are redelivered from the
    /// committed offset next time. Later mutations fail with `IllegalState`.
    pub fn close(&self, wait_ms: u64) -> AppResult<()> {
        if self.stopped.swap(true) {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(wait_ms);

        for group in self.groups.iter() {
            for entry in group.value().iter() {
                let mut state = entry.value().lock();
                if state.policy == Some(false) && state.booked_delta != 0 {
                    state.commit(true);
                }
                entry.value().publish(&state);
            }
        }

        let persisted = self.persist_dirty(Some(deadline))?;
        info!(persisted, "offset manager closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load()
    }

    /// Spawns the periodic commit cycle. On shutdown the task closes the
    /// manager within `close_wait_ms`.
    pub fn start_commit_task(
        self: &Arc<Self>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let manager = self.clone();
        let mut shutdown = Shutdown::subscribe(notify_shutdown);
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.commit_period_ms.max(1)));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {},
                    _ = shutdown.recv() => {
                        debug!("offset commit task receiving shutdown signal");
                    }
                }
                if shutdown.is_shutdown() {
                    if let Err(e) = manager.close(manager.config.close_wait_ms) {
                        error!("close offset manager error:{:?}", e);
                    }
                    break;
                }
                if let Err(e) = manager.flush_offsets() {
                    warn!(error = %e, "offset commit cycle failed, retrying next cycle");
                }
            }
            drop(shutdown_complete_tx);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MemoryStorage {
        offsets: Mutex<HashMap<String, OffsetStorageInfo>>,
        failing: AtomicCell<bool>,
    }

    impl MemoryStorage {
        fn key(group: &str, topic_partition: &TopicPartition) -> String {
            format!("{}:{}", group, topic_partition)
        }

        fn stored(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
            self.offsets
                .lock()
                .get(&Self::key(group, &TopicPartition::new(topic, partition)))
                .map(|info| info.offset)
        }
    }

    impl OffsetStorage for MemoryStorage {
        fn load_offset(
            &self,
            group: &str,
            topic_partition: &TopicPartition,
        ) -> AppResult<Option<OffsetStorageInfo>> {
            Ok(self
                .offsets
                .lock()
                .get(&Self::key(group, topic_partition))
                .cloned())
        }

        fn load_group_offsets(&self, group: &str) -> AppResult<Vec<OffsetStorageInfo>> {
            Ok(self
                .offsets
                .lock()
                .values()
                .filter(|info| info.group == group)
                .cloned()
                .collect())
        }

        fn commit_offsets(&self, offsets: &[OffsetStorageInfo]) -> AppResult<()> {
            if self.failing.load() {
                return Err(AppError::DetailedIoError("storage offline".into()));
            }
            let mut stored = self.offsets.lock();
            for info in offsets {
                stored.insert(Self::key(&info.group, &info.topic_partition()), info.clone());
            }
            Ok(())
        }
    }

    struct Bounds {
        min: i64,
        max: i64,
    }

    impl OffsetBoundary for Bounds {
        fn min_offset(&self) -> i64 {
            self.min
        }

        fn max_offset(&self) -> i64 {
            self.max
        }
    }

    const STORE: Bounds = Bounds { min: 0, max: 250 };

    fn manager(storage: &Arc<MemoryStorage>) -> OffsetManager {
        OffsetManager::new(1, OffsetConfig::default(), storage.clone())
    }

    #[test]
    fn manual_commit_redelivers_failed_window() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, Some(40))?;

        let position = offsets.get_offset(&STORE, "g1", "t", 0, true, false)?;
        assert_eq!(position, ReadPosition { offset: 40, at_tail: false });

        offsets.book_offset("g1", "t", 0, 10, true, false)?;
        assert_eq!(offsets.get_tmp_offset("g1", "t", 0), Some(50));
        assert_eq!(offsets.commit_offset("g1", "t", 0, false)?, 40);
        assert_eq!(offsets.get_tmp_offset("g1", "t", 0), Some(40));
        assert_eq!(offsets.get_offset(&STORE, "g1", "t", 0, true, false)?.offset, 40);

        offsets.book_offset("g1", "t", 0, 10, true, false)?;
        assert_eq!(offsets.get_offset(&STORE, "g1", "t", 0, true, false)?.offset, 50);
        assert_eq!(offsets.commit_offset("g1", "t", 0, true)?, 50);
        assert_eq!(offsets.get_committed_offset("g1", "t", 0)?, Some(50));
        Ok(())
    }

    #[test]
    fn reload_replays_from_committed_offset() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        {
            let offsets = manager(&storage);
            offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, Some(40))?;
            offsets.get_offset(&STORE, "g1", "t", 0, true, false)?;
            offsets.book_offset("g1", "t", 0, 25, true, false)?;
            offsets.flush_offsets()?;
            offsets.close(1_000)?;
        }

        let offsets = manager(&storage);
        let info = offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, None)?;
        assert_eq!(info.offset, 40);
        assert!(!info.first_create);
        assert_eq!(offsets.get_offset(&STORE, "g1", "t", 0, true, false)?.offset, 40);
        Ok(())
    }

    #[test]
    fn reset_overrides_booked_window_and_clamps() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        let store = Bounds { min: 20, max: 250 };
        offsets.load_offset(&store, "g1", "t", 0, ReadStatus::Normal, None)?;
        offsets.get_offset(&store, "g1", "t", 0, true, false)?;
        offsets.book_offset("g1", "t", 0, 30, true, false)?;

        assert_eq!(offsets.reset_offset(&store, "g1", "t", 0, 120, "admin")?, 120);
        assert_eq!(offsets.get_offset(&store, "g1", "t", 0, true, false)?.offset, 120);

        assert_eq!(offsets.reset_offset(&store, "g1", "t", 0, 5, "admin")?, 20);
        assert_eq!(offsets.reset_offset(&store, "g1", "t", 0, 900, "admin")?, 250);
        Ok(())
    }

    #[test]
    fn commit_policy_is_bound_per_session() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, None)?;
        offsets.get_offset(&STORE, "g1", "t", 0, true, false)?;

        assert!(matches!(
            offsets.book_offset("g1", "t", 0, 5, false, false),
            Err(AppError::PolicyMismatch(_))
        ));
        assert!(matches!(
            offsets.get_offset(&STORE, "g1", "t", 0, false, true),
            Err(AppError::PolicyMismatch(_))
        ));

        offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, None)?;
        offsets.get_offset(&STORE, "g1", "t", 0, false, false)?;
        Ok(())
    }

    #[test]
    fn auto_commit_confirms_previous_batch_on_next_get() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g2", "t", 1, ReadStatus::Normal, Some(10))?;
        assert_eq!(offsets.get_offset(&STORE, "g2", "t", 1, false, false)?.offset, 10);

        offsets.book_offset("g2", "t", 1, 8, false, false)?;
        offsets.book_offset("g2", "t", 1, 5, false, false)?;
        assert_eq!(offsets.get_tmp_offset("g2", "t", 1), Some(15));
        assert_eq!(offsets.get_offset(&STORE, "g2", "t", 1, false, false)?.offset, 10);
        assert_eq!(offsets.get_offset(&STORE, "g2", "t", 1, false, true)?.offset, 15);

        offsets.book_offset("g2", "t", 1, 3, false, true)?;
        assert_eq!(offsets.get_committed_offset("g2", "t", 1)?, Some(18));
        Ok(())
    }

    #[test]
    fn served_offset_is_kept_inside_store_bounds() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, Some(240))?;
        offsets.get_offset(&STORE, "g1", "t", 0, true, false)?;
        offsets.book_offset("g1", "t", 0, 30, true, false)?;

        let position = offsets.get_offset(&STORE, "g1", "t", 0, true, false)?;
        assert_eq!(position, ReadPosition { offset: 250, at_tail: true });
        assert_eq!(offsets.get_committed_offset("g1", "t", 0)?, Some(240));

        let shrunk = Bounds { min: 300, max: 400 };
        let position = offsets.get_offset(&shrunk, "g1", "t", 0, true, false)?;
        assert_eq!(position, ReadPosition { offset: 300, at_tail: false });

        let truncated = Bounds { min: 0, max: 200 };
        let position = offsets.get_offset(&truncated, "g1", "t", 0, true, false)?;
        assert_eq!(position, ReadPosition { offset: 200, at_tail: true });
        assert_eq!(offsets.get_committed_offset("g1", "t", 0)?, Some(200));
        Ok(())
    }

    #[test]
    fn manual_window_past_truncated_tail_stays_unconfirmed() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        let before = Bounds { min: 0, max: 10 };
        offsets.load_offset(&before, "g1", "t", 0, ReadStatus::Normal, None)?;
        offsets.get_offset(&before, "g1", "t", 0, true, false)?;
        offsets.book_offset("g1", "t", 0, 8, true, false)?;

        let repaired = Bounds { min: 0, max: 5 };
        let position = offsets.get_offset(&repaired, "g1", "t", 0, true, false)?;
        assert_eq!(position, ReadPosition { offset: 5, at_tail: true });
        assert_eq!(offsets.get_committed_offset("g1", "t", 0)?, Some(0));

        assert_eq!(offsets.commit_offset("g1", "t", 0, false)?, 0);
        assert_eq!(offsets.get_offset(&repaired, "g1", "t", 0, true, false)?.offset, 0);
        offsets.book_offset("g1", "t", 0, 5, true, false)?;
        assert_eq!(offsets.commit_offset("g1", "t", 0, true)?, 5);
        Ok(())
    }

    #[test]
    fn reset_linearizes_with_book_and_commit() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        let store = Bounds { min: 0, max: 1_000_000 };
        offsets.load_offset(&store, "g1", "t", 0, ReadStatus::Normal, None)?;
        offsets.get_offset(&store, "g1", "t", 0, true, false)?;

        std::thread::scope(|scope| -> AppResult<()> {
            let consumer = scope.spawn(|| -> AppResult<()> {
                for _ in 0..2_000 {
                    offsets.book_offset("g1", "t", 0, 3, true, false)?;
                    offsets.commit_offset("g1", "t", 0, true)?;
                }
                Ok(())
            });
            for _ in 0..200 {
                let applied = offsets.reset_offset(&store, "g1", "t", 0, 500_000, "admin")?;
                assert_eq!(applied, 500_000);
            }
            match consumer.join() {
                Ok(result) => result,
                Err(_) => panic!("consumer thread panicked"),
            }
        })?;

        // the last reset followed by whole confirmed windows
        let committed = offsets.get_committed_offset("g1", "t", 0)?.unwrap_or(-1);
        let served = offsets.get_tmp_offset("g1", "t", 0).unwrap_or(-1);
        assert_eq!(committed, served);
        assert!((500_000..=506_000).contains(&committed));
        assert_eq!((committed - 500_000) % 3, 0);
        Ok(())
    }

    #[test]
    fn read_status_selects_start() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        let store = Bounds { min: 7, max: 90 };

        let normal = offsets.load_offset(&store, "a", "t", 0, ReadStatus::Normal, None)?;
        assert_eq!(normal.offset, 7);
        assert!(normal.first_create);
        let from_max = offsets.load_offset(&store, "b", "t", 0, ReadStatus::FromMax, None)?;
        assert_eq!(from_max.offset, 90);

        offsets.reset_offset(&store, "a", "t", 0, 50, "admin")?;
        let resumed = offsets.load_offset(&store, "a", "t", 0, ReadStatus::FromMax, None)?;
        assert_eq!(resumed.offset, 50);
        let always = offsets.load_offset(&store, "a", "t", 0, ReadStatus::FromMaxAlways, Some(30))?;
        assert_eq!(always.offset, 90);
        Ok(())
    }

    #[test]
    fn failed_flush_is_retried() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g1", "t", 0, ReadStatus::Normal, Some(5))?;

        storage.failing.store(true);
        assert!(offsets.flush_offsets().is_err());
        assert_eq!(storage.stored("g1", "t", 0), None);

        storage.failing.store(false);
        assert_eq!(offsets.flush_offsets()?, 1);
        assert_eq!(storage.stored("g1", "t", 0), Some(5));
        assert_eq!(offsets.flush_offsets()?, 0);
        Ok(())
    }

    #[test]
    fn close_commits_auto_batches_only() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "auto", "t", 0, ReadStatus::Normal, Some(10))?;
        offsets.get_offset(&STORE, "auto", "t", 0, false, false)?;
        offsets.book_offset("auto", "t", 0, 4, false, false)?;
        offsets.load_offset(&STORE, "manual", "t", 0, ReadStatus::Normal, Some(10))?;
        offsets.get_offset(&STORE, "manual", "t", 0, true, false)?;
        offsets.book_offset("manual", "t", 0, 4, true, false)?;

        offsets.close(1_000)?;
        offsets.close(1_000)?;
        assert_eq!(storage.stored("auto", "t", 0), Some(14));
        assert_eq!(storage.stored("manual", "t", 0), Some(10));
        assert!(matches!(
            offsets.commit_offset("manual", "t", 0, true),
            Err(AppError::IllegalState(_))
        ));
        Ok(())
    }

    #[test]
    fn unsubscribe_persists_and_forgets() -> AppResult<()> {
        let storage = Arc::new(MemoryStorage::default());
        let offsets = manager(&storage);
        offsets.load_offset(&STORE, "g1", "a", 0, ReadStatus::Normal, Some(3))?;
        offsets.load_offset(&STORE, "g1", "b", 0, ReadStatus::Normal, Some(4))?;
        assert_eq!(offsets.group_offsets("g1").len(), 2);

        offsets.unsubscribe("g1", &["a".to_string()])?;
        assert_eq!(storage.stored("g1", "a", 0), Some(3));
        assert_eq!(offsets.get_tmp_offset("g1", "a", 0), None);
        assert_eq!(offsets.get_committed_offset("g1", "a", 0)?, Some(3));

        let remaining = offsets.group_offsets("g1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].topic_partition, TopicPartition::new("b", 0));

        offsets.unsubscribe("g1", &[])?;
        assert!(offsets.group_offsets("g1").is_empty());
        assert_eq!(offsets.get_tmp_offset("nobody", "a", 0), None);
        Ok(())
    }
}
