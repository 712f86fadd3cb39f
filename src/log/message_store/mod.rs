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

//! Message store of one topic partition.
//!
//! This module provides:
//! - Loading and recovering segments from the partition directory
//! - Appending to the active segment and rolling it by size or age
//! - Bounded, reference-counted reads
//! - The retention sweep that deletes expired segments
mod store_expire;
mod store_load;
mod store_read;
mod store_write;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::log::segment::Segment;
use crate::message::TopicPartition;
use crate::offset::OffsetBoundary;
use crate::service::StoreConfig;
use crate::{AppError, AppResult};

/// Ordered segments of one partition plus the single-writer state.
///
/// The segment map covers `[min_offset, max_offset)` without gaps and its
/// last entry is the only mutable segment. Appends, rolls, repair and close
/// are serialized by `write_lock`; reads only take the map's read lock.
#[derive(Debug)]
pub struct MessageStore {
    topic_partition: TopicPartition,
    dir: PathBuf,
    config: StoreConfig,
    segments: RwLock<BTreeMap<i64, Arc<Segment>>>,
    write_lock: Mutex<()>,
    writable: AtomicCell<bool>,
    closed: AtomicCell<bool>,
    last_flush_time: AtomicI64,
}

impl MessageStore {
    fn from_segments(
        topic_partition: &TopicPartition,
        dir: PathBuf,
        config: &StoreConfig,
        segments: BTreeMap<i64, Arc<Segment>>,
    ) -> Self {
        Self {
            topic_partition: topic_partition.clone(),
            dir,
            config: config.clone(),
            segments: RwLock::new(segments),
            write_lock: Mutex::new(()),
            writable: AtomicCell::new(true),
            closed: AtomicCell::new(false),
            last_flush_time: AtomicI64::new(crate::log::now_ms()),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The mutable segment appends go to.
    pub(crate) fn active_segment(&self) -> AppResult<Arc<Segment>> {
        self.segments
            .read()
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| {
                AppError::IllegalState(format!("store {} has no segment", self.topic_partition))
            })
    }

    /// Earliest retained offset: the start of the oldest segment that has
    /// not expired.
    pub fn min_offset(&self) -> i64 {
        let segments = self.segments.read();
        segments
            .values()
            .find(|segment| !segment.is_expired())
            .or_else(|| segments.values().next_back())
            .map(|segment| segment.get_start())
            .unwrap_or(0)
    }

    /// Offset the next appended record receives.
    pub fn max_offset(&self) -> i64 {
        self.segments
            .read()
            .values()
            .next_back()
            .map(|segment| segment.get_last())
            .unwrap_or(0)
    }

    /// End of the durably flushed data.
    pub fn commit_offset(&self) -> i64 {
        self.segments
            .read()
            .values()
            .next_back()
            .map(|segment| segment.get_commit_last())
            .unwrap_or(0)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Snapshot of the current segments in offset order.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().values().cloned().collect()
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load()
    }

    /// Marks the partition unwritable after a failed write or flush and
    /// turns the failure into the error callers see.
    fn fail_partition(&self, cause: AppError) -> AppError {
        self.writable.store(false);
        error!(
            topic_partition = %self.topic_partition,
            error = %cause,
            "partition marked unwritable"
        );
        AppError::StoreUnavailable(format!("{}: {}", self.topic_partition, cause))
    }

    /// Flushes and closes the active segment. Further appends fail, reads
    /// keep working.
    pub fn close(&self) -> AppResult<()> {
        let _writer = self.write_lock.lock();
        if self.closed.load() {
            return Ok(());
        }
        self.closed.store(true);
        let active = self.active_segment()?;
        active.close()?;
        self.last_flush_time
            .store(crate::log::now_ms(), Ordering::Release);
        Ok(())
    }
}

impl OffsetBoundary for MessageStore {
    fn min_offset(&self) -> i64 {
        MessageStore::min_offset(self)
    }

    fn max_offset(&self) -> i64 {
        MessageStore::max_offset(self)
    }
}
