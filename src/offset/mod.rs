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

//! Consumer offset service.
//!
//! Tracks, per consumer group and topic partition, the durable committed
//! offset and the window of records handed out but not yet confirmed.

mod offset_manager;
mod offset_storage;

use serde::{Deserialize, Serialize};

use crate::message::TopicPartition;

pub use offset_manager::{GroupOffset, OffsetManager};
pub use offset_storage::{OffsetStorage, RocksDbOffsetStorage};

/// Where a consumer without a usable position starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// from the earliest retained offset, honouring a requested offset
    Normal,
    /// from the max offset, honouring a requested offset
    FromMax,
    /// always from the max offset, ignoring stored and requested offsets
    FromMaxAlways,
}

/// Answer to a consumer asking where to read next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPosition {
    pub offset: i64,
    /// the offset reached the store's max offset, nothing to read yet
    pub at_tail: bool,
}

/// Bounds of a partition's retained data as seen by the offset service.
pub trait OffsetBoundary: Send + Sync {
    /// earliest retained offset
    fn min_offset(&self) -> i64;
    /// offset the next appended record receives
    fn max_offset(&self) -> i64;
}

/// Durable offset record of one group on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetStorageInfo {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub broker_id: i32,
    pub last_update_ms: i64,
    /// created in memory and never persisted yet
    #[serde(skip)]
    pub first_create: bool,
}

impl OffsetStorageInfo {
    pub fn new(group: &str, topic_partition: &TopicPartition, offset: i64, broker_id: i32) -> Self {
        Self {
            group: group.to_string(),
            topic: topic_partition.topic().to_string(),
            partition: topic_partition.partition(),
            offset,
            broker_id,
            last_update_ms: crate::log::now_ms(),
            first_create: true,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.as_str(), self.partition)
    }
}
