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

use tracing::trace;

use super::MessageStore;
use crate::log::RecordView;
use crate::{AppError, AppResult};

impl MessageStore {
    /// Returns a view of the records starting at `from_offset`, bounded by
    /// `max_bytes` and by the end of the segment holding `from_offset`.
    ///
    /// A view never spans two segments; the caller continues from
    /// [`RecordView::next_offset`]. Reading at the max offset yields an empty
    /// view. An offset below the earliest retained one (expired data) or
    /// past the max offset fails with `OffsetOutOfRange`, which carries the
    /// offset to re-seek to.
    pub fn read(&self, from_offset: i64, max_bytes: u64) -> AppResult<RecordView> {
        // the view reference is taken under the read lock so the expiration
        // sweep, which removes segments under the write lock, sees it; the
        // header scan runs after the lock is released
        let segments = self.segments.read();
        let earliest = segments
            .values()
            .find(|segment| !segment.is_expired())
            .or_else(|| segments.values().next_back())
            .map(|segment| segment.get_start())
            .unwrap_or(0);
        let latest = segments
            .values()
            .next_back()
            .map(|segment| segment.get_last())
            .unwrap_or(0);

        let out_of_range = || AppError::OffsetOutOfRange {
            offset: from_offset,
            earliest,
            latest,
        };
        if from_offset < earliest || from_offset > latest {
            trace!(
                topic_partition = %self.topic_partition,
                from_offset,
                earliest,
                latest,
                "read out of range"
            );
            return Err(out_of_range());
        }

        let (_, segment) = segments
            .range(..=from_offset)
            .next_back()
            .ok_or_else(out_of_range)?;
        if segment.is_expired() {
            return Err(out_of_range());
        }
        segment.acquire_view_ref();
        let segment = segment.clone();
        drop(segments);
        segment.view_from_acquired(from_offset, max_bytes)
    }
}
