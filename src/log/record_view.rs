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
use std::sync::Arc;

use bytes::Bytes;

use crate::log::segment::Segment;
use crate::message::{decode_records, StoredRecord};
use crate::AppResult;

/// A bounded read window over one segment.
///
/// The view holds a reference on its segment for as long as it lives, which
/// keeps the expiration sweep from deleting the segment's files underneath
/// it. The reference is released when the view is dropped.
pub struct RecordView {
    segment: Arc<Segment>,
    first_offset: i64,
    position: u64,
    limit: u64,
    record_count: i64,
}

impl RecordView {
    pub(crate) fn new(
        segment: Arc<Segment>,
        first_offset: i64,
        position: u64,
        limit: u64,
        record_count: i64,
    ) -> Self {
        Self {
            segment,
            first_offset,
            position,
            limit,
            record_count,
        }
    }

    /// Start offset of the segment this view reads from.
    pub fn segment_start(&self) -> i64 {
        self.segment.get_start()
    }

    pub fn first_offset(&self) -> i64 {
        self.first_offset
    }

    /// The offset a follow-up read should start from.
    pub fn next_offset(&self) -> i64 {
        self.first_offset + self.record_count
    }

    /// Byte position of the view inside the segment data file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length of the view in bytes.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn record_count(&self) -> i64 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Raw frames covered by the view.
    pub fn read_bytes(&self) -> AppResult<Bytes> {
        if self.limit == 0 {
            return Ok(Bytes::new());
        }
        self.segment.read_at(self.position, self.limit)
    }

    /// Decoded and CRC checked records covered by the view.
    pub fn records(&self) -> AppResult<Vec<StoredRecord>> {
        decode_records(self.read_bytes()?, self.first_offset)
    }
}

impl Debug for RecordView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordView")
            .field("segment", &self.segment.get_start())
            .field("first_offset", &self.first_offset)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("record_count", &self.record_count)
            .finish()
    }
}

impl Drop for RecordView {
    fn drop(&mut self) {
        self.segment.rel_view_ref();
    }
}
