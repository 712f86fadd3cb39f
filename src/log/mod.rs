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

//! Segment structured partition log.
//!
//! This module provides functionality for:
//! - Segment files and their sparse offset index
//! - Per partition message stores with rolling and retention
//! - Reference counted read views
//! - Recovery checkpoints and the store manager driving background tasks

mod checkpoint;
mod index_file;
mod message_store;
mod record_view;
mod segment;
mod store_manager;

use std::path::{Path, PathBuf};

pub use checkpoint::CheckPointFile;
pub use index_file::{ReadOnlyIndexFile, WritableIndexFile, INDEX_ENTRY_SIZE};
pub use message_store::MessageStore;
pub use record_view::RecordView;
pub use segment::Segment;
pub use store_manager::MessageStoreManager;

// File name constants
pub const RECOVERY_POINT_FILE_NAME: &str = ".recovery_checkpoints";
pub const INDEX_FILE_SUFFIX: &str = "index";
pub const LOG_FILE_SUFFIX: &str = "log";

/// Path of a segment file: the start offset zero padded to 20 digits.
pub fn segment_file_path(dir: impl AsRef<Path>, start: i64, suffix: &str) -> PathBuf {
    dir.as_ref().join(format!("{:020}.{}", start, suffix))
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
