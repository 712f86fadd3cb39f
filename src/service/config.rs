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

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();

/// Broker-wide configuration. Only valid after the broker binary has
/// installed it; library components take their own section explicitly.
pub fn global_config() -> AppResult<&'static BrokerConfig> {
    GLOBAL_CONFIG
        .get()
        .ok_or_else(|| AppError::IllegalState("broker config is not initialized".into()))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub broker_id: i32,
    /// root directory holding one sub directory per topic partition
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            broker_id: 1,
            data_dir: "data/store".to_string(),
        }
    }
}

/// Segment rotation, flush and retention policy of a message store.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// roll the active segment once it would grow past this many bytes
    pub segment_max_size: u64,
    /// roll the active segment once it is older than this, 0 disables
    pub segment_roll_interval_ms: u64,
    /// pre-allocated size of an active segment's index file
    pub index_file_size: usize,
    /// bytes appended between two sparse index entries
    pub index_interval_bytes: usize,
    /// dirty bytes that make a non-forced flush actually sync
    pub flush_dirty_bytes: u64,
    /// a non-forced flush syncs anyway once this much time passed
    pub flush_interval_ms: u64,
    /// retention window of a segment's newest record, 0 keeps data forever
    pub retention_ms: u64,
    /// largest accepted record payload
    pub max_record_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_max_size: 512 * 1024 * 1024,
            segment_roll_interval_ms: 0,
            index_file_size: 1024 * 1024,
            index_interval_bytes: 4096,
            flush_dirty_bytes: 1024 * 1024,
            flush_interval_ms: 1000,
            retention_ms: 72 * 3600 * 1000,
            max_record_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OffsetConfig {
    /// rocksdb directory holding committed offsets
    pub db_path: String,
    /// period of the background offset commit cycle
    pub commit_period_ms: u64,
    /// pull a served offset beyond the store's max offset back to it
    pub update_consumer_offsets: bool,
    /// how long shutdown may spend persisting offsets
    pub close_wait_ms: u64,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            db_path: "data/offsets".to_string(),
            commit_period_ms: 5000,
            update_consumer_offsets: true,
            close_wait_ms: 3000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    pub flush_check_interval_ms: u64,
    pub expire_check_interval_ms: u64,
    pub recovery_checkpoint_interval_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            flush_check_interval_ms: 500,
            expire_check_interval_ms: 60 * 1000,
            recovery_checkpoint_interval_ms: 10 * 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub store: StoreConfig,
    pub offset: OffsetConfig,
    pub tasks: TaskConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("TUBESTORE").separator("__"))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;
        Ok(broker_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.store.segment_max_size == 0 || self.store.segment_max_size > u32::MAX as u64 {
            return Err(AppError::InvalidValue(
                "store.segment_max_size must be positive and fit index positions (u32)".into(),
            ));
        }
        if self.store.index_interval_bytes == 0 || self.store.index_file_size < 8 {
            return Err(AppError::InvalidValue(
                "store.index_interval_bytes must be positive and store.index_file_size hold at least one entry".into(),
            ));
        }
        if self.offset.commit_period_ms == 0 {
            return Err(AppError::InvalidValue(
                "offset.commit_period_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn partial_file_falls_back_to_defaults() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "[general]\nbroker_id = 7\n\n[store]\nsegment_max_size = 4096\nretention_ms = 1000"
        )?;

        let config = BrokerConfig::set_up_config(file.path())?;
        assert_eq!(config.general.broker_id, 7);
        assert_eq!(config.store.segment_max_size, 4096);
        assert_eq!(config.store.retention_ms, 1000);
        assert_eq!(
            config.store.index_interval_bytes,
            StoreConfig::default().index_interval_bytes
        );
        assert_eq!(config.offset.commit_period_ms, 5000);
        Ok(())
    }

    #[test]
    fn zero_segment_size_is_rejected() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[store]\nsegment_max_size = 0")?;

        let result = BrokerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        Ok(())
    }
}
