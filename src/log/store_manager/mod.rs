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

//! Message Store Manager Module
//!
//! Owns every partition's [`MessageStore`] on this broker. It discovers and
//! recovers stores at startup, creates stores for new partitions and runs
//! the background flush, retention and recovery checkpoint tasks.
//!
//! # Checkpointing
//!
//! The recovery checkpoint records, per partition, the offset below which
//! all data was flushed. On the next start segments entirely below it are
//! trusted and load through their index instead of a full scan.

mod manager_tasks;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::log::{CheckPointFile, MessageStore, RECOVERY_POINT_FILE_NAME};
use crate::message::TopicPartition;
use crate::service::{StoreConfig, TaskConfig};
use crate::{AppError, AppResult};

#[derive(Debug)]
pub struct MessageStoreManager {
    stores: DashMap<TopicPartition, Arc<MessageStore>>,
    data_dir: PathBuf,
    store_config: StoreConfig,
    task_config: TaskConfig,
    recovery_checkpoints: CheckPointFile,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl MessageStoreManager {
    pub fn new(
        data_dir: impl AsRef<Path>,
        store_config: StoreConfig,
        task_config: TaskConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let recovery_checkpoints = CheckPointFile::new(data_dir.join(RECOVERY_POINT_FILE_NAME));
        Self {
            stores: DashMap::new(),
            data_dir,
            store_config,
            task_config,
            recovery_checkpoints,
            notify_shutdown,
            shutdown_complete_tx,
        }
    }

    /// Opens every partition directory found under the data directory.
    pub async fn startup(&self) -> AppResult<()> {
        info!(data_dir = %self.data_dir.display(), "message store manager startup ...");
        tokio::fs::create_dir_all(&self.data_dir).await.map_err(|e| {
            AppError::DetailedIoError(format!(
                "create data directory {}: {}",
                self.data_dir.display(),
                e
            ))
        })?;
        let recovery_points = self.recovery_checkpoints.read_checkpoints().await?;

        let mut read_dir = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let topic_partition = match TopicPartition::from_string(name.as_str().into()) {
                Ok(tp) => tp,
                Err(_) => {
                    warn!(dir = %name, "skip directory that is not a topic partition");
                    continue;
                }
            };
            let recovery_point = recovery_points.get(&topic_partition).copied().unwrap_or(0);
            let store = MessageStore::open(
                &topic_partition,
                &self.data_dir,
                &self.store_config,
                recovery_point,
            )?;
            self.stores.insert(topic_partition, Arc::new(store));
        }

        info!(stores = self.stores.len(), "message store manager started");
        Ok(())
    }

    /// Store of the partition, created empty if it does not exist yet.
    pub fn get_or_create_store(&self, topic: &str, partition: i32) -> AppResult<Arc<MessageStore>> {
        let topic_partition = TopicPartition::new(topic, partition);
        if let Some(store) = self.stores.get(&topic_partition) {
            return Ok(store.clone());
        }
        let store = self
            .stores
            .entry(topic_partition.clone())
            .or_try_insert_with(|| {
                debug!(%topic_partition, "creating message store");
                MessageStore::open(&topic_partition, &self.data_dir, &self.store_config, 0)
                    .map(Arc::new)
            })?;
        Ok(store.clone())
    }

    pub fn get_store(&self, topic_partition: &TopicPartition) -> Option<Arc<MessageStore>> {
        self.stores.get(topic_partition).map(|store| store.clone())
    }

    pub fn stores(&self) -> Vec<Arc<MessageStore>> {
        self.stores.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Durable end offset of every partition.
    pub fn recovery_points(&self) -> HashMap<TopicPartition, i64> {
        self.stores
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().commit_offset()))
            .collect()
    }

    pub async fn checkpoint_recovery_points(&self) -> AppResult<()> {
        let points = self.recovery_points();
        self.recovery_checkpoints
            .write_checkpoints(&points)
            .await
            .map_err(|e| {
                AppError::DetailedIoError(format!("write recovery checkpoint error: {}", e))
            })
    }

    /// Flushes every store. A failing store is already marked unwritable
    /// by its own flush and does not stop the others.
    pub fn flush_all(&self, force: bool) {
        for store in self.stores() {
            if let Err(e) = store.flush(force) {
                warn!(
                    topic_partition = %store.topic_partition(),
                    error = %e,
                    "flush store failed"
                );
            }
        }
    }

    /// Runs one retention sweep over every store.
    pub fn delete_expired(&self, now: i64) -> usize {
        self.stores()
            .iter()
            .map(|store| store.check_and_delete_expired(now))
            .sum()
    }

    /// Closes every store and writes the final recovery checkpoint.
    pub async fn close(&self) -> AppResult<()> {
        for store in self.stores() {
            info!(
                topic_partition = %store.topic_partition(),
                "message store manager is shutting down, closing store"
            );
            if let Err(e) = store.close() {
                warn!(
                    topic_partition = %store.topic_partition(),
                    error = %e,
                    "close store failed"
                );
            }
        }
        self.checkpoint_recovery_points().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> MessageStoreManager {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        MessageStoreManager::new(
            dir.path(),
            StoreConfig {
                segment_max_size: 256,
                ..StoreConfig::default()
            },
            TaskConfig::default(),
            notify_shutdown,
            shutdown_complete_tx,
        )
    }

    #[tokio::test]
    async fn stores_survive_restart() -> AppResult<()> {
        let dir = TempDir::new()?;
        {
            let manager = manager(&dir);
            manager.startup().await?;
            let store = manager.get_or_create_store("clicks", 2)?;
            for i in 0..40 {
                store.append(&[Bytes::from(format!("click-{}", i))])?;
            }
            manager.get_or_create_store("views", 0)?;
            manager.close().await?;
        }

        let checkpoints = CheckPointFile::new(dir.path().join(RECOVERY_POINT_FILE_NAME))
            .read_checkpoints()
            .await?;
        assert_eq!(checkpoints.get(&TopicPartition::new("clicks", 2)), Some(&40));

        let manager = manager(&dir);
        manager.startup().await?;
        assert_eq!(manager.stores().len(), 2);
        let store = manager
            .get_store(&TopicPartition::new("clicks", 2))
            .ok_or_else(|| AppError::IllegalState("store not recovered".into()))?;
        assert_eq!(store.max_offset(), 40);
        assert_eq!(store.append(&[Bytes::from_static(b"more")])?, 40);
        Ok(())
    }

    #[tokio::test]
    async fn get_or_create_returns_same_store() -> AppResult<()> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);
        let a = manager.get_or_create_store("t", 0)?;
        let b = manager.get_or_create_store("t", 0)?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }
}
