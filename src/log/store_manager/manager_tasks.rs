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

//! Message Store Manager Background Tasks
//!
//! - Flush task: periodic non-forced flush of every store
//! - Expiration task: periodic retention sweep
//! - Recovery checkpoint task: periodic checkpoint write; on shutdown it
//!   closes every store and writes the final checkpoint

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Interval;
use tracing::{debug, error, info, trace};

use super::MessageStoreManager;
use crate::log::now_ms;
use crate::{AppResult, Shutdown};

impl MessageStoreManager {
    /// Spawns the flush, expiration and recovery checkpoint tasks. Each task
    /// keeps a shutdown completion sender alive until it has finished.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let tasks = &self.task_config;
        let flush_interval = tokio::time::interval(Duration::from_millis(
            tasks.flush_check_interval_ms.max(1),
        ));
        let expire_interval = tokio::time::interval(Duration::from_millis(
            tasks.expire_check_interval_ms.max(1),
        ));
        let checkpoint_interval = tokio::time::interval(Duration::from_millis(
            tasks.recovery_checkpoint_interval_ms.max(1),
        ));

        let manager = self.clone();
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.flush_task(flush_interval, shutdown).await;
            trace!("store flush task shutdown");
            drop(complete);
        });

        let manager = self.clone();
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager.expire_task(expire_interval, shutdown).await;
            trace!("store expiration task shutdown");
            drop(complete);
        });

        let manager = self.clone();
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            match manager
                .recovery_checkpoint_task(checkpoint_interval, shutdown)
                .await
            {
                Ok(_) => trace!("recovery checkpoint task shutdown"),
                Err(error) => error!("recovery checkpoint task error:{:?}", error),
            }
            drop(complete);
        });
    }

    async fn flush_task(&self, mut interval: Interval, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.recv() => {
                    debug!("store flush task receiving shutdown signal");
                    return;
                }
            }
            self.flush_all(false);
        }
    }

    async fn expire_task(&self, mut interval: Interval, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.recv() => {
                    debug!("store expiration task receiving shutdown signal");
                    return;
                }
            }
            let deleted = self.delete_expired(now_ms());
            if deleted > 0 {
                info!(deleted, "expired segments deleted");
            }
        }
    }

    async fn recovery_checkpoint_task(
        &self,
        mut interval: Interval,
        mut shutdown: Shutdown,
    ) -> AppResult<()> {
        loop {
            tokio::select! {
                // the first tick completes immediately
                _ = interval.tick() => {trace!("tick complete .")},
                _ = shutdown.recv() => {trace!("recovery checkpoint task receiving shutdown signal");}
            };
            if shutdown.is_shutdown() {
                return self.close().await;
            }
            if let Err(e) = self.checkpoint_recovery_points().await {
                // retried on the next tick
                error!("{}", e);
            }
        }
    }
}
