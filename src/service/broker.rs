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

use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace};

use crate::log::MessageStoreManager;
use crate::offset::{OffsetManager, RocksDbOffsetStorage};
use crate::service::BrokerConfig;
use crate::AppResult;

/// Storage side of a broker: the partition stores, the offset service and
/// their background tasks.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker { config }
    }

    /// Runs until Ctrl-C, then shuts every background task down and waits
    /// for them to finish.
    pub fn start(&self, rt: &Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let _guard = rt.enter();

        // startup message stores
        let store_manager = Arc::new(MessageStoreManager::new(
            &self.config.general.data_dir,
            self.config.store.clone(),
            self.config.tasks.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        ));
        rt.block_on(store_manager.startup())?;
        store_manager.start_background_tasks();

        // startup offset service
        let storage = Arc::new(RocksDbOffsetStorage::open(&self.config.offset.db_path)?);
        let offset_manager = Arc::new(OffsetManager::new(
            self.config.general.broker_id,
            self.config.offset.clone(),
            storage,
        ));
        offset_manager.start_commit_task(&notify_shutdown, shutdown_complete_tx);

        info!(
            broker_id = self.config.general.broker_id,
            stores = store_manager.stores().len(),
            "broker started"
        );
        rt.block_on(signal::ctrl_c())?;
        info!("get shutdown signal");

        let _ = notify_shutdown.send(());
        drop(store_manager);
        drop(offset_manager);
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("broker shutdown complete");
        Ok(())
    }
}
