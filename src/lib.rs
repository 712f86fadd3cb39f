pub mod log;
pub mod master;
pub mod message;
pub mod offset;
pub mod service;

pub use log::{CheckPointFile, MessageStore, MessageStoreManager, RecordView, Segment};
pub use message::{StoredRecord, TopicPartition};
pub use offset::{OffsetManager, OffsetStorage, ReadPosition, ReadStatus, RocksDbOffsetStorage};
pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, Broker, BrokerConfig,
    ErrorCategory, Shutdown,
};
pub use master::{ConsumerHolder, TopicPSInfoManager};
