pub use app_error::{AppError, AppResult, ErrorCategory};
pub use broker::Broker;
pub use config::{
    global_config, BrokerConfig, GeneralConfig, OffsetConfig, StoreConfig, TaskConfig,
    GLOBAL_CONFIG,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod broker;
mod config;
mod shutdown;
mod tracing_config;
