pub mod app_config;
pub mod sink_observability;
pub mod store_worker;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use sink_observability::{AlertConfig, LogSinkConfig, ObservabilityConfig};
pub use store_worker::{MasterConfig, StoreBackend, StoreConfig, WorkerConfig};
