pub mod alert;
pub mod database;
pub mod lock;
pub mod log_sink;
pub mod memory_store;
pub mod observability;
pub mod redis_store;
pub mod store_factory;

pub use alert::{AlertDispatcher, AlertTransport, NoopAlertSender, StoreAlertPublisher, TracingAlertTransport};
pub use database::SqliteJobLogRepository;
pub use lock::{JobLock, LeaseLock, MasterLock};
pub use log_sink::{BatchLogSink, BatchLogSinkConfig};
pub use memory_store::{InMemoryCoordinationStore, InMemoryStoreConfig};
pub use redis_store::{RedisCoordinationStore, RedisStoreConfig};
pub use store_factory::CoordinationStoreFactory;
