pub mod config;
pub mod constants;
pub mod cron_utils;
pub mod errors;
pub mod models;
pub mod traits;
pub mod utils;

pub use cron_utils::CronScheduler;
pub use errors::*;
pub use models::{AlertInfo, AlertKind, Job, JobEvent, JobEventKind, JobLog, LogQuery};
pub use traits::{AlertSender, CoordinationStore, JobLogRepository, JobLogSink};
