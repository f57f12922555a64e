pub mod executor;
pub mod job_watcher;
pub mod register;
pub mod scheduler;
pub mod service;

pub use executor::{ExecutorConfig, JobExecutor};
pub use job_watcher::JobWatcher;
pub use register::WorkerRegistrar;
pub use scheduler::{
    scheduler_channels, JobExeResult, JobExecuteInfo, JobRunner, JobSchedulePlan, JobScheduler,
    SchedulerHandle, SchedulerInbox,
};
pub use service::{WorkerService, WorkerServiceBuilder};
