pub mod sqlite_job_log_repository;

pub use sqlite_job_log_repository::SqliteJobLogRepository;
