pub mod sqlite;

pub use sqlite::SqliteJobLogRepository;
