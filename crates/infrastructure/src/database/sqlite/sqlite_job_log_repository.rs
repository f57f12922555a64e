use async_trait::async_trait;
use crond_core::models::{JobLog, LogQuery};
use crond_core::traits::JobLogRepository;
use crond_core::CronResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

/// SQLite执行日志仓库
pub struct SqliteJobLogRepository {
    pool: SqlitePool,
}

impl SqliteJobLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并自动建表
    pub async fn connect(database_url: &str, max_connections: u32) -> CronResult<Self> {
        debug!("Creating SQLite job log repository at: {}", database_url);

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // 内存数据库每个连接都是独立的库，只能使用单连接
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        debug!("Successfully created SQLite job log repository");
        Ok(Self { pool })
    }

    /// 运行数据库迁移
    async fn run_migrations(pool: &SqlitePool) -> CronResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                command TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                plan_time INTEGER NOT NULL,
                schedule_time INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_logs_job_name_start_time ON job_logs(job_name, start_time)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_job_log(row: &sqlx::sqlite::SqliteRow) -> CronResult<JobLog> {
        Ok(JobLog {
            job_name: row.try_get("job_name")?,
            command: row.try_get("command")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            plan_time: row.try_get("plan_time")?,
            schedule_time: row.try_get("schedule_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }
}

#[async_trait]
impl JobLogRepository for SqliteJobLogRepository {
    #[instrument(skip(self, logs), fields(count = logs.len()))]
    async fn insert_many(&self, logs: &[JobLog]) -> CronResult<u64> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for log in logs {
            let result = sqlx::query(
                r#"
                INSERT INTO job_logs (job_name, command, output, error, plan_time, schedule_time, start_time, end_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&log.job_name)
            .bind(&log.command)
            .bind(&log.output)
            .bind(&log.error)
            .bind(log.plan_time)
            .bind(log.schedule_time)
            .bind(log.start_time)
            .bind(log.end_time)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!("Inserted {} job logs", inserted);
        Ok(inserted)
    }

    async fn query(&self, query: &LogQuery) -> CronResult<Vec<JobLog>> {
        let rows = sqlx::query(
            "SELECT job_name, command, output, error, plan_time, schedule_time, start_time, end_time
             FROM job_logs WHERE job_name = $1
             ORDER BY start_time DESC, id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(&query.job_name)
        .bind(query.limit)
        .bind(query.skip)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(job_name: &str, start_time: i64) -> JobLog {
        JobLog {
            job_name: job_name.to_string(),
            command: "echo hi".to_string(),
            output: "hi\n".to_string(),
            error: String::new(),
            plan_time: start_time - 10,
            schedule_time: start_time - 5,
            start_time,
            end_time: start_time + 3,
        }
    }

    #[tokio::test]
    async fn test_insert_and_query_newest_first() {
        let repo = SqliteJobLogRepository::connect("sqlite::memory:", 5).await.unwrap();
        let inserted = repo
            .insert_many(&[log("job1", 100), log("job1", 300), log("job2", 200), log("job1", 200)])
            .await
            .unwrap();
        assert_eq!(inserted, 4);

        let logs = repo.query(&LogQuery::new("job1")).await.unwrap();
        let starts: Vec<i64> = logs.iter().map(|l| l.start_time).collect();
        assert_eq!(starts, vec![300, 200, 100]);
        assert_eq!(logs[0], log("job1", 300));
    }

    #[tokio::test]
    async fn test_query_pagination() {
        let repo = SqliteJobLogRepository::connect("sqlite::memory:", 1).await.unwrap();
        let logs: Vec<JobLog> = (1..=5).map(|i| log("job1", i * 100)).collect();
        repo.insert_many(&logs).await.unwrap();

        let page = repo.query(&LogQuery::new("job1").page(1, 2)).await.unwrap();
        let starts: Vec<i64> = page.iter().map(|l| l.start_time).collect();
        assert_eq!(starts, vec![400, 300]);
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("logs.db").display());
        let repo = SqliteJobLogRepository::connect(&url, 2).await.unwrap();
        repo.insert_many(&[log("job1", 1)]).await.unwrap();
        assert_eq!(repo.query(&LogQuery::new("job1")).await.unwrap().len(), 1);
    }
}
