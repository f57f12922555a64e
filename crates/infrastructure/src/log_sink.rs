use crond_core::config::LogSinkConfig;
use crond_core::models::JobLog;
use crond_core::traits::{JobLogRepository, JobLogSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability::metrics_collector;

/// 批量日志写入器配置
#[derive(Debug, Clone)]
pub struct BatchLogSinkConfig {
    /// 单个批次的最大条数，达到即提交
    pub batch_size: usize,
    /// 批次从第一条日志开始计时的自动提交超时
    pub commit_timeout: Duration,
    /// 待写入队列容量，满了直接丢弃
    pub queue_capacity: usize,
}

impl Default for BatchLogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            commit_timeout: Duration::from_millis(1000),
            queue_capacity: 1000,
        }
    }
}

impl From<&LogSinkConfig> for BatchLogSinkConfig {
    fn from(config: &LogSinkConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            commit_timeout: Duration::from_millis(config.commit_timeout_ms),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// 批量日志写入器
///
/// `append` 只做非阻塞入队；后台任务攒批后写入仓库，
/// 批次满或超时即提交，关闭时把未提交的批次写完。
pub struct BatchLogSink {
    sender: mpsc::Sender<JobLog>,
    shutdown: CancellationToken,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchLogSink {
    /// 创建写入器并启动后台写入任务
    pub fn new(repository: Arc<dyn JobLogRepository>, config: BatchLogSinkConfig) -> Self {
        info!("Creating batch log sink with config: {:?}", config);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(Self::write_loop(
            repository,
            config,
            receiver,
            shutdown.clone(),
        ));

        Self {
            sender,
            shutdown,
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// 停止写入任务，等待剩余日志落盘
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.writer.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("日志写入任务异常退出: {}", e);
            }
        }
    }

    async fn write_loop(
        repository: Arc<dyn JobLogRepository>,
        config: BatchLogSinkConfig,
        mut receiver: mpsc::Receiver<JobLog>,
        shutdown: CancellationToken,
    ) {
        let batch_size = config.batch_size.max(1);
        let mut batch: Vec<JobLog> = Vec::with_capacity(batch_size);
        // 当前批次的提交截止时间，只对当前批次有效
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(log) => {
                        if batch.is_empty() {
                            deadline = Instant::now() + config.commit_timeout;
                        }
                        batch.push(log);
                        if batch.len() >= batch_size {
                            Self::commit(repository.as_ref(), &mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                    debug!(count = batch.len(), "批次超时，自动提交");
                    Self::commit(repository.as_ref(), &mut batch).await;
                }
                _ = shutdown.cancelled() => {
                    receiver.close();
                    while let Some(log) = receiver.recv().await {
                        batch.push(log);
                        if batch.len() >= batch_size {
                            Self::commit(repository.as_ref(), &mut batch).await;
                        }
                    }
                    break;
                }
            }
        }

        Self::commit(repository.as_ref(), &mut batch).await;
        debug!("日志写入任务已退出");
    }

    async fn commit(repository: &dyn JobLogRepository, batch: &mut Vec<JobLog>) {
        if batch.is_empty() {
            return;
        }

        match repository.insert_many(batch).await {
            Ok(written) => metrics_collector::record_logs_written(written),
            Err(e) => warn!(count = batch.len(), error = %e, "写入执行日志失败"),
        }
        batch.clear();
    }
}

impl JobLogSink for BatchLogSink {
    fn append(&self, log: JobLog) {
        match self.sender.try_send(log) {
            Ok(()) => {}
            Err(TrySendError::Full(log)) => {
                metrics_collector::record_log_dropped();
                warn!(job_name = %log.job_name, "日志队列已满，丢弃执行日志");
            }
            Err(TrySendError::Closed(log)) => {
                debug!(job_name = %log.job_name, "日志写入器已关闭，丢弃执行日志");
            }
        }
    }
}

impl Drop for BatchLogSink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crond_core::models::LogQuery;
    use crond_core::CronResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRepository {
        batches: Mutex<Vec<Vec<JobLog>>>,
    }

    impl RecordingRepository {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl JobLogRepository for RecordingRepository {
        async fn insert_many(&self, logs: &[JobLog]) -> CronResult<u64> {
            self.batches.lock().unwrap().push(logs.to_vec());
            Ok(logs.len() as u64)
        }

        async fn query(&self, _query: &LogQuery) -> CronResult<Vec<JobLog>> {
            Ok(Vec::new())
        }
    }

    fn log(i: i64) -> JobLog {
        JobLog {
            job_name: format!("job{i}"),
            command: "true".to_string(),
            output: String::new(),
            error: String::new(),
            plan_time: i,
            schedule_time: i,
            start_time: i,
            end_time: i,
        }
    }

    #[tokio::test]
    async fn test_full_batch_commits_immediately() {
        let repo = Arc::new(RecordingRepository::default());
        let sink = BatchLogSink::new(
            repo.clone(),
            BatchLogSinkConfig {
                batch_size: 3,
                commit_timeout: Duration::from_secs(60),
                queue_capacity: 100,
            },
        );

        for i in 0..3 {
            sink.append(log(i));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(repo.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_partial_batch_commits_after_timeout() {
        let repo = Arc::new(RecordingRepository::default());
        let sink = BatchLogSink::new(
            repo.clone(),
            BatchLogSinkConfig {
                batch_size: 100,
                commit_timeout: Duration::from_millis(100),
                queue_capacity: 100,
            },
        );

        sink.append(log(1));
        sink.append(log(2));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(repo.batch_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(repo.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_batch() {
        let repo = Arc::new(RecordingRepository::default());
        let sink = BatchLogSink::new(
            repo.clone(),
            BatchLogSinkConfig {
                batch_size: 100,
                commit_timeout: Duration::from_secs(60),
                queue_capacity: 100,
            },
        );

        for i in 0..5 {
            sink.append(log(i));
        }
        sink.shutdown().await;
        assert_eq!(repo.batch_sizes().iter().sum::<usize>(), 5);

        // 关闭后追加的日志被丢弃，不会panic
        sink.append(log(99));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_instead_of_blocking() {
        let repo = Arc::new(RecordingRepository::default());
        let sink = BatchLogSink::new(
            repo.clone(),
            BatchLogSinkConfig {
                batch_size: 100,
                commit_timeout: Duration::from_secs(60),
                queue_capacity: 2,
            },
        );

        // 单线程运行时下写入任务在此期间无法运行，队列只能容纳2条
        for i in 0..10 {
            sink.append(log(i));
        }
        sink.shutdown().await;
        assert_eq!(repo.batch_sizes().iter().sum::<usize>(), 2);
    }
}
