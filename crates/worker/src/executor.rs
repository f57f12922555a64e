use chrono::Local;
use crond_core::models::AlertInfo;
use crond_core::traits::{AlertSender, CoordinationStore};
use crond_core::{CronError, CronResult};
use crond_infrastructure::JobLock;
use rand::Rng;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::{JobExeResult, JobExecuteInfo, JobRunner, SchedulerHandle};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 执行命令使用的shell
    pub shell: String,
    /// 抢锁前随机睡眠的上限（毫秒），用于错开各节点的抢锁时间
    pub max_jitter_ms: u64,
    /// 任务锁租约时长（秒）
    pub lock_ttl_seconds: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            max_jitter_ms: 1000,
            lock_ttl_seconds: 5,
        }
    }
}

/// Shell任务执行器
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn CoordinationStore>,
    identity: String,
    config: ExecutorConfig,
    scheduler: SchedulerHandle,
    alerts: Arc<dyn AlertSender>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        identity: impl Into<String>,
        config: ExecutorConfig,
        scheduler: SchedulerHandle,
        alerts: Arc<dyn AlertSender>,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            config,
            scheduler,
            alerts,
        }
    }

    /// 执行一次尝试：随机睡眠、抢锁、运行命令、释放锁
    pub async fn run_attempt(&self, info: JobExecuteInfo) -> JobExeResult {
        if self.config.max_jitter_ms > 0 {
            let jitter = rand::rng().random_range(0..self.config.max_jitter_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let start_time = Local::now();
        if info.cancel.is_cancelled() {
            return Self::finished(info, start_time, Vec::new(), Some(CronError::ExecutionCancelled));
        }

        let lock = match JobLock::try_lock(
            self.store.clone(),
            &info.job.name,
            self.config.lock_ttl_seconds,
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                if e.is_lock_contention() {
                    debug!(job_name = %info.job.name, "任务已被其他节点锁住");
                } else {
                    warn!(job_name = %info.job.name, error = %e, "抢锁失败");
                }
                return Self::finished(info, start_time, Vec::new(), Some(e));
            }
        };

        let timed_out = Arc::new(AtomicBool::new(false));
        let alarm = (info.job.timeout_seconds > 0).then(|| {
            let timeout = Duration::from_secs(info.job.timeout_seconds as u64);
            let cancel = info.cancel.clone();
            let timed_out = timed_out.clone();
            let alerts = self.alerts.clone();
            let identity = self.identity.clone();
            let job_name = info.job.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(job_name = %job_name, "任务执行超时");
                timed_out.store(true, Ordering::SeqCst);
                alerts.send(AlertInfo::timeout(&identity, &job_name));
                cancel.cancel();
            })
        });

        info!(job_name = %info.job.name, command = %info.job.command, "执行任务");
        let outcome = run_command(&self.config.shell, &info.job.command, &info.cancel).await;

        if let Some(alarm) = alarm {
            alarm.abort();
        }
        lock.release().await;

        let (output, error) = match outcome {
            Ok((output, status)) => {
                let error = if timed_out.load(Ordering::SeqCst) {
                    Some(CronError::ExecutionTimeout {
                        timeout_seconds: info.job.timeout_seconds,
                    })
                } else if info.cancel.is_cancelled() {
                    Some(CronError::ExecutionCancelled)
                } else if !status.success() {
                    Some(CronError::CommandFailed(status.to_string()))
                } else {
                    None
                };
                (output, error)
            }
            Err(e) => (Vec::new(), Some(e)),
        };

        debug!(
            job_name = %info.job.name,
            output = %String::from_utf8_lossy(&output),
            "任务执行结束"
        );
        Self::finished(info, start_time, output, error)
    }

    fn finished(
        info: JobExecuteInfo,
        start_time: chrono::DateTime<Local>,
        output: Vec<u8>,
        error: Option<CronError>,
    ) -> JobExeResult {
        JobExeResult {
            execute_info: info,
            start_time,
            end_time: Local::now(),
            output,
            error,
        }
    }
}

impl JobRunner for JobExecutor {
    fn execute(&self, info: JobExecuteInfo) {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.run_attempt(info).await;
            executor.scheduler.push_execution_result(result).await;
        });
    }
}

/// 通过shell运行命令，合并stdout和stderr
///
/// 取消后杀死子进程并停止读取输出，返回已读到的部分。
async fn run_command(
    shell: &str,
    command: &str,
    cancel: &CancellationToken,
) -> CronResult<(Vec<u8>, ExitStatus)> {
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CronError::CommandFailed(format!("启动命令失败: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CronError::Internal("无法获取stdout".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CronError::Internal("无法获取stderr".to_string()))?;

    let mut output = Vec::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => output.extend_from_slice(&out_buf[..n]),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => output.extend_from_slice(&err_buf[..n]),
            },
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                break;
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            child.wait().await?
        }
    };

    Ok((output, status))
}
