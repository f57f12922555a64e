use std::sync::Arc;

use crond_core::config::WorkerConfig;
use crond_core::traits::{AlertSender, CoordinationStore, JobLogSink};
use crond_core::{CronError, CronResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::{ExecutorConfig, JobExecutor};
use crate::job_watcher::JobWatcher;
use crate::register::WorkerRegistrar;
use crate::scheduler::{scheduler_channels, JobScheduler, SchedulerHandle};

/// Worker服务
///
/// 组装节点注册、任务事件管道、调度循环和执行器，共用一个停止信号。
pub struct WorkerService {
    identity: String,
    store: Arc<dyn CoordinationStore>,
    config: WorkerConfig,
    lock_ttl_seconds: i64,
    log_sink: Arc<dyn JobLogSink>,
    alerts: Arc<dyn AlertSender>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    identity: String,
    store: Arc<dyn CoordinationStore>,
    config: WorkerConfig,
    lock_ttl_seconds: i64,
    log_sink: Option<Arc<dyn JobLogSink>>,
    alerts: Option<Arc<dyn AlertSender>>,
}

impl WorkerServiceBuilder {
    pub fn new(identity: impl Into<String>, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            identity: identity.into(),
            store,
            config: WorkerConfig::default(),
            lock_ttl_seconds: crond_core::constants::DEFAULT_LOCK_TTL_SECONDS,
            log_sink: None,
            alerts: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lock_ttl_seconds(mut self, ttl: i64) -> Self {
        self.lock_ttl_seconds = ttl;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn JobLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSender>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> CronResult<WorkerService> {
        let log_sink = self
            .log_sink
            .ok_or_else(|| CronError::Configuration("Worker缺少日志存储".to_string()))?;
        let alerts = self
            .alerts
            .ok_or_else(|| CronError::Configuration("Worker缺少告警发送器".to_string()))?;
        if self.identity.trim().is_empty() {
            return Err(CronError::Configuration("Worker标识不能为空".to_string()));
        }

        Ok(WorkerService {
            identity: self.identity,
            store: self.store,
            config: self.config,
            lock_ttl_seconds: self.lock_ttl_seconds,
            log_sink,
            alerts,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl WorkerService {
    pub fn builder(identity: impl Into<String>, store: Arc<dyn CoordinationStore>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(identity, store)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 启动Worker服务
    ///
    /// 调度循环先于事件管道启动，快照中的任务较多时推送不会卡住。
    pub async fn start(&self) -> CronResult<SchedulerHandle> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(CronError::Internal("Worker服务已启动".to_string()));
        }

        let (handle, inbox) = scheduler_channels(
            self.config.event_queue_capacity,
            self.config.result_queue_capacity,
        );

        let executor = JobExecutor::new(
            self.store.clone(),
            self.identity.clone(),
            ExecutorConfig {
                shell: self.config.shell.clone(),
                max_jitter_ms: self.config.max_jitter_ms,
                lock_ttl_seconds: self.lock_ttl_seconds,
            },
            handle.clone(),
            self.alerts.clone(),
        );
        let scheduler = JobScheduler::new(
            self.identity.clone(),
            Arc::new(executor),
            self.log_sink.clone(),
            self.alerts.clone(),
        );
        tasks.push(tokio::spawn(scheduler.run(inbox, self.shutdown.clone())));

        let registrar = WorkerRegistrar::new(
            self.store.clone(),
            self.identity.clone(),
            self.config.register_ttl_seconds,
        );
        tasks.push(tokio::spawn(registrar.keep_online(self.shutdown.clone())));

        let watcher = JobWatcher::new(self.store.clone(), handle.clone());
        match watcher.start(self.shutdown.clone()).await {
            Ok(handles) => tasks.extend(handles),
            Err(e) => {
                self.shutdown.cancel();
                return Err(e);
            }
        }

        info!(identity = %self.identity, "Worker服务已启动");
        Ok(handle)
    }

    /// 停止Worker服务，等待所有后台任务退出
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(identity = %self.identity, error = %e, "Worker后台任务异常退出");
            }
        }
        info!(identity = %self.identity, "Worker服务已停止");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
