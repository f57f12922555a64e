use std::sync::Arc;

use anyhow::{Context, Result};
use crond_core::config::{AppConfig, StoreBackend};
use crond_core::traits::{AlertSender, CoordinationStore, JobLogRepository};
use crond_core::utils::resolve_identity;
use crond_infrastructure::{
    BatchLogSink, BatchLogSinkConfig, CoordinationStoreFactory, NoopAlertSender,
    SqliteJobLogRepository, StoreAlertPublisher, TracingAlertTransport,
};
use crond_master::MasterService;
use crond_worker::WorkerService;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Master（选举、任务管理、告警分发）
    Master,
    /// 仅运行Worker
    Worker,
    /// 同一进程内运行Master和若干Worker
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    identity: String,
    worker_count: usize,
    store: Arc<dyn CoordinationStore>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode, worker_count: usize) -> Result<Self> {
        // 进程内存储无法跨进程共享，Master和Worker分开部署时必须使用Redis
        if mode != AppMode::All && config.store.backend == StoreBackend::Memory {
            anyhow::bail!("{mode:?}模式需要共享的协调存储，请在[store]中配置backend = \"redis\"");
        }

        let configured = match mode {
            AppMode::Master => config.master.identity.as_deref(),
            AppMode::Worker | AppMode::All => config.worker.identity.as_deref(),
        };
        let identity = resolve_identity(configured).context("无法确定节点标识")?;
        info!(identity = %identity, ?mode, "初始化应用程序");

        let store = CoordinationStoreFactory::create(&config.store)
            .await
            .context("初始化协调存储失败")?;

        Ok(Self {
            config,
            mode,
            identity,
            worker_count: worker_count.max(1),
            store,
        })
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let repository = Arc::new(
            SqliteJobLogRepository::connect(
                &self.config.log_sink.database_url,
                self.config.log_sink.max_connections,
            )
            .await
            .context("连接日志数据库失败")?,
        );

        let master = if matches!(self.mode, AppMode::Master | AppMode::All) {
            let logs: Arc<dyn JobLogRepository> = repository.clone();
            let master = MasterService::new(
                self.store.clone(),
                self.identity.clone(),
                &self.config.master,
                self.config.store.lock_ttl_seconds,
                Arc::new(TracingAlertTransport),
                Some(logs),
            );
            master.start().await.context("启动Master服务失败")?;
            Some(master)
        } else {
            None
        };

        let sink = Arc::new(BatchLogSink::new(
            repository.clone(),
            BatchLogSinkConfig::from(&self.config.log_sink),
        ));
        let alerts: Arc<dyn AlertSender> = if self.config.alert.enabled {
            Arc::new(StoreAlertPublisher::new(
                self.store.clone(),
                self.config.alert.alert_ttl_seconds,
            ))
        } else {
            Arc::new(NoopAlertSender)
        };

        let mut workers = Vec::new();
        if matches!(self.mode, AppMode::Worker | AppMode::All) {
            for identity in self.worker_identities() {
                let worker = WorkerService::builder(identity, self.store.clone())
                    .config(self.config.worker.clone())
                    .lock_ttl_seconds(self.config.store.lock_ttl_seconds)
                    .log_sink(sink.clone())
                    .alerts(alerts.clone())
                    .build()?;
                worker.start().await.context("启动Worker服务失败")?;
                workers.push(worker);
            }
        }

        info!(
            identity = %self.identity,
            mode = ?self.mode,
            workers = workers.len(),
            "应用程序已启动"
        );

        shutdown.cancelled().await;

        info!("开始停止各组件");
        futures::future::join_all(workers.iter().map(|w| w.stop())).await;
        sink.shutdown().await;
        if let Some(master) = master {
            master.stop().await;
        }
        repository.close().await;
        info!("所有组件已停止");
        Ok(())
    }

    /// 单个worker直接使用节点标识，多个worker在标识后加序号
    fn worker_identities(&self) -> Vec<String> {
        if self.mode == AppMode::Worker || self.worker_count == 1 {
            return vec![self.identity.clone()];
        }
        (1..=self.worker_count)
            .map(|i| format!("{}-{i}", self.identity))
            .collect()
    }
}
