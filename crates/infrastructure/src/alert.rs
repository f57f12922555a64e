//! 告警的发布与分发
//!
//! worker把告警写入协调存储的告警队列目录（带租约，过期自动丢弃），
//! 只有主节点运行分发器，从队列中取出告警交给具体的投递通道。

use async_trait::async_trait;
use chrono::Utc;
use crond_core::constants::ALERT_QUEUE_DIR;
use crond_core::models::AlertInfo;
use crond_core::traits::{AlertSender, CoordinationStore, KeyValue, WatchEventType};
use crond_core::CronResult;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::observability::metrics_collector;

/// 告警投递通道
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, alert: &AlertInfo) -> CronResult<()>;
}

/// 以结构化日志的形式输出告警
#[derive(Debug, Default)]
pub struct TracingAlertTransport;

#[async_trait]
impl AlertTransport for TracingAlertTransport {
    async fn deliver(&self, alert: &AlertInfo) -> CronResult<()> {
        warn!(
            worker = %alert.worker,
            job_name = %alert.job_name,
            kind = alert.kind.code(),
            time = %alert.time,
            "告警[{}]: {}",
            alert.kind.description(),
            alert.message
        );
        Ok(())
    }
}

/// 把告警写入存储中的告警队列
pub struct StoreAlertPublisher {
    store: Arc<dyn CoordinationStore>,
    ttl_seconds: i64,
}

impl StoreAlertPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    /// 生成按时间排序的队列key
    pub fn queue_key() -> String {
        format!(
            "{ALERT_QUEUE_DIR}{:013}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4()
        )
    }

    /// 写入一条告警，返回其队列key
    pub async fn publish(&self, alert: &AlertInfo) -> CronResult<String> {
        let value = serde_json::to_vec(alert)?;
        let lease = self.store.grant_lease(self.ttl_seconds).await?;
        let key = Self::queue_key();
        self.store.put(&key, value, Some(lease.id)).await?;
        Ok(key)
    }
}

impl AlertSender for StoreAlertPublisher {
    fn send(&self, alert: AlertInfo) {
        metrics_collector::record_alert_sent(&alert.kind.code().to_string());
        let publisher = StoreAlertPublisher {
            store: self.store.clone(),
            ttl_seconds: self.ttl_seconds,
        };
        tokio::spawn(async move {
            match publisher.publish(&alert).await {
                Ok(key) => debug!(key = %key, job_name = %alert.job_name, "告警已入队"),
                Err(e) => warn!(job_name = %alert.job_name, error = %e, "告警入队失败"),
            }
        });
    }
}

/// 告警关闭时使用，只打印调试日志
#[derive(Debug, Default)]
pub struct NoopAlertSender;

impl AlertSender for NoopAlertSender {
    fn send(&self, alert: AlertInfo) {
        debug!(job_name = %alert.job_name, kind = alert.kind.code(), "告警已关闭，忽略告警");
    }
}

/// 告警分发器，只在主节点上运行
pub struct AlertDispatcher {
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn AlertTransport>,
    running: Mutex<Option<CancellationToken>>,
}

impl AlertDispatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, transport: Arc<dyn AlertTransport>) -> Self {
        Self {
            store,
            transport,
            running: Mutex::new(None),
        }
    }

    /// 启动分发循环，已在运行时不做任何事
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        info!("启动告警分发");
        tokio::spawn(Self::run(
            self.store.clone(),
            self.transport.clone(),
            token,
        ));
    }

    /// 停止分发循环，可以重复调用
    pub fn stop(&self) {
        let token = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
            info!("停止告警分发");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    async fn run(
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn AlertTransport>,
        token: CancellationToken,
    ) {
        // 先处理积压的告警，再从快照之后的版本开始监听
        let snapshot = match store.get_prefix(ALERT_QUEUE_DIR).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "读取告警队列失败");
                token.cancel();
                return;
            }
        };
        for kv in &snapshot.kvs {
            if token.is_cancelled() {
                return;
            }
            Self::dispatch(store.as_ref(), transport.as_ref(), kv).await;
        }

        let mut watch = match store.watch(ALERT_QUEUE_DIR, Some(snapshot.revision + 1)).await {
            Ok(watch) => watch,
            Err(e) => {
                error!(error = %e, "监听告警队列失败");
                token.cancel();
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = watch.next() => match event {
                    Some(event) if event.event_type == WatchEventType::Put => {
                        Self::dispatch(store.as_ref(), transport.as_ref(), &event.kv).await;
                    }
                    Some(_) => {}
                    None => {
                        warn!("告警队列监听已断开");
                        token.cancel();
                        break;
                    }
                }
            }
        }
        debug!("告警分发循环已退出");
    }

    async fn dispatch(store: &dyn CoordinationStore, transport: &dyn AlertTransport, kv: &KeyValue) {
        match serde_json::from_slice::<AlertInfo>(&kv.value) {
            Ok(alert) => match transport.deliver(&alert).await {
                Ok(()) => metrics_collector::record_alert_delivered(),
                Err(e) => {
                    // 投递失败的告警留在队列里，租约到期后自动丢弃
                    warn!(key = %kv.key, error = %e, "告警投递失败");
                    return;
                }
            },
            Err(e) => warn!(key = %kv.key, error = %e, "无法解析告警，丢弃"),
        }

        if let Err(e) = store.delete(&kv.key).await {
            warn!(key = %kv.key, error = %e, "删除已投递告警失败");
        }
    }
}
