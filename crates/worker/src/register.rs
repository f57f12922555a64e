use crond_core::constants::JOB_WORKER_DIR;
use crond_core::traits::{CoordinationStore, KeepAliveStream, LeaseId};
use crond_core::CronResult;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 注册失败或续租中断后的重试间隔
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// 节点注册
///
/// 在`worker-registry/<identity>`下写一个带租约的空值key并持续续租，
/// 节点宕机后key随租约过期消失，master据此列出在线节点。
pub struct WorkerRegistrar {
    store: Arc<dyn CoordinationStore>,
    identity: String,
    ttl_seconds: i64,
}

impl WorkerRegistrar {
    pub fn new(store: Arc<dyn CoordinationStore>, identity: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            store,
            identity: identity.into(),
            ttl_seconds,
        }
    }

    pub fn key(&self) -> String {
        format!("{JOB_WORKER_DIR}{}", self.identity)
    }

    /// 保持在线，直到收到停止信号；停止时撤销租约让注册立即消失
    pub async fn keep_online(self, shutdown: CancellationToken) {
        loop {
            let scope = shutdown.child_token();
            match self.register(&scope).await {
                Ok((lease, mut keep_alive)) => {
                    info!(key = %self.key(), lease, "节点已注册");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            msg = keep_alive.message() => {
                                if msg.is_none() {
                                    warn!(key = %self.key(), lease, "注册续租中断，准备重新注册");
                                    break;
                                }
                            }
                        }
                    }
                    scope.cancel();

                    if shutdown.is_cancelled() {
                        if let Err(e) = self.store.revoke(lease).await {
                            debug!(lease, error = %e, "撤销注册租约失败");
                        }
                        info!(key = %self.key(), "节点已注销");
                        return;
                    }
                }
                Err(e) => {
                    scope.cancel();
                    warn!(key = %self.key(), error = %e, "节点注册失败");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    async fn register(
        &self,
        scope: &CancellationToken,
    ) -> CronResult<(LeaseId, KeepAliveStream)> {
        let lease = self.store.grant_lease(self.ttl_seconds).await?;
        let keep_alive = match self.store.keep_alive(lease.id, scope.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.store.revoke(lease.id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.put(&self.key(), Vec::new(), Some(lease.id)).await {
            let _ = self.store.revoke(lease.id).await;
            return Err(e);
        }

        Ok((lease.id, keep_alive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crond_infrastructure::{InMemoryCoordinationStore, InMemoryStoreConfig};

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(InMemoryCoordinationStore::with_config(InMemoryStoreConfig {
            reap_interval: Duration::from_millis(20),
            history_limit: 1000,
        }))
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_register_and_unregister_on_shutdown() {
        let store = store();
        let shutdown = CancellationToken::new();
        let registrar = WorkerRegistrar::new(store.clone(), "10.0.0.9", 1);
        let handle = tokio::spawn(registrar.keep_online(shutdown.clone()));

        let s = store.clone();
        wait_for(|| {
            let s = s.clone();
            async move { !s.get("worker-registry/10.0.0.9").await.unwrap().kvs.is_empty() }
        })
        .await;

        // 续租让注册超过TTL仍然存在
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get_prefix(JOB_WORKER_DIR).await.unwrap().kvs.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.get_prefix(JOB_WORKER_DIR).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_reregisters_after_lease_loss() {
        let store = store();
        let shutdown = CancellationToken::new();
        let registrar = WorkerRegistrar::new(store.clone(), "10.0.0.9", 5);
        let handle = tokio::spawn(registrar.keep_online(shutdown.clone()));

        let s = store.clone();
        wait_for(|| {
            let s = s.clone();
            async move { !s.get("worker-registry/10.0.0.9").await.unwrap().kvs.is_empty() }
        })
        .await;

        let first = store.get("worker-registry/10.0.0.9").await.unwrap().kvs[0].lease.unwrap();
        store.revoke(first).await.unwrap();

        let s = store.clone();
        wait_for(|| {
            let s = s.clone();
            async move {
                s.get("worker-registry/10.0.0.9")
                    .await
                    .unwrap()
                    .kvs
                    .first()
                    .and_then(|kv| kv.lease)
                    .is_some_and(|lease| lease != first)
            }
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap();
    }
}
