//! 基于租约的分布式锁
//!
//! 加锁流程：申请租约 → 启动自动续租 → 事务“key不存在则写入”。
//! 租约续期中断（过期、网络分区或主动取消）时锁即视为丢失；
//! 持锁进程崩溃后锁会在租约到期时自动释放。

use crond_core::constants::{JOB_LOCK_DIR, MASTER_LOCK_KEY};
use crond_core::traits::{Compare, CoordinationStore, LeaseId, Txn, TxnOp};
use crond_core::{CronError, CronResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::AlertDispatcher;
use crate::observability::metrics_collector;

/// 通用租约锁
pub struct LeaseLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease_id: LeaseId,
    /// 续租作用域，取消后停止续租
    scope: CancellationToken,
    /// 续租应答流关闭时触发
    lost: CancellationToken,
    released: AtomicBool,
}

impl LeaseLock {
    /// 尝试获取锁，失败时已申请的租约会被撤销
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        value: Vec<u8>,
        ttl_seconds: i64,
    ) -> CronResult<Self> {
        let key = key.into();

        let lease = store.grant_lease(ttl_seconds).await?;
        let scope = CancellationToken::new();

        let mut keep_alive = match store.keep_alive(lease.id, scope.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                scope.cancel();
                revoke_quietly(store.as_ref(), lease.id).await;
                return Err(e);
            }
        };

        let lost = CancellationToken::new();
        {
            let lost = lost.clone();
            let key = key.clone();
            tokio::spawn(async move {
                while keep_alive.message().await.is_some() {}
                debug!(key = %key, lease_id = lease.id, "续租应答流已关闭，锁失效");
                lost.cancel();
            });
        }

        let txn = Txn::new()
            .when(Compare::key_absent(key.clone()))
            .and_then(TxnOp::put(key.clone(), value, Some(lease.id)))
            .or_else(TxnOp::get(key.clone()));

        match store.txn(txn).await {
            Ok(resp) if resp.succeeded => {}
            Ok(_) => {
                scope.cancel();
                revoke_quietly(store.as_ref(), lease.id).await;
                return Err(CronError::LockAlreadyAcquired { key });
            }
            Err(e) => {
                scope.cancel();
                revoke_quietly(store.as_ref(), lease.id).await;
                return Err(e);
            }
        }

        debug!(key = %key, lease_id = lease.id, "加锁成功");
        Ok(Self {
            store,
            key,
            lease_id: lease.id,
            scope,
            lost,
            released: AtomicBool::new(false),
        })
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// 锁是否仍然有效
    pub fn is_held(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.lost.is_cancelled()
    }

    /// 锁丢失信号，续租停止时触发（包括主动释放）
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// 释放锁：停止续租并撤销租约，重复调用无副作用
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scope.cancel();
        revoke_quietly(self.store.as_ref(), self.lease_id).await;
        debug!(key = %self.key, lease_id = self.lease_id, "锁已释放");
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        // 未显式释放时至少停止续租，租约到期后锁自动释放
        if !self.released.load(Ordering::SeqCst) {
            self.scope.cancel();
        }
    }
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .field("held", &self.is_held())
            .finish()
    }
}

async fn revoke_quietly(store: &dyn CoordinationStore, lease_id: LeaseId) {
    match store.revoke(lease_id).await {
        Ok(()) | Err(CronError::LeaseNotFound(_)) => {}
        Err(e) => warn!(lease_id, error = %e, "撤销租约失败"),
    }
}

/// 主节点锁，全集群只有一个持有者
#[derive(Debug)]
pub struct MasterLock {
    identity: String,
    inner: LeaseLock,
}

impl MasterLock {
    /// 参与选举。失败时返回 [`CronError::LockAlreadyAcquired`]，当前节点成为从节点
    ///
    /// 成功后一旦失去领导权，传入的告警分发器会被停止。
    pub async fn campaign(
        store: Arc<dyn CoordinationStore>,
        identity: &str,
        ttl_seconds: i64,
        alerts: Option<Arc<AlertDispatcher>>,
    ) -> CronResult<Self> {
        let inner = LeaseLock::acquire(
            store,
            MASTER_LOCK_KEY,
            identity.as_bytes().to_vec(),
            ttl_seconds,
        )
        .await?;

        if let Some(dispatcher) = alerts {
            let lost = inner.lost();
            let identity = identity.to_string();
            tokio::spawn(async move {
                lost.cancelled().await;
                warn!(identity = %identity, "失去主节点身份，停止告警分发");
                dispatcher.stop();
            });
        }

        info!(identity = %identity, "成为主节点");
        Ok(Self {
            identity: identity.to_string(),
            inner,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_held()
    }

    pub fn lost(&self) -> CancellationToken {
        self.inner.lost()
    }

    pub async fn release(&self) {
        self.inner.release().await;
    }
}

/// 任务执行锁，保证同一任务同一时刻只在一个节点上运行
#[derive(Debug)]
pub struct JobLock {
    inner: LeaseLock,
}

impl JobLock {
    pub fn key_for(job_name: &str) -> String {
        format!("{JOB_LOCK_DIR}{job_name}")
    }

    /// 尝试锁住任务，已被其他节点锁住时返回 [`CronError::LockAlreadyAcquired`]
    pub async fn try_lock(
        store: Arc<dyn CoordinationStore>,
        job_name: &str,
        ttl_seconds: i64,
    ) -> CronResult<Self> {
        match LeaseLock::acquire(store, Self::key_for(job_name), Vec::new(), ttl_seconds).await {
            Ok(inner) => Ok(Self { inner }),
            Err(e) => {
                if e.is_lock_contention() {
                    metrics_collector::record_lock_contention(job_name);
                }
                Err(e)
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_held()
    }

    pub async fn release(&self) {
        self.inner.release().await;
    }
}
