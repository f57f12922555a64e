use std::sync::{Arc, Mutex};

use crond_core::constants::{LEADER_ELECTION_DIR, MASTER_LOCK_KEY};
use crond_core::traits::{CoordinationStore, WatchEventType};
use crond_core::CronResult;
use crond_infrastructure::observability::metrics_collector;
use crond_infrastructure::{AlertDispatcher, MasterLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 主节点选举
///
/// 启动时竞选一次，之后监听选举目录，任何删除事件（主节点宕机、租约过期、主动下台）
/// 都会触发新一轮竞选。当选的节点负责告警分发。
pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    identity: String,
    ttl_seconds: i64,
    dispatcher: Arc<AlertDispatcher>,
    lock: Arc<Mutex<Option<Arc<MasterLock>>>>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        identity: impl Into<String>,
        ttl_seconds: i64,
        dispatcher: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            ttl_seconds,
            dispatcher,
            lock: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            watcher: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 本节点当前是否是主节点
    pub fn is_leader(&self) -> bool {
        self.current().is_some_and(|lock| lock.is_held())
    }

    /// 读取当前主节点的标识
    pub async fn leader_identity(&self) -> CronResult<Option<String>> {
        let resp = self.store.get(MASTER_LOCK_KEY).await?;
        Ok(resp
            .kvs
            .first()
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned()))
    }

    /// 参与一轮竞选，返回是否当选
    ///
    /// 选举目录下的删除事件说明主节点key已经不在了，所以总是重新尝试加锁，
    /// 不依赖旧锁的状态。
    pub async fn campaign(&self) -> CronResult<bool> {
        let lock = match MasterLock::campaign(
            self.store.clone(),
            &self.identity,
            self.ttl_seconds,
            None,
        )
        .await
        {
            Ok(lock) => Arc::new(lock),
            Err(e) if e.is_lock_contention() => {
                debug!(identity = %self.identity, "主节点已存在，作为从节点运行");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        {
            let mut slot = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(lock.clone());
            self.dispatcher.start();
        }
        metrics_collector::record_leader_elected();
        self.watch_term(lock);
        Ok(true)
    }

    /// 任期结束时停止告警分发；只处理仍是当前任期的锁，旧任期的通知直接忽略
    fn watch_term(&self, lock: Arc<MasterLock>) {
        let slot = self.lock.clone();
        let dispatcher = self.dispatcher.clone();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            lock.lost().cancelled().await;
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &lock)) {
                *slot = None;
                dispatcher.stop();
                warn!(identity = %identity, "失去主节点身份，停止告警分发");
            }
        });
    }

    /// 开始竞选并监听领导权变化
    pub async fn start(self: &Arc<Self>) -> CronResult<()> {
        // 先建立监听，避免竞选失败和监听建立之间的删除事件丢失
        let mut watch = self.store.watch(LEADER_ELECTION_DIR, None).await?;
        let elected = self.campaign().await?;
        info!(identity = %self.identity, elected, "完成首次竞选");

        let election = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = election.shutdown.cancelled() => break,
                    event = watch.next() => event,
                };

                let Some(event) = event else {
                    error!("选举监听已断开");
                    break;
                };
                if event.event_type != WatchEventType::Delete {
                    continue;
                }

                match election.campaign().await {
                    Ok(true) => info!(identity = %election.identity, "重新当选主节点"),
                    Ok(false) => {}
                    Err(e) => warn!(identity = %election.identity, error = %e, "竞选失败"),
                }
            }
        });
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// 停止选举，主节点会主动下台
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(lock) = lock {
            lock.release().await;
        }
        self.dispatcher.stop();
        info!(identity = %self.identity, "已退出选举");
    }

    fn current(&self) -> Option<Arc<MasterLock>> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
