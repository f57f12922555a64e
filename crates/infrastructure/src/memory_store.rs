use async_trait::async_trait;
use crond_core::traits::{
    Compare, CoordinationStore, DeleteResponse, GetResponse, KeepAliveResponse, KeepAliveStream,
    KeyValue, LeaseGrant, LeaseId, PutResponse, Revision, Txn, TxnOp, TxnOpResponse, TxnResponse,
    WatchEvent, WatchEventType, WatchStream,
};
use crond_core::constants::MAX_LEASE_TTL_SECONDS;
use crond_core::{CronError, CronResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 内存协调存储实现
///
/// 在单进程内模拟线性一致的键值存储，适用于嵌入式部署和测试场景。
/// 支持全局修订版本、带TTL的租约及自动续租、基于创建版本的比较并交换事务，
/// 以及从指定修订版本开始按顺序投递的变化监听。
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    state: Arc<Mutex<StoreState>>,
    config: InMemoryStoreConfig,
    /// 过期租约清理任务的停止信号
    reaper_stop: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
    /// 过期租约清理间隔
    pub reap_interval: Duration,
    /// 保留的历史事件条数，用于从旧修订版本开始监听
    pub history_limit: usize,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(100),
            history_limit: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease_id: LeaseId,
    history: VecDeque<WatchEvent>,
    /// 小于等于该版本的历史事件已被丢弃
    compacted_revision: Revision,
    history_limit: usize,
    watchers: Vec<Watcher>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
    /// 租约过期或被撤销时触发，用于关闭续租应答流
    closed: CancellationToken,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl InMemoryCoordinationStore {
    /// 创建新的内存协调存储实例
    pub fn new() -> Self {
        Self::with_config(InMemoryStoreConfig::default())
    }

    /// 使用指定配置创建内存协调存储实例，需要在tokio运行时内调用
    pub fn with_config(config: InMemoryStoreConfig) -> Self {
        info!("Creating in-memory coordination store with config: {:?}", config);
        let state = Arc::new(Mutex::new(StoreState {
            history_limit: config.history_limit.max(1),
            next_lease_id: 1,
            ..StoreState::default()
        }));
        let store = Self {
            state,
            config,
            reaper_stop: CancellationToken::new(),
        };

        store.start_reaper();
        store
    }

    /// 当前修订版本
    pub fn revision(&self) -> Revision {
        self.lock_state().revision
    }

    /// 当前存活的租约数
    pub fn lease_count(&self) -> usize {
        self.lock_state().leases.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }

    /// 启动过期租约清理任务
    fn start_reaper(&self) {
        let weak = Arc::downgrade(&self.state);
        let stop = self.reaper_stop.clone();
        let reap_interval = self.config.reap_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(state) = weak.upgrade() else { break };
                let mut state = lock(&state);
                let now = Instant::now();
                let expired: Vec<LeaseId> = state
                    .leases
                    .iter()
                    .filter(|(_, lease)| lease.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();

                for id in expired {
                    debug!(lease_id = id, "租约已过期");
                    state.remove_lease(id);
                }
            }
        });
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryCoordinationStore {
    fn drop(&mut self) {
        self.reaper_stop.cancel();
    }
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StoreState {
    fn range(&self, key: &str, prefix: bool) -> GetResponse {
        let kvs = if prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            self.kvs.get(key).cloned().into_iter().collect()
        };

        GetResponse {
            revision: self.revision,
            kvs,
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> CronResult<PutResponse> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(CronError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let prev_kv = self.kvs.get(key).cloned();
        if let Some(old_lease) = prev_kv.as_ref().and_then(|kv| kv.lease) {
            if let Some(lease_state) = self.leases.get_mut(&old_lease) {
                lease_state.keys.remove(key);
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev_kv
                .as_ref()
                .map(|kv| kv.create_revision)
                .unwrap_or(self.revision),
            mod_revision: self.revision,
            lease,
        };
        if let Some(id) = lease {
            if let Some(lease_state) = self.leases.get_mut(&id) {
                lease_state.keys.insert(key.to_string());
            }
        }
        self.kvs.insert(key.to_string(), kv.clone());
        self.record(WatchEvent {
            event_type: WatchEventType::Put,
            kv,
        });

        Ok(PutResponse {
            revision: self.revision,
            prev_kv,
        })
    }

    fn delete(&mut self, key: &str) -> DeleteResponse {
        let Some(prev) = self.kvs.remove(key) else {
            return DeleteResponse {
                revision: self.revision,
                deleted: 0,
                prev_kvs: Vec::new(),
            };
        };

        self.revision += 1;
        if let Some(lease_state) = prev.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease_state.keys.remove(key);
        }
        self.record(WatchEvent {
            event_type: WatchEventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: self.revision,
                lease: None,
            },
        });

        DeleteResponse {
            revision: self.revision,
            deleted: 1,
            prev_kvs: vec![prev],
        }
    }

    fn compare(&self, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => {
                let current = self.kvs.get(key).map(|kv| kv.create_revision).unwrap_or(0);
                current == *revision
            }
        }
    }

    fn apply(&mut self, op: TxnOp) -> CronResult<TxnOpResponse> {
        Ok(match op {
            TxnOp::Put { key, value, lease } => TxnOpResponse::Put(self.put(&key, value, lease)?),
            TxnOp::Get { key } => TxnOpResponse::Get(self.range(&key, false)),
            TxnOp::Delete { key } => TxnOpResponse::Delete(self.delete(&key)),
        })
    }

    /// 删除租约及其绑定的所有key
    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        for key in &lease.keys {
            let bound = self.kvs.get(key).map(|kv| kv.lease == Some(id)).unwrap_or(false);
            if bound {
                self.delete(key);
            }
        }
        lease.closed.cancel();
        true
    }

    /// 记录历史并分发给匹配前缀的监听者
    fn record(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.kv.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(event.clone()).is_ok()
        });

        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_revision = dropped.kv.mod_revision;
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> CronResult<GetResponse> {
        Ok(self.lock_state().range(key, false))
    }

    async fn get_prefix(&self, prefix: &str) -> CronResult<GetResponse> {
        Ok(self.lock_state().range(prefix, true))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> CronResult<PutResponse> {
        self.lock_state().put(key, value, lease)
    }

    async fn delete(&self, key: &str) -> CronResult<DeleteResponse> {
        Ok(self.lock_state().delete(key))
    }

    async fn txn(&self, txn: Txn) -> CronResult<TxnResponse> {
        let mut state = self.lock_state();
        let succeeded = txn.compare.iter().all(|compare| state.compare(compare));
        let ops = if succeeded { txn.success } else { txn.failure };

        // 先校验租约，保证事务要么全部生效要么全部不生效
        for op in &ops {
            if let TxnOp::Put { lease: Some(id), .. } = op {
                if !state.leases.contains_key(id) {
                    return Err(CronError::LeaseNotFound(*id));
                }
            }
        }

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(state.apply(op)?);
        }

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
            responses,
        })
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> CronResult<LeaseGrant> {
        if ttl_seconds <= 0 || ttl_seconds > MAX_LEASE_TTL_SECONDS {
            return Err(CronError::Store(format!("无效的租约时长: {ttl_seconds}")));
        }

        let mut state = self.lock_state();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl: ttl_seconds,
                deadline: Instant::now() + Duration::from_secs(ttl_seconds as u64),
                keys: BTreeSet::new(),
                closed: CancellationToken::new(),
            },
        );

        debug!(lease_id = id, ttl_seconds, "租约已创建");
        Ok(LeaseGrant {
            id,
            ttl: ttl_seconds,
        })
    }

    async fn keep_alive(&self, lease: LeaseId, cancel: CancellationToken) -> CronResult<KeepAliveStream> {
        let (ttl, closed) = {
            let state = self.lock_state();
            let lease_state = state.leases.get(&lease).ok_or(CronError::LeaseNotFound(lease))?;
            (lease_state.ttl, lease_state.closed.clone())
        };

        let (tx, rx) = mpsc::channel(16);
        let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        let period = Duration::from_millis((ttl.saturating_mul(1000) / 3).max(50) as u64);

        tokio::spawn(async move {
            loop {
                let renewed = match weak.upgrade() {
                    Some(state) => {
                        let mut state = lock(&state);
                        match state.leases.get_mut(&lease) {
                            Some(lease_state) => {
                                lease_state.deadline = Instant::now() + Duration::from_secs(ttl as u64);
                                true
                            }
                            None => false,
                        }
                    }
                    None => false,
                };
                if !renewed || tx.is_closed() {
                    break;
                }
                let _ = tx.try_send(KeepAliveResponse { id: lease, ttl });

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!(lease_id = lease, "续租已停止");
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke(&self, lease: LeaseId) -> CronResult<()> {
        if self.lock_state().remove_lease(lease) {
            debug!(lease_id = lease, "租约已撤销");
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, prefix: &str, from_revision: Option<Revision>) -> CronResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock_state();

        if let Some(from) = from_revision {
            if from <= state.compacted_revision {
                warn!(from, compacted = state.compacted_revision, "监听的修订版本已被压缩");
                return Err(CronError::Store(format!(
                    "修订版本{from}已被压缩，当前最早可用版本为{}",
                    state.compacted_revision + 1
                )));
            }
            for event in state
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= from && e.kv.key.starts_with(prefix))
            {
                // 接收端就在本函数中，发送不会失败
                let _ = tx.send(event.clone());
            }
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}
