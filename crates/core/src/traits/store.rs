use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::CronResult;

/// 租约ID
pub type LeaseId = i64;
/// 存储全局修订版本号
pub type Revision = i64;

/// 存储中的一个键值对及其版本信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// 创建该key时的修订版本，key不存在时视为0
    pub create_revision: Revision,
    /// 最后一次修改该key时的修订版本
    pub mod_revision: Revision,
    /// 绑定的租约，租约过期或被撤销时key随之删除
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    /// 读取时刻存储的修订版本
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    pub revision: Revision,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResponse {
    pub revision: Revision,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// 事务比较条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// key的创建版本等于给定值，key不存在时创建版本为0
    CreateRevision { key: String, revision: Revision },
}

impl Compare {
    /// key不存在
    pub fn key_absent(key: impl Into<String>) -> Self {
        Compare::CreateRevision {
            key: key.into(),
            revision: 0,
        }
    }
}

/// 事务中的单个操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value,
            lease,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

/// If/Then/Else 形式的原子事务
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compare.push(compare);
        self
    }

    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// 是否走了Then分支
    pub succeeded: bool,
    pub revision: Revision,
    pub responses: Vec<TxnOpResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

/// 续租应答流，流结束代表续租已停止（租约过期、被撤销或续租被取消）
#[derive(Debug)]
pub struct KeepAliveStream {
    rx: mpsc::Receiver<KeepAliveResponse>,
}

impl KeepAliveStream {
    pub fn new(rx: mpsc::Receiver<KeepAliveResponse>) -> Self {
        Self { rx }
    }

    /// 等待下一个续租应答，返回None表示续租结束
    pub async fn message(&mut self) -> Option<KeepAliveResponse> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Put,
    Delete,
}

/// 监听到的一次变化，删除事件的value为空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kv: KeyValue,
}

/// 变化监听流，事件按修订版本顺序投递
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// 等待下一个事件，返回None表示监听连接已断开
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// 协调存储抽象接口
///
/// 线性一致的键值存储：前缀读取、带租约写入、比较并交换事务、
/// 租约续期以及从指定修订版本开始的变化监听。
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 读取单个key
    async fn get(&self, key: &str) -> CronResult<GetResponse>;

    /// 按前缀读取，结果按key排序
    async fn get_prefix(&self, prefix: &str) -> CronResult<GetResponse>;

    /// 写入key，可选绑定租约，返回旧值
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> CronResult<PutResponse>;

    /// 删除key，返回旧值
    async fn delete(&self, key: &str) -> CronResult<DeleteResponse>;

    /// 原子地执行 If/Then/Else 事务
    async fn txn(&self, txn: Txn) -> CronResult<TxnResponse>;

    /// 申请一个租约
    async fn grant_lease(&self, ttl_seconds: i64) -> CronResult<LeaseGrant>;

    /// 自动续租，`cancel` 触发后停止续租并关闭应答流
    async fn keep_alive(&self, lease: LeaseId, cancel: CancellationToken)
        -> CronResult<KeepAliveStream>;

    /// 撤销租约，绑定的key立即删除
    async fn revoke(&self, lease: LeaseId) -> CronResult<()>;

    /// 监听前缀下的变化，`from_revision` 为None时只监听之后的变化
    async fn watch(&self, prefix: &str, from_revision: Option<Revision>)
        -> CronResult<WatchStream>;
}
