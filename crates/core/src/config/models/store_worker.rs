use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_KILL_TTL_SECONDS, DEFAULT_LOCK_TTL_SECONDS,
    DEFAULT_REDIS_NAMESPACE, DEFAULT_REDIS_URL, DEFAULT_REGISTER_TTL_SECONDS,
    MAX_LEASE_TTL_SECONDS,
};

/// 租约时长必须在 (0, MAX_LEASE_TTL_SECONDS] 之间
pub(crate) fn validate_ttl(what: &str, ttl_seconds: i64) -> anyhow::Result<()> {
    if ttl_seconds <= 0 {
        return Err(anyhow::anyhow!("{what}必须大于0"));
    }
    if ttl_seconds > MAX_LEASE_TTL_SECONDS {
        return Err(anyhow::anyhow!(
            "{what}不能超过{MAX_LEASE_TTL_SECONDS}秒: {ttl_seconds}"
        ));
    }
    Ok(())
}

/// 协调存储后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 进程内存储，只在同一进程的master和worker之间共享
    #[default]
    Memory,
    /// Redis服务，master和worker分进程部署时使用
    Redis,
}

/// 协调存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Redis连接地址
    pub url: String,
    /// Redis中所有数据的key前缀，多个集群共用一个Redis时用来隔离
    pub namespace: String,
    /// 连接Redis的超时时间（毫秒）
    pub connect_timeout_ms: u64,
    /// 分布式锁租约时长（秒）
    pub lock_ttl_seconds: i64,
    /// 过期租约清理间隔（毫秒）
    pub reap_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: DEFAULT_REDIS_URL.to_string(),
            namespace: DEFAULT_REDIS_NAMESPACE.to_string(),
            connect_timeout_ms: 5000,
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            reap_interval_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_ttl("锁租约时长", self.lock_ttl_seconds)?;
        if self.reap_interval_ms == 0 {
            return Err(anyhow::anyhow!("租约清理间隔必须大于0"));
        }
        if self.backend == StoreBackend::Redis {
            if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
                return Err(anyhow::anyhow!("无效的Redis地址: {}", self.url));
            }
            if self.namespace.is_empty() {
                return Err(anyhow::anyhow!("Redis key前缀不能为空"));
            }
            if self.connect_timeout_ms == 0 {
                return Err(anyhow::anyhow!("Redis连接超时必须大于0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 节点标识，为空时使用本机IPv4地址
    pub identity: Option<String>,
    /// 任务事件队列容量
    pub event_queue_capacity: usize,
    /// 执行结果队列容量
    pub result_queue_capacity: usize,
    /// 抢锁前随机睡眠的上限（毫秒）
    pub max_jitter_ms: u64,
    /// 注册租约时长（秒）
    pub register_ttl_seconds: i64,
    /// 执行命令使用的shell
    pub shell: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: None,
            event_queue_capacity: 1000,
            result_queue_capacity: 1000,
            max_jitter_ms: 1000,
            register_ttl_seconds: DEFAULT_REGISTER_TTL_SECONDS,
            shell: "/bin/bash".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(identity) = &self.identity {
            if identity.trim().is_empty() {
                return Err(anyhow::anyhow!("Worker标识不能为空字符串"));
            }
        }
        if self.event_queue_capacity == 0 || self.result_queue_capacity == 0 {
            return Err(anyhow::anyhow!("队列容量必须大于0"));
        }
        validate_ttl("注册租约时长", self.register_ttl_seconds)?;
        if self.shell.is_empty() {
            return Err(anyhow::anyhow!("shell不能为空"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub enabled: bool,
    /// 节点标识，为空时使用本机IPv4地址
    pub identity: Option<String>,
    /// 强杀请求key的存活时长（秒）
    pub kill_ttl_seconds: i64,
    /// 删除标记key的存活时长（秒）
    pub delete_marker_ttl_seconds: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: None,
            kill_ttl_seconds: DEFAULT_KILL_TTL_SECONDS,
            delete_marker_ttl_seconds: DEFAULT_KILL_TTL_SECONDS,
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_ttl("强杀请求存活时长", self.kill_ttl_seconds)?;
        validate_ttl("删除标记存活时长", self.delete_marker_ttl_seconds)?;
        Ok(())
    }
}
