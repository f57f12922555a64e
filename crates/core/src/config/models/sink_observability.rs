use serde::{Deserialize, Serialize};

use super::store_worker::validate_ttl;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// 日志数据库地址
    pub database_url: String,
    pub max_connections: u32,
    /// 单个批次的最大日志条数
    pub batch_size: usize,
    /// 批次自动提交的超时时间（毫秒）
    pub commit_timeout_ms: u64,
    /// 日志队列容量，队列满时直接丢弃
    pub queue_capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://crond-logs.db".to_string(),
            max_connections: 5,
            batch_size: 100,
            commit_timeout_ms: 1000,
            queue_capacity: 1000,
        }
    }
}

impl LogSinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!(
                "日志数据库只支持sqlite: {}",
                self.database_url
            ));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("数据库最大连接数必须大于0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批次大小必须大于0"));
        }
        if self.commit_timeout_ms == 0 {
            return Err(anyhow::anyhow!("批次提交超时必须大于0"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("日志队列容量必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// 告警在队列中的存活时长（秒），超时未投递即丢弃
    pub alert_ttl_seconds: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alert_ttl_seconds: 60,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_ttl("告警存活时长", self.alert_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9898".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        if self.metrics_enabled {
            self.metrics_bind_address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("无效的指标监听地址 {}: {e}", self.metrics_bind_address))?;
        }
        Ok(())
    }
}
