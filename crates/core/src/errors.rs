use thiserror::Error;

/// 调度系统错误类型定义
#[derive(Debug, Error)]
pub enum CronError {
    /// 抢锁失败，其他节点已经持有该锁。属于预期内的竞争，不记录日志也不告警
    #[error("锁已被占用: {key}")]
    LockAlreadyAcquired { key: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的任务定义: {0}")]
    InvalidJob(String),

    #[error("任务执行超时: {timeout_seconds}秒")]
    ExecutionTimeout { timeout_seconds: i64 },

    #[error("任务被强制终止")]
    ExecutionCancelled,

    #[error("命令执行失败: {0}")]
    CommandFailed(String),

    #[error("租约不存在: {0}")]
    LeaseNotFound(i64),

    #[error("协调存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无法找到本地IP")]
    NoLocalIp,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CronError {
    /// 是否为抢锁竞争失败
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CronError::LockAlreadyAcquired { .. })
    }

    /// 是否为调度器主动取消或超时取消导致的失败
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CronError::ExecutionCancelled | CronError::ExecutionTimeout { .. }
        )
    }
}

/// 统一的Result类型
pub type CronResult<T> = std::result::Result<T, CronError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = CronError::LockAlreadyAcquired {
            key: "job-execution-locks/job1".to_string(),
        };
        assert!(err.is_lock_contention());
        assert!(!err.is_cancellation());

        assert!(CronError::ExecutionCancelled.is_cancellation());
        assert!(CronError::ExecutionTimeout { timeout_seconds: 1 }.is_cancellation());
        assert!(!CronError::CommandFailed("exit status: 1".to_string()).is_cancellation());
    }

    #[test]
    fn test_error_display() {
        let err = CronError::InvalidCron {
            expr: "bad".to_string(),
            message: "unexpected token".to_string(),
        };
        assert_eq!(err.to_string(), "无效的CRON表达式: bad - unexpected token");
    }
}
