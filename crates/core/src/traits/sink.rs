use async_trait::async_trait;

use crate::models::{AlertInfo, JobLog, LogQuery};
use crate::CronResult;

/// 执行日志接收端
///
/// 调用方不等待写入结果；日志过多时实现可以直接丢弃。
pub trait JobLogSink: Send + Sync {
    fn append(&self, log: JobLog);
}

/// 告警发送端，尽力而为且不阻塞调用方
pub trait AlertSender: Send + Sync {
    fn send(&self, alert: AlertInfo);
}

/// 执行日志持久化接口
#[async_trait]
pub trait JobLogRepository: Send + Sync {
    /// 批量写入日志，返回写入条数
    async fn insert_many(&self, logs: &[JobLog]) -> CronResult<u64>;

    /// 按任务名分页查询，按开始时间倒序
    async fn query(&self, query: &LogQuery) -> CronResult<Vec<JobLog>>;
}
