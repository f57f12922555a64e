use serde::{Deserialize, Serialize};

/// 任务执行日志
///
/// 每次真正执行（抢锁成功）的任务产生一条日志，时间字段均为毫秒级unix时间戳。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    /// 任务名
    pub job_name: String,
    /// 执行的命令
    pub command: String,
    /// 任务执行的输出
    pub output: String,
    /// 执行的错误信息，成功时为空
    pub error: String,
    /// 计划执行时间
    pub plan_time: i64,
    /// 调度时间
    pub schedule_time: i64,
    /// 开始执行时间
    pub start_time: i64,
    /// 执行完成时间
    pub end_time: i64,
}

/// 日志查询条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub job_name: String,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl LogQuery {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            skip: 0,
            limit: default_limit(),
        }
    }

    pub fn page(mut self, skip: i64, limit: i64) -> Self {
        self.skip = skip.max(0);
        self.limit = limit.max(0);
        self
    }
}
