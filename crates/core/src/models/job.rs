use serde::{Deserialize, Serialize};

use crate::{CronError, CronResult};

/// 任务定义
///
/// 一个可按cron表达式周期调度的shell命令。任务以 `name` 为唯一键保存在
/// 协调存储的 `job-definitions/` 目录下，新版本按名称整体替换旧版本。
///
/// # 使用示例
///
/// ```rust
/// use crond_core::models::Job;
///
/// let job = Job {
///     name: "job1".to_string(),
///     command: "echo hi".to_string(),
///     cron_expr: "* * * * * *".to_string(),
///     timeout_seconds: 5,
/// };
/// assert!(job.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// 任务名
    pub name: String,
    /// shell命令
    pub command: String,
    /// cron表达式
    pub cron_expr: String,
    /// 任务执行的超时时间（秒），小于等于0表示不限制
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: i64,
}

impl Job {
    /// 只携带任务名的任务，用于删除和强杀事件
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            cron_expr: String::new(),
            timeout_seconds: 0,
        }
    }

    /// 校验任务定义的基本字段
    pub fn validate(&self) -> CronResult<()> {
        if self.name.trim().is_empty() {
            return Err(CronError::InvalidJob("任务名不能为空".to_string()));
        }
        if self.name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "任务名不能包含'/': {}",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(CronError::InvalidJob("命令不能为空".to_string()));
        }
        if self.cron_expr.trim().is_empty() {
            return Err(CronError::InvalidJob("cron表达式不能为空".to_string()));
        }
        Ok(())
    }

    /// 从协调存储中的JSON值解码
    pub fn decode(value: &[u8]) -> CronResult<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    /// 编码为协调存储中保存的JSON值
    pub fn encode(&self) -> CronResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 任务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    /// 任务新增或修改
    Save,
    /// 任务删除
    Delete,
    /// 强杀正在执行的任务
    Kill,
}

/// 任务事件，由事件管道推送给调度器，不做持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

impl JobEvent {
    pub fn save(job: Job) -> Self {
        Self {
            kind: JobEventKind::Save,
            job,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Delete,
            job: Job::named(name),
        }
    }

    pub fn kill(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Kill,
            job: Job::named(name),
        }
    }
}
