use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::constants::TIME_FORMAT;

/// 告警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// 任务执行超时
    Timeout,
    /// 任务执行出错
    ExecutionError,
    /// 任务被强制杀死
    ForceKilled,
}

impl AlertKind {
    /// 告警类型编码，1 超时 2 执行出错 3 强制杀死
    pub fn code(&self) -> i64 {
        match self {
            AlertKind::Timeout => 1,
            AlertKind::ExecutionError => 2,
            AlertKind::ForceKilled => 3,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AlertKind::Timeout => "超时",
            AlertKind::ExecutionError => "执行出错",
            AlertKind::ForceKilled => "强制杀死",
        }
    }
}

/// 告警信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertInfo {
    /// 产生告警信息的worker节点
    pub worker: String,
    /// 告警类型
    pub kind: AlertKind,
    /// 相关任务名
    #[serde(default)]
    pub job_name: String,
    /// 错误信息
    pub message: String,
    /// 告警发生时间
    pub time: String,
}

impl AlertInfo {
    pub fn new(
        worker: impl Into<String>,
        kind: AlertKind,
        job_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            worker: worker.into(),
            kind,
            job_name: job_name.into(),
            message: message.into(),
            time: Local::now().format(TIME_FORMAT).to_string(),
        }
    }

    pub fn timeout(worker: &str, job_name: &str) -> Self {
        Self::new(worker, AlertKind::Timeout, job_name, "任务执行超时")
    }

    pub fn execution_error(worker: &str, job_name: &str) -> Self {
        Self::new(worker, AlertKind::ExecutionError, job_name, "任务执行失败")
    }

    pub fn force_killed(worker: &str, job_name: &str) -> Self {
        Self::new(worker, AlertKind::ForceKilled, job_name, "任务被强制杀死")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_kind_codes() {
        assert_eq!(AlertKind::Timeout.code(), 1);
        assert_eq!(AlertKind::ExecutionError.code(), 2);
        assert_eq!(AlertKind::ForceKilled.code(), 3);
    }

    #[test]
    fn test_alert_json() {
        let alert = AlertInfo::force_killed("10.0.0.1", "job1");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "force_killed");
        assert_eq!(json["worker"], "10.0.0.1");
        assert_eq!(alert.time.len(), "2006-01-02 15:04:05".len());
    }
}
