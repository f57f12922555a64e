use chrono::{DateTime, TimeZone};
use cron::Schedule;
use std::str::FromStr;

use crate::{CronError, CronResult};

/// CRON表达式解析和调度工具
///
/// 支持带秒的6/7段表达式；传统的5段表达式会在前面补上秒字段`0`。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> CronResult<Self> {
        let normalized = Self::normalize(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| CronError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 严格晚于`from`的下一次执行时间，错过的时间点不会补偿
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(from).next()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> CronResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    fn normalize(cron_expr: &str) -> String {
        let trimmed = cron_expr.trim();
        if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        }
    }
}
