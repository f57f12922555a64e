//! Metrics for the distributed cron scheduler
//!
//! 未安装指标导出器时所有记录操作都是空操作。

use metrics::{counter, histogram};

pub const JOBS_STARTED_TOTAL: &str = "crond_jobs_started_total";
pub const JOB_LOCK_CONTENTION_TOTAL: &str = "crond_job_lock_contention_total";
pub const JOB_FAILURES_TOTAL: &str = "crond_job_failures_total";
pub const JOB_EXECUTION_DURATION_SECONDS: &str = "crond_job_execution_duration_seconds";
pub const JOB_LOGS_WRITTEN_TOTAL: &str = "crond_job_logs_written_total";
pub const JOB_LOGS_DROPPED_TOTAL: &str = "crond_job_logs_dropped_total";
pub const ALERTS_SENT_TOTAL: &str = "crond_alerts_sent_total";
pub const ALERTS_DELIVERED_TOTAL: &str = "crond_alerts_delivered_total";
pub const LEADER_ELECTIONS_WON_TOTAL: &str = "crond_leader_elections_won_total";

/// Record a scheduling decision that handed a job to the executor
pub fn record_job_started(job_name: &str) {
    counter!(JOBS_STARTED_TOTAL, "job" => job_name.to_string()).increment(1);
}

/// Record a lost job-lock race
pub fn record_lock_contention(job_name: &str) {
    counter!(JOB_LOCK_CONTENTION_TOTAL, "job" => job_name.to_string()).increment(1);
}

/// Record a finished execution
pub fn record_job_finished(job_name: &str, succeeded: bool, duration_seconds: f64) {
    histogram!(JOB_EXECUTION_DURATION_SECONDS, "job" => job_name.to_string())
        .record(duration_seconds);
    if !succeeded {
        counter!(JOB_FAILURES_TOTAL, "job" => job_name.to_string()).increment(1);
    }
}

pub fn record_logs_written(count: u64) {
    counter!(JOB_LOGS_WRITTEN_TOTAL).increment(count);
}

pub fn record_log_dropped() {
    counter!(JOB_LOGS_DROPPED_TOTAL).increment(1);
}

/// Record an alert handed to the alert channel, labelled by kind
pub fn record_alert_sent(kind: &str) {
    counter!(ALERTS_SENT_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_alert_delivered() {
    counter!(ALERTS_DELIVERED_TOTAL).increment(1);
}

pub fn record_leader_elected() {
    counter!(LEADER_ELECTIONS_WON_TOTAL).increment(1);
}
