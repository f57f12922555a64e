use std::sync::Arc;

use crond_core::config::MasterConfig;
use crond_core::constants::{JOB_DELETE_DIR, JOB_KILL_DIR, JOB_SAVE_DIR, JOB_WORKER_DIR};
use crond_core::models::{Job, JobLog, LogQuery};
use crond_core::traits::{CoordinationStore, JobLogRepository, KeyValue};
use crond_core::utils::extract_name;
use crond_core::{CronError, CronResult, CronScheduler};
use tracing::{info, warn};

/// 任务管理
///
/// 所有写操作都只落在协调存储上，worker通过监听感知变化。
pub struct JobManager {
    store: Arc<dyn CoordinationStore>,
    logs: Option<Arc<dyn JobLogRepository>>,
    kill_ttl_seconds: i64,
    delete_marker_ttl_seconds: i64,
}

impl JobManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &MasterConfig) -> Self {
        Self {
            store,
            logs: None,
            kill_ttl_seconds: config.kill_ttl_seconds,
            delete_marker_ttl_seconds: config.delete_marker_ttl_seconds,
        }
    }

    pub fn with_log_repository(mut self, logs: Arc<dyn JobLogRepository>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// 保存任务，返回被覆盖的旧定义
    pub async fn save_job(&self, job: Job) -> CronResult<Option<Job>> {
        job.validate()?;
        CronScheduler::validate_cron_expression(&job.cron_expr)?;

        let key = format!("{JOB_SAVE_DIR}{}", job.name);
        let resp = self.store.put(&key, job.encode()?, None).await?;
        info!(job_name = %job.name, cron_expr = %job.cron_expr, "保存任务");

        Ok(resp.prev_kv.as_ref().and_then(Self::decode_quietly))
    }

    /// 删除任务，返回被删除的定义；任务不存在时返回None
    ///
    /// 删除成功后写一个很快过期的删除标记，供审计类的监听者使用。
    pub async fn delete_job(&self, name: &str) -> CronResult<Option<Job>> {
        let resp = self.store.delete(&format!("{JOB_SAVE_DIR}{name}")).await?;
        let Some(prev) = resp.prev_kvs.first() else {
            return Ok(None);
        };

        let lease = self.store.grant_lease(self.delete_marker_ttl_seconds).await?;
        self.store
            .put(&format!("{JOB_DELETE_DIR}{name}"), Vec::new(), Some(lease.id))
            .await?;
        info!(job_name = %name, "删除任务");

        Ok(Self::decode_quietly(prev))
    }

    /// 强杀任务：写一个短租约的key，所有worker收到后取消本地正在执行的该任务
    pub async fn kill_job(&self, name: &str) -> CronResult<()> {
        if name.trim().is_empty() {
            return Err(CronError::InvalidJob("任务名不能为空".to_string()));
        }

        let lease = self.store.grant_lease(self.kill_ttl_seconds).await?;
        self.store
            .put(&format!("{JOB_KILL_DIR}{name}"), Vec::new(), Some(lease.id))
            .await?;
        info!(job_name = %name, "发送强杀请求");
        Ok(())
    }

    pub async fn get_job(&self, name: &str) -> CronResult<Option<Job>> {
        let resp = self.store.get(&format!("{JOB_SAVE_DIR}{name}")).await?;
        resp.kvs.first().map(|kv| Job::decode(&kv.value)).transpose()
    }

    /// 列出所有任务，无法解析的定义会被跳过
    pub async fn list_jobs(&self) -> CronResult<Vec<Job>> {
        let resp = self.store.get_prefix(JOB_SAVE_DIR).await?;
        Ok(resp.kvs.iter().filter_map(Self::decode_quietly).collect())
    }

    /// 列出在线的worker
    pub async fn list_workers(&self) -> CronResult<Vec<String>> {
        let resp = self.store.get_prefix(JOB_WORKER_DIR).await?;
        Ok(resp
            .kvs
            .iter()
            .map(|kv| extract_name(&kv.key, JOB_WORKER_DIR).to_string())
            .collect())
    }

    /// 查询任务执行日志，按开始时间倒序
    pub async fn job_logs(&self, query: &LogQuery) -> CronResult<Vec<JobLog>> {
        let logs = self
            .logs
            .as_ref()
            .ok_or_else(|| CronError::Configuration("未配置日志存储".to_string()))?;
        logs.query(query).await
    }

    fn decode_quietly(kv: &KeyValue) -> Option<Job> {
        match Job::decode(&kv.value) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "无法解析任务定义");
                None
            }
        }
    }
}
