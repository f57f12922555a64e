use std::sync::Arc;

use crond_core::config::MasterConfig;
use crond_core::traits::{CoordinationStore, JobLogRepository};
use crond_core::CronResult;
use crond_infrastructure::{AlertDispatcher, AlertTransport};
use tracing::info;

use crate::election::LeaderElection;
use crate::job_manager::JobManager;

/// Master服务
///
/// 任何节点都可以处理任务管理请求；只有选举出的主节点负责告警分发。
pub struct MasterService {
    election: Arc<LeaderElection>,
    jobs: JobManager,
}

impl MasterService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        identity: impl Into<String>,
        config: &MasterConfig,
        lock_ttl_seconds: i64,
        transport: Arc<dyn AlertTransport>,
        logs: Option<Arc<dyn JobLogRepository>>,
    ) -> Self {
        let dispatcher = Arc::new(AlertDispatcher::new(store.clone(), transport));
        let election = Arc::new(LeaderElection::new(
            store.clone(),
            identity,
            lock_ttl_seconds,
            dispatcher,
        ));

        let mut jobs = JobManager::new(store, config);
        if let Some(logs) = logs {
            jobs = jobs.with_log_repository(logs);
        }

        Self { election, jobs }
    }

    pub async fn start(&self) -> CronResult<()> {
        self.election.start().await?;
        info!(
            identity = %self.election.identity(),
            leader = self.election.is_leader(),
            "Master服务已启动"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.election.stop().await;
        info!(identity = %self.election.identity(), "Master服务已停止");
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }
}
