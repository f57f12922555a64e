use async_trait::async_trait;
use crond_core::config::{MasterConfig, WorkerConfig};
use crond_core::models::{AlertInfo, AlertKind, Job, LogQuery};
use crond_core::traits::{CoordinationStore, JobLogRepository};
use crond_core::CronResult;
use crond_infrastructure::{
    AlertTransport, BatchLogSink, BatchLogSinkConfig, InMemoryCoordinationStore,
    InMemoryStoreConfig, SqliteJobLogRepository, StoreAlertPublisher,
};
use crond_master::MasterService;
use crond_worker::WorkerService;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<AlertInfo>>,
}

#[async_trait]
impl AlertTransport for RecordingTransport {
    async fn deliver(&self, alert: &AlertInfo) -> CronResult<()> {
        self.delivered.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Cluster {
    store: Arc<dyn CoordinationStore>,
    master: MasterService,
    worker: WorkerService,
    sink: Arc<BatchLogSink>,
    transport: Arc<RecordingTransport>,
}

impl Cluster {
    async fn start() -> Self {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(InMemoryCoordinationStore::with_config(InMemoryStoreConfig {
                reap_interval: Duration::from_millis(20),
                history_limit: 1000,
            }));
        let repo = Arc::new(SqliteJobLogRepository::connect("sqlite::memory:", 1).await.unwrap());
        let sink = Arc::new(BatchLogSink::new(
            repo.clone(),
            BatchLogSinkConfig {
                batch_size: 10,
                commit_timeout: Duration::from_millis(100),
                queue_capacity: 100,
            },
        ));
        let transport = Arc::new(RecordingTransport::default());

        let logs: Arc<dyn JobLogRepository> = repo;
        let master = MasterService::new(
            store.clone(),
            "10.0.0.100",
            &MasterConfig::default(),
            5,
            transport.clone(),
            Some(logs),
        );
        master.start().await.unwrap();

        let worker = WorkerService::builder("10.0.0.1", store.clone())
            .config(WorkerConfig {
                max_jitter_ms: 0,
                shell: "/bin/sh".to_string(),
                ..WorkerConfig::default()
            })
            .log_sink(sink.clone())
            .alerts(Arc::new(StoreAlertPublisher::new(store.clone(), 60)))
            .build()
            .unwrap();
        worker.start().await.unwrap();

        Self {
            store,
            master,
            worker,
            sink,
            transport,
        }
    }

    async fn stop(self) {
        self.worker.stop().await;
        self.sink.shutdown().await;
        self.master.stop().await;
    }

    fn delivered(&self, kind: AlertKind, job_name: &str) -> bool {
        self.transport
            .delivered
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.kind == kind && a.job_name == job_name)
    }
}

fn every_second(name: &str, command: &str, timeout_seconds: i64) -> Job {
    Job {
        name: name.to_string(),
        command: command.to_string(),
        cron_expr: "* * * * * *".to_string(),
        timeout_seconds,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..80 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_saved_job_output_reaches_log_store() {
    let cluster = Cluster::start().await;
    assert!(cluster.master.election().is_leader());

    cluster
        .master
        .jobs()
        .save_job(every_second("hello", "echo hi", 5))
        .await
        .unwrap();

    let jobs = cluster.master.jobs();
    eventually("persisted hello log", || async move {
        !jobs.job_logs(&LogQuery::new("hello")).await.unwrap().is_empty()
    })
    .await;

    let logs = jobs.job_logs(&LogQuery::new("hello").page(0, 1)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].output.trim(), "hi");
    assert!(logs[0].error.is_empty());

    assert_eq!(jobs.list_workers().await.unwrap(), vec!["10.0.0.1"]);
    cluster.stop().await;
}

#[tokio::test]
async fn test_failing_job_alert_is_delivered_by_leader() {
    let cluster = Cluster::start().await;

    cluster
        .master
        .jobs()
        .save_job(every_second("broken", "exit 2", 5))
        .await
        .unwrap();

    let c = &cluster;
    eventually("execution error alert", || async move {
        c.delivered(AlertKind::ExecutionError, "broken")
    })
    .await;

    // 投递成功的告警从队列中删除
    cluster.master.jobs().delete_job("broken").await.unwrap();
    eventually("alert queue drained", || async move {
        c.store
            .get_prefix(crond_core::constants::ALERT_QUEUE_DIR)
            .await
            .unwrap()
            .kvs
            .is_empty()
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_kill_and_timeout_alerts() {
    let cluster = Cluster::start().await;
    let jobs = cluster.master.jobs();

    jobs.save_job(every_second("slow", "sleep 5", 1)).await.unwrap();
    let c = &cluster;
    eventually("timeout alert", || async move { c.delivered(AlertKind::Timeout, "slow") }).await;

    jobs.save_job(every_second("stuck", "sleep 30", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    jobs.kill_job("stuck").await.unwrap();
    eventually("force killed alert", || async move {
        c.delivered(AlertKind::ForceKilled, "stuck")
    })
    .await;

    cluster.stop().await;
}
