use crond_core::constants::{JOB_KILL_DIR, JOB_SAVE_DIR};
use crond_core::models::{Job, JobEvent};
use crond_core::traits::{CoordinationStore, Revision, WatchEvent, WatchEventType, WatchStream};
use crond_core::utils::extract_name;
use crond_core::CronResult;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::SchedulerHandle;

/// 任务事件管道
///
/// 启动时读取全部任务定义推给调度器，然后从快照之后的版本开始监听变化；
/// 另有一路独立监听强杀请求目录。同一目录内的事件按修订版本顺序推送，不做合并。
pub struct JobWatcher {
    store: Arc<dyn CoordinationStore>,
    scheduler: SchedulerHandle,
}

impl JobWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, scheduler: SchedulerHandle) -> Self {
        Self { store, scheduler }
    }

    /// 启动任务监听和强杀监听，返回两个监听任务的句柄
    pub async fn start(&self, shutdown: CancellationToken) -> CronResult<Vec<JoinHandle<()>>> {
        let jobs = self.watch_jobs(shutdown.clone()).await?;
        let killer = self.watch_killer(shutdown).await?;
        Ok(vec![jobs, killer])
    }

    /// 读取任务快照并推送Save事件，返回快照的修订版本
    pub async fn load_snapshot(&self) -> CronResult<Revision> {
        let snapshot = self.store.get_prefix(JOB_SAVE_DIR).await?;

        for kv in &snapshot.kvs {
            match Job::decode(&kv.value) {
                Ok(job) => self.scheduler.push_job_event(JobEvent::save(job)).await?,
                Err(e) => warn!(key = %kv.key, error = %e, "无法解析任务定义，跳过"),
            }
        }

        info!(
            count = snapshot.kvs.len(),
            revision = snapshot.revision,
            "已加载任务快照"
        );
        Ok(snapshot.revision)
    }

    /// 加载快照后从下一个版本开始监听任务目录
    pub async fn watch_jobs(&self, shutdown: CancellationToken) -> CronResult<JoinHandle<()>> {
        let revision = self.load_snapshot().await?;
        let watch = self.store.watch(JOB_SAVE_DIR, Some(revision + 1)).await?;

        Ok(tokio::spawn(Self::forward(
            "任务定义",
            watch,
            self.scheduler.clone(),
            shutdown,
            Self::decode_job_event,
        )))
    }

    /// 监听强杀请求目录，只关心新建的key
    pub async fn watch_killer(&self, shutdown: CancellationToken) -> CronResult<JoinHandle<()>> {
        let watch = self.store.watch(JOB_KILL_DIR, None).await?;

        Ok(tokio::spawn(Self::forward(
            "强杀请求",
            watch,
            self.scheduler.clone(),
            shutdown,
            Self::decode_kill_event,
        )))
    }

    /// 任务目录的变化转换为任务事件
    pub fn decode_job_event(event: &WatchEvent) -> Option<JobEvent> {
        match event.event_type {
            WatchEventType::Put => match Job::decode(&event.kv.value) {
                Ok(job) => Some(JobEvent::save(job)),
                Err(e) => {
                    warn!(key = %event.kv.key, error = %e, "无法解析任务定义，跳过");
                    None
                }
            },
            WatchEventType::Delete => Some(JobEvent::delete(extract_name(
                &event.kv.key,
                JOB_SAVE_DIR,
            ))),
        }
    }

    /// 强杀目录的变化转换为强杀事件
    ///
    /// 只有新建key产生事件，覆盖写入和过期删除都忽略。
    pub fn decode_kill_event(event: &WatchEvent) -> Option<JobEvent> {
        match event.event_type {
            WatchEventType::Put if event.kv.create_revision == event.kv.mod_revision => {
                Some(JobEvent::kill(extract_name(&event.kv.key, JOB_KILL_DIR)))
            }
            WatchEventType::Put | WatchEventType::Delete => None,
        }
    }

    async fn forward(
        source: &'static str,
        mut watch: WatchStream,
        scheduler: SchedulerHandle,
        shutdown: CancellationToken,
        decode: fn(&WatchEvent) -> Option<JobEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = watch.next() => event,
            };

            let Some(event) = event else {
                // 监听断开后由外部负责重建
                error!(source, "监听连接已断开");
                break;
            };

            if let Some(job_event) = decode(&event) {
                debug!(source, job_name = %job_event.job.name, kind = ?job_event.kind, "推送任务事件");
                if scheduler.push_job_event(job_event).await.is_err() {
                    break;
                }
            }
        }
        debug!(source, "监听任务已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{scheduler_channels, SchedulerInbox};
    use crond_core::models::JobEventKind;
    use crond_core::traits::KeyValue;
    use crond_infrastructure::{InMemoryCoordinationStore, InMemoryStoreConfig};
    use std::time::Duration;

    fn event(event_type: WatchEventType, key: &str, value: Vec<u8>) -> WatchEvent {
        WatchEvent {
            event_type,
            kv: KeyValue {
                key: key.to_string(),
                value,
                create_revision: 1,
                mod_revision: 1,
                lease: None,
            },
        }
    }

    #[test]
    fn test_decode_job_events() {
        let job = Job {
            name: "job1".to_string(),
            command: "echo hi".to_string(),
            cron_expr: "* * * * * *".to_string(),
            timeout_seconds: 5,
        };

        let put = event(WatchEventType::Put, "job-definitions/job1", job.encode().unwrap());
        assert_eq!(JobWatcher::decode_job_event(&put), Some(JobEvent::save(job)));

        let delete = event(WatchEventType::Delete, "job-definitions/job1", Vec::new());
        let decoded = JobWatcher::decode_job_event(&delete).unwrap();
        assert_eq!(decoded.kind, JobEventKind::Delete);
        assert_eq!(decoded.job.name, "job1");

        let garbage = event(WatchEventType::Put, "job-definitions/x", b"{not json".to_vec());
        assert!(JobWatcher::decode_job_event(&garbage).is_none());
    }

    #[test]
    fn test_decode_kill_events() {
        let put = event(WatchEventType::Put, "job-kill-requests/job1", Vec::new());
        assert_eq!(JobWatcher::decode_kill_event(&put), Some(JobEvent::kill("job1")));

        let mut overwrite = event(WatchEventType::Put, "job-kill-requests/job1", Vec::new());
        overwrite.kv.mod_revision = 2;
        assert!(JobWatcher::decode_kill_event(&overwrite).is_none());

        let expired = event(WatchEventType::Delete, "job-kill-requests/job1", Vec::new());
        assert!(JobWatcher::decode_kill_event(&expired).is_none());
    }

    fn job(name: &str, command: &str) -> Job {
        Job {
            name: name.to_string(),
            command: command.to_string(),
            cron_expr: "*/5 * * * * *".to_string(),
            timeout_seconds: 0,
        }
    }

    fn fast_store() -> Arc<dyn CoordinationStore> {
        Arc::new(InMemoryCoordinationStore::with_config(InMemoryStoreConfig {
            reap_interval: Duration::from_millis(20),
            history_limit: 100,
        }))
    }

    async fn put_job(store: &Arc<dyn CoordinationStore>, job: &Job) {
        let key = format!("{JOB_SAVE_DIR}{}", job.name);
        store.put(&key, job.encode().unwrap(), None).await.unwrap();
    }

    async fn next_event(inbox: &mut SchedulerInbox) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(1), inbox.next_job_event())
            .await
            .expect("等待任务事件超时")
            .expect("事件队列已关闭")
    }

    async fn assert_quiet(inbox: &mut SchedulerInbox, wait: Duration) {
        let extra = tokio::time::timeout(wait, inbox.next_job_event()).await;
        assert!(extra.is_err(), "出现多余的任务事件: {extra:?}");
    }

    #[tokio::test]
    async fn test_snapshot_then_watch_delivers_each_change_once() {
        let store = fast_store();
        put_job(&store, &job("a", "echo a")).await;
        put_job(&store, &job("b", "echo b")).await;

        let (handle, mut inbox) = scheduler_channels(100, 10);
        let watcher = JobWatcher::new(store.clone(), handle);
        let shutdown = CancellationToken::new();
        let task = watcher.watch_jobs(shutdown.clone()).await.unwrap();

        // 快照中的任务按key顺序推送
        assert_eq!(next_event(&mut inbox).await, JobEvent::save(job("a", "echo a")));
        assert_eq!(next_event(&mut inbox).await, JobEvent::save(job("b", "echo b")));

        put_job(&store, &job("c", "echo c")).await;
        put_job(&store, &job("a", "echo a2")).await;
        store.delete(&format!("{JOB_SAVE_DIR}b")).await.unwrap();

        assert_eq!(next_event(&mut inbox).await, JobEvent::save(job("c", "echo c")));
        assert_eq!(next_event(&mut inbox).await, JobEvent::save(job("a", "echo a2")));
        let deleted = next_event(&mut inbox).await;
        assert_eq!(deleted, JobEvent::delete("b"));
        assert!(deleted.job.command.is_empty());

        assert_quiet(&mut inbox, Duration::from_millis(100)).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_request_yields_one_kill_and_expiry_yields_nothing() {
        let store = fast_store();
        let (handle, mut inbox) = scheduler_channels(100, 10);
        let watcher = JobWatcher::new(store.clone(), handle);
        let shutdown = CancellationToken::new();
        let task = watcher.watch_killer(shutdown.clone()).await.unwrap();

        let key = format!("{JOB_KILL_DIR}job1");
        let lease = store.grant_lease(1).await.unwrap();
        store.put(&key, Vec::new(), Some(lease.id)).await.unwrap();
        store.put(&key, Vec::new(), Some(lease.id)).await.unwrap();

        assert_eq!(next_event(&mut inbox).await, JobEvent::kill("job1"));

        // 覆盖写入和租约到期删除都不产生事件
        assert_quiet(&mut inbox, Duration::from_millis(1500)).await;
        assert!(store.get(&key).await.unwrap().kvs.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
