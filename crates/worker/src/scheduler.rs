//! 任务调度
//!
//! 调度循环独占任务计划表和执行表，其他任务只能通过消息队列与它交互：
//! 事件管道推送任务事件，执行器推送执行结果，定时器在最近的计划时间唤醒。

use chrono::{DateTime, Local};
use crond_core::models::{AlertInfo, AlertKind, Job, JobEvent, JobEventKind, JobLog};
use crond_core::traits::{AlertSender, JobLogSink};
use crond_core::utils::unix_millis;
use crond_core::{CronError, CronResult, CronScheduler};
use crond_infrastructure::observability::metrics_collector;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 没有任何任务计划时的调度间隔
pub const IDLE_SCHEDULE_INTERVAL: Duration = Duration::from_secs(1);

/// 任务调度计划
#[derive(Debug, Clone)]
pub struct JobSchedulePlan {
    pub job: Job,
    pub schedule: CronScheduler,
    pub next_time: DateTime<Local>,
}

impl JobSchedulePlan {
    /// 解析cron表达式并计算`now`之后的第一次执行时间
    pub fn build(job: Job, now: DateTime<Local>) -> CronResult<Self> {
        let schedule = CronScheduler::new(&job.cron_expr)?;
        let next_time = schedule
            .next_after(&now)
            .ok_or_else(|| CronError::InvalidCron {
                expr: job.cron_expr.clone(),
                message: "没有后续的执行时间".to_string(),
            })?;

        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }
}

/// 一次执行尝试
#[derive(Debug, Clone)]
pub struct JobExecuteInfo {
    /// 区分同一任务的不同执行尝试
    pub attempt_id: Uuid,
    pub job: Job,
    /// 计划执行时间
    pub plan_time: DateTime<Local>,
    /// 实际调度时间
    pub real_time: DateTime<Local>,
    /// 取消后执行中的命令被杀死
    pub cancel: CancellationToken,
}

impl JobExecuteInfo {
    pub fn new(job: Job, plan_time: DateTime<Local>, real_time: DateTime<Local>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            job,
            plan_time,
            real_time,
            cancel: CancellationToken::new(),
        }
    }
}

/// 任务执行结果
#[derive(Debug)]
pub struct JobExeResult {
    pub execute_info: JobExecuteInfo,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// 合并后的stdout和stderr
    pub output: Vec<u8>,
    pub error: Option<CronError>,
}

impl JobExeResult {
    /// 转换成执行日志
    pub fn to_job_log(&self) -> JobLog {
        let info = &self.execute_info;
        JobLog {
            job_name: info.job.name.clone(),
            command: info.job.command.clone(),
            output: String::from_utf8_lossy(&self.output).into_owned(),
            error: self
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            plan_time: unix_millis(info.plan_time.into()),
            schedule_time: unix_millis(info.real_time.into()),
            start_time: unix_millis(self.start_time.into()),
            end_time: unix_millis(self.end_time.into()),
        }
    }
}

/// 执行一次调度决定，不能阻塞调度循环
pub trait JobRunner: Send + Sync {
    fn execute(&self, info: JobExecuteInfo);
}

/// 调度器的输入端
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    events: mpsc::Sender<JobEvent>,
    results: mpsc::Sender<JobExeResult>,
}

/// 调度器的接收端，由调度循环持有
#[derive(Debug)]
pub struct SchedulerInbox {
    events: mpsc::Receiver<JobEvent>,
    results: mpsc::Receiver<JobExeResult>,
}

/// 创建调度器的事件队列和结果队列
pub fn scheduler_channels(
    event_capacity: usize,
    result_capacity: usize,
) -> (SchedulerHandle, SchedulerInbox) {
    let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
    let (result_tx, result_rx) = mpsc::channel(result_capacity.max(1));
    (
        SchedulerHandle {
            events: event_tx,
            results: result_tx,
        },
        SchedulerInbox {
            events: event_rx,
            results: result_rx,
        },
    )
}

impl SchedulerInbox {
    #[cfg(test)]
    pub(crate) async fn next_job_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }
}

impl SchedulerHandle {
    /// 推送任务事件，队列满时等待，任务事件不能丢
    pub async fn push_job_event(&self, event: JobEvent) -> CronResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| CronError::Internal("调度器已停止，无法推送任务事件".to_string()))
    }

    /// 推送执行结果
    ///
    /// 结果丢失会让执行表中的记录永远无法清除，所以同样等待队列空位；
    /// 调度循环从不等待执行器，这里不会死锁。
    pub async fn push_execution_result(&self, result: JobExeResult) {
        if let Err(e) = self.results.send(result).await {
            debug!(job_name = %e.0.execute_info.job.name, "调度器已停止，丢弃执行结果");
        }
    }
}

/// 任务调度器
pub struct JobScheduler {
    /// 本节点标识，用于告警
    identity: String,
    plans: HashMap<String, JobSchedulePlan>,
    executing: HashMap<String, JobExecuteInfo>,
    runner: Arc<dyn JobRunner>,
    log_sink: Arc<dyn JobLogSink>,
    alerts: Arc<dyn AlertSender>,
}

impl JobScheduler {
    pub fn new(
        identity: impl Into<String>,
        runner: Arc<dyn JobRunner>,
        log_sink: Arc<dyn JobLogSink>,
        alerts: Arc<dyn AlertSender>,
    ) -> Self {
        Self {
            identity: identity.into(),
            plans: HashMap::new(),
            executing: HashMap::new(),
            runner,
            log_sink,
            alerts,
        }
    }

    pub fn plan(&self, job_name: &str) -> Option<&JobSchedulePlan> {
        self.plans.get(job_name)
    }

    pub fn executing(&self, job_name: &str) -> Option<&JobExecuteInfo> {
        self.executing.get(job_name)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// 处理任务事件
    pub fn handle_job_event(&mut self, event: JobEvent) {
        self.handle_job_event_at(event, Local::now());
    }

    pub fn handle_job_event_at(&mut self, event: JobEvent, now: DateTime<Local>) {
        let name = event.job.name.clone();
        match event.kind {
            JobEventKind::Save => {
                // 任务定义变化后，旧定义正在执行的实例作废
                if let Some(info) = self.executing.remove(&name) {
                    info.cancel.cancel();
                    debug!(job_name = %name, "任务定义已更新，取消正在执行的旧实例");
                }

                match JobSchedulePlan::build(event.job, now) {
                    Ok(plan) => {
                        debug!(job_name = %name, next_time = %plan.next_time, "任务计划已更新");
                        self.plans.insert(name, plan);
                    }
                    Err(e) => warn!(job_name = %name, error = %e, "无法解析cron表达式，忽略该任务"),
                }
            }
            JobEventKind::Delete => {
                if self.plans.remove(&name).is_some() {
                    debug!(job_name = %name, "任务计划已删除");
                }
                if let Some(info) = self.executing.remove(&name) {
                    info.cancel.cancel();
                }
            }
            JobEventKind::Kill => {
                if let Some(info) = self.executing.remove(&name) {
                    info.cancel.cancel();
                    info!(job_name = %name, "任务被强制杀死");
                    self.alerts.send(AlertInfo::force_killed(&self.identity, &name));
                }
            }
        }
    }

    /// 调度一次，返回距离下一次调度的时长
    pub fn try_schedule(&mut self) -> Duration {
        self.try_schedule_at(Local::now())
    }

    pub fn try_schedule_at(&mut self, now: DateTime<Local>) -> Duration {
        if self.plans.is_empty() {
            return IDLE_SCHEDULE_INTERVAL;
        }

        let mut due = Vec::new();
        let mut exhausted = Vec::new();
        for (name, plan) in self.plans.iter_mut() {
            if plan.next_time <= now {
                due.push((plan.job.clone(), plan.next_time));
                match plan.schedule.next_after(&now) {
                    Some(next_time) => plan.next_time = next_time,
                    None => exhausted.push(name.clone()),
                }
            }
        }

        for (job, plan_time) in due {
            self.try_start_job(job, plan_time, now);
        }
        for name in exhausted {
            info!(job_name = %name, "任务没有后续的执行时间，移除计划");
            self.plans.remove(&name);
        }

        self.plans
            .values()
            .map(|plan| plan.next_time)
            .min()
            .map(|nearest| (nearest - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_SCHEDULE_INTERVAL)
    }

    fn try_start_job(&mut self, job: Job, plan_time: DateTime<Local>, now: DateTime<Local>) {
        if self.executing.contains_key(&job.name) {
            debug!(job_name = %job.name, "任务尚未结束，跳过本次执行");
            return;
        }

        let info = JobExecuteInfo::new(job, plan_time, now);
        debug!(job_name = %info.job.name, attempt_id = %info.attempt_id, "开始执行任务");
        self.executing.insert(info.job.name.clone(), info.clone());
        metrics_collector::record_job_started(&info.job.name);
        self.runner.execute(info);
    }

    /// 处理执行结果
    pub fn handle_execution_result(&mut self, result: JobExeResult) {
        let info = &result.execute_info;
        let owns_entry = self
            .executing
            .get(&info.job.name)
            .is_some_and(|current| current.attempt_id == info.attempt_id);
        if owns_entry {
            self.executing.remove(&info.job.name);
        }

        match &result.error {
            Some(e) if e.is_lock_contention() => return,
            Some(e) if e.is_cancellation() => {
                // 超时和强杀已经单独告警过
                debug!(job_name = %info.job.name, error = %e, "任务被取消");
            }
            Some(e) => {
                warn!(job_name = %info.job.name, error = %e, "任务执行失败");
                self.alerts.send(AlertInfo::new(
                    &self.identity,
                    AlertKind::ExecutionError,
                    &info.job.name,
                    format!("任务执行失败: {e}"),
                ));
            }
            None => {}
        }

        let duration = (result.end_time - result.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        metrics_collector::record_job_finished(&info.job.name, result.error.is_none(), duration);
        self.log_sink.append(result.to_job_log());
    }

    /// 取消所有正在执行的任务
    pub fn cancel_all(&mut self) {
        for (name, info) in self.executing.drain() {
            debug!(job_name = %name, "调度器停止，取消正在执行的任务");
            info.cancel.cancel();
        }
    }

    /// 调度循环，直到收到停止信号
    pub async fn run(mut self, mut inbox: SchedulerInbox, shutdown: CancellationToken) {
        info!("调度循环已启动");
        let schedule_after = self.try_schedule();
        let timer = tokio::time::sleep(schedule_after);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = inbox.events.recv() => self.handle_job_event(event),
                Some(result) = inbox.results.recv() => self.handle_execution_result(result),
                _ = &mut timer => {}
            }

            let schedule_after = self.try_schedule();
            timer.as_mut().reset(Instant::now() + schedule_after);
        }

        self.cancel_all();
        info!("调度循环已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        started: Mutex<Vec<JobExecuteInfo>>,
    }

    impl JobRunner for RecordingRunner {
        fn execute(&self, info: JobExecuteInfo) {
            self.started.lock().unwrap().push(info);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        logs: Mutex<Vec<JobLog>>,
    }

    impl JobLogSink for RecordingSink {
        fn append(&self, log: JobLog) {
            self.logs.lock().unwrap().push(log);
        }
    }

    #[derive(Default)]
    struct RecordingAlerts {
        alerts: Mutex<Vec<AlertInfo>>,
    }

    impl AlertSender for RecordingAlerts {
        fn send(&self, alert: AlertInfo) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    struct Fixture {
        scheduler: JobScheduler,
        runner: Arc<RecordingRunner>,
        sink: Arc<RecordingSink>,
        alerts: Arc<RecordingAlerts>,
    }

    impl Fixture {
        fn new() -> Self {
            let runner = Arc::new(RecordingRunner::default());
            let sink = Arc::new(RecordingSink::default());
            let alerts = Arc::new(RecordingAlerts::default());
            let scheduler =
                JobScheduler::new("10.0.0.1", runner.clone(), sink.clone(), alerts.clone());
            Self {
                scheduler,
                runner,
                sink,
                alerts,
            }
        }

        fn started(&self) -> Vec<JobExecuteInfo> {
            self.runner.started.lock().unwrap().clone()
        }

        fn alert_kinds(&self) -> Vec<AlertKind> {
            self.alerts.alerts.lock().unwrap().iter().map(|a| a.kind).collect()
        }

        fn log_count(&self) -> usize {
            self.sink.logs.lock().unwrap().len()
        }
    }

    fn job(name: &str, cron_expr: &str) -> Job {
        Job {
            name: name.to_string(),
            command: "echo hi".to_string(),
            cron_expr: cron_expr.to_string(),
            timeout_seconds: 5,
        }
    }

    fn result(info: JobExecuteInfo, error: Option<CronError>) -> JobExeResult {
        let now = Local::now();
        JobExeResult {
            execute_info: info,
            start_time: now,
            end_time: now,
            output: b"hi\n".to_vec(),
            error,
        }
    }

    /// 保存任务并让它立即到期
    fn schedule_due(fixture: &mut Fixture, name: &str) -> DateTime<Local> {
        let now = Local::now();
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job(name, "* * * * * *")), now);
        let due_at = fixture.scheduler.plan(name).unwrap().next_time;
        fixture.scheduler.try_schedule_at(due_at);
        due_at
    }

    #[test]
    fn test_empty_plan_map_returns_idle_interval_without_side_effects() {
        let mut fixture = Fixture::new();
        assert_eq!(fixture.scheduler.try_schedule(), IDLE_SCHEDULE_INTERVAL);
        assert!(fixture.started().is_empty());
        assert_eq!(fixture.scheduler.executing_count(), 0);
        assert_eq!(fixture.log_count(), 0);
    }

    #[test]
    fn test_save_builds_plan_within_one_second() {
        let mut fixture = Fixture::new();
        let now = Local::now();
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("job1", "* * * * * *")), now);

        let plan = fixture.scheduler.plan("job1").unwrap();
        assert!(plan.next_time > now);
        assert!(plan.next_time <= now + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_due_plan_starts_once_and_advances() {
        let mut fixture = Fixture::new();
        let due_at = schedule_due(&mut fixture, "job1");

        let started = fixture.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].plan_time, due_at);
        assert!(fixture.scheduler.executing("job1").is_some());
        assert!(fixture.scheduler.plan("job1").unwrap().next_time > due_at);
    }

    #[test]
    fn test_fire_while_executing_is_suppressed() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let next = fixture.scheduler.plan("job1").unwrap().next_time;
        fixture.scheduler.try_schedule_at(next);

        assert_eq!(fixture.started().len(), 1);
        assert_eq!(fixture.scheduler.executing_count(), 1);
    }

    #[test]
    fn test_next_wakeup_is_nearest_plan() {
        let mut fixture = Fixture::new();
        let now = Local::now();
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("hourly", "0 0 * * * *")), now);
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("every-second", "* * * * * *")), now);

        let wait = fixture.scheduler.try_schedule_at(now);
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_last_valid_save_wins() {
        let mut fixture = Fixture::new();
        let now = Local::now();
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("job1", "* * * * * *")), now);
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("job1", "0 0 0 1 1 *")), now);
        fixture
            .scheduler
            .handle_job_event_at(JobEvent::save(job("job1", "not a cron")), now);

        let plan = fixture.scheduler.plan("job1").unwrap();
        assert_eq!(plan.job.cron_expr, "0 0 0 1 1 *");
        assert_eq!(fixture.scheduler.plan_count(), 1);
    }

    #[test]
    fn test_invalid_cron_is_not_scheduled() {
        let mut fixture = Fixture::new();
        fixture
            .scheduler
            .handle_job_event(JobEvent::save(job("bad", "every day")));
        assert!(fixture.scheduler.plan("bad").is_none());
    }

    #[test]
    fn test_save_cancels_running_attempt() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let running = fixture.started()[0].clone();

        fixture
            .scheduler
            .handle_job_event(JobEvent::save(job("job1", "0 * * * * *")));
        assert!(running.cancel.is_cancelled());
        assert!(fixture.scheduler.executing("job1").is_none());
    }

    #[test]
    fn test_delete_clears_plan_and_execution() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let running = fixture.started()[0].clone();

        fixture.scheduler.handle_job_event(JobEvent::delete("job1"));
        assert!(fixture.scheduler.plan("job1").is_none());
        assert!(fixture.scheduler.executing("job1").is_none());
        assert!(running.cancel.is_cancelled());

        // 删除不存在的任务没有副作用
        fixture.scheduler.handle_job_event(JobEvent::delete("ghost"));
        assert_eq!(fixture.scheduler.plan_count(), 0);
    }

    #[test]
    fn test_kill_without_execution_is_noop() {
        let mut fixture = Fixture::new();
        fixture
            .scheduler
            .handle_job_event(JobEvent::save(job("job1", "* * * * * *")));

        fixture.scheduler.handle_job_event(JobEvent::kill("job1"));
        assert!(fixture.alert_kinds().is_empty());
        assert!(fixture.scheduler.plan("job1").is_some());
    }

    #[test]
    fn test_kill_mid_execution_alerts_force_killed_only() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let running = fixture.started()[0].clone();

        fixture.scheduler.handle_job_event(JobEvent::kill("job1"));
        assert!(running.cancel.is_cancelled());
        assert!(fixture.scheduler.executing("job1").is_none());
        assert_eq!(fixture.alert_kinds(), vec![AlertKind::ForceKilled]);

        // 被杀死的执行结果只记日志，不再重复告警
        fixture
            .scheduler
            .handle_execution_result(result(running, Some(CronError::ExecutionCancelled)));
        assert_eq!(fixture.alert_kinds(), vec![AlertKind::ForceKilled]);
        assert_eq!(fixture.log_count(), 1);
    }

    #[test]
    fn test_lock_contention_result_is_silent() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let running = fixture.started()[0].clone();

        fixture.scheduler.handle_execution_result(result(
            running,
            Some(CronError::LockAlreadyAcquired {
                key: "job-execution-locks/job1".to_string(),
            }),
        ));
        assert!(fixture.scheduler.executing("job1").is_none());
        assert_eq!(fixture.log_count(), 0);
        assert!(fixture.alert_kinds().is_empty());
    }

    #[test]
    fn test_failed_result_logs_and_alerts() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let running = fixture.started()[0].clone();

        fixture.scheduler.handle_execution_result(result(
            running,
            Some(CronError::CommandFailed("exit status: 1".to_string())),
        ));
        assert_eq!(fixture.alert_kinds(), vec![AlertKind::ExecutionError]);

        let logs = fixture.sink.logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].job_name, "job1");
        assert_eq!(logs[0].output, "hi\n");
        assert!(logs[0].error.contains("exit status: 1"));
    }

    #[test]
    fn test_stale_result_does_not_remove_newer_attempt() {
        let mut fixture = Fixture::new();
        schedule_due(&mut fixture, "job1");
        let old = fixture.started()[0].clone();

        // 重新保存后启动新的一次执行
        fixture
            .scheduler
            .handle_job_event(JobEvent::save(job("job1", "* * * * * *")));
        let due_at = fixture.scheduler.plan("job1").unwrap().next_time;
        fixture.scheduler.try_schedule_at(due_at);
        let newer = fixture.started()[1].clone();

        fixture
            .scheduler
            .handle_execution_result(result(old, Some(CronError::ExecutionCancelled)));
        assert_eq!(
            fixture.scheduler.executing("job1").map(|i| i.attempt_id),
            Some(newer.attempt_id)
        );

        fixture.scheduler.handle_execution_result(result(newer, None));
        assert!(fixture.scheduler.executing("job1").is_none());
        assert_eq!(fixture.log_count(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_exits_and_cancels_on_shutdown() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = JobScheduler::new(
            "10.0.0.1",
            runner.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(RecordingAlerts::default()),
        );
        let (handle, inbox) = scheduler_channels(16, 16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(inbox, shutdown.clone()));

        handle
            .push_job_event(JobEvent::save(job("job1", "* * * * * *")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        let started = runner.started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);

        shutdown.cancel();
        task.await.unwrap();
        assert!(started[0].cancel.is_cancelled());
    }
}
