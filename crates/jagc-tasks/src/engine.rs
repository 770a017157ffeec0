//! Scheduled task engine: a serialized periodic tick that materializes due
//! schedules into task runs, feeds them through the run service, and
//! reconciles whatever a crash left behind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jagc_core::RunService;
use jagc_store::{Store, StoreError};
use jagc_types::{
    DeliveryMode, DeliveryTarget, IngestRequest, RunStatus, ScheduledTask, TaskRun, TaskRunStatus,
};

use crate::schedule::compute_next_occurrence;

pub const TOPICS_UNAVAILABLE: &str = "telegram_topics_unavailable";

/// Creates the dedicated chat-bot topic some delivery targets need for their
/// execution thread. Implemented by the Telegram gateway; absent otherwise.
#[async_trait]
pub trait TopicBridge: Send + Sync {
    async fn create_task_topic(&self, chat_id: i64, title: &str) -> anyhow::Result<i64>;
}

/// Stand-in when no chat gateway is configured: topic-backed tasks fail
/// with a clear, non-retriable message.
pub struct NoTopicBridge;

#[async_trait]
impl TopicBridge for NoTopicBridge {
    async fn create_task_topic(&self, _chat_id: i64, _title: &str) -> anyhow::Result<i64> {
        anyhow::bail!(TOPICS_UNAVAILABLE)
    }
}

/// Best-effort hook fired when a task run's underlying run starts; the chat
/// gateway uses it to attach its progress follow-up to the topic.
#[async_trait]
pub trait TaskRunNotifier: Send + Sync {
    async fn task_run_dispatched(&self, task: &ScheduledTask, task_run: &TaskRun, run_id: &str);
}

pub struct NoopTaskRunNotifier;

#[async_trait]
impl TaskRunNotifier for NoopTaskRunNotifier {
    async fn task_run_dispatched(&self, _task: &ScheduledTask, _task_run: &TaskRun, _run_id: &str) {
    }
}

#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    pub poll_interval: Duration,
    pub due_batch_size: usize,
    pub recovery_batch_size: usize,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            due_batch_size: 25,
            recovery_batch_size: 25,
        }
    }
}

pub struct TaskEngine {
    store: Store,
    runs: Arc<RunService>,
    bridge: Arc<dyn TopicBridge>,
    notifier: Arc<dyn TaskRunNotifier>,
    config: TaskEngineConfig,
    cancel: CancellationToken,
    /// Serializes ticks; `stop` takes it to wait out an in-flight tick.
    tick_lock: Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(
        store: Store,
        runs: Arc<RunService>,
        bridge: Arc<dyn TopicBridge>,
        notifier: Arc<dyn TaskRunNotifier>,
        config: TaskEngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runs,
            bridge,
            notifier,
            config,
            cancel: CancellationToken::new(),
            tick_lock: Mutex::new(()),
            loop_handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = interval.tick() => engine.tick(Utc::now()).await,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "task engine started"
        );
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        // The loop is gone, but a tick started before the cancel may still
        // be running; taking the lock waits it out.
        let _guard = self.tick_lock.lock().await;
        info!("task engine stopped");
    }

    /// One full pass: due tasks, then pending recovery, then reconciliation
    /// of dispatched task runs. Public for tests and `run-now`.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let _guard = self.tick_lock.lock().await;
        if let Err(err) = self.process_due_tasks(now).await {
            error!(%err, "process_due_tasks failed");
        }
        if let Err(err) = self.resume_pending_task_runs().await {
            error!(%err, "resume_pending_task_runs failed");
        }
        if let Err(err) = self.reconcile_dispatched_task_runs().await {
            error!(%err, "reconcile_dispatched_task_runs failed");
        }
    }

    async fn process_due_tasks(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let due = self
            .store
            .list_due_tasks(now, self.config.due_batch_size)
            .await?;
        for task in due {
            let Some(occurrence) = task.next_run_at else {
                continue;
            };
            if let Err(err) = self.fire_occurrence(&task, occurrence).await {
                error!(task_id = %task.task_id, %err, "due task processing failed");
            }
        }
        Ok(())
    }

    async fn fire_occurrence(
        &self,
        task: &ScheduledTask,
        occurrence: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let (task_run, created) = self
            .store
            .create_or_get_task_run(&task.task_id, occurrence)
            .await?;
        if created {
            debug!(task_id = %task.task_id, scheduled_for = %occurrence, "task run materialized");
        }

        // Advance the schedule before dispatching so a dispatch failure can
        // never replay the same occurrence forever.
        match compute_next_occurrence(task, occurrence) {
            Ok((enabled, next_run_at)) => {
                self.store
                    .advance_task_after_occurrence(&task.task_id, occurrence, enabled, next_run_at)
                    .await?;
            }
            Err(err) => {
                warn!(task_id = %task.task_id, %err, "schedule advance failed; disabling task");
                self.store
                    .advance_task_after_occurrence(&task.task_id, occurrence, false, None)
                    .await?;
                self.store
                    .record_task_outcome(&task.task_id, TaskRunStatus::Failed, Some(&err.to_string()))
                    .await?;
            }
        }

        if task_run.status == TaskRunStatus::Pending {
            self.dispatch_task_run(task, &task_run).await?;
        }
        Ok(())
    }

    /// Crash window: a task run was created but the process died before its
    /// dispatch. Sweep and redispatch.
    async fn resume_pending_task_runs(&self) -> Result<(), StoreError> {
        let pending = self
            .store
            .list_task_runs_by_status(TaskRunStatus::Pending, self.config.recovery_batch_size)
            .await?;
        for task_run in pending {
            let task = match self.store.get_task(&task_run.task_id).await {
                Ok(task) => task,
                Err(StoreError::TaskNotFound(_)) => {
                    self.store
                        .mark_task_run_failed(&task_run.task_run_id, "task was deleted")
                        .await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Err(err) = self.dispatch_task_run(&task, &task_run).await {
                error!(task_run_id = %task_run.task_run_id, %err, "pending redispatch failed");
            }
        }
        Ok(())
    }

    /// Task runs whose underlying run was created: follow the run to its
    /// terminal state.
    async fn reconcile_dispatched_task_runs(&self) -> Result<(), StoreError> {
        let dispatched = self
            .store
            .list_task_runs_by_status(TaskRunStatus::Dispatched, self.config.recovery_batch_size)
            .await?;
        for task_run in dispatched {
            let Some(run_id) = task_run.run_id.clone() else {
                self.store
                    .mark_task_run_failed(&task_run.task_run_id, "dispatched without a run id")
                    .await?;
                continue;
            };
            let run = match self.runs.get_run(&run_id).await {
                Ok(run) => run,
                Err(StoreError::RunNotFound(_)) => {
                    self.store
                        .mark_task_run_failed(&task_run.task_run_id, "underlying run vanished")
                        .await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match run.status {
                RunStatus::Running => {
                    // Still going; re-fire the best-effort delivery hook so a
                    // restarted gateway can re-attach.
                    if let Ok(task) = self.store.get_task(&task_run.task_id).await {
                        self.notifier
                            .task_run_dispatched(&task, &task_run, &run_id)
                            .await;
                    }
                }
                RunStatus::Succeeded => {
                    self.store
                        .mark_task_run_succeeded(&task_run.task_run_id, Some(&run_id))
                        .await?;
                    self.store
                        .record_task_outcome(&task_run.task_id, TaskRunStatus::Succeeded, None)
                        .await?;
                }
                RunStatus::Failed => {
                    let reason = run
                        .error_message
                        .unwrap_or_else(|| "run failed without a message".to_string());
                    self.store
                        .mark_task_run_failed(&task_run.task_run_id, &reason)
                        .await?;
                    self.store
                        .record_task_outcome(
                            &task_run.task_id,
                            TaskRunStatus::Failed,
                            Some(&reason),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_task_run(
        &self,
        task: &ScheduledTask,
        task_run: &TaskRun,
    ) -> anyhow::Result<()> {
        let task = match self.ensure_execution_thread(task).await {
            Ok(task) => task,
            Err(err) => {
                let reason = err.to_string();
                self.store
                    .mark_task_run_failed(&task_run.task_run_id, &reason)
                    .await?;
                self.store
                    .record_task_outcome(&task.task_id, TaskRunStatus::Failed, Some(&reason))
                    .await?;
                return Ok(());
            }
        };
        let thread_key = task
            .execution_thread_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("execution thread missing after ensure"))?;

        let instructions = format!(
            "[SCHEDULED TASK] {}\nOccurrence: {}\n\n{}",
            task.title,
            task_run
                .scheduled_for
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            task.instructions,
        );
        let req = IngestRequest {
            source: format!("task:{}", task.task_id),
            thread_key,
            user_key: task.owner_user_key.clone(),
            delivery_mode: DeliveryMode::FollowUp,
            idempotency_key: Some(task_run.idempotency_key.clone()),
            input_text: instructions,
            images: Vec::new(),
        };

        let outcome = self.runs.ingest(&req).await?;
        match outcome.run.status {
            RunStatus::Running => {
                self.store
                    .mark_task_run_dispatched(&task_run.task_run_id, &outcome.run.run_id)
                    .await?;
                self.notifier
                    .task_run_dispatched(&task, task_run, &outcome.run.run_id)
                    .await;
            }
            RunStatus::Succeeded => {
                self.store
                    .mark_task_run_succeeded(&task_run.task_run_id, Some(&outcome.run.run_id))
                    .await?;
                self.store
                    .record_task_outcome(&task.task_id, TaskRunStatus::Succeeded, None)
                    .await?;
            }
            RunStatus::Failed => {
                let reason = outcome
                    .run
                    .error_message
                    .unwrap_or_else(|| "run failed at ingest".to_string());
                self.store
                    .mark_task_run_failed(&task_run.task_run_id, &reason)
                    .await?;
                self.store
                    .record_task_outcome(&task.task_id, TaskRunStatus::Failed, Some(&reason))
                    .await?;
            }
        }
        Ok(())
    }

    /// Lazily create the thread a task's runs execute on. Telegram targets
    /// get a dedicated forum topic; everything else gets a synthetic key.
    async fn ensure_execution_thread(
        &self,
        task: &ScheduledTask,
    ) -> anyhow::Result<ScheduledTask> {
        if task.execution_thread_key.is_some() {
            return Ok(task.clone());
        }
        let mut task = task.clone();
        match task.delivery_target.clone() {
            DeliveryTarget::Telegram { chat_id, .. } => {
                let topic_id = self
                    .bridge
                    .create_task_topic(chat_id, &task.title)
                    .await
                    .map_err(|_| anyhow::anyhow!(TOPICS_UNAVAILABLE))?;
                let thread_key = format!("telegram:chat:{chat_id}:topic:{topic_id}");
                let target = DeliveryTarget::Telegram {
                    chat_id,
                    topic_id: Some(topic_id),
                };
                self.store
                    .set_task_execution_thread(&task.task_id, &thread_key, &target)
                    .await?;
                task.execution_thread_key = Some(thread_key);
                task.delivery_target = target;
            }
            other => {
                let thread_key = format!("{}:task:{}", other.provider(), task.task_id);
                self.store
                    .set_task_execution_thread(&task.task_id, &thread_key, &other)
                    .await?;
                task.execution_thread_key = Some(thread_key);
            }
        }
        Ok(task)
    }

    /// Materialize and dispatch an immediate occurrence, outside the
    /// schedule. The schedule itself is not advanced.
    pub async fn run_now(&self, task_id: &str) -> anyhow::Result<TaskRun> {
        let _guard = self.tick_lock.lock().await;
        let task = self.store.get_task(task_id).await?;
        let now = Utc::now();
        let (task_run, _) = self.store.create_or_get_task_run(task_id, now).await?;
        if task_run.status == TaskRunStatus::Pending {
            self.dispatch_task_run(&task, &task_run).await?;
        }
        Ok(self.store.get_task_run(&task_run.task_run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jagc_core::{EchoExecutor, ProgressBus};
    use jagc_types::{new_task_id, ScheduleKind};
    use std::sync::Mutex as StdMutex;

    struct RecordingBridge {
        calls: StdMutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl TopicBridge for RecordingBridge {
        async fn create_task_topic(&self, chat_id: i64, title: &str) -> anyhow::Result<i64> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((chat_id, title.to_string()));
            Ok(7000 + calls.len() as i64)
        }
    }

    fn harness() -> (Store, Arc<RunService>, Arc<TaskEngine>, Arc<RecordingBridge>) {
        let store = Store::open_in_memory().unwrap();
        let progress = ProgressBus::new();
        let executor = Arc::new(EchoExecutor::new(progress.clone()));
        let runs = RunService::new(store.clone(), executor, progress);
        let bridge = Arc::new(RecordingBridge {
            calls: StdMutex::new(Vec::new()),
        });
        let engine = TaskEngine::new(
            store.clone(),
            runs.clone(),
            bridge.clone(),
            Arc::new(NoopTaskRunNotifier),
            TaskEngineConfig::default(),
        );
        (store, runs, engine, bridge)
    }

    fn cron_task(next_run_at: Option<DateTime<Utc>>) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            task_id: new_task_id(),
            title: "standup notes".into(),
            instructions: "collect yesterday's activity".into(),
            schedule_kind: ScheduleKind::Cron,
            once_at: None,
            cron_expr: Some("0 9 * * 1-5".into()),
            rrule_expr: None,
            timezone: "America/Los_Angeles".into(),
            enabled: true,
            next_run_at,
            creator_thread_key: "telegram:chat:101".into(),
            owner_user_key: Some("telegram:user:202".into()),
            delivery_target: DeliveryTarget::Telegram {
                chat_id: 101,
                topic_id: None,
            },
            execution_thread_key: None,
            last_run_at: None,
            last_run_status: None,
            last_error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn run_now_creates_topic_lazily_and_once() {
        let (store, _runs, engine, bridge) = harness();
        let task = cron_task(None);
        store.insert_task(&task).await.unwrap();

        // Creating the task alone creates no topic.
        assert!(bridge.calls.lock().unwrap().is_empty());

        let task_run = engine.run_now(&task.task_id).await.unwrap();
        assert_eq!(task_run.status, TaskRunStatus::Dispatched);
        assert_eq!(bridge.calls.lock().unwrap().as_slice(), &[(101, "standup notes".to_string())]);

        let loaded = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(
            loaded.execution_thread_key.as_deref(),
            Some("telegram:chat:101:topic:7001")
        );
        assert_eq!(
            loaded.delivery_target,
            DeliveryTarget::Telegram {
                chat_id: 101,
                topic_id: Some(7001),
            }
        );

        // The underlying run carries the scheduled-task header and executes
        // on the topic's thread.
        let run = store
            .get_run(task_run.run_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(run.thread_key, "telegram:chat:101:topic:7001");
        assert!(run.input_text.starts_with("[SCHEDULED TASK] standup notes"));
        assert!(run.input_text.contains("collect yesterday's activity"));

        // The second immediate occurrence reuses the topic.
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.run_now(&task.task_id).await.unwrap();
        assert_eq!(bridge.calls.lock().unwrap().len(), 1);
    }

    /// Timestamps round-trip through the store at millisecond precision.
    fn ms(ts: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap()
    }

    #[tokio::test]
    async fn due_task_materializes_and_advances() {
        let (store, _runs, engine, _bridge) = harness();
        let occurrence = ms(Utc::now() - chrono::Duration::minutes(1));
        let task = cron_task(Some(occurrence));
        store.insert_task(&task).await.unwrap();

        engine.tick(Utc::now()).await;

        let runs = store
            .list_task_runs_by_status(TaskRunStatus::Dispatched, 10)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].task_id, task.task_id);
        assert_eq!(runs[0].scheduled_for, occurrence);

        let advanced = store.get_task(&task.task_id).await.unwrap();
        assert!(advanced.enabled);
        let next = advanced.next_run_at.unwrap();
        assert!(next > occurrence);
        assert_eq!(advanced.last_run_at, Some(occurrence));

        // The same occurrence does not fire twice.
        engine.tick(Utc::now()).await;
        let runs = store
            .list_task_runs_by_status(TaskRunStatus::Dispatched, 10)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn one_shot_disables_after_firing() {
        let (store, _runs, engine, _bridge) = harness();
        let occurrence = Utc::now() - chrono::Duration::seconds(10);
        let mut task = cron_task(Some(occurrence));
        task.schedule_kind = ScheduleKind::Once;
        task.cron_expr = None;
        task.once_at = Some(occurrence);
        store.insert_task(&task).await.unwrap();

        engine.tick(Utc::now()).await;

        let loaded = store.get_task(&task.task_id).await.unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.next_run_at, None);
    }

    #[tokio::test]
    async fn topicless_gateway_fails_task_run_clearly() {
        let store = Store::open_in_memory().unwrap();
        let progress = ProgressBus::new();
        let executor = Arc::new(EchoExecutor::new(progress.clone()));
        let runs = RunService::new(store.clone(), executor, progress);
        let engine = TaskEngine::new(
            store.clone(),
            runs,
            Arc::new(NoTopicBridge),
            Arc::new(NoopTaskRunNotifier),
            TaskEngineConfig::default(),
        );

        let task = cron_task(None);
        store.insert_task(&task).await.unwrap();
        let task_run = engine.run_now(&task.task_id).await.unwrap();
        assert_eq!(task_run.status, TaskRunStatus::Failed);
        assert_eq!(task_run.error_message.as_deref(), Some(TOPICS_UNAVAILABLE));
    }

    #[tokio::test]
    async fn reconcile_promotes_terminal_runs() {
        let (store, runs, engine, _bridge) = harness();
        let task = cron_task(None);
        store.insert_task(&task).await.unwrap();

        let task_run = engine.run_now(&task.task_id).await.unwrap();
        assert_eq!(task_run.status, TaskRunStatus::Dispatched);

        // Give the echo executor time to finish the underlying run, then
        // reconcile.
        let run_id = task_run.run_id.clone().unwrap();
        runs.wait_for_terminal(&run_id, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        engine.tick(Utc::now()).await;

        let reconciled = store.get_task_run(&task_run.task_run_id).await.unwrap();
        assert_eq!(reconciled.status, TaskRunStatus::Succeeded);
        let loaded = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(loaded.last_run_status, Some(TaskRunStatus::Succeeded));
    }
}
