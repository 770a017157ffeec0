//! Run service: ingest → store → scheduler → executor → terminal update,
//! with progress multiplexed to every subscriber.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use jagc_store::{IngestOutcome, Store, StoreError};
use jagc_types::{
    ImagePayload, IngestRequest, Run, RunEvent, RunProgressEvent, RunStatus, ThreadSession,
};

use crate::executor::RunExecutor;
use crate::progress::ProgressBus;
use crate::scheduler::{EnqueueOutcome, LocalRunScheduler, RunDispatcher};

/// Error text recorded on a run killed by an explicit cancel. The chat
/// gateway suppresses terminal failures carrying this message for the run it
/// just acknowledged.
pub const ABORTED_SENTINEL: &str = "This operation was aborted";

pub struct RunService {
    store: Store,
    scheduler: LocalRunScheduler,
    executor: Arc<dyn RunExecutor>,
    progress: ProgressBus,
}

impl RunService {
    pub fn new(store: Store, executor: Arc<dyn RunExecutor>, progress: ProgressBus) -> Arc<Self> {
        let scheduler = LocalRunScheduler::new();
        let service = Arc::new(Self {
            store,
            scheduler,
            executor,
            progress,
        });
        service
            .scheduler
            .bind_dispatcher(service.clone() as Arc<dyn RunDispatcher>);
        service
    }

    /// Recover work left mid-flight by the previous process: every run still
    /// `running` is re-enqueued exactly once.
    pub async fn init(&self) -> Result<usize, StoreError> {
        let running = self.store.list_running_runs(1000).await?;
        let mut recovered = 0;
        for run in &running {
            if self
                .scheduler
                .ensure_enqueued(&run.thread_key, &run.run_id)
                .await
                == EnqueueOutcome::Enqueued
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "re-enqueued runs left running at last shutdown");
        }
        Ok(recovered)
    }

    pub async fn ingest(&self, req: &IngestRequest) -> Result<IngestOutcome, StoreError> {
        let outcome = self.store.ingest(req, Utc::now()).await?;
        if outcome.deduplicated {
            // A replayed ingest must not double-dispatch, but a run whose
            // first enqueue was lost to a crash still needs one.
            if outcome.run.status == RunStatus::Running {
                self.scheduler
                    .ensure_enqueued(&outcome.run.thread_key, &outcome.run.run_id)
                    .await;
            }
            return Ok(outcome);
        }
        self.progress.publish(&outcome.run.run_id, RunEvent::Queued);
        self.scheduler
            .enqueue(&outcome.run.thread_key, &outcome.run.run_id)
            .await;
        Ok(outcome)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.store.get_run(run_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunProgressEvent> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &ProgressBus {
        &self.progress
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Block until the run reaches a terminal status, or time out.
    pub async fn wait_for_terminal(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<Option<Run>, StoreError> {
        let mut rx = self.progress.subscribe();
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(Some(run));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.run_id == run_id && event.event.is_terminal() {
                        return Ok(Some(self.store.get_run(run_id).await?));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "progress subscriber lagged; re-checking store");
                    let run = self.store.get_run(run_id).await?;
                    if run.status.is_terminal() {
                        return Ok(Some(run));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    let run = self.store.get_run(run_id).await?;
                    return Ok(run.status.is_terminal().then_some(run));
                }
            }
        }
    }

    /// Mark the run failed with the abort sentinel and ask the session to
    /// drop its current turn. Losing the terminal CAS means the run finished
    /// first; that race is benign.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let run = self.store.get_run(run_id).await?;
        match self.store.mark_run_failed(run_id, ABORTED_SENTINEL).await {
            Ok(_) => {
                self.progress.publish(
                    run_id,
                    RunEvent::Failed {
                        error_message: ABORTED_SENTINEL.to_string(),
                    },
                );
                if let Err(err) = self.executor.cancel_thread(&run.thread_key).await {
                    warn!(run_id, %err, "session abort failed after cancel");
                }
                Ok(true)
            }
            Err(StoreError::RunAlreadyTerminal { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Cancel whatever run is active on a thread, if any.
    pub async fn cancel_active_run(&self, thread_key: &str) -> Result<Option<Run>, StoreError> {
        let Some(run) = self.store.latest_running_run_for_thread(thread_key).await? else {
            return Ok(None);
        };
        self.cancel_run(&run.run_id).await?;
        Ok(Some(run))
    }

    /// Reset a thread's agent session: drop the live session and delete the
    /// persisted resume row so the next run starts fresh.
    pub async fn reset_thread(&self, thread_key: &str) -> Result<bool, StoreError> {
        if let Err(err) = self.executor.reset_thread(thread_key).await {
            warn!(thread_key, %err, "live session teardown failed during reset");
        }
        self.store.delete_thread_session(thread_key).await
    }

    pub async fn share_thread(&self, thread_key: &str) -> anyhow::Result<Option<String>> {
        self.executor.share_thread(thread_key).await
    }

    pub async fn get_thread_session(
        &self,
        thread_key: &str,
    ) -> Result<Option<ThreadSession>, StoreError> {
        self.store.get_thread_session(thread_key).await
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.executor.shutdown().await;
        info!("run service stopped");
    }
}

#[async_trait]
impl RunDispatcher for RunService {
    async fn dispatch_run_by_id(&self, run_id: &str) {
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(err) => {
                error!(run_id, %err, "dispatch could not load run");
                return;
            }
        };
        if run.status != RunStatus::Running {
            debug!(run_id, status = run.status.as_str(), "run already terminal");
            return;
        }

        let images = match self.store.list_run_input_images(run_id).await {
            Ok(rows) => rows
                .into_iter()
                .map(|img| ImagePayload {
                    mime_type: img.mime_type,
                    filename: img.filename,
                    bytes: img.image_bytes,
                })
                .collect(),
            Err(err) => {
                error!(run_id, %err, "failed to load run input images");
                Vec::new()
            }
        };

        match self.executor.execute(&run, images).await {
            Ok(output) => match self.store.mark_run_succeeded(run_id, &output).await {
                Ok(_) => {
                    self.progress
                        .publish(run_id, RunEvent::Succeeded { output });
                }
                Err(StoreError::RunAlreadyTerminal { status, .. }) => {
                    // Another actor (usually a cancel) won the terminal race.
                    debug!(run_id, status, "terminal mark lost benignly");
                }
                Err(err) => error!(run_id, %err, "failed to record run success"),
            },
            Err(exec_err) => {
                let message = exec_err.to_string();
                match self.store.mark_run_failed(run_id, &message).await {
                    Ok(_) => {
                        self.progress.publish(
                            run_id,
                            RunEvent::Failed {
                                error_message: message,
                            },
                        );
                    }
                    Err(StoreError::RunAlreadyTerminal { status, .. }) => {
                        debug!(run_id, status, "terminal mark lost benignly");
                    }
                    Err(err) => error!(run_id, %err, "failed to record run failure"),
                }
            }
        }
    }
}
