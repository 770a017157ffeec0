//! Agent-session executor: one resumable session per thread key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use jagc_store::Store;
use jagc_types::{ImagePayload, Run, RunOutput};

use crate::controller::{SubmitRun, ThreadRunController};
use crate::executor::{RunExecutor, SessionFactory, TurnSession};
use crate::progress::ProgressBus;

struct ThreadEntry {
    controller: ThreadRunController,
    session: Arc<dyn TurnSession>,
    session_file: String,
}

/// Owns the live sessions and their controllers. Sessions persist
/// `(thread_key, session_id, session_file)` so a restart resumes the same
/// conversation instead of starting cold.
pub struct AgentSessionExecutor {
    store: Store,
    factory: Arc<dyn SessionFactory>,
    progress: ProgressBus,
    threads: Mutex<HashMap<String, ThreadEntry>>,
}

impl AgentSessionExecutor {
    pub fn new(store: Store, factory: Arc<dyn SessionFactory>, progress: ProgressBus) -> Self {
        Self {
            store,
            factory,
            progress,
            threads: Mutex::new(HashMap::new()),
        }
    }

    async fn controller_for(
        &self,
        thread_key: &str,
    ) -> anyhow::Result<(ThreadRunController, Arc<dyn TurnSession>)> {
        let mut threads = self.threads.lock().await;
        if let Some(entry) = threads.get(thread_key) {
            if !entry.controller.is_terminated() {
                return Ok((entry.controller.clone(), entry.session.clone()));
            }
            debug!(thread_key, "controller terminated, reopening session");
            threads.remove(thread_key);
        }

        let resume = self.store.get_thread_session(thread_key).await?;
        let handle = self
            .factory
            .open_session(thread_key, resume.as_ref())
            .await?;
        self.store
            .upsert_thread_session(thread_key, &handle.session_id, &handle.session_file)
            .await?;
        info!(
            thread_key,
            session_id = %handle.session_id,
            resumed = handle.resumed,
            "agent session ready"
        );

        let session = handle.session.clone();
        let session_file = handle.session_file.clone();
        let controller = ThreadRunController::spawn(
            thread_key.to_string(),
            handle,
            self.store.clone(),
            self.progress.clone(),
        );
        let result = (controller.clone(), session.clone());
        threads.insert(
            thread_key.to_string(),
            ThreadEntry {
                controller,
                session,
                session_file,
            },
        );
        Ok(result)
    }
}

#[async_trait]
impl RunExecutor for AgentSessionExecutor {
    async fn execute(&self, run: &Run, images: Vec<ImagePayload>) -> anyhow::Result<RunOutput> {
        let (controller, _session) = self.controller_for(&run.thread_key).await?;
        let completion = controller
            .submit(SubmitRun {
                run_id: run.run_id.clone(),
                text: run.input_text.clone(),
                delivery_mode: run.delivery_mode,
                images,
            })
            .await?;
        completion
            .await
            .map_err(|_| anyhow::anyhow!("controller dropped the run before completion"))?
    }

    async fn cancel_thread(&self, thread_key: &str) -> anyhow::Result<()> {
        let threads = self.threads.lock().await;
        if let Some(entry) = threads.get(thread_key) {
            entry.session.abort_turn().await?;
        }
        Ok(())
    }

    async fn reset_thread(&self, thread_key: &str) -> anyhow::Result<()> {
        let mut threads = self.threads.lock().await;
        if let Some(entry) = threads.remove(thread_key) {
            entry.session.shutdown().await;
        }
        Ok(())
    }

    async fn share_thread(&self, thread_key: &str) -> anyhow::Result<Option<String>> {
        {
            let threads = self.threads.lock().await;
            if let Some(entry) = threads.get(thread_key) {
                return Ok(Some(entry.session_file.clone()));
            }
        }
        Ok(self
            .store
            .get_thread_session(thread_key)
            .await?
            .map(|s| s.session_file))
    }

    async fn set_model(&self, thread_key: &str, model: &str) -> anyhow::Result<()> {
        let (_, session) = self.controller_for(thread_key).await?;
        session.set_model(model).await
    }

    async fn set_thinking_level(&self, thread_key: &str, level: &str) -> anyhow::Result<()> {
        let (_, session) = self.controller_for(thread_key).await?;
        session.set_thinking_level(level).await
    }

    async fn shutdown(&self) {
        let mut threads = self.threads.lock().await;
        for (_, entry) in threads.drain() {
            entry.session.shutdown().await;
        }
    }
}
