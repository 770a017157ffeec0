use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use jagc_types::{ImagePayload, Run, RunEvent, RunOutput, SessionEvent, ThreadSession};

use crate::progress::ProgressBus;

/// One live agent conversation. Delivery calls are fire-and-forget: they
/// return once the session has accepted the text, not once the turn ends.
/// Turn results arrive on the event stream handed out at session creation.
#[async_trait]
pub trait TurnSession: Send + Sync {
    async fn prompt(&self, text: &str, images: &[ImagePayload]) -> anyhow::Result<()>;
    async fn follow_up(&self, text: &str, images: &[ImagePayload]) -> anyhow::Result<()>;
    async fn steer(&self, text: &str) -> anyhow::Result<()>;

    /// Ask the session to abort whatever turn is in flight.
    async fn abort_turn(&self) -> anyhow::Result<()>;

    async fn set_model(&self, model: &str) -> anyhow::Result<()>;
    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()>;

    /// Tear the session down. Safe to call more than once.
    async fn shutdown(&self);
}

/// A freshly opened (or resumed) session plus its single-consumer event
/// stream. Producer order on `events` is the ordering contract of the whole
/// correlation layer.
pub struct SessionHandle {
    pub session: Arc<dyn TurnSession>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub session_id: String,
    pub session_file: String,
    /// True when the handle resumes an existing conversation; the first
    /// delivery then uses `follow_up` instead of `prompt`.
    pub resumed: bool,
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(
        &self,
        thread_key: &str,
        resume: Option<&ThreadSession>,
    ) -> anyhow::Result<SessionHandle>;
}

/// Drives one run to a terminal output. The dispatcher owns the surrounding
/// status bookkeeping; implementations only produce (or fail to produce) an
/// output.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, run: &Run, images: Vec<ImagePayload>) -> anyhow::Result<RunOutput>;

    /// Abort the in-flight turn on a thread, if any.
    async fn cancel_thread(&self, _thread_key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Drop the live session for a thread so the next run starts fresh.
    async fn reset_thread(&self, _thread_key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Path of the persisted session transcript for sharing, when one exists.
    async fn share_thread(&self, _thread_key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn set_model(&self, _thread_key: &str, _model: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_thinking_level(&self, _thread_key: &str, _level: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Echoes the input back as the terminal output. Diagnostic mode and the
/// backbone of the test suite.
pub struct EchoExecutor {
    progress: ProgressBus,
}

impl EchoExecutor {
    pub fn new(progress: ProgressBus) -> Self {
        Self { progress }
    }
}

#[async_trait]
impl RunExecutor for EchoExecutor {
    async fn execute(&self, run: &Run, _images: Vec<ImagePayload>) -> anyhow::Result<RunOutput> {
        self.progress.publish(&run.run_id, RunEvent::Delivered);
        Ok(RunOutput::message(run.input_text.clone(), run.delivery_mode))
    }
}
