//! Run follow-up: one edited progress message per run, a typing indicator
//! while the agent works, and exactly-once terminal delivery with chunking
//! and document fallback for oversized code blocks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use jagc_core::{RunService, ABORTED_SENTINEL};
use jagc_types::{RunEvent, SessionEvent};

use crate::api::TelegramApi;

/// Per-message delivery budget. Telegram caps messages at 4096 characters;
/// staying at 3500 leaves room for decoration.
pub const DELIVERY_CHUNK_LIMIT: usize = 3500;

/// Code blocks that cannot fit a single message become attached documents.
const CODE_BLOCK_DOCUMENT_THRESHOLD: usize = DELIVERY_CHUNK_LIMIT;

const PLACEHOLDER_TEXT: &str = "⏳ Working on it...";
const FOLLOW_TIMEOUT: Duration = Duration::from_secs(60 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowTarget {
    pub chat_id: i64,
    pub message_thread_id: Option<i64>,
}

/// Shared follower state: which runs already got their terminal delivery and
/// which cancelled runs should have their failure line muted.
pub struct RunFollower {
    api: Arc<TelegramApi>,
    runs: Arc<RunService>,
    delivered: Mutex<HashSet<String>>,
    following: Mutex<HashSet<String>>,
    suppressed: Mutex<HashSet<String>>,
}

impl RunFollower {
    pub fn new(api: Arc<TelegramApi>, runs: Arc<RunService>) -> Arc<Self> {
        Arc::new(Self {
            api,
            runs,
            delivered: Mutex::new(HashSet::new()),
            following: Mutex::new(HashSet::new()),
            suppressed: Mutex::new(HashSet::new()),
        })
    }

    /// Mute the terminal failure line of a run the user just cancelled; they
    /// already got the cancel acknowledgement.
    pub fn suppress_failure(&self, run_id: &str) {
        self.suppressed.lock().insert(run_id.to_string());
    }

    /// Attach a follow loop to a run. Idempotent per run id, so reconcile
    /// re-fires and duplicate updates cannot double-post.
    pub fn follow(self: &Arc<Self>, target: FollowTarget, run_id: String) -> Option<JoinHandle<()>> {
        if !self.following.lock().insert(run_id.clone()) {
            return None;
        }
        let follower = self.clone();
        Some(tokio::spawn(async move {
            follower.run_follow_loop(target, run_id).await;
        }))
    }

    async fn run_follow_loop(self: Arc<Self>, target: FollowTarget, run_id: String) {
        // Subscribe before the status check so the terminal event cannot slip
        // between the two.
        let mut rx = self.runs.subscribe();

        match self.runs.get_run(&run_id).await {
            Ok(run) if run.status.is_terminal() => {
                self.deliver_terminal_state(
                    target,
                    &run_id,
                    None,
                    run.output.as_ref().map(|o| o.text().to_string()),
                    run.error_message,
                )
                .await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(run_id, %err, "follow could not load run");
                return;
            }
        }

        let placeholder = match self
            .api
            .send_message(target.chat_id, target.message_thread_id, PLACEHOLDER_TEXT)
            .await
        {
            Ok(msg) => Some(msg.message_id),
            Err(err) => {
                warn!(run_id, %err, "failed to post placeholder");
                None
            }
        };

        let typing = self.spawn_typing_loop(target);
        let mut last_progress_text = PLACEHOLDER_TEXT.to_string();
        let deadline = tokio::time::Instant::now() + FOLLOW_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(run_id, "follow timed out");
                break;
            }
            let event = match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(run_id, skipped, "follow lagged behind the progress bus");
                    // Re-check the store in case the terminal event was lost.
                    if let Ok(run) = self.runs.get_run(&run_id).await {
                        if run.status.is_terminal() {
                            typing.abort();
                            self.deliver_terminal_state(
                                target,
                                &run_id,
                                placeholder,
                                run.output.as_ref().map(|o| o.text().to_string()),
                                run.error_message,
                            )
                            .await;
                            return;
                        }
                    }
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            };
            if event.run_id != run_id {
                continue;
            }

            match event.event {
                RunEvent::Session(SessionEvent::ToolExecutionStart { tool_name, .. }) => {
                    let text = format!("🔧 {tool_name}...");
                    if text != last_progress_text {
                        if let Some(message_id) = placeholder {
                            if let Err(err) = self
                                .api
                                .edit_message_text(target.chat_id, message_id, &text)
                                .await
                            {
                                debug!(run_id, %err, "progress edit failed");
                            } else {
                                last_progress_text = text;
                            }
                        }
                    }
                }
                RunEvent::Succeeded { output } => {
                    typing.abort();
                    self.deliver_terminal_state(
                        target,
                        &run_id,
                        placeholder,
                        Some(output.text().to_string()),
                        None,
                    )
                    .await;
                    return;
                }
                RunEvent::Failed { error_message } => {
                    typing.abort();
                    self.deliver_terminal_state(
                        target,
                        &run_id,
                        placeholder,
                        None,
                        Some(error_message),
                    )
                    .await;
                    return;
                }
                _ => {}
            }
        }

        typing.abort();
        if let Some(message_id) = placeholder {
            let _ = self.api.delete_message(target.chat_id, message_id).await;
        }
    }

    fn spawn_typing_loop(&self, target: FollowTarget) -> JoinHandle<()> {
        let api = self.api.clone();
        tokio::spawn(async move {
            loop {
                let _ = api
                    .send_chat_action(target.chat_id, target.message_thread_id, "typing")
                    .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    async fn deliver_terminal_state(
        &self,
        target: FollowTarget,
        run_id: &str,
        placeholder: Option<i64>,
        output_text: Option<String>,
        error_message: Option<String>,
    ) {
        // Exactly one terminal delivery per run id.
        if !self.delivered.lock().insert(run_id.to_string()) {
            if let Some(message_id) = placeholder {
                let _ = self.api.delete_message(target.chat_id, message_id).await;
            }
            return;
        }

        if let Some(error) = error_message {
            let muted = self.suppressed.lock().remove(run_id) && error == ABORTED_SENTINEL;
            if let Some(message_id) = placeholder {
                let _ = self.api.delete_message(target.chat_id, message_id).await;
            }
            if !muted {
                let _ = self
                    .api
                    .send_message(
                        target.chat_id,
                        target.message_thread_id,
                        &format!("❌ {error}"),
                    )
                    .await;
            }
            return;
        }

        let text = output_text.unwrap_or_default();
        let (body, attachments) = extract_oversized_code_blocks(&text);
        let chunks = split_terminal_message(&body, DELIVERY_CHUNK_LIMIT);

        let mut chunks = chunks.into_iter();
        match (placeholder, chunks.next()) {
            (Some(message_id), Some(first)) => {
                // Reuse the placeholder as the first chunk; fall back to a
                // fresh message if the edit is refused.
                if self
                    .api
                    .edit_message_text(target.chat_id, message_id, &first)
                    .await
                    .is_err()
                {
                    let _ = self
                        .api
                        .send_message(target.chat_id, target.message_thread_id, &first)
                        .await;
                }
            }
            (Some(message_id), None) => {
                let _ = self.api.delete_message(target.chat_id, message_id).await;
            }
            (None, Some(first)) => {
                let _ = self
                    .api
                    .send_message(target.chat_id, target.message_thread_id, &first)
                    .await;
            }
            (None, None) => {}
        }
        for chunk in chunks {
            let _ = self
                .api
                .send_message(target.chat_id, target.message_thread_id, &chunk)
                .await;
        }
        for (index, attachment) in attachments.into_iter().enumerate() {
            let filename = format!("code-{}.txt", index + 1);
            if let Err(err) = self
                .api
                .send_document(
                    target.chat_id,
                    target.message_thread_id,
                    &filename,
                    attachment.into_bytes(),
                    Some("code block too large for a message"),
                )
                .await
            {
                warn!(run_id, %err, "document attachment failed");
            }
        }
    }
}

/// Split text into chunks of at most `limit` characters that concatenate
/// back to the original. Prefers newline boundaries when one exists inside
/// the window.
pub fn split_terminal_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        if text.is_empty() {
            return Vec::new();
        }
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        if rest.chars().count() <= limit {
            if !rest.is_empty() {
                chunks.push(rest.to_string());
            }
            return chunks;
        }
        let window_end = rest
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];
        let cut = window.rfind('\n').map(|p| p + 1).unwrap_or(window_end);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
}

/// Pull fenced code blocks too large for a single message out of the text,
/// leaving a marker behind. Returns the rewritten text plus the extracted
/// block contents.
fn extract_oversized_code_blocks(text: &str) -> (String, Vec<String>) {
    let mut body = String::with_capacity(text.len());
    let mut attachments = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let block = &after_open[..close];
        let full_len = block.len() + 6;
        if full_len > CODE_BLOCK_DOCUMENT_THRESHOLD {
            body.push_str(&rest[..open]);
            // Drop the language line from the attachment marker, keep the
            // content for the document.
            let content = match block.split_once('\n') {
                Some((_lang, content)) => content,
                None => block,
            };
            attachments.push(content.to_string());
            body.push_str(&format!("📎 (code block attached: code-{}.txt)", attachments.len()));
        } else {
            body.push_str(&rest[..open + 3 + close + 3]);
        }
        rest = &after_open[close + 3..];
    }
    body.push_str(rest);
    (body, attachments)
}
