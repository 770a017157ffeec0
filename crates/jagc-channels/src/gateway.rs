//! Telegram delivery loop: long-poll updates, map them to run ingests, and
//! hand each created run to the follower for progress and terminal delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jagc_core::RunService;
use jagc_store::{ImageScope, Store, StoreError};
use jagc_types::{DeliveryMode, ImagePayload, IngestRequest, RunStatus};

use crate::api::{Message, TelegramApi, Update};
use crate::config::{is_user_allowed, TelegramGatewayConfig};
use crate::follow::{FollowTarget, RunFollower};

const POLL_BACKOFF: Duration = Duration::from_secs(2);

pub struct TelegramGateway {
    api: Arc<TelegramApi>,
    runs: Arc<RunService>,
    store: Store,
    follower: Arc<RunFollower>,
    config: TelegramGatewayConfig,
    cancel: CancellationToken,
}

impl TelegramGateway {
    pub fn new(
        config: TelegramGatewayConfig,
        runs: Arc<RunService>,
        store: Store,
    ) -> anyhow::Result<Arc<Self>> {
        let api = Arc::new(TelegramApi::new(&config.api_base, &config.bot_token)?);
        let follower = RunFollower::new(api.clone(), runs.clone());
        Ok(Arc::new(Self {
            api,
            runs,
            store,
            follower,
            config,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn api(&self) -> Arc<TelegramApi> {
        self.api.clone()
    }

    pub fn follower(&self) -> Arc<RunFollower> {
        self.follower.clone()
    }

    pub fn start(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            info!("telegram gateway polling started");
            gateway.poll_loop().await;
            info!("telegram gateway polling stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: i64 = 0;
        loop {
            let updates = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = self.api.get_updates(offset, self.config.poll_timeout_secs) => res,
            };
            let updates = match updates {
                Ok(updates) => updates,
                Err(err) => {
                    match err.retry_after() {
                        Some(wait) => {
                            debug!(wait_ms = wait.as_millis() as u64, "poll rate limited");
                            tokio::time::sleep(wait).await;
                        }
                        None if err.is_transient() => {
                            warn!(%err, "poll failed, backing off");
                            tokio::time::sleep(POLL_BACKOFF).await;
                        }
                        None => {
                            warn!(%err, "poll failed with a non-transient error");
                            tokio::time::sleep(POLL_BACKOFF).await;
                        }
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Err(err) = self.handle_update(&update).await {
                    // A bad update never stops the loop.
                    warn!(update_id = update.update_id, %err, "update skipped");
                }
            }
        }
    }

    async fn handle_update(self: &Arc<Self>, update: &Update) -> anyhow::Result<()> {
        let Some(message) = &update.message else {
            debug!(update_id = update.update_id, "update without a message");
            return Ok(());
        };
        let Some(from) = &message.from else {
            debug!(update_id = update.update_id, "message without a sender");
            return Ok(());
        };

        let target = FollowTarget {
            chat_id: message.chat.id,
            message_thread_id: normalize_topic(message.message_thread_id),
        };

        if !is_user_allowed(from.id, &self.config.allowed_user_ids) {
            let deny = format!(
                "⛔ You are not authorized to use this bot.\n\
                 To allow yourself, run this on the host:\n\
                 jagc allow-user {}",
                from.id
            );
            let _ = self
                .api
                .send_message(target.chat_id, target.message_thread_id, &deny)
                .await;
            return Ok(());
        }

        let thread_key = thread_key_for(message);
        let user_key = format!("telegram:user:{}", from.id);

        if let Some(photos) = &message.photo {
            self.buffer_photo(
                update.update_id,
                &thread_key,
                &user_key,
                target,
                photos,
                message.media_group_id.as_deref(),
            )
            .await;
        }

        let text = message
            .text
            .as_deref()
            .or(message.caption.as_deref())
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Ok(());
        }

        // Slash commands short-circuit before any ingest.
        if text == "/new" {
            self.runs.reset_thread(&thread_key).await?;
            let _ = self
                .api
                .send_message(
                    target.chat_id,
                    target.message_thread_id,
                    "✨ Started a fresh session.",
                )
                .await;
            return Ok(());
        }
        if text == "/cancel" {
            // Suppress before cancelling: the terminal failure event fires
            // inside cancel_run and the follower must already know to mute it.
            match self.store.latest_running_run_for_thread(&thread_key).await? {
                Some(run) => {
                    self.follower.suppress_failure(&run.run_id);
                    self.runs.cancel_run(&run.run_id).await?;
                    let _ = self
                        .api
                        .send_message(
                            target.chat_id,
                            target.message_thread_id,
                            "🛑 Stopped the active run. Session context is preserved.",
                        )
                        .await;
                }
                None => {
                    let _ = self
                        .api
                        .send_message(
                            target.chat_id,
                            target.message_thread_id,
                            "ℹ️ No active run to stop.",
                        )
                        .await;
                }
            }
            return Ok(());
        }

        let (delivery_mode, body) = if text == "/steer" || text.starts_with("/steer ") {
            let body = text["/steer".len()..].trim();
            if body.is_empty() {
                let _ = self
                    .api
                    .send_message(
                        target.chat_id,
                        target.message_thread_id,
                        "⚠️ Nothing to steer with. Usage: /steer <text>",
                    )
                    .await;
                return Ok(());
            }
            (DeliveryMode::Steer, body.to_string())
        } else {
            (DeliveryMode::FollowUp, text)
        };

        let req = IngestRequest {
            source: "telegram".to_string(),
            thread_key,
            user_key: Some(user_key),
            delivery_mode,
            idempotency_key: Some(format!("telegram:update:{}", update.update_id)),
            input_text: body,
            images: Vec::new(),
        };

        match self.runs.ingest(&req).await {
            Ok(outcome) => {
                if outcome.deduplicated && outcome.run.status != RunStatus::Running {
                    debug!(run_id = %outcome.run.run_id, "replayed update for a settled run");
                    return Ok(());
                }
                self.follower.follow(target, outcome.run.run_id);
            }
            Err(StoreError::IdempotencyPayloadMismatch) => {
                warn!(update_id = update.update_id, "replayed update with altered payload");
            }
            Err(err) => {
                let _ = self
                    .api
                    .send_message(
                        target.chat_id,
                        target.message_thread_id,
                        &format!("❌ Could not accept that message: {err}"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn buffer_photo(
        &self,
        update_id: i64,
        thread_key: &str,
        user_key: &str,
        target: FollowTarget,
        photos: &[crate::api::PhotoSize],
        media_group_id: Option<&str>,
    ) {
        // Telegram lists sizes smallest first; take the largest rendition.
        let Some(photo) = photos.last() else {
            return;
        };
        let bytes = match self.api.download_file(&photo.file_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(update_id, %err, "photo download failed");
                return;
            }
        };
        let scope = ImageScope {
            source: "telegram".to_string(),
            thread_key: thread_key.to_string(),
            user_key: user_key.to_string(),
        };
        let image = ImagePayload {
            mime_type: "image/jpeg".to_string(),
            filename: Some(format!("{}.jpg", photo.file_unique_id)),
            bytes,
        };
        match self
            .store
            .insert_pending_images(
                &scope,
                &update_id.to_string(),
                media_group_id,
                &[image],
                chrono::Utc::now(),
            )
            .await
        {
            Ok(stats) => {
                debug!(
                    update_id,
                    buffered = stats.count,
                    bytes = stats.total_bytes,
                    "photo buffered"
                );
            }
            Err(StoreError::ImageBufferLimitExceeded { max_count, max_bytes }) => {
                let _ = self
                    .api
                    .send_message(
                        target.chat_id,
                        target.message_thread_id,
                        &format!(
                            "⚠️ Image buffer is full ({max_count} images / {} MiB max). \
                             Send a message to use the buffered images first.",
                            max_bytes / (1024 * 1024)
                        ),
                    )
                    .await;
            }
            Err(err) => warn!(update_id, %err, "photo buffering failed"),
        }
    }
}

/// Thread key for a chat message. Topic id 1 is Telegram's "General" topic
/// and folds back onto the plain chat thread.
fn thread_key_for(message: &Message) -> String {
    match normalize_topic(message.message_thread_id) {
        Some(topic_id) => format!("telegram:chat:{}:topic:{}", message.chat.id, topic_id),
        None => format!("telegram:chat:{}", message.chat.id),
    }
}

fn normalize_topic(message_thread_id: Option<i64>) -> Option<i64> {
    match message_thread_id {
        Some(1) | None => None,
        Some(topic_id) => Some(topic_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Chat;

    fn msg(chat_id: i64, thread_id: Option<i64>) -> Message {
        Message {
            message_id: 1,
            message_thread_id: thread_id,
            from: None,
            chat: Chat { id: chat_id },
            text: Some("hi".into()),
            caption: None,
            photo: None,
            media_group_id: None,
        }
    }

    #[test]
    fn thread_keys_carry_routing() {
        assert_eq!(thread_key_for(&msg(101, None)), "telegram:chat:101");
        assert_eq!(
            thread_key_for(&msg(101, Some(77))),
            "telegram:chat:101:topic:77"
        );
    }

    #[test]
    fn general_topic_normalizes_to_base_chat() {
        assert_eq!(thread_key_for(&msg(101, Some(1))), "telegram:chat:101");
    }
}
