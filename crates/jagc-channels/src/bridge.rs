//! Glue between the task engine and the Telegram gateway: topic creation
//! for execution threads, and the best-effort hook that attaches the run
//! follower to a task run's topic.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use jagc_tasks::{TaskRunNotifier, TopicBridge};
use jagc_types::{DeliveryTarget, ScheduledTask, TaskRun};

use crate::api::TelegramApi;
use crate::follow::{FollowTarget, RunFollower};

pub struct TelegramTopicBridge {
    api: Arc<TelegramApi>,
}

impl TelegramTopicBridge {
    pub fn new(api: Arc<TelegramApi>) -> Arc<Self> {
        Arc::new(Self { api })
    }
}

#[async_trait]
impl TopicBridge for TelegramTopicBridge {
    async fn create_task_topic(&self, chat_id: i64, title: &str) -> anyhow::Result<i64> {
        let topic = self.api.create_forum_topic(chat_id, title).await?;
        debug!(chat_id, topic_id = topic.message_thread_id, "task topic created");
        Ok(topic.message_thread_id)
    }
}

pub struct TelegramTaskRunNotifier {
    follower: Arc<RunFollower>,
}

impl TelegramTaskRunNotifier {
    pub fn new(follower: Arc<RunFollower>) -> Arc<Self> {
        Arc::new(Self { follower })
    }
}

#[async_trait]
impl TaskRunNotifier for TelegramTaskRunNotifier {
    async fn task_run_dispatched(&self, task: &ScheduledTask, task_run: &TaskRun, run_id: &str) {
        match task.delivery_target {
            DeliveryTarget::Telegram { chat_id, topic_id } => {
                let target = FollowTarget {
                    chat_id,
                    message_thread_id: topic_id,
                };
                // `follow` is idempotent per run id, so reconcile re-fires
                // are harmless.
                self.follower.follow(target, run_id.to_string());
            }
            _ => {
                warn!(
                    task_id = %task.task_id,
                    task_run_id = %task_run.task_run_id,
                    "no delivery channel for this target provider"
                );
            }
        }
    }
}
