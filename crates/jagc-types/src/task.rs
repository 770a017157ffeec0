use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Once,
    Cron,
    Rrule,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Once => "once",
            ScheduleKind::Cron => "cron",
            ScheduleKind::Rrule => "rrule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(ScheduleKind::Once),
            "cron" => Some(ScheduleKind::Cron),
            "rrule" => Some(ScheduleKind::Rrule),
            _ => None,
        }
    }
}

/// Where a task's runs report to. A tagged union instead of an opaque
/// routing blob so each provider carries exactly the fields it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum DeliveryTarget {
    Telegram {
        chat_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic_id: Option<i64>,
    },
    Cli,
}

impl DeliveryTarget {
    pub fn provider(&self) -> &'static str {
        match self {
            DeliveryTarget::Telegram { .. } => "telegram",
            DeliveryTarget::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Pending => "pending",
            TaskRunStatus::Dispatched => "dispatched",
            TaskRunStatus::Succeeded => "succeeded",
            TaskRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskRunStatus::Pending),
            "dispatched" => Some(TaskRunStatus::Dispatched),
            "succeeded" => Some(TaskRunStatus::Succeeded),
            "failed" => Some(TaskRunStatus::Failed),
            _ => None,
        }
    }

    /// Status moves forward only: pending → dispatched → terminal, or
    /// pending → failed.
    pub fn rank(&self) -> u8 {
        match self {
            TaskRunStatus::Pending => 0,
            TaskRunStatus::Dispatched => 1,
            TaskRunStatus::Succeeded => 2,
            TaskRunStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub title: String,
    pub instructions: String,
    pub schedule_kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub once_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rrule_expr: Option<String>,
    pub timezone: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub creator_thread_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_key: Option<String>,
    pub delivery_target: DeliveryTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_thread_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<TaskRunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_run_id: String,
    pub task_id: String,
    /// The occurrence instant this row materializes, ISO UTC.
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub status: TaskRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn task_run_idempotency_key(task_id: &str, scheduled_for: DateTime<Utc>) -> String {
    format!(
        "task:{}:scheduled_for:{}",
        task_id,
        scheduled_for.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delivery_target_tagging() {
        let tg = DeliveryTarget::Telegram {
            chat_id: 101,
            topic_id: Some(7),
        };
        let json = serde_json::to_value(&tg).unwrap();
        assert_eq!(json["provider"], "telegram");
        assert_eq!(json["chat_id"], 101);
        let cli: DeliveryTarget = serde_json::from_str(r#"{"provider":"cli"}"#).unwrap();
        assert_eq!(cli, DeliveryTarget::Cli);
    }

    #[test]
    fn idempotency_key_format() {
        let at = Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap();
        assert_eq!(
            task_run_idempotency_key("t1", at),
            "task:t1:scheduled_for:2026-02-16T00:00:00.000Z"
        );
    }

    #[test]
    fn task_run_status_forward_only_ranks() {
        assert!(TaskRunStatus::Pending.rank() < TaskRunStatus::Dispatched.rank());
        assert!(TaskRunStatus::Dispatched.rank() < TaskRunStatus::Succeeded.rank());
        assert_eq!(TaskRunStatus::Succeeded.rank(), TaskRunStatus::Failed.rank());
    }
}
