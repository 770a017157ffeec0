use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMode {
    FollowUp,
    Steer,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::FollowUp => "followUp",
            DeliveryMode::Steer => "steer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "followUp" => Some(DeliveryMode::FollowUp),
            "steer" => Some(DeliveryMode::Steer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Terminal output of a run. Today every executor produces a message; the
/// tag leaves room for richer output kinds without a schema change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOutput {
    Message {
        text: String,
        delivery_mode: DeliveryMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
}

impl RunOutput {
    pub fn message(text: impl Into<String>, delivery_mode: DeliveryMode) -> Self {
        RunOutput::Message {
            text: text.into(),
            delivery_mode,
            provider: None,
            model: None,
            structured: None,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            RunOutput::Message { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub source: String,
    pub thread_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub status: RunStatus,
    pub input_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RunOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An image travelling with an ingest, decoded and ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// One inbound request for a run, from any producer (HTTP, Telegram, task
/// engine).
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: String,
    pub thread_key: String,
    pub user_key: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub idempotency_key: Option<String>,
    pub input_text: String,
    pub images: Vec<ImagePayload>,
}

impl IngestRequest {
    pub fn text(
        source: impl Into<String>,
        thread_key: impl Into<String>,
        input_text: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            thread_key: thread_key.into(),
            user_key: None,
            delivery_mode: DeliveryMode::FollowUp,
            idempotency_key: None,
            input_text: input_text.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputImage {
    pub input_image_id: String,
    pub source: String,
    pub thread_key: String,
    pub user_key: String,
    pub external_update_id: Option<String>,
    pub media_group_id: Option<String>,
    pub run_id: Option<String>,
    pub mime_type: String,
    pub filename: Option<String>,
    pub byte_size: i64,
    pub image_bytes: Vec<u8>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSession {
    pub thread_key: String,
    pub session_id: String,
    pub session_file: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeliveryMode::FollowUp).unwrap(),
            "\"followUp\""
        );
        assert_eq!(serde_json::to_string(&DeliveryMode::Steer).unwrap(), "\"steer\"");
        assert_eq!(DeliveryMode::parse("followUp"), Some(DeliveryMode::FollowUp));
        assert_eq!(DeliveryMode::parse("bogus"), None);
    }

    #[test]
    fn run_output_roundtrip() {
        let out = RunOutput::message("hi", DeliveryMode::Steer);
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["delivery_mode"], "steer");
        let back: RunOutput = serde_json::from_value(json).unwrap();
        assert_eq!(back, out);
    }
}
