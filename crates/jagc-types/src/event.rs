use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::RunOutput;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Events an agent session emits over one subscription. Ordering contract:
/// within a turn, `turn_start` precedes its `message_*` events which precede
/// `turn_end`; `agent_end` follows all turn events; delivery is
/// single-threaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    AgentStart,
    TurnStart,
    MessageStart {
        role: MessageRole,
    },
    MessageUpdate {
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_index: Option<u32>,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        result: Value,
        is_error: bool,
    },
    MessageEnd {
        role: MessageRole,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    TurnEnd {
        tool_result_count: u32,
    },
    AgentEnd,
}

/// A run-scoped progress event as seen by subscribers: session events tagged
/// with the correlated run, the synthetic queue/delivery markers, and the
/// terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Queued,
    Delivered,
    Session(SessionEvent),
    Succeeded { output: RunOutput },
    Failed { error_message: String },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Succeeded { .. } | RunEvent::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunProgressEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub event: RunEvent,
}
