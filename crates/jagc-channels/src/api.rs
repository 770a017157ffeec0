//! Typed client for the Telegram Bot API surface the gateway uses.
//!
//! Every call goes through the `{ok, result, error_code, description,
//! parameters}` envelope; 429 responses surface their `retry_after` hint so
//! callers can honor it. `editMessageText` retries once under 429 itself
//! because edits are the hot path of the progress loop.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("telegram api error {code}: {description}")]
    Api {
        code: i64,
        description: String,
        retry_after: Option<f64>,
    },

    #[error("telegram response decode error: {0}")]
    Decode(String),
}

impl TelegramError {
    /// The `retry_after` hint of a 429, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TelegramError::Api {
                code: 429,
                retry_after,
                ..
            } => Some(Duration::from_secs_f64(retry_after.unwrap_or(1.0))),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TelegramError::Transport(_) => true,
            TelegramError::Api { code, .. } => *code == 429 || *code >= 500,
            TelegramError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub media_group_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub file_unique_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForumTopic {
    pub message_thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct Envelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<f64>,
}

pub struct TelegramApi {
    client: Client,
    base: String,
    token: String,
}

impl TelegramApi {
    pub fn new(api_base: &str, token: &str) -> anyhow::Result<Self> {
        // The long poll holds for up to 25s; leave headroom over it.
        let client = Client::builder().timeout(Duration::from_secs(40)).build()?;
        Ok(Self {
            client,
            base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
    ) -> Result<T, TelegramError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes).map_err(|e| {
            TelegramError::Decode(format!(
                "{method} returned undecodable body (http {status}): {e}"
            ))
        })?;
        if envelope.ok {
            envelope.result.ok_or_else(|| {
                TelegramError::Decode(format!("{method} returned ok without a result"))
            })
        } else {
            Err(TelegramError::Api {
                code: envelope.error_code.unwrap_or(status.as_u16() as i64),
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown telegram error".to_string()),
                retry_after: envelope.parameters.and_then(|p| p.retry_after),
            })
        }
    }

    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        message_thread_id: Option<i64>,
        text: &str,
    ) -> Result<Message, TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(thread_id) = message_thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        self.call("sendMessage", &body).await
    }

    /// Edit in place, honoring one 429 `retry_after` hint before surfacing.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TelegramError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        match self.call::<Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(err) => match err.retry_after() {
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "edit rate limited, retrying");
                    tokio::time::sleep(wait).await;
                    self.call::<Value>("editMessageText", &body).await.map(|_| ())
                }
                None => Err(err),
            },
        }
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        self.call::<Value>(
            "deleteMessage",
            &json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_chat_action(
        &self,
        chat_id: i64,
        message_thread_id: Option<i64>,
        action: &str,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "action": action });
        if let Some(thread_id) = message_thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        self.call::<Value>("sendChatAction", &body).await.map(|_| ())
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        message_thread_id: Option<i64>,
        filename: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<Message, TelegramError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(thread_id) = message_thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let resp = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let envelope: Envelope<Message> = serde_json::from_slice(&bytes).map_err(|e| {
            TelegramError::Decode(format!(
                "sendDocument returned undecodable body (http {status}): {e}"
            ))
        })?;
        if envelope.ok {
            envelope
                .result
                .ok_or_else(|| TelegramError::Decode("sendDocument ok without result".into()))
        } else {
            Err(TelegramError::Api {
                code: envelope.error_code.unwrap_or(status.as_u16() as i64),
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown telegram error".to_string()),
                retry_after: envelope.parameters.and_then(|p| p.retry_after),
            })
        }
    }

    pub async fn create_forum_topic(
        &self,
        chat_id: i64,
        name: &str,
    ) -> Result<ForumTopic, TelegramError> {
        self.call(
            "createForumTopic",
            &json!({ "chat_id": chat_id, "name": name }),
        )
        .await
    }

    pub async fn edit_forum_topic(
        &self,
        chat_id: i64,
        message_thread_id: i64,
        name: &str,
    ) -> Result<(), TelegramError> {
        self.call::<Value>(
            "editForumTopic",
            &json!({
                "chat_id": chat_id,
                "message_thread_id": message_thread_id,
                "name": name,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Resolve a file id and download its bytes.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, TelegramError> {
        let info: FileInfo = self
            .call("getFile", &json!({ "file_id": file_id }))
            .await?;
        let Some(path) = info.file_path else {
            return Err(TelegramError::Decode("getFile returned no file_path".into()));
        };
        let url = format!("{}/file/bot{}/{}", self.base, self.token, path);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "file download failed");
            return Err(TelegramError::Api {
                code: resp.status().as_u16() as i64,
                description: "file download failed".to_string(),
                retry_after: None,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
