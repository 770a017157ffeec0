//! The `pi` runner: drives the external pi coding agent as a long-lived
//! subprocess speaking newline-delimited JSON. Commands go down stdin;
//! session events come back up stdout in the shape the controller consumes.
//! The agent process itself is an external collaborator; everything here
//! relies only on the turn-session contract.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use jagc_types::{ImagePayload, SessionEvent, ThreadSession};

use crate::executor::{SessionFactory, SessionHandle, TurnSession};

pub struct PiSessionFactory {
    sessions_dir: PathBuf,
    pi_binary: String,
}

impl PiSessionFactory {
    pub fn new(sessions_dir: PathBuf) -> Self {
        let pi_binary = std::env::var("PI_BINARY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "pi".to_string());
        Self {
            sessions_dir,
            pi_binary,
        }
    }
}

#[async_trait]
impl SessionFactory for PiSessionFactory {
    async fn open_session(
        &self,
        thread_key: &str,
        resume: Option<&ThreadSession>,
    ) -> anyhow::Result<SessionHandle> {
        let session_file = match resume {
            Some(prior) => PathBuf::from(&prior.session_file),
            None => self
                .sessions_dir
                .join(format!("{}.jsonl", sanitize_thread_key(thread_key))),
        };
        let resumed = resume.is_some() && session_file.exists();
        let session_id = match resume {
            Some(prior) => prior.session_id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let mut child = Command::new(&self.pi_binary)
            .arg("--mode")
            .arg("rpc")
            .arg("--session-file")
            .arg(&session_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} for {thread_key}", self.pi_binary))?;

        let stdin = child
            .stdin
            .take()
            .context("pi child has no stdin handle")?;
        let stdout = child
            .stdout
            .take()
            .context("pi child has no stdout handle")?;
        let stderr = child.stderr.take();

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(256);
        tokio::spawn(read_events(stdout, events_tx));
        if let Some(stderr) = stderr {
            let key = thread_key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(thread_key = %key, "pi: {line}");
                }
            });
        }

        let session = Arc::new(PiSession {
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
        });

        Ok(SessionHandle {
            session,
            events: events_rx,
            session_id,
            session_file: session_file.to_string_lossy().to_string(),
            resumed,
        })
    }
}

async fn read_events(
    stdout: tokio::process::ChildStdout,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<SessionEvent>(line) {
                    Ok(event) => {
                        if events_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(%err, "unparseable pi event line skipped"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "pi stdout read error");
                break;
            }
        }
    }
    // Dropping the sender closes the event stream, which the controller
    // treats as agent_end.
}

struct PiSession {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
}

impl PiSession {
    async fn send(&self, value: serde_json::Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("pi stdin write failed")?;
        stdin.flush().await.context("pi stdin flush failed")?;
        Ok(())
    }

    fn encode_images(images: &[ImagePayload]) -> Vec<serde_json::Value> {
        images
            .iter()
            .map(|img| {
                json!({
                    "mime_type": img.mime_type,
                    "filename": img.filename,
                    "data": BASE64.encode(&img.bytes),
                })
            })
            .collect()
    }
}

#[async_trait]
impl TurnSession for PiSession {
    async fn prompt(&self, text: &str, images: &[ImagePayload]) -> anyhow::Result<()> {
        self.send(json!({
            "op": "prompt",
            "text": text,
            "images": Self::encode_images(images),
        }))
        .await
    }

    async fn follow_up(&self, text: &str, images: &[ImagePayload]) -> anyhow::Result<()> {
        self.send(json!({
            "op": "follow_up",
            "text": text,
            "images": Self::encode_images(images),
        }))
        .await
    }

    async fn steer(&self, text: &str) -> anyhow::Result<()> {
        self.send(json!({ "op": "steer", "text": text })).await
    }

    async fn abort_turn(&self) -> anyhow::Result<()> {
        self.send(json!({ "op": "abort" })).await
    }

    async fn set_model(&self, model: &str) -> anyhow::Result<()> {
        self.send(json!({ "op": "set_model", "model": model })).await
    }

    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()> {
        self.send(json!({ "op": "set_thinking_level", "level": level }))
            .await
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(err) = child.start_kill() {
                debug!(%err, "pi child already gone at shutdown");
            }
        }
    }
}

fn sanitize_thread_key(thread_key: &str) -> String {
    thread_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_keys_become_safe_file_names() {
        assert_eq!(
            sanitize_thread_key("telegram:chat:101:topic:7"),
            "telegram-chat-101-topic-7"
        );
        assert_eq!(sanitize_thread_key("cli"), "cli");
    }
}
