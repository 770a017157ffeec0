use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use sha2::{Digest, Sha256};
use tracing::debug;

use jagc_types::{DeliveryMode, IngestRequest, Run, RunOutput, RunStatus};

use crate::images::{claim_pending_images_tx, insert_bound_images_tx, ImageScope};
use crate::{fmt_ts, parse_ts, Store, StoreError};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub run: Run,
    pub deduplicated: bool,
}

impl Store {
    /// Idempotent intake: one transaction covering the dedup lookup, the run
    /// insert, the ingest-key insert, bound image rows, and (for the chat
    /// gateway) the claim of any pending images in scope.
    pub async fn ingest(
        &self,
        req: &IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let hash = payload_hash(req);

        if let Some(key) = req.idempotency_key.as_deref() {
            if let Some(prior) = lookup_ingest_key(&tx, &req.source, key)? {
                if prior.payload_hash != hash {
                    return Err(StoreError::IdempotencyPayloadMismatch);
                }
                let run = get_run_tx(&tx, &prior.run_id)?
                    .ok_or_else(|| StoreError::RunNotFound(prior.run_id.clone()))?;
                tx.commit()?;
                return Ok(IngestOutcome {
                    run,
                    deduplicated: true,
                });
            }
        }

        let run_id = jagc_types::new_run_id();
        let ts = fmt_ts(now);
        tx.execute(
            "INSERT INTO runs (run_id, source, thread_key, user_key, delivery_mode, status, \
             input_text, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                run_id,
                req.source,
                req.thread_key,
                req.user_key,
                req.delivery_mode.as_str(),
                RunStatus::Running.as_str(),
                req.input_text,
                ts,
            ],
        )?;

        if let Some(key) = req.idempotency_key.as_deref() {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO message_ingest \
                 (source, idempotency_key, run_id, payload_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![req.source, key, run_id, hash, ts],
            )?;
            if inserted == 0 {
                // Lost a race with a concurrent ingest of the same key: drop
                // our run and fall back to the prior row.
                let prior = lookup_ingest_key(&tx, &req.source, key)?
                    .ok_or_else(|| StoreError::Corrupt("ingest key vanished mid-insert".into()))?;
                if prior.payload_hash != hash {
                    return Err(StoreError::IdempotencyPayloadMismatch);
                }
                tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
                let run = get_run_tx(&tx, &prior.run_id)?
                    .ok_or_else(|| StoreError::RunNotFound(prior.run_id.clone()))?;
                tx.commit()?;
                return Ok(IngestOutcome {
                    run,
                    deduplicated: true,
                });
            }
        }

        if !req.images.is_empty() {
            insert_bound_images_tx(&tx, &run_id, &req.images, now)?;
        }

        if req.source == "telegram" {
            if let Some(user_key) = req.user_key.as_deref() {
                let scope = ImageScope {
                    source: req.source.clone(),
                    thread_key: req.thread_key.clone(),
                    user_key: user_key.to_string(),
                };
                let claimed = claim_pending_images_tx(&tx, &scope, &run_id, now)?;
                if claimed > 0 {
                    debug!(run_id, claimed, "claimed pending images on ingest");
                }
            }
        }

        let run = get_run_tx(&tx, &run_id)?
            .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
        tx.commit()?;
        Ok(IngestOutcome {
            run,
            deduplicated: false,
        })
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let conn = self.conn.lock().await;
        get_run_conn(&conn, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    /// Runs still marked `running`, oldest first. Used by crash recovery.
    pub async fn list_running_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, source, thread_key, user_key, delivery_mode, status, input_text, \
             output_json, error_message, created_at, updated_at \
             FROM runs WHERE status = 'running' ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// The most recently created run still `running` on a thread, if any.
    /// Backs the thread-level cancel command.
    pub async fn latest_running_run_for_thread(
        &self,
        thread_key: &str,
    ) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE thread_key = ?1 AND status = 'running' \
             ORDER BY created_at DESC LIMIT 1"
        ))?;
        let run = stmt
            .query_row(params![thread_key], run_from_row)
            .optional()?
            .transpose()?;
        Ok(run)
    }

    pub async fn mark_run_succeeded(
        &self,
        run_id: &str,
        output: &RunOutput,
    ) -> Result<Run, StoreError> {
        let output_json = serde_json::to_string(output)?;
        self.mark_terminal(run_id, RunStatus::Succeeded, Some(output_json), None)
            .await
    }

    pub async fn mark_run_failed(
        &self,
        run_id: &str,
        error_message: &str,
    ) -> Result<Run, StoreError> {
        self.mark_terminal(
            run_id,
            RunStatus::Failed,
            None,
            Some(error_message.to_string()),
        )
        .await
    }

    /// Compare-and-swap from `running`. Losing the swap is an error here;
    /// callers that race their own cancellation path treat it as benign.
    async fn mark_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        output_json: Option<String>,
        error_message: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE runs SET status = ?1, output_json = ?2, error_message = ?3, updated_at = ?4 \
             WHERE run_id = ?5 AND status = 'running'",
            params![
                status.as_str(),
                output_json,
                error_message,
                fmt_ts(Utc::now()),
                run_id,
            ],
        )?;
        if changed == 0 {
            let current = get_run_tx(&tx, run_id)?
                .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
            return Err(StoreError::RunAlreadyTerminal {
                run_id: run_id.to_string(),
                status: current.status.as_str().to_string(),
            });
        }
        let run =
            get_run_tx(&tx, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        tx.commit()?;
        Ok(run)
    }
}

struct IngestKeyRow {
    run_id: String,
    payload_hash: String,
}

fn lookup_ingest_key(
    tx: &Transaction<'_>,
    source: &str,
    key: &str,
) -> Result<Option<IngestKeyRow>, StoreError> {
    Ok(tx
        .query_row(
            "SELECT run_id, payload_hash FROM message_ingest \
             WHERE source = ?1 AND idempotency_key = ?2",
            params![source, key],
            |row| {
                Ok(IngestKeyRow {
                    run_id: row.get(0)?,
                    payload_hash: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// sha-256 over the input text and every image's bytes, in order. Two
/// ingests with the same idempotency key must match bit-for-bit.
pub(crate) fn payload_hash(req: &IngestRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(req.input_text.as_bytes());
    for image in &req.images {
        hasher.update([0u8]);
        hasher.update(image.mime_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(&image.bytes);
    }
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

const RUN_COLUMNS: &str = "run_id, source, thread_key, user_key, delivery_mode, status, \
     input_text, output_json, error_message, created_at, updated_at";

fn get_run_tx(tx: &Transaction<'_>, run_id: &str) -> Result<Option<Run>, StoreError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"
    ))?;
    let run = stmt
        .query_row(params![run_id], run_from_row)
        .optional()?
        .transpose()?;
    Ok(run)
}

fn get_run_conn(conn: &rusqlite::Connection, run_id: &str) -> Result<Option<Run>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"
    ))?;
    let run = stmt
        .query_row(params![run_id], run_from_row)
        .optional()?
        .transpose()?;
    Ok(run)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Run, StoreError>> {
    let run_id: String = row.get(0)?;
    let delivery_mode: String = row.get(4)?;
    let status: String = row.get(5)?;
    let output_json: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok((|| {
        let delivery_mode = DeliveryMode::parse(&delivery_mode)
            .ok_or_else(|| StoreError::Corrupt(format!("bad delivery_mode {delivery_mode:?}")))?;
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad run status {status:?}")))?;
        let output = output_json
            .as_deref()
            .map(serde_json::from_str::<RunOutput>)
            .transpose()?;
        Ok(Run {
            run_id,
            source: row.get(1)?,
            thread_key: row.get(2)?,
            user_key: row.get(3)?,
            delivery_mode,
            status,
            input_text: row.get(6)?,
            output,
            error_message: row.get(8)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}
