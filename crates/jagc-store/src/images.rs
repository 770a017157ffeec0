use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use jagc_types::{
    ImagePayload, InputImage, MAX_INPUT_IMAGE_COUNT, MAX_INPUT_IMAGE_TOTAL_BYTES,
    PENDING_IMAGE_TTL_SECONDS,
};

use crate::{fmt_ts, parse_ts, Store, StoreError};

/// The pending buffer is keyed by who sent images where, not by run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageScope {
    pub source: String,
    pub thread_key: String,
    pub user_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingBufferStats {
    pub count: usize,
    pub total_bytes: usize,
}

impl Store {
    /// Buffer images awaiting a text message in the same scope. One
    /// transaction: purge expired rows, dedup on the external update id,
    /// enforce the buffer caps, then append at the next positions.
    pub async fn insert_pending_images(
        &self,
        scope: &ImageScope,
        external_update_id: &str,
        media_group_id: Option<&str>,
        images: &[ImagePayload],
        now: DateTime<Utc>,
    ) -> Result<PendingBufferStats, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        purge_expired_in_scope_tx(&tx, scope, now)?;

        let seen: Option<i64> = tx
            .query_row(
                "SELECT COUNT(*) FROM input_images \
                 WHERE source = ?1 AND thread_key = ?2 AND user_key = ?3 \
                 AND external_update_id = ?4",
                params![scope.source, scope.thread_key, scope.user_key, external_update_id],
                |row| row.get(0),
            )
            .optional()?;
        if seen.unwrap_or(0) > 0 {
            let stats = pending_stats_tx(&tx, scope)?;
            tx.commit()?;
            return Ok(stats);
        }

        let current = pending_stats_tx(&tx, scope)?;
        let new_bytes: usize = images.iter().map(|i| i.bytes.len()).sum();
        if current.count + images.len() > MAX_INPUT_IMAGE_COUNT
            || current.total_bytes + new_bytes > MAX_INPUT_IMAGE_TOTAL_BYTES
        {
            return Err(StoreError::ImageBufferLimitExceeded {
                max_count: MAX_INPUT_IMAGE_COUNT,
                max_bytes: MAX_INPUT_IMAGE_TOTAL_BYTES,
            });
        }

        let base: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) FROM input_images \
             WHERE source = ?1 AND thread_key = ?2 AND user_key = ?3 AND run_id IS NULL",
            params![scope.source, scope.thread_key, scope.user_key],
            |row| row.get(0),
        )?;
        let expires = fmt_ts(now + Duration::seconds(PENDING_IMAGE_TTL_SECONDS));
        let created = fmt_ts(now);
        for (offset, image) in images.iter().enumerate() {
            tx.execute(
                "INSERT INTO input_images \
                 (input_image_id, source, thread_key, user_key, external_update_id, \
                  media_group_id, run_id, mime_type, filename, byte_size, image_bytes, \
                  position, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    Uuid::new_v4().to_string(),
                    scope.source,
                    scope.thread_key,
                    scope.user_key,
                    external_update_id,
                    media_group_id,
                    image.mime_type,
                    image.filename,
                    image.bytes.len() as i64,
                    image.bytes,
                    base + 1 + offset as i64,
                    created,
                    expires,
                ],
            )?;
        }

        let stats = pending_stats_tx(&tx, scope)?;
        tx.commit()?;
        Ok(stats)
    }

    /// Bind every pending image in scope to `run_id`, refreshing its TTL.
    /// Also available standalone; ingest runs the same statement inside its
    /// own transaction.
    pub async fn claim_pending_images_to_run(
        &self,
        scope: &ImageScope,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let claimed = claim_pending_images_tx(&tx, scope, run_id, now)?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Bound insertion path for sources that attach images directly.
    pub async fn insert_run_input_images(
        &self,
        run_id: &str,
        images: &[ImagePayload],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = insert_bound_images_tx(&tx, run_id, images, now)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn list_run_input_images(&self, run_id: &str) -> Result<Vec<InputImage>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT input_image_id, source, thread_key, user_key, external_update_id, \
             media_group_id, run_id, mime_type, filename, byte_size, image_bytes, position, \
             created_at, expires_at \
             FROM input_images WHERE run_id = ?1 ORDER BY position ASC, input_image_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], image_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub async fn delete_run_input_images(&self, run_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM input_images WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(deleted)
    }

    /// Global TTL sweep. Expired rows that were already bound to a run point
    /// at a delivery that never cleaned up; they are logged as an anomaly.
    pub async fn purge_expired_input_images(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ts = fmt_ts(now);
        let bound: i64 = tx.query_row(
            "SELECT COUNT(*) FROM input_images WHERE expires_at <= ?1 AND run_id IS NOT NULL",
            params![ts],
            |row| row.get(0),
        )?;
        if bound > 0 {
            warn!(count = bound, "purging expired input images still bound to runs");
        }
        let purged = tx.execute(
            "DELETE FROM input_images WHERE expires_at <= ?1",
            params![ts],
        )?;
        tx.commit()?;
        Ok(purged)
    }

    pub async fn pending_buffer_stats(
        &self,
        scope: &ImageScope,
    ) -> Result<PendingBufferStats, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let stats = pending_stats_tx(&tx, scope)?;
        tx.commit()?;
        Ok(stats)
    }
}

pub(crate) fn claim_pending_images_tx(
    tx: &Transaction<'_>,
    scope: &ImageScope,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    // The `run_id IS NULL` predicate makes the claim idempotent and keeps a
    // row from ever being reassigned.
    let refreshed = fmt_ts(now + Duration::seconds(PENDING_IMAGE_TTL_SECONDS));
    let claimed = tx.execute(
        "UPDATE input_images SET run_id = ?1, expires_at = ?2 \
         WHERE source = ?3 AND thread_key = ?4 AND user_key = ?5 \
         AND run_id IS NULL AND expires_at > ?6",
        params![
            run_id,
            refreshed,
            scope.source,
            scope.thread_key,
            scope.user_key,
            fmt_ts(now),
        ],
    )?;
    Ok(claimed)
}

pub(crate) fn insert_bound_images_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    images: &[ImagePayload],
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let created = fmt_ts(now);
    let expires = fmt_ts(now + Duration::seconds(PENDING_IMAGE_TTL_SECONDS));
    for (position, image) in images.iter().enumerate() {
        tx.execute(
            "INSERT INTO input_images \
             (input_image_id, source, thread_key, user_key, external_update_id, media_group_id, \
              run_id, mime_type, filename, byte_size, image_bytes, position, created_at, expires_at) \
             VALUES (?1, '', '', '', NULL, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                run_id,
                image.mime_type,
                image.filename,
                image.bytes.len() as i64,
                image.bytes,
                position as i64,
                created,
                expires,
            ],
        )?;
    }
    Ok(images.len())
}

fn purge_expired_in_scope_tx(
    tx: &Transaction<'_>,
    scope: &ImageScope,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let purged = tx.execute(
        "DELETE FROM input_images \
         WHERE source = ?1 AND thread_key = ?2 AND user_key = ?3 \
         AND run_id IS NULL AND expires_at <= ?4",
        params![scope.source, scope.thread_key, scope.user_key, fmt_ts(now)],
    )?;
    Ok(purged)
}

fn pending_stats_tx(
    tx: &Transaction<'_>,
    scope: &ImageScope,
) -> Result<PendingBufferStats, StoreError> {
    let (count, total_bytes): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(byte_size), 0) FROM input_images \
         WHERE source = ?1 AND thread_key = ?2 AND user_key = ?3 AND run_id IS NULL",
        params![scope.source, scope.thread_key, scope.user_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(PendingBufferStats {
        count: count as usize,
        total_bytes: total_bytes as usize,
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Result<InputImage, StoreError>> {
    let created_at: String = row.get(12)?;
    let expires_at: String = row.get(13)?;
    Ok((|| {
        Ok(InputImage {
            input_image_id: row.get(0)?,
            source: row.get(1)?,
            thread_key: row.get(2)?,
            user_key: row.get(3)?,
            external_update_id: row.get(4)?,
            media_group_id: row.get(5)?,
            run_id: row.get(6)?,
            mime_type: row.get(7)?,
            filename: row.get(8)?,
            byte_size: row.get(9)?,
            image_bytes: row.get(10)?,
            position: row.get(11)?,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jagc_types::{DeliveryMode, IngestRequest};

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn scope() -> ImageScope {
        ImageScope {
            source: "telegram".into(),
            thread_key: "telegram:chat:1".into(),
            user_key: "telegram:user:1".into(),
        }
    }

    fn image(len: usize) -> ImagePayload {
        ImagePayload {
            mime_type: "image/jpeg".into(),
            filename: Some("photo.jpg".into()),
            bytes: vec![0xAB; len],
        }
    }

    #[tokio::test]
    async fn pending_insert_and_dedup_on_update_id() {
        let store = store();
        let now = Utc::now();
        let stats = store
            .insert_pending_images(&scope(), "2001", None, &[image(10)], now)
            .await
            .unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 10);

        // Same update id again: no-op, same stats.
        let stats = store
            .insert_pending_images(&scope(), "2001", None, &[image(10)], now)
            .await
            .unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn buffer_count_limit_enforced() {
        let store = store();
        let now = Utc::now();
        for i in 0..MAX_INPUT_IMAGE_COUNT {
            store
                .insert_pending_images(&scope(), &format!("u{i}"), None, &[image(1)], now)
                .await
                .unwrap();
        }
        let err = store
            .insert_pending_images(&scope(), "one-too-many", None, &[image(1)], now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ImageBufferLimitExceeded { .. }));
        // Prior rows remain.
        let stats = store.pending_buffer_stats(&scope()).await.unwrap();
        assert_eq!(stats.count, MAX_INPUT_IMAGE_COUNT);
    }

    #[tokio::test]
    async fn buffer_byte_limit_enforced() {
        let store = store();
        let now = Utc::now();
        store
            .insert_pending_images(
                &scope(),
                "big",
                None,
                &[image(MAX_INPUT_IMAGE_TOTAL_BYTES - 1)],
                now,
            )
            .await
            .unwrap();
        let err = store
            .insert_pending_images(&scope(), "big2", None, &[image(2)], now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ImageBufferLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn expired_rows_purged_on_insert() {
        let store = store();
        let t0 = Utc::now();
        store
            .insert_pending_images(&scope(), "u1", None, &[image(5)], t0)
            .await
            .unwrap();
        let later = t0 + Duration::seconds(PENDING_IMAGE_TTL_SECONDS + 1);
        let stats = store
            .insert_pending_images(&scope(), "u2", None, &[image(7)], later)
            .await
            .unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_bytes, 7);
    }

    #[tokio::test]
    async fn claim_binds_all_pending_and_refreshes_ttl() {
        let store = store();
        let now = Utc::now();
        store
            .insert_pending_images(&scope(), "u1", None, &[image(3), image(4)], now)
            .await
            .unwrap();

        let claimed = store
            .claim_pending_images_to_run(&scope(), "run-1", now)
            .await
            .unwrap();
        assert_eq!(claimed, 2);
        assert_eq!(store.pending_buffer_stats(&scope()).await.unwrap().count, 0);

        let bound = store.list_run_input_images("run-1").await.unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].position, 0);
        assert_eq!(bound[1].position, 1);
        for img in &bound {
            assert!(img.expires_at > now + Duration::seconds(PENDING_IMAGE_TTL_SECONDS - 5));
        }

        // Second claim is a no-op: run_id is never reassigned.
        let reclaimed = store
            .claim_pending_images_to_run(&scope(), "run-2", now)
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
        assert!(store.list_run_input_images("run-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingest_claims_pending_images_atomically() {
        let store = store();
        let now = Utc::now();
        store
            .insert_pending_images(&scope(), "2001", None, &[image(6)], now)
            .await
            .unwrap();

        let req = IngestRequest {
            source: "telegram".into(),
            thread_key: "telegram:chat:1".into(),
            user_key: Some("telegram:user:1".into()),
            delivery_mode: DeliveryMode::FollowUp,
            idempotency_key: Some("telegram:update:2002".into()),
            input_text: "describe buffered image".into(),
            images: Vec::new(),
        };
        let out = store.ingest(&req, now).await.unwrap();
        let bound = store.list_run_input_images(&out.run.run_id).await.unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].position, 0);
        assert_eq!(store.pending_buffer_stats(&scope()).await.unwrap().count, 0);

        // Replay of the same ingest does not duplicate image rows.
        let replay = store.ingest(&req, now).await.unwrap();
        assert!(replay.deduplicated);
        assert_eq!(
            store.list_run_input_images(&out.run.run_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn delete_run_images_returns_count() {
        let store = store();
        let now = Utc::now();
        store
            .insert_run_input_images("run-9", &[image(1), image(2), image(3)], now)
            .await
            .unwrap();
        assert_eq!(store.delete_run_input_images("run-9").await.unwrap(), 3);
        assert_eq!(store.delete_run_input_images("run-9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn global_purge_removes_expired() {
        let store = store();
        let t0 = Utc::now();
        store
            .insert_pending_images(&scope(), "u1", None, &[image(5)], t0)
            .await
            .unwrap();
        let purged = store
            .purge_expired_input_images(t0 + Duration::seconds(PENDING_IMAGE_TTL_SECONDS + 1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
