use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use jagc_types::ThreadSession;

use crate::{fmt_ts, parse_ts, Store, StoreError};

impl Store {
    pub async fn get_thread_session(
        &self,
        thread_key: &str,
    ) -> Result<Option<ThreadSession>, StoreError> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT thread_key, session_id, session_file, created_at, updated_at \
                 FROM thread_sessions WHERE thread_key = ?1",
                params![thread_key],
                session_from_row,
            )
            .optional()?
            .transpose()?;
        Ok(session)
    }

    pub async fn upsert_thread_session(
        &self,
        thread_key: &str,
        session_id: &str,
        session_file: &str,
    ) -> Result<ThreadSession, StoreError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thread_sessions (thread_key, session_id, session_file, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(thread_key) DO UPDATE SET \
             session_id = excluded.session_id, session_file = excluded.session_file, \
             updated_at = excluded.updated_at",
            params![thread_key, session_id, session_file, now],
        )?;
        let session = conn
            .query_row(
                "SELECT thread_key, session_id, session_file, created_at, updated_at \
                 FROM thread_sessions WHERE thread_key = ?1",
                params![thread_key],
                session_from_row,
            )
            .optional()?
            .transpose()?;
        session.ok_or_else(|| StoreError::Corrupt("thread session vanished after upsert".into()))
    }

    pub async fn delete_thread_session(&self, thread_key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM thread_sessions WHERE thread_key = ?1",
            params![thread_key],
        )?;
        Ok(deleted > 0)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ThreadSession, StoreError>> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok((|| {
        Ok(ThreadSession {
            thread_key: row.get(0)?,
            session_id: row.get(1)?,
            session_file: row.get(2)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}
