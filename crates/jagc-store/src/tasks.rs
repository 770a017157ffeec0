use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use jagc_types::{
    task_run_idempotency_key, DeliveryTarget, ScheduleKind, ScheduledTask, TaskRun, TaskRunStatus,
};

use crate::{fmt_ts, parse_ts, Store, StoreError};

#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    pub creator_thread_key: Option<String>,
    pub enabled: Option<bool>,
}

const TASK_COLUMNS: &str = "task_id, title, instructions, schedule_kind, once_at, cron_expr, \
     rrule_expr, timezone, enabled, next_run_at, creator_thread_key, owner_user_key, \
     delivery_target, execution_thread_key, last_run_at, last_run_status, last_error_message, \
     created_at, updated_at";

const TASK_RUN_COLUMNS: &str = "task_run_id, task_id, scheduled_for, idempotency_key, run_id, \
     status, error_message, created_at, updated_at";

impl Store {
    pub async fn insert_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let delivery_target = serde_json::to_string(&task.delivery_target)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_tasks \
             (task_id, title, instructions, schedule_kind, once_at, cron_expr, rrule_expr, \
              timezone, enabled, next_run_at, creator_thread_key, owner_user_key, \
              delivery_target, execution_thread_key, last_run_at, last_run_status, \
              last_error_message, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                task.task_id,
                task.title,
                task.instructions,
                task.schedule_kind.as_str(),
                task.once_at.map(fmt_ts),
                task.cron_expr,
                task.rrule_expr,
                task.timezone,
                task.enabled as i64,
                task.next_run_at.map(fmt_ts),
                task.creator_thread_key,
                task.owner_user_key,
                delivery_target,
                task.execution_thread_key,
                task.last_run_at.map(fmt_ts),
                task.last_run_status.map(|s| s.as_str()),
                task.last_error_message,
                fmt_ts(task.created_at),
                fmt_ts(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<ScheduledTask, StoreError> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()?
            .transpose()?;
        task.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_tasks(
        &self,
        filter: &TaskListFilter,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(thread_key) = &filter.creator_thread_key {
            sql.push_str(" AND creator_thread_key = ?");
            args.push(Box::new(thread_key.clone()));
        }
        if let Some(enabled) = filter.enabled {
            sql.push_str(" AND enabled = ?");
            args.push(Box::new(enabled as i64));
        }
        sql.push_str(" ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            task_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Full-row update used by the PATCH surface. Schedule advancement never
    /// goes through here; it uses the conditional path below.
    pub async fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let delivery_target = serde_json::to_string(&task.delivery_target)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET title = ?2, instructions = ?3, schedule_kind = ?4, \
             once_at = ?5, cron_expr = ?6, rrule_expr = ?7, timezone = ?8, enabled = ?9, \
             next_run_at = ?10, delivery_target = ?11, execution_thread_key = ?12, \
             updated_at = ?13 WHERE task_id = ?1",
            params![
                task.task_id,
                task.title,
                task.instructions,
                task.schedule_kind.as_str(),
                task.once_at.map(fmt_ts),
                task.cron_expr,
                task.rrule_expr,
                task.timezone,
                task.enabled as i64,
                task.next_run_at.map(fmt_ts),
                delivery_target,
                task.execution_thread_key,
                fmt_ts(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task.task_id.clone()));
        }
        Ok(())
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM scheduled_tasks WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(deleted > 0)
    }

    /// Enabled tasks whose `next_run_at` has passed, soonest first.
    pub async fn list_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(now), limit as i64], task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Advance the schedule past `occurrence`. The match on the current
    /// `next_run_at` means overlapping ticks cannot double-advance: the loser
    /// matches zero rows and must reload.
    pub async fn advance_task_after_occurrence(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET next_run_at = ?1, enabled = ?2, last_run_at = ?3, \
             updated_at = ?4 WHERE task_id = ?5 AND next_run_at = ?3",
            params![
                next_run_at.map(fmt_ts),
                enabled as i64,
                fmt_ts(occurrence),
                fmt_ts(Utc::now()),
                task_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Persist the lazily created execution thread and the routing that came
    /// with it (e.g. the freshly created Telegram topic).
    pub async fn set_task_execution_thread(
        &self,
        task_id: &str,
        execution_thread_key: &str,
        delivery_target: &DeliveryTarget,
    ) -> Result<(), StoreError> {
        let target = serde_json::to_string(delivery_target)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET execution_thread_key = ?1, delivery_target = ?2, \
             updated_at = ?3 WHERE task_id = ?4",
            params![execution_thread_key, target, fmt_ts(Utc::now()), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    pub async fn record_task_outcome(
        &self,
        task_id: &str,
        status: TaskRunStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_tasks SET last_run_status = ?1, last_error_message = ?2, \
             updated_at = ?3 WHERE task_id = ?4",
            params![status.as_str(), error_message, fmt_ts(Utc::now()), task_id],
        )?;
        Ok(())
    }

    /// Materialize one occurrence. Unique on `(task_id, scheduled_for)`, so
    /// concurrent callers converge on the same row.
    pub async fn create_or_get_task_run(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(TaskRun, bool), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = fmt_ts(Utc::now());
        let key = task_run_idempotency_key(task_id, scheduled_for);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO scheduled_task_runs \
             (task_run_id, task_id, scheduled_for, idempotency_key, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                Uuid::new_v4().to_string(),
                task_id,
                fmt_ts(scheduled_for),
                key,
                TaskRunStatus::Pending.as_str(),
                now,
            ],
        )?;
        let run = tx
            .query_row(
                &format!(
                    "SELECT {TASK_RUN_COLUMNS} FROM scheduled_task_runs \
                     WHERE task_id = ?1 AND scheduled_for = ?2"
                ),
                params![task_id, fmt_ts(scheduled_for)],
                task_run_from_row,
            )
            .optional()?
            .transpose()?
            .ok_or_else(|| StoreError::Corrupt("task run vanished after insert".into()))?;
        tx.commit()?;
        Ok((run, inserted > 0))
    }

    pub async fn get_task_run(&self, task_run_id: &str) -> Result<TaskRun, StoreError> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {TASK_RUN_COLUMNS} FROM scheduled_task_runs WHERE task_run_id = ?1"),
                params![task_run_id],
                task_run_from_row,
            )
            .optional()?
            .transpose()?;
        run.ok_or_else(|| StoreError::TaskRunNotFound(task_run_id.to_string()))
    }

    pub async fn list_task_runs_by_status(
        &self,
        status: TaskRunStatus,
        limit: usize,
    ) -> Result<Vec<TaskRun>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM scheduled_task_runs \
             WHERE status = ?1 ORDER BY scheduled_for ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], task_run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// pending → dispatched, recording the underlying run. Forward-only by
    /// the status predicate.
    pub async fn mark_task_run_dispatched(
        &self,
        task_run_id: &str,
        run_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_task_runs SET status = 'dispatched', run_id = ?1, updated_at = ?2 \
             WHERE task_run_id = ?3 AND status = 'pending'",
            params![run_id, fmt_ts(Utc::now()), task_run_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn mark_task_run_succeeded(
        &self,
        task_run_id: &str,
        run_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_task_runs SET status = 'succeeded', \
             run_id = COALESCE(?1, run_id), error_message = NULL, updated_at = ?2 \
             WHERE task_run_id = ?3 AND status IN ('pending', 'dispatched')",
            params![run_id, fmt_ts(Utc::now()), task_run_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn mark_task_run_failed(
        &self,
        task_run_id: &str,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE scheduled_task_runs SET status = 'failed', error_message = ?1, updated_at = ?2 \
             WHERE task_run_id = ?3 AND status IN ('pending', 'dispatched')",
            params![error_message, fmt_ts(Utc::now()), task_run_id],
        )?;
        Ok(changed > 0)
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ScheduledTask, StoreError>> {
    let schedule_kind: String = row.get(3)?;
    let once_at: Option<String> = row.get(4)?;
    let enabled: i64 = row.get(8)?;
    let next_run_at: Option<String> = row.get(9)?;
    let delivery_target: String = row.get(12)?;
    let last_run_at: Option<String> = row.get(14)?;
    let last_run_status: Option<String> = row.get(15)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    Ok((|| {
        let schedule_kind = ScheduleKind::parse(&schedule_kind)
            .ok_or_else(|| StoreError::Corrupt(format!("bad schedule_kind {schedule_kind:?}")))?;
        let last_run_status = last_run_status
            .as_deref()
            .map(|s| {
                TaskRunStatus::parse(s)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad last_run_status {s:?}")))
            })
            .transpose()?;
        Ok(ScheduledTask {
            task_id: row.get(0)?,
            title: row.get(1)?,
            instructions: row.get(2)?,
            schedule_kind,
            once_at: once_at.as_deref().map(parse_ts).transpose()?,
            cron_expr: row.get(5)?,
            rrule_expr: row.get(6)?,
            timezone: row.get(7)?,
            enabled: enabled != 0,
            next_run_at: next_run_at.as_deref().map(parse_ts).transpose()?,
            creator_thread_key: row.get(10)?,
            owner_user_key: row.get(11)?,
            delivery_target: serde_json::from_str(&delivery_target)?,
            execution_thread_key: row.get(13)?,
            last_run_at: last_run_at.as_deref().map(parse_ts).transpose()?,
            last_run_status,
            last_error_message: row.get(16)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn task_run_from_row(row: &Row<'_>) -> rusqlite::Result<Result<TaskRun, StoreError>> {
    let scheduled_for: String = row.get(2)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok((|| {
        let status = TaskRunStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad task run status {status:?}")))?;
        Ok(TaskRun {
            task_run_id: row.get(0)?,
            task_id: row.get(1)?,
            scheduled_for: parse_ts(&scheduled_for)?,
            idempotency_key: row.get(3)?,
            run_id: row.get(4)?,
            status,
            error_message: row.get(6)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}
