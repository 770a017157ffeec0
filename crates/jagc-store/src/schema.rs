pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT PRIMARY KEY,
    source          TEXT NOT NULL,
    thread_key      TEXT NOT NULL,
    user_key        TEXT,
    delivery_mode   TEXT NOT NULL,
    status          TEXT NOT NULL,
    input_text      TEXT NOT NULL,
    output_json     TEXT,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(thread_key, created_at);

CREATE TABLE IF NOT EXISTS message_ingest (
    source          TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    run_id          TEXT NOT NULL,
    payload_hash    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (source, idempotency_key)
);

CREATE TABLE IF NOT EXISTS thread_sessions (
    thread_key      TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL,
    session_file    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    task_id              TEXT PRIMARY KEY,
    title                TEXT NOT NULL,
    instructions         TEXT NOT NULL,
    schedule_kind        TEXT NOT NULL,
    once_at              TEXT,
    cron_expr            TEXT,
    rrule_expr           TEXT,
    timezone             TEXT NOT NULL,
    enabled              INTEGER NOT NULL,
    next_run_at          TEXT,
    creator_thread_key   TEXT NOT NULL,
    owner_user_key       TEXT,
    delivery_target      TEXT NOT NULL,
    execution_thread_key TEXT,
    last_run_at          TEXT,
    last_run_status      TEXT,
    last_error_message   TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_due
    ON scheduled_tasks(enabled, next_run_at);

CREATE TABLE IF NOT EXISTS scheduled_task_runs (
    task_run_id     TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL,
    scheduled_for   TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    run_id          TEXT,
    status          TEXT NOT NULL,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (task_id, scheduled_for)
);

CREATE INDEX IF NOT EXISTS idx_task_runs_status
    ON scheduled_task_runs(status, scheduled_for);

CREATE TABLE IF NOT EXISTS input_images (
    input_image_id     TEXT PRIMARY KEY,
    source             TEXT NOT NULL,
    thread_key         TEXT NOT NULL,
    user_key           TEXT NOT NULL,
    external_update_id TEXT,
    media_group_id     TEXT,
    run_id             TEXT,
    mime_type          TEXT NOT NULL,
    filename           TEXT,
    byte_size          INTEGER NOT NULL,
    image_bytes        BLOB NOT NULL,
    position           INTEGER NOT NULL,
    created_at         TEXT NOT NULL,
    expires_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_input_images_scope
    ON input_images(source, thread_key, user_key, run_id);
CREATE INDEX IF NOT EXISTS idx_input_images_run
    ON input_images(run_id);
CREATE INDEX IF NOT EXISTS idx_input_images_expiry
    ON input_images(expires_at);
"#;
