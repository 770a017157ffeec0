use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {run_id} is {status}, expected running")]
    RunAlreadyTerminal { run_id: String, status: String },

    #[error("ingest payload differs from the run previously recorded for this idempotency key")]
    IdempotencyPayloadMismatch,

    #[error("image_buffer_limit_exceeded: pending buffer is capped at {max_count} images / {max_bytes} bytes per scope")]
    ImageBufferLimitExceeded { max_count: usize, max_bytes: usize },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task run {0} not found")]
    TaskRunNotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Stable error code for the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "database_error",
            StoreError::Serialization(_) => "serialization_error",
            StoreError::RunNotFound(_) => "run_not_found",
            StoreError::RunAlreadyTerminal { .. } => "run_already_terminal",
            StoreError::IdempotencyPayloadMismatch => "idempotency_payload_mismatch",
            StoreError::ImageBufferLimitExceeded { .. } => "image_buffer_limit_exceeded",
            StoreError::TaskNotFound(_) => "task_not_found",
            StoreError::TaskRunNotFound(_) => "task_run_not_found",
            StoreError::Corrupt(_) => "corrupt_row",
        }
    }
}
