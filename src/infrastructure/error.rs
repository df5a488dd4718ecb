use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid task: {0}")]
    InvalidTask(String),
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("found {0} JSON objects in one message, expected at most one")]
    MultipleJsonObjects(usize),
    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),
    #[error("language model returned an empty response")]
    ModelEmptyResponse,
    #[error("language model http error {status}: {body}")]
    ModelHttp { status: u16, body: String },
    #[error("language model communication error: {0}")]
    ModelCommunication(String),
    #[error("Alarm error: {0}")]
    Alarm(String),
}

impl InfraError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
