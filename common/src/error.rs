use async_openai::error::OpenAIError;
use thiserror::Error;

/// Core error type for the oracle daemon.
///
/// Per the error handling design, only `Config` is ever allowed to
/// terminate the process; every other variant is meant to be logged
/// and handled at its call site (returning a safe default, a fixed
/// user-facing string, or simply skipping the offending item).
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("LLM error: {0}")]
    Llm(#[from] OpenAIError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("internal error: {0}")]
    InternalError(String),
}
