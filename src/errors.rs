use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("FETCH_FAILED: {0}")]
    Fetch(String),
    #[error("GENERATION_FAILED: {0}")]
    Generation(String),
    #[error("EXECUTION_FAILED: {0}")]
    Execution(String),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("REFRESH_IN_PROGRESS: {0}")]
    Busy(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Policy(format!("invalid settings file: {}", value))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
