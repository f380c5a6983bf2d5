use serde::Serialize;
use thiserror::Error;

/// Boxed cause carried by directory failures, independent of the backend.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failed directory operation with the backend's original error attached.
#[derive(Debug, Error)]
#[error("directory {operation} on '{dn}' failed: {source}")]
pub struct DirectoryError {
    pub operation: &'static str,
    pub dn: String,
    #[source]
    pub source: BoxedCause,
}

impl DirectoryError {
    pub fn new(operation: &'static str, dn: impl Into<String>, source: impl Into<BoxedCause>) -> Self {
        Self {
            operation,
            dn: dn.into(),
            source: source.into(),
        }
    }
}

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("File operation failed: {0}")]
    FileOperationFailed(String),

    #[error("External tool '{tool}' failed ({}): {stderr}", describe_exit(.exit_code))]
    ExternalToolFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed or timed out".to_string(),
    }
}

/// Serializable error for the request layer
#[derive(Debug, Clone, Serialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
    pub status: u16,
}

impl From<AppError> for CommandError {
    fn from(err: AppError) -> Self {
        CommandError::from(&err)
    }
}

impl From<&AppError> for CommandError {
    fn from(err: &AppError) -> Self {
        CommandError {
            code: err.error_code().to_string(),
            message: err.to_string(),
            status: err.status(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        CommandError::from(self).serialize(serializer)
    }
}

impl AppError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::Conflict(_) => "CONFLICT",
            AppError::FileOperationFailed(_) => "FILE_OPERATION_FAILED",
            AppError::ExternalToolFailed { .. } => "EXTERNAL_TOOL_FAILED",
            AppError::Directory(_) => "DIRECTORY_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
        }
    }

    /// Status code the request layer answers with.
    pub fn status(&self) -> u16 {
        match self {
            AppError::InvalidInput(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::AlreadyExists(_) | AppError::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// True when the target is already in the requested state.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AppError::AlreadyExists(_))
    }

    pub fn file(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        AppError::FileOperationFailed(format!("{}: {}", context, err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
