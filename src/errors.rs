use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    ArrowError(String),

    #[error("Date parsing error: {0}")]
    DateError(#[from] chrono::ParseError),

    #[error("Excel parsing error: {0}")]
    ExcelError(#[from] calamine::Error),

    #[error("Fetch error: {0}")]
    FetchError(String),

    #[error("Price parse error: {0}")]
    ParseError(String),

    #[error("Invalid instrument code: {0:?}")]
    InvalidCodeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Empty snapshot: {0}")]
    EmptySnapshotError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// 日志和退出码使用的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Fetch,
    Parse,
    Write,
    Config,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Fetch => "fetch",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Write => "write",
            ErrorCategory::Config => "config",
        }
    }

    /// Process exit status reported to the external scheduler.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::Fetch => 1,
            ErrorCategory::Parse => 2,
            ErrorCategory::Write => 3,
            ErrorCategory::Config => 4,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SnapshotError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SnapshotError::RequestError(_)
            | SnapshotError::ExcelError(_)
            | SnapshotError::FetchError(_) => ErrorCategory::Fetch,
            SnapshotError::JsonError(_)
            | SnapshotError::DateError(_)
            | SnapshotError::ParseError(_)
            | SnapshotError::InvalidCodeError(_)
            | SnapshotError::ValidationError(_)
            | SnapshotError::EmptySnapshotError(_) => ErrorCategory::Parse,
            SnapshotError::IoError(_)
            | SnapshotError::ArrowError(_)
            | SnapshotError::WriteError(_) => ErrorCategory::Write,
            SnapshotError::ConfigError(_) => ErrorCategory::Config,
        }
    }
}

// 用于从字符串创建错误
impl From<String> for SnapshotError {
    fn from(s: String) -> Self {
        SnapshotError::ValidationError(s)
    }
}
