use thiserror::Error;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("{0}")]
    Validation(String),

    #[error("Missing API token")]
    MissingToken,

    #[error("Invalid API token")]
    InvalidToken,

    #[error("{0}")]
    NotFound(String),

    #[error("failed to dispatch task to worker")]
    DispatchFailed,

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("worker did not respond before the in-flight timeout")]
    WorkerTimeout,

    #[error("worker returned a malformed result: {0}")]
    WorkerProtocol(String),

    #[error("worker error: {message}")]
    WorkerReported {
        message: String,
        stack: Option<String>,
    },

    #[error("task exceeded the maximum queue age before dispatch")]
    QueueAgeExceeded,

    #[error("worker pool is unavailable: {0}")]
    PoolFatal(String),

    #[error("player fetch failed: {status_text}")]
    PlayerFetchFailed { status: u16, status_text: String },

    #[error("no signature solver available for this player")]
    NoSigSolver,

    #[error("n parameter is required but was not provided")]
    NParamMissing,

    #[error("script evaluation error: {0}")]
    Evaluation(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl CipherError {
    /// HTTP status the error surfaces as at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            CipherError::Validation(_) | CipherError::NParamMissing => 400,
            CipherError::MissingToken | CipherError::InvalidToken => 401,
            CipherError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, CipherError>;
