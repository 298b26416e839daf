use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store operation timed out: {0}")]
    StoreTimeout(String),

    #[error("Requested revision {requested} has been compacted (oldest available: {compacted})")]
    Compacted { requested: u64, compacted: u64 },

    #[error("Key not found")]
    KeyNotFound,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lease {0} not found or expired")]
    LeaseNotFound(u64),

    #[error("Session closed")]
    SessionClosed,

    #[error("could not obtain lock {id}: another conflicting transaction may be in progress")]
    LockTimeout { id: String },

    #[error("existing lock found for lock ID {0}")]
    LockExists(String),

    #[error("Lock {0} is not held")]
    LockNotHeld(String),

    #[error("node {0} is probably down")]
    NodeDown(String),

    #[error("step function not found: {0}")]
    StepFuncNotFound(String),

    #[error("step function already registered: {0}")]
    StepFuncExists(String),

    #[error("step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("timed out waiting for all nodes to finish step {step_index}")]
    SyncTimeout { step_index: usize },

    #[error("txn timed out")]
    TxnTimeout,

    #[error("{0}")]
    TxnFailed(String),

    #[error("Transaction {0} not found")]
    TxnNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Generic error: {0}")]
    Generic(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::Store(_) => -2,
            Error::StoreTimeout(_) => -3,
            Error::Compacted { .. } => -4,
            Error::KeyNotFound => -5,
            Error::Serialization(_) => -6,
            Error::LeaseNotFound(_) => -7,
            Error::SessionClosed => -8,
            Error::LockTimeout { .. } => -9,
            Error::LockExists(_) => -10,
            Error::LockNotHeld(_) => -11,
            Error::NodeDown(_) => -12,
            Error::StepFuncNotFound(_) => -13,
            Error::StepFuncExists(_) => -14,
            Error::StepFailed { .. } => -15,
            Error::SyncTimeout { .. } => -16,
            Error::TxnTimeout => -17,
            Error::TxnFailed(_) => -18,
            Error::TxnNotFound(_) => -19,
            Error::InvalidState(_) => -20,
            Error::InvalidInput(_) => -21,
            Error::Config(_) => -22,
            Error::Cancelled => -23,
            Error::Generic(_) => -99,
        }
    }

    /// HTTP status a REST layer should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::LockTimeout { .. } => 409,
            Error::KeyNotFound | Error::TxnNotFound(_) => 404,
            Error::InvalidInput(_) | Error::StepFuncNotFound(_) => 400,
            _ => 500,
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreTimeout(_)
                | Error::LockTimeout { .. }
                | Error::SyncTimeout { .. }
                | Error::TxnTimeout
                | Error::NodeDown(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::StoreTimeout(_)
                | Error::LockTimeout { .. }
                | Error::SyncTimeout { .. }
                | Error::TxnTimeout
        )
    }
}

/// Context trait for adding context to errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T>;
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| Error::Generic(format!("{}: {}", msg, e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Generic(format!("{}: {}", f(), e)))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::StoreTimeout(err.to_string()),
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Serialization(format!("Integer parse error: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Serialization(format!("UTF-8 conversion error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::StoreTimeout(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::InvalidInput(format!("invalid uuid: {}", err))
    }
}
