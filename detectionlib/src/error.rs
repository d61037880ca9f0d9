use std::fmt;
use thiserror::Error;

/// Stable failure taxonomy of the detection engine. The kinds are part of
/// the public contract; callers may match on them across releases.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    BadParameter,
    NotEntitled,
    NotAuthorized,
    Unsupported,
    Invalidated,
    BluetoothOff,
    InsufficientStorage,
    NotEnabled,
    ApiMisuse,
    Internal,
    InsufficientMemory,
    RateLimited,
    Restricted,
    BadFormat,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::BadParameter => "bad parameter",
            ErrorKind::NotEntitled => "not entitled",
            ErrorKind::NotAuthorized => "not authorized",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Invalidated => "invalidated",
            ErrorKind::BluetoothOff => "bluetooth off",
            ErrorKind::InsufficientStorage => "insufficient storage",
            ErrorKind::NotEnabled => "not enabled",
            ErrorKind::ApiMisuse => "API misuse",
            ErrorKind::Internal => "internal error",
            ErrorKind::InsufficientMemory => "insufficient memory",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Restricted => "restricted",
            ErrorKind::BadFormat => "bad format",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct DetectionError {
    kind: ErrorKind,
    message: String,
}

impl DetectionError {
    pub fn new<T: Into<String>>(kind: ErrorKind, message: T) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failures of the SQLite backing store, mirrored from the SQLite primary
/// result codes. The kinds are opaque to callers; the taxonomy is stable.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device storage is full")]
    Full,
    #[error("backing store is corrupt")]
    Corrupt,
    #[error("backing store must be closed and reopened")]
    Reopen,
    #[error("backing store is busy")]
    Busy,
    #[error("store error: {0}")]
    Unknown(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DiskFull => StoreError::Full,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreError::Corrupt,
                ErrorCode::SystemIoFailure | ErrorCode::SchemaChanged | ErrorCode::CannotOpen => {
                    StoreError::Reopen
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy,
                _ => StoreError::Unknown(error.to_string()),
            },
            _ => StoreError::Unknown(error.to_string()),
        }
    }
}

impl From<StoreError> for DetectionError {
    fn from(error: StoreError) -> Self {
        let kind = match error {
            StoreError::Full => ErrorKind::InsufficientStorage,
            _ => ErrorKind::Internal,
        };
        DetectionError::new(kind, error.to_string())
    }
}
