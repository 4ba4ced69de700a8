use shale_shm::ShmError;
use std::io;

pub type Result<T> = std::result::Result<T, TopicError>;

#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("topic '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("'{name}' does not exist")]
    NotFound { name: String },

    #[error("message size mismatch: expected {expected} bytes, topic stores {actual}")]
    SizeMismatch { expected: u32, actual: u32 },

    #[error("message count mismatch: expected {expected} slots, topic stores {actual}")]
    CountMismatch { expected: u32, actual: u32 },

    #[error("failed to create or open topic objects")]
    CreateFailed {
        #[source]
        source: ShmError,
    },

    #[error("invalid topic configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// The segment exists but its header has not been written yet.
    #[error("topic '{name}' is not initialized")]
    Uninitialized { name: String },

    #[error("topic '{name}' is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("payload length mismatch: topic carries {expected} bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },

    #[error("semaphore operation failed")]
    Sync(#[from] io::Error),
}

/// Outcome classes of [`TopicError`], for callers that only branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    SizeMismatch,
    CountMismatch,
    CreateFailed,
    InvalidConfiguration,
    Uninitialized,
    Corrupt,
    PayloadLength,
    Sync,
}

impl TopicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::CountMismatch { .. } => ErrorKind::CountMismatch,
            Self::CreateFailed { .. } => ErrorKind::CreateFailed,
            Self::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            Self::Uninitialized { .. } => ErrorKind::Uninitialized,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::PayloadLength { .. } => ErrorKind::PayloadLength,
            Self::Sync(_) => ErrorKind::Sync,
        }
    }

    /// True when the OS denied access to POSIX IPC objects altogether.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::CreateFailed { source } if source.is_permission_denied())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(name: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ShmError> for TopicError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::AlreadyExists { name } => Self::AlreadyExists { name },
            ShmError::NotFound { name } => Self::NotFound { name },
            ShmError::InvalidName { name, reason } => Self::InvalidConfiguration {
                reason: format!("invalid name '{name}': {reason}"),
            },
            source => Self::CreateFailed { source },
        }
    }
}
