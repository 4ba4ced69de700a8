use std::io;

/// Result alias for operations on named kernel objects.
pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("'{name}' does not exist")]
    NotFound { name: String },

    #[error("'{name}' size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("{op} failed for '{name}'")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ShmError {
    pub(crate) fn os(op: &'static str, name: &str, source: io::Error) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// Classifies the errno left behind by an `shm_open`/`sem_open` call.
    pub(crate) fn from_open(op: &'static str, name: &str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EEXIST) => Self::AlreadyExists {
                name: name.to_string(),
            },
            Some(libc::ENOENT) => Self::NotFound {
                name: name.to_string(),
            },
            _ => Self::os(op, name, source),
        }
    }

    /// True when the OS refused the operation for lack of permission.
    ///
    /// Sandboxed CI runners often deny `/dev/shm`; tests use this to skip.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Os { source, .. } if source.kind() == io::ErrorKind::PermissionDenied)
    }
}
