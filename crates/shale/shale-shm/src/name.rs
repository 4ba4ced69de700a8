use crate::error::{Result, ShmError};
use std::ffi::CString;

/// Longest name accepted for any kernel object.
///
/// Linux stores named semaphores as `/dev/shm/sem.<name>`, which eats four
/// bytes of `NAME_MAX` (255). Segments share the same limit. Callers that
/// derive several names from one base must leave room for their suffixes.
pub const MAX_NAME_LEN: usize = 251;

/// Validates a POSIX IPC object name and converts it for FFI.
///
/// Portable names start with a single `/` and contain no other slash.
pub fn validate_name(name: &str) -> Result<CString> {
    let invalid = |reason| ShmError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if !name.starts_with('/') {
        return Err(invalid("name must start with '/'"));
    }
    if name.len() == 1 {
        return Err(invalid("name must not be empty after '/'"));
    }
    if name[1..].contains('/') {
        return Err(invalid("name must not contain additional '/' characters"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 251 bytes"));
    }

    CString::new(name).map_err(|_| invalid("name must not contain NUL bytes"))
}
