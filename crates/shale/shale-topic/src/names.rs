//! Kernel object names derived from a topic's logical name `T`:
//!
//! | object                       | name      |
//! |------------------------------|-----------|
//! | shared segment               | `T`       |
//! | cursor semaphore             | `T--n`    |
//! | slot `i` reader mutex        | `T--r{i}` |
//! | slot `i` write permission    | `T--w{i}` |
//!
//! `T` itself must leave room for the longest suffix, `--w4294967295`, so
//! that every derived name is a valid POSIX name whenever `T` is accepted.

use crate::error::{Result, TopicError};
use shale_shm::{MAX_NAME_LEN, validate_name};

/// Bytes appended to the topic name by the longest derived name.
const LONGEST_SUFFIX: usize = "--w4294967295".len();

/// Longest topic name whose derived kernel object names all stay within
/// [`MAX_NAME_LEN`].
pub const MAX_TOPIC_NAME_LEN: usize = MAX_NAME_LEN - LONGEST_SUFFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    base: String,
}

impl TopicNames {
    /// Fails with `InvalidConfiguration` if `name` is not a valid POSIX name
    /// or is longer than [`MAX_TOPIC_NAME_LEN`].
    pub fn new(name: &str) -> Result<Self> {
        let names = Self::base_only(name)?;
        if name.len() > MAX_TOPIC_NAME_LEN {
            return Err(TopicError::invalid(format!(
                "topic name '{name}' is longer than {MAX_TOPIC_NAME_LEN} bytes"
            )));
        }
        Ok(names)
    }

    /// Checks only the segment name. Derived names may then be invalid; used
    /// to clean up topics whose name predates the length rule.
    pub(crate) fn base_only(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            base: name.to_string(),
        })
    }

    pub fn segment(&self) -> &str {
        &self.base
    }

    pub fn cursor(&self) -> String {
        format!("{}--n", self.base)
    }

    pub fn reader_mutex(&self, slot: u32) -> String {
        format!("{}--r{slot}", self.base)
    }

    pub fn write_permission(&self, slot: u32) -> String {
        format!("{}--w{slot}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn derives_role_suffixes() {
        let names = TopicNames::new("/clap0").unwrap();
        assert_eq!(names.segment(), "/clap0");
        assert_eq!(names.cursor(), "/clap0--n");
        assert_eq!(names.reader_mutex(0), "/clap0--r0");
        assert_eq!(names.write_permission(12), "/clap0--w12");
    }

    #[test]
    fn rejects_names_that_are_not_posix_names() {
        let err = TopicNames::new("clap0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn longest_accepted_name_keeps_every_derived_name_valid() {
        let name = format!("/{}", "x".repeat(MAX_TOPIC_NAME_LEN - 1));
        let names = TopicNames::new(&name).unwrap();
        for derived in [
            names.cursor(),
            names.reader_mutex(u32::MAX),
            names.write_permission(u32::MAX),
        ] {
            assert!(derived.len() <= MAX_NAME_LEN);
            assert!(validate_name(&derived).is_ok(), "{derived}");
        }
    }

    #[test]
    fn names_without_room_for_suffixes_are_rejected() {
        let name = format!("/{}", "x".repeat(MAX_TOPIC_NAME_LEN));
        assert!(validate_name(&name).is_ok());
        let err = TopicNames::new(&name).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(TopicNames::base_only(&name).is_ok());
    }
}
