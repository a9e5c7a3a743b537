//! Usernames the engine must never touch in any downstream service.

use std::collections::HashSet;
use std::path::Path;

use crate::error::ConfigError;

/// Loaded once at startup from a newline-delimited file; immutable afterwards.
///
/// The filter is monotone: an excluded user is never added, updated, or
/// removed, and existing access they hold downstream is preserved during
/// differential sync.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    usernames: HashSet<String>,
}

impl ExclusionList {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_lines(&raw))
    }

    pub fn from_lines(raw: &str) -> Self {
        let usernames = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { usernames }
    }

    pub fn from_usernames<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            usernames: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.usernames.contains(username)
    }

    pub fn len(&self) -> usize {
        self.usernames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usernames.is_empty()
    }
}
