//! Human-readable dataset references: `username/name[@path]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::BlockId;

/// A reference to a dataset, optionally pinned to one version path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub username: String,
    pub name: String,
    pub path: Option<BlockId>,
}

impl Ref {
    pub fn new(username: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: name.into(),
            path: None,
        }
    }

    /// Pin to a version path.
    pub fn at(mut self, path: BlockId) -> Self {
        self.path = Some(path);
        self
    }

    /// `username/name` without the path.
    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }

    pub fn is_pinned(&self) -> bool {
        self.path.is_some()
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

impl FromStr for Ref {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidRef {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (alias, path) = match s.split_once('@') {
            Some((alias, path)) => {
                let id: BlockId = path.parse().map_err(|_| invalid("bad path"))?;
                (alias, Some(id))
            }
            None => (s, None),
        };

        let (username, name) = alias
            .split_once('/')
            .ok_or_else(|| invalid("expected username/name"))?;
        if !valid_segment(username) {
            return Err(invalid("bad username"));
        }
        if !valid_segment(name) {
            return Err(invalid("bad dataset name"));
        }

        Ok(Self {
            username: username.to_string(),
            name: name.to_string(),
            path,
        })
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.name)?;
        if let Some(path) = &self.path {
            write!(f, "@{}", path.to_path())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let r: Ref = "alice/cities".parse().unwrap();
        assert_eq!(r, Ref::new("alice", "cities"));
        assert_eq!(r.to_string(), "alice/cities");
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_parse_with_path() {
        let path = BlockId::of(b"root");
        let r: Ref = format!("alice/cities@{}", path.to_path()).parse().unwrap();
        assert_eq!(r.path, Some(path));
        assert_eq!(r.to_string().parse::<Ref>().unwrap(), r);

        let bare_hex: Ref = format!("alice/cities@{}", path.to_hex()).parse().unwrap();
        assert_eq!(bare_hex, r);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["alice", "/cities", "alice/", "al ice/cities", "alice/cities@nope", "a/b/c"] {
            assert!(bad.parse::<Ref>().is_err(), "{} should not parse", bad);
        }
    }
}
