use std::fmt;

use crate::errors::{FsError, FsResult};

pub const SEPARATOR: char = '/';
pub const ROOT: &str = "/";

/// Absolute, slash-separated path with no `.`, `..` or empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    path: String,
}

impl FsPath {
    pub fn root() -> Self {
        Self {
            path: ROOT.to_string(),
        }
    }

    pub fn new(raw: &str) -> Self {
        Self {
            path: normalize(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        self.path.as_str()
    }

    pub fn is_root(&self) -> bool {
        self.path == ROOT
    }

    /// Final segment; empty only for the root.
    pub fn name(&self) -> &str {
        match self.path.rfind(SEPARATOR) {
            Some(idx) => &self.path[idx + 1..],
            None => "",
        }
    }

    pub fn parent_path(&self) -> String {
        match self.path.rfind(SEPARATOR) {
            Some(0) | None => ROOT.to_string(),
            Some(idx) => self.path[..idx].to_string(),
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split(SEPARATOR).filter(|segment| !segment.is_empty())
    }

    pub fn set_path(&mut self, raw: &str) {
        self.path = normalize(raw);
    }

    pub fn set_name(&mut self, name: &str) -> FsResult<()> {
        validate_name("set_name", name)?;
        let parent = self.parent_path();
        self.path = normalize(&format!("{parent}/{name}"));
        Ok(())
    }

    pub fn add_path(&mut self, relative: &str) -> FsResult<()> {
        if relative.starts_with(SEPARATOR) {
            return Err(FsError::invalid_argument(
                "add_path",
                relative,
                "segment must be relative",
            ));
        }
        self.path = normalize(&format!("{}/{relative}", self.path));
        Ok(())
    }

    /// Moves to the parent directory; the root stays where it is.
    pub fn parent(&mut self) {
        self.path = self.parent_path();
    }

    /// Path of a direct child, without touching `self`.
    pub fn child(&self, name: &str) -> String {
        if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path)
        }
    }
}

impl Default for FsPath {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path.as_str())
    }
}

/// Normalizes `raw` into an absolute path. `..` above the root is dropped.
pub fn normalize(raw: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for segment in raw.split(SEPARATOR) {
        match segment {
            "" | "." => continue,
            ".." => {
                kept.pop();
            }
            other => kept.push(other),
        }
    }

    if kept.is_empty() {
        return ROOT.to_string();
    }

    let mut path = String::with_capacity(raw.len() + 1);
    for segment in kept {
        path.push(SEPARATOR);
        path.push_str(segment);
    }
    path
}

pub fn validate_name(operation: &'static str, name: &str) -> FsResult<()> {
    if name.contains(SEPARATOR) {
        return Err(FsError::invalid_argument(
            operation,
            name,
            "name must not contain a separator",
        ));
    }
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::invalid_argument(
            operation,
            name,
            "name must denote a single entry",
        ));
    }
    Ok(())
}
