//! Logical resource paths.
//!
//! A logical path looks like `/<selector>/<relative>`. The first segment
//! picks the backend, the remainder is handed to that backend. This module
//! is the only place where that split happens.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid resource path `{path}`: {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: &'static str,
}

/// A parsed logical path.
///
/// Invariants:
/// - `selector` never contains `/`.
/// - `relative` has no leading `/`, no empty, `.` or `..` segments, and
///   keeps a trailing `/` only when the caller addressed a container.
/// - an empty `relative` addresses the backend root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    selector: String,
    relative: String,
}

impl ResourcePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let invalid = |reason| PathError {
            path: raw.to_string(),
            reason,
        };

        if raw.bytes().any(|b| b == b'\0' || b == b'\\') {
            return Err(invalid("contains NUL or backslash"));
        }

        let trimmed = raw.trim_start_matches('/');
        let (selector, rest) = match trimmed.split_once('/') {
            Some((selector, rest)) => (selector, rest),
            None => (trimmed, ""),
        };

        let trailing = rest.ends_with('/');
        let mut segments = Vec::new();
        for segment in rest.split('/') {
            match segment {
                "" => continue,
                "." | ".." => return Err(invalid("dot segments are not allowed")),
                s => segments.push(s),
            }
        }
        if selector == "." || selector == ".." {
            return Err(invalid("dot segments are not allowed"));
        }

        let mut relative = segments.join("/");
        if trailing && !relative.is_empty() {
            relative.push('/');
        }

        Ok(Self {
            selector: selector.to_string(),
            relative,
        })
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Relative path without a trailing container slash.
    pub fn relative_trimmed(&self) -> &str {
        self.relative.trim_end_matches('/')
    }

    pub fn is_backend_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// Name of the last segment, or the selector for a backend root.
    pub fn name(&self) -> &str {
        match self.relative_trimmed().rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => &self.selector,
        }
    }

    /// Logical path of a child entry of this (container) path.
    pub fn child(&self, name: &str) -> Self {
        let relative = match self.relative_trimmed() {
            "" => name.to_string(),
            parent => format!("{}/{}", parent, name),
        };
        Self {
            selector: self.selector.clone(),
            relative,
        }
    }

    /// `selector/relative`, with a trailing `/` when `container` is set.
    pub fn logical(&self, container: bool) -> String {
        let mut out = if self.selector.is_empty() {
            String::from("/")
        } else {
            let mut s = self.selector.clone();
            if !self.relative_trimmed().is_empty() {
                s.push('/');
                s.push_str(self.relative_trimmed());
            }
            s
        };
        if container && !out.ends_with('/') {
            out.push('/');
        }
        out
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.logical(self.relative.ends_with('/')))
    }
}
