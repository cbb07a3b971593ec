//! Staging keys for chunked uploads.
//!
//! A chunk is addressed as
//! `<resource_path>-chunking-<transfer_id>-<total_chunks>-<current_chunk>`.
//! The key format is shared with clients and must stay bit-exact.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const CHUNKING_MARKER: &str = "-chunking-";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid chunk path `{key}`: {reason}")]
pub struct ChunkPathError {
    pub key: String,
    pub reason: &'static str,
}

/// Decoded form of a chunk staging key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkPathInfo {
    pub resource_path: String,
    pub transfer_id: String,
    pub total_chunks: u64,
    pub current_chunk: u64,
}

impl ChunkPathInfo {
    pub fn new(
        resource_path: impl Into<String>,
        transfer_id: impl Into<String>,
        total_chunks: u64,
        current_chunk: u64,
    ) -> Self {
        Self {
            resource_path: resource_path.into(),
            transfer_id: transfer_id.into(),
            total_chunks,
            current_chunk,
        }
    }
}

impl fmt::Display for ChunkPathInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}-{}-{}",
            self.resource_path,
            CHUNKING_MARKER,
            self.transfer_id,
            self.total_chunks,
            self.current_chunk
        )
    }
}

impl FromStr for ChunkPathInfo {
    type Err = ChunkPathError;

    /// The tail is read right to left so resource paths with hyphens and
    /// transfer IDs with hyphens or underscores both survive.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ChunkPathError {
            key: key.to_string(),
            reason,
        };

        let (resource_path, tail) = key
            .rsplit_once(CHUNKING_MARKER)
            .ok_or_else(|| invalid("missing -chunking- marker"))?;
        if resource_path.is_empty() {
            return Err(invalid("empty resource path"));
        }

        let mut fields = tail.rsplitn(3, '-');
        let current = fields.next().ok_or_else(|| invalid("missing chunk index"))?;
        let total = fields.next().ok_or_else(|| invalid("missing chunk count"))?;
        let transfer_id = fields.next().ok_or_else(|| invalid("missing transfer id"))?;
        if transfer_id.is_empty() {
            return Err(invalid("empty transfer id"));
        }

        let total_chunks = parse_decimal(total).ok_or_else(|| invalid("chunk count is not a number"))?;
        let current_chunk =
            parse_decimal(current).ok_or_else(|| invalid("chunk index is not a number"))?;
        if total_chunks == 0 {
            return Err(invalid("chunk count must be positive"));
        }
        if current_chunk >= total_chunks {
            return Err(invalid("chunk index out of range"));
        }

        Ok(Self::new(resource_path, transfer_id, total_chunks, current_chunk))
    }
}

// `u64::from_str` accepts a leading `+`, which the key format does not.
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
