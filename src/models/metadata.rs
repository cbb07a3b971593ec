//! Resource metadata returned by `Stat`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MIME type reported for every container.
pub const CONTAINER_MIME_TYPE: &str = "inode/directory";

/// MIME type reported when the extension is unknown.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Snapshot of a resource, computed from the backend's physical state at
/// call time. Never cached, never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetaData {
    /// Backend-stable identifier (inode number for the local backend).
    pub id: String,

    /// Logical path including the backend selector. Containers end in `/`.
    pub path: String,

    pub size: u64,

    pub is_container: bool,

    pub mime_type: String,

    /// Empty unless the backend sends checksums.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub checksum: String,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub checksum_type: String,

    pub modified: DateTime<Utc>,

    pub etag: String,

    /// Unix mode bits.
    pub permissions: u32,

    /// One level of entries, only for a container stat'ed with children.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub children: Option<Vec<MetaData>>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, String>,
}

/// Best-effort MIME type from a file name's extension.
pub fn mime_type_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return DEFAULT_MIME_TYPE,
    };
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "js" => "application/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "odt" => "application/vnd.oasis.opendocument.text",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}
