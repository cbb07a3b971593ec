//! The storage contract every backend implements, and its error taxonomy.

use crate::models::{
    capabilities::{Capabilities, Operation},
    checksum::Checksum,
    chunk::{ChunkPathError, ChunkPathInfo},
    identity::Identity,
    metadata::MetaData,
    path::{PathError, ResourcePath},
};
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Byte stream handed to or returned from a backend. The receiver owns it
/// and is responsible for dropping it.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{0}` does not exist")]
    NotExist(String),
    #[error("`{0}` already exists")]
    AlreadyExist(String),
    #[error("bad checksum: expected `{expected}`, computed `{computed}`")]
    BadChecksum {
        expected: Checksum,
        computed: Checksum,
    },
    #[error("operation {operation} is not implemented by backend `{selector}`")]
    NotImplemented {
        operation: Operation,
        selector: String,
    },
    #[error("{operation} from `{from}` to `{to}` crosses backends and is not enabled")]
    ThirdPartyNotEnabled {
        operation: Operation,
        from: String,
        to: String,
    },
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error(transparent)]
    InvalidChunkPath(#[from] ChunkPathError),
    #[error("checksum algorithm `{0}` is not supported")]
    UnsupportedChecksum(String),
    #[error("container `{0}` is not empty")]
    ContainerNotEmpty(String),
    #[error("expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("backend selector `{0}` is registered twice")]
    DuplicateSelector(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Translate an OS error into the taxonomy, naming the logical path
    /// rather than the physical one.
    pub fn from_io(err: io::Error, path: &ResourcePath) -> Self {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotExist(path.to_string()),
            ErrorKind::AlreadyExists => StorageError::AlreadyExist(path.to_string()),
            ErrorKind::DirectoryNotEmpty => StorageError::ContainerNotEmpty(path.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

/// Result of asking a backend to finish a chunked upload.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Not every chunk has arrived yet.
    Pending { received: u64, total: u64 },
    /// Another commit already claimed this transfer.
    Busy,
    /// The object is assembled, verified and visible under its final path.
    Committed(MetaData),
}

/// A storage backend addressed by its selector.
///
/// Every `path` argument has already been routed here by the dispatcher,
/// and the operation has passed the capability gate. Backends do not
/// re-check their own flags.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend selector, the first segment of every logical path it owns.
    fn prefix(&self) -> &str;

    async fn capabilities(&self, identity: &Identity) -> Capabilities;

    async fn create_user_home_directory(&self, identity: &Identity) -> StorageResult<()>;

    async fn put_object(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        reader: ObjectReader,
        size: u64,
        checksum: &Checksum,
    ) -> StorageResult<()>;

    /// Begin a chunked upload of `path` and return a fresh transfer ID.
    async fn start_chunked_upload(
        &self,
        identity: &Identity,
        path: &ResourcePath,
    ) -> StorageResult<String>;

    /// Stage one chunk, starting `start` bytes into that chunk.
    async fn put_chunked_object(
        &self,
        identity: &Identity,
        reader: ObjectReader,
        size: u64,
        start: u64,
        chunk: &ChunkPathInfo,
    ) -> StorageResult<()>;

    async fn commit_chunked_upload(
        &self,
        identity: &Identity,
        chunk: &ChunkPathInfo,
        checksum: &Checksum,
    ) -> StorageResult<CommitOutcome>;

    async fn get_object(&self, identity: &Identity, path: &ResourcePath)
    -> StorageResult<ObjectReader>;

    async fn stat(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        children: bool,
    ) -> StorageResult<MetaData>;

    async fn remove(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        recursive: bool,
    ) -> StorageResult<()>;

    async fn create_container(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        recursive: bool,
    ) -> StorageResult<()>;

    async fn copy(
        &self,
        identity: &Identity,
        from: &ResourcePath,
        to: &ResourcePath,
    ) -> StorageResult<()>;

    async fn rename(
        &self,
        identity: &Identity,
        from: &ResourcePath,
        to: &ResourcePath,
    ) -> StorageResult<()>;
}
