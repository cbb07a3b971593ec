//! RootStorage - the read-only view that lists every registered backend as
//! a container under `/`. It answers `Stat` and nothing else.

use crate::{
    models::{
        capabilities::{Capabilities, Operation},
        checksum::Checksum,
        chunk::ChunkPathInfo,
        identity::Identity,
        metadata::{CONTAINER_MIME_TYPE, MetaData},
        path::ResourcePath,
    },
    services::storage::{CommitOutcome, ObjectReader, Storage, StorageError, StorageResult},
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Selector owning the root path `/`.
pub const ROOT_SELECTOR: &str = "";

const ROOT_PERMISSIONS: u32 = 0o555;

pub struct RootStorage {
    selectors: Vec<String>,
}

impl RootStorage {
    /// `selectors` are the backends to expose; they are listed sorted by name.
    pub fn new(selectors: impl IntoIterator<Item = String>) -> Self {
        let mut selectors: Vec<String> = selectors
            .into_iter()
            .filter(|s| s != ROOT_SELECTOR)
            .collect();
        selectors.sort();
        selectors.dedup();
        Self { selectors }
    }

    /// Synthetic container entry. Timestamp and ETag are regenerated on
    /// every call.
    fn container(path: String) -> MetaData {
        MetaData {
            id: path.clone(),
            path,
            size: 0,
            is_container: true,
            mime_type: CONTAINER_MIME_TYPE.to_string(),
            checksum: String::new(),
            checksum_type: String::new(),
            modified: Utc::now(),
            etag: Uuid::new_v4().simple().to_string(),
            permissions: ROOT_PERMISSIONS,
            children: None,
            extra: BTreeMap::new(),
        }
    }

    fn unsupported(operation: Operation) -> StorageError {
        StorageError::NotImplemented {
            operation,
            selector: ROOT_SELECTOR.to_string(),
        }
    }
}

// Everything except `stat` is unreachable through the dispatcher because the
// capability flags are false; direct callers get `NotImplemented`.
#[async_trait]
impl Storage for RootStorage {
    fn prefix(&self) -> &str {
        ROOT_SELECTOR
    }

    async fn capabilities(&self, _identity: &Identity) -> Capabilities {
        Capabilities {
            stat: true,
            ..Default::default()
        }
    }

    async fn create_user_home_directory(&self, _identity: &Identity) -> StorageResult<()> {
        Err(Self::unsupported(Operation::CreateUserHomeDirectory))
    }

    async fn put_object(
        &self,
        _identity: &Identity,
        _path: &ResourcePath,
        _reader: ObjectReader,
        _size: u64,
        _checksum: &Checksum,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::PutObject))
    }

    async fn start_chunked_upload(
        &self,
        _identity: &Identity,
        _path: &ResourcePath,
    ) -> StorageResult<String> {
        Err(Self::unsupported(Operation::PutObjectInChunks))
    }

    async fn put_chunked_object(
        &self,
        _identity: &Identity,
        _reader: ObjectReader,
        _size: u64,
        _start: u64,
        _chunk: &ChunkPathInfo,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::PutObjectInChunks))
    }

    async fn commit_chunked_upload(
        &self,
        _identity: &Identity,
        _chunk: &ChunkPathInfo,
        _checksum: &Checksum,
    ) -> StorageResult<CommitOutcome> {
        Err(Self::unsupported(Operation::PutObjectInChunks))
    }

    async fn get_object(
        &self,
        _identity: &Identity,
        _path: &ResourcePath,
    ) -> StorageResult<ObjectReader> {
        Err(Self::unsupported(Operation::GetObject))
    }

    async fn stat(
        &self,
        _identity: &Identity,
        path: &ResourcePath,
        children: bool,
    ) -> StorageResult<MetaData> {
        if path.selector() != ROOT_SELECTOR || !path.is_backend_root() {
            return Err(StorageError::NotExist(path.to_string()));
        }
        let mut md = Self::container("/".to_string());
        if children {
            md.children = Some(
                self.selectors
                    .iter()
                    .map(|selector| Self::container(format!("{}/", selector)))
                    .collect(),
            );
        }
        Ok(md)
    }

    async fn remove(
        &self,
        _identity: &Identity,
        _path: &ResourcePath,
        _recursive: bool,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::Remove))
    }

    async fn create_container(
        &self,
        _identity: &Identity,
        _path: &ResourcePath,
        _recursive: bool,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::CreateContainer))
    }

    async fn copy(
        &self,
        _identity: &Identity,
        _from: &ResourcePath,
        _to: &ResourcePath,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::Copy))
    }

    async fn rename(
        &self,
        _identity: &Identity,
        _from: &ResourcePath,
        _to: &ResourcePath,
    ) -> StorageResult<()> {
        Err(Self::unsupported(Operation::Rename))
    }
}
