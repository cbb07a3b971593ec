//! Dispatcher - the single entry point for storage operations.
//!
//! Every call goes through the same steps: parse the logical path, pick the
//! backend registered under its selector, ask that backend for its
//! capabilities, refuse the call if the matching flag is off, and only then
//! forward it. Copy and rename additionally refuse to cross backends unless
//! the source backend advertises third-party support.

use crate::{
    models::{
        capabilities::{Capabilities, Operation},
        checksum::Checksum,
        chunk::ChunkPathInfo,
        identity::Identity,
        metadata::MetaData,
        path::ResourcePath,
    },
    services::{
        root::RootStorage,
        storage::{CommitOutcome, ObjectReader, Storage, StorageError, StorageResult},
    },
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Registry of backends keyed by selector. Populated once at startup and
/// immutable afterwards.
pub struct Dispatcher {
    storages: HashMap<String, Arc<dyn Storage>>,
}

impl Dispatcher {
    pub fn new(storages: impl IntoIterator<Item = Arc<dyn Storage>>) -> StorageResult<Self> {
        let mut map: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        for storage in storages {
            let selector = storage.prefix().to_string();
            if map.contains_key(&selector) {
                return Err(StorageError::DuplicateSelector(selector));
            }
            map.insert(selector, storage);
        }
        Ok(Self { storages: map })
    }

    /// Register `backends` plus a root aggregator listing exactly their
    /// selectors.
    pub fn with_root(backends: Vec<Arc<dyn Storage>>) -> StorageResult<Self> {
        let root = RootStorage::new(backends.iter().map(|s| s.prefix().to_string()));
        Self::new(
            backends
                .into_iter()
                .chain(std::iter::once(Arc::new(root) as Arc<dyn Storage>)),
        )
    }

    /// All registered backends, ordered by selector.
    pub fn get_all_storages(&self) -> Vec<Arc<dyn Storage>> {
        let mut all: Vec<_> = self.storages.values().cloned().collect();
        all.sort_by(|a, b| a.prefix().cmp(b.prefix()));
        all
    }

    pub fn get_storage(&self, selector: &str) -> StorageResult<Arc<dyn Storage>> {
        self.storages
            .get(selector)
            .cloned()
            .ok_or_else(|| StorageError::NotExist(selector.to_string()))
    }

    fn resolve(&self, raw: &str) -> StorageResult<(Arc<dyn Storage>, ResourcePath)> {
        let path = ResourcePath::parse(raw)?;
        let storage = self.get_storage(path.selector())?;
        Ok((storage, path))
    }

    fn resolve_chunk(&self, chunk_id: &str) -> StorageResult<(Arc<dyn Storage>, ChunkPathInfo)> {
        let chunk: ChunkPathInfo = chunk_id.parse()?;
        let path = ResourcePath::parse(&chunk.resource_path)?;
        let storage = self.get_storage(path.selector())?;
        Ok((storage, chunk))
    }

    /// Capability gate. Runs before the backend method is entered.
    async fn gate(
        &self,
        storage: &dyn Storage,
        identity: &Identity,
        operation: Operation,
    ) -> StorageResult<Capabilities> {
        let caps = storage.capabilities(identity).await;
        if !caps.allows(operation) {
            debug!(
                "rejecting {} on backend `{}`: capability not advertised",
                operation,
                storage.prefix()
            );
            return Err(StorageError::NotImplemented {
                operation,
                selector: storage.prefix().to_string(),
            });
        }
        Ok(caps)
    }

    pub async fn capabilities(&self, identity: &Identity, path: &str) -> StorageResult<Capabilities> {
        let (storage, _) = self.resolve(path)?;
        Ok(storage.capabilities(identity).await)
    }

    pub async fn dispatch_create_user_home_directory(
        &self,
        identity: &Identity,
        selector: &str,
    ) -> StorageResult<()> {
        let storage = self.get_storage(selector)?;
        self.gate(&*storage, identity, Operation::CreateUserHomeDirectory)
            .await?;
        storage.create_user_home_directory(identity).await
    }

    /// Create the identity's home on every backend that supports homes.
    pub async fn provision_homes(&self, identity: &Identity) -> StorageResult<()> {
        for storage in self.get_all_storages() {
            match self
                .dispatch_create_user_home_directory(identity, storage.prefix())
                .await
            {
                Ok(()) | Err(StorageError::NotImplemented { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn dispatch_put_object(
        &self,
        identity: &Identity,
        path: &str,
        reader: ObjectReader,
        size: u64,
        checksum: &Checksum,
    ) -> StorageResult<()> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::PutObject).await?;
        storage
            .put_object(identity, &path, reader, size, checksum)
            .await
    }

    pub async fn dispatch_start_chunked_upload(
        &self,
        identity: &Identity,
        path: &str,
    ) -> StorageResult<String> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::PutObjectInChunks)
            .await?;
        storage.start_chunked_upload(identity, &path).await
    }

    pub async fn dispatch_put_chunked_object(
        &self,
        identity: &Identity,
        reader: ObjectReader,
        size: u64,
        start: u64,
        chunk_id: &str,
    ) -> StorageResult<()> {
        let (storage, chunk) = self.resolve_chunk(chunk_id)?;
        self.gate(&*storage, identity, Operation::PutObjectInChunks)
            .await?;
        storage
            .put_chunked_object(identity, reader, size, start, &chunk)
            .await
    }

    pub async fn dispatch_commit_chunked_upload(
        &self,
        identity: &Identity,
        chunk_id: &str,
        checksum: &Checksum,
    ) -> StorageResult<CommitOutcome> {
        let (storage, chunk) = self.resolve_chunk(chunk_id)?;
        self.gate(&*storage, identity, Operation::PutObjectInChunks)
            .await?;
        storage
            .commit_chunked_upload(identity, &chunk, checksum)
            .await
    }

    pub async fn dispatch_get_object(
        &self,
        identity: &Identity,
        path: &str,
    ) -> StorageResult<ObjectReader> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::GetObject).await?;
        storage.get_object(identity, &path).await
    }

    pub async fn dispatch_stat(
        &self,
        identity: &Identity,
        path: &str,
        children: bool,
    ) -> StorageResult<MetaData> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::Stat).await?;
        storage.stat(identity, &path, children).await
    }

    pub async fn dispatch_remove(
        &self,
        identity: &Identity,
        path: &str,
        recursive: bool,
    ) -> StorageResult<()> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::Remove).await?;
        storage.remove(identity, &path, recursive).await
    }

    pub async fn dispatch_create_container(
        &self,
        identity: &Identity,
        path: &str,
        recursive: bool,
    ) -> StorageResult<()> {
        let (storage, path) = self.resolve(path)?;
        self.gate(&*storage, identity, Operation::CreateContainer)
            .await?;
        storage.create_container(identity, &path, recursive).await
    }

    /// Resolve both ends of a copy or rename, gate on `operation`, and refuse
    /// cross-backend moves unless `third_party` is advertised by the source.
    async fn resolve_transfer(
        &self,
        identity: &Identity,
        from: &str,
        to: &str,
        operation: Operation,
        third_party: Operation,
    ) -> StorageResult<(Arc<dyn Storage>, ResourcePath, ResourcePath)> {
        let (source, from_path) = self.resolve(from)?;
        let (_, to_path) = self.resolve(to)?;
        let caps = self.gate(&*source, identity, operation).await?;
        if from_path.selector() != to_path.selector() && !caps.allows(third_party) {
            debug!(
                "rejecting {} across backends `{}` -> `{}`",
                operation,
                from_path.selector(),
                to_path.selector()
            );
            return Err(StorageError::ThirdPartyNotEnabled {
                operation,
                from: from_path.to_string(),
                to: to_path.to_string(),
            });
        }
        Ok((source, from_path, to_path))
    }

    pub async fn dispatch_copy(&self, identity: &Identity, from: &str, to: &str) -> StorageResult<()> {
        let (storage, from, to) = self
            .resolve_transfer(identity, from, to, Operation::Copy, Operation::ThirdPartyCopy)
            .await?;
        storage.copy(identity, &from, &to).await
    }

    pub async fn dispatch_rename(
        &self,
        identity: &Identity,
        from: &str,
        to: &str,
    ) -> StorageResult<()> {
        let (storage, from, to) = self
            .resolve_transfer(
                identity,
                from,
                to,
                Operation::Rename,
                Operation::ThirdPartyRename,
            )
            .await?;
        storage.rename(identity, &from, &to).await
    }
}
