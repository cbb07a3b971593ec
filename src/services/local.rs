//! src/services/local.rs
//!
//! LocalStorage - a backend over a plain directory tree. Every user gets a
//! home under `data_dir/{namespace}`. Writes never land in place: bytes are
//! staged under `tmp_dir/staging` and become visible only through a single
//! rename, so readers see either the old object or the new one. Chunked
//! uploads are staged under `tmp_dir/chunks/{transfer}/{index}`.

use crate::{
    models::{
        capabilities::Capabilities,
        checksum::Checksum,
        chunk::{CHUNKING_MARKER, ChunkPathInfo},
        identity::Identity,
        metadata::{CONTAINER_MIME_TYPE, MetaData, mime_type_for},
        path::{PathError, ResourcePath},
    },
    services::storage::{CommitOutcome, ObjectReader, Storage, StorageError, StorageResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::Context;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHECKSUM_ALGORITHM: &str = "md5";
const HOME_DIR_MODE: u32 = 0o755;
const STAGING_DIR: &str = "staging";
const CHUNKS_DIR: &str = "chunks";
const CLAIMED_MARKER: &str = ".claimed-";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Construction-time settings for a [`LocalStorage`].
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Backend selector.
    pub prefix: String,
    /// Parent of all user homes.
    pub data_dir: PathBuf,
    /// Staging area. Must share a filesystem with `data_dir`.
    pub tmp_dir: PathBuf,
    pub verify_client_checksum: bool,
    pub send_checksum: bool,
}

impl LocalConfig {
    pub fn new(
        prefix: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            data_dir: data_dir.into(),
            tmp_dir: tmp_dir.into(),
            verify_client_checksum: true,
            send_checksum: false,
        }
    }
}

#[derive(Debug)]
pub struct LocalStorage {
    config: LocalConfig,
}

impl LocalStorage {
    /// Create the backend, making sure its data and staging directories exist.
    pub async fn open(config: LocalConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        fs::create_dir_all(config.tmp_dir.join(STAGING_DIR)).await?;
        fs::create_dir_all(config.tmp_dir.join(CHUNKS_DIR)).await?;
        debug!(
            "local backend `{}` at {} (staging in {})",
            config.prefix,
            config.data_dir.display(),
            config.tmp_dir.display()
        );
        Ok(Self { config })
    }

    fn staging_dir(&self) -> PathBuf {
        self.config.tmp_dir.join(STAGING_DIR)
    }

    fn chunks_dir(&self) -> PathBuf {
        self.config.tmp_dir.join(CHUNKS_DIR)
    }

    /// A fresh, unique name inside the staging area.
    fn staging_path(&self) -> PathBuf {
        self.staging_dir().join(Uuid::new_v4().to_string())
    }

    fn home(&self, identity: &Identity) -> StorageResult<PathBuf> {
        if !identity.has_valid_namespace() {
            return Err(StorageError::InvalidPath(PathError {
                path: identity.namespace().to_string(),
                reason: "identity namespace is not a valid directory name",
            }));
        }
        Ok(self.config.data_dir.join(identity.namespace()))
    }

    /// Physical location of a logical path inside the identity's home.
    fn resolve(&self, identity: &Identity, path: &ResourcePath) -> StorageResult<PathBuf> {
        let home = self.home(identity)?;
        Ok(match path.relative_trimmed() {
            "" => home,
            relative => home.join(relative),
        })
    }

    fn reject_backend_root(path: &ResourcePath, reason: &'static str) -> StorageResult<()> {
        if path.is_backend_root() {
            return Err(StorageError::InvalidPath(PathError {
                path: path.to_string(),
                reason,
            }));
        }
        Ok(())
    }

    /// Objects are never written under a container-style path (`dir/`).
    fn reject_container_target(path: &ResourcePath) -> StorageResult<()> {
        if path.relative().ends_with('/') {
            return Err(StorageError::InvalidPath(PathError {
                path: path.to_string(),
                reason: "object destination must not end with `/`",
            }));
        }
        Ok(())
    }

    /// Whether `checksum` must be verified. Fails early for algorithms this
    /// backend cannot compute, before any bytes are staged.
    fn verification_requested(&self, checksum: &Checksum) -> StorageResult<bool> {
        if !checksum.is_requested() || !self.config.verify_client_checksum {
            return Ok(false);
        }
        if checksum.algorithm != CHECKSUM_ALGORITHM {
            return Err(StorageError::UnsupportedChecksum(checksum.algorithm.clone()));
        }
        Ok(true)
    }

    fn check_digest(expected: &Checksum, digest: md5::Digest) -> StorageResult<()> {
        let computed = Checksum::new(CHECKSUM_ALGORITHM, format!("{:x}", digest));
        if expected.matches(&computed) {
            Ok(())
        } else {
            Err(StorageError::BadChecksum {
                expected: expected.clone(),
                computed,
            })
        }
    }

    /// Stream exactly `size` bytes into a new staging file.
    ///
    /// On any error the staging file is removed before returning.
    async fn stage_stream(
        &self,
        mut reader: ObjectReader,
        size: u64,
        hash: bool,
    ) -> StorageResult<(PathBuf, Option<md5::Digest>)> {
        let tmp_path = self.staging_path();
        let mut file = File::create(&tmp_path).await?;
        let mut digest = hash.then(Context::new);

        let result = async {
            copy_exact(&mut reader, &mut file, size, digest.as_mut()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(err) = result {
            discard(&tmp_path).await;
            return Err(err);
        }
        debug!("staged {} bytes at {}", size, tmp_path.display());
        Ok((tmp_path, digest.map(Context::compute)))
    }

    /// Atomically move a staged file or tree onto `dest`.
    ///
    /// The staged artifact is removed if the rename fails.
    async fn publish(&self, staged: &Path, dest: &Path, path: &ResourcePath) -> StorageResult<()> {
        let staged_is_dir = fs::symlink_metadata(staged).await?.is_dir();
        let conflict = match fs::symlink_metadata(dest).await {
            Ok(existing) => existing.is_dir() || staged_is_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                discard(staged).await;
                return Err(StorageError::from_io(err, path));
            }
        };
        if conflict {
            discard(staged).await;
            return Err(StorageError::AlreadyExist(path.to_string()));
        }

        if let Err(err) = fs::rename(staged, dest).await {
            discard(staged).await;
            return Err(StorageError::from_io(err, path));
        }
        debug!("published {} -> {}", staged.display(), dest.display());
        Ok(())
    }

    fn to_metadata(&self, path: &ResourcePath, meta: &std::fs::Metadata) -> MetaData {
        let is_container = meta.is_dir();
        let modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let nanos = modified.timestamp_nanos_opt().unwrap_or_default();
        let size = if is_container { 0 } else { meta.len() };

        MetaData {
            id: meta.ino().to_string(),
            path: path.logical(is_container),
            size,
            is_container,
            mime_type: if is_container {
                CONTAINER_MIME_TYPE.to_string()
            } else {
                mime_type_for(path.name()).to_string()
            },
            checksum: String::new(),
            checksum_type: String::new(),
            modified,
            etag: format!("{:x}-{:x}", nanos, size),
            permissions: meta.permissions().mode() & 0o7777,
            children: None,
            extra: BTreeMap::new(),
        }
    }

    /// Staging directory for all chunks of one transfer.
    ///
    /// The name is derived from owner, target and transfer, plus the chunk
    /// count so that keys disagreeing on the total never mix.
    fn transfer_dir(&self, identity: &Identity, chunk: &ChunkPathInfo) -> StorageResult<PathBuf> {
        self.home(identity)?;
        let key = md5::compute(format!(
            "{}\0{}\0{}",
            identity.namespace(),
            chunk.resource_path,
            chunk.transfer_id
        ));
        Ok(self
            .chunks_dir()
            .join(format!("{:x}-{}", key, chunk.total_chunks)))
    }

    /// Concatenate chunks `0..total` from `dir` into a new staging file.
    async fn assemble(
        &self,
        dir: &Path,
        total: u64,
        hash: bool,
    ) -> StorageResult<(PathBuf, Option<md5::Digest>)> {
        let tmp_path = self.staging_path();
        let mut out = File::create(&tmp_path).await?;
        let mut digest = hash.then(Context::new);

        let result = async {
            for index in 0..total {
                let mut part = File::open(dir.join(index.to_string())).await?;
                let len = part.metadata().await?.len();
                copy_exact(&mut part, &mut out, len, digest.as_mut()).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(err) = result {
            discard(&tmp_path).await;
            return Err(err);
        }
        Ok((tmp_path, digest.map(Context::compute)))
    }

    /// Remove chunk sets and staging leftovers not touched for `ttl`.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_abandoned(&self, ttl: Duration) -> StorageResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for area in [self.chunks_dir(), self.staging_dir()] {
            let mut entries = fs::read_dir(&area).await?;
            while let Some(entry) = entries.next_entry().await? {
                let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                if modified <= cutoff {
                    discard(&entry.path()).await;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(
                "swept {} abandoned staging entries from backend `{}`",
                removed, self.config.prefix
            );
        }
        Ok(removed)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn prefix(&self) -> &str {
        &self.config.prefix
    }

    async fn capabilities(&self, _identity: &Identity) -> Capabilities {
        Capabilities {
            put_object: true,
            put_object_in_chunks: true,
            get_object: true,
            stat: true,
            remove: true,
            create_container: true,
            copy: true,
            rename: true,
            third_party_copy: false,
            third_party_rename: false,
            verify_client_checksum: self.config.verify_client_checksum,
            send_checksum: self.config.send_checksum,
            create_user_home_directory: true,
            supported_checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
        }
    }

    async fn create_user_home_directory(&self, identity: &Identity) -> StorageResult<()> {
        let home = self.home(identity)?;
        if fs::try_exists(&home).await? {
            debug!("home {} already present", home.display());
            return Ok(());
        }
        fs::create_dir_all(&home).await?;
        fs::set_permissions(&home, std::fs::Permissions::from_mode(HOME_DIR_MODE)).await?;
        info!("created home directory {}", home.display());
        Ok(())
    }

    async fn put_object(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        reader: ObjectReader,
        size: u64,
        checksum: &Checksum,
    ) -> StorageResult<()> {
        Self::reject_backend_root(path, "cannot write over a backend root")?;
        Self::reject_container_target(path)?;
        let verify = self.verification_requested(checksum)?;
        let dest = self.resolve(identity, path)?;

        let (tmp_path, digest) = self.stage_stream(reader, size, verify).await?;
        if let Some(digest) = digest {
            if let Err(err) = Self::check_digest(checksum, digest) {
                warn!("discarding upload for {}: {}", path, err);
                discard(&tmp_path).await;
                return Err(err);
            }
        }
        self.publish(&tmp_path, &dest, path).await
    }

    async fn start_chunked_upload(
        &self,
        identity: &Identity,
        path: &ResourcePath,
    ) -> StorageResult<String> {
        self.home(identity)?;
        Self::reject_backend_root(path, "cannot upload over a backend root")?;
        Self::reject_container_target(path)?;
        if path.to_string().contains(CHUNKING_MARKER) {
            return Err(StorageError::InvalidPath(PathError {
                path: path.to_string(),
                reason: "resource paths must not contain -chunking-",
            }));
        }
        let transfer_id = Uuid::new_v4().simple().to_string();
        debug!("chunked upload {} started for {}", transfer_id, path);
        Ok(transfer_id)
    }

    async fn put_chunked_object(
        &self,
        identity: &Identity,
        mut reader: ObjectReader,
        size: u64,
        start: u64,
        chunk: &ChunkPathInfo,
    ) -> StorageResult<()> {
        let dir = self.transfer_dir(identity, chunk)?;
        fs::create_dir_all(&dir).await?;
        let target = dir.join(chunk.current_chunk.to_string());
        let tmp_path = self.staging_path();
        let mut file = File::create(&tmp_path).await?;

        let result = async {
            if start > 0 {
                let mut existing = File::open(&target).await.map_err(|err| match err.kind() {
                    ErrorKind::NotFound => StorageError::NotExist(chunk.to_string()),
                    _ => StorageError::Io(err),
                })?;
                copy_exact(&mut existing, &mut file, start, None).await?;
            }
            copy_exact(&mut reader, &mut file, size, None).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &target).await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(err) = result {
            discard(&tmp_path).await;
            return Err(err);
        }
        debug!(
            "staged chunk {}/{} of transfer {}",
            chunk.current_chunk + 1,
            chunk.total_chunks,
            chunk.transfer_id
        );
        Ok(())
    }

    async fn commit_chunked_upload(
        &self,
        identity: &Identity,
        chunk: &ChunkPathInfo,
        checksum: &Checksum,
    ) -> StorageResult<CommitOutcome> {
        let verify = self.verification_requested(checksum)?;
        let resource = ResourcePath::parse(&chunk.resource_path)?;
        Self::reject_container_target(&resource)?;
        let dest = self.resolve(identity, &resource)?;
        let dir = self.transfer_dir(identity, chunk)?;
        let total = chunk.total_chunks;

        let received = match count_chunks(&dir, total).await {
            Ok(received) => received,
            // Claimed (or finished) by another commit.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CommitOutcome::Busy),
            Err(err) => return Err(err.into()),
        };
        if received < total {
            return Ok(CommitOutcome::Pending { received, total });
        }

        let mut claimed = dir.clone().into_os_string();
        claimed.push(format!("{}{}", CLAIMED_MARKER, Uuid::new_v4().simple()));
        let claimed = PathBuf::from(claimed);
        match fs::rename(&dir, &claimed).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CommitOutcome::Busy),
            Err(err) => return Err(err.into()),
        }

        let assembled = self.assemble(&claimed, total, verify).await;
        let (tmp_path, digest) = match assembled {
            Ok(staged) => staged,
            Err(err) => {
                discard(&claimed).await;
                return Err(err);
            }
        };
        if let Some(digest) = digest {
            if let Err(err) = Self::check_digest(checksum, digest) {
                warn!(
                    "discarding chunked transfer {} for {}: {}",
                    chunk.transfer_id, resource, err
                );
                discard(&tmp_path).await;
                discard(&claimed).await;
                return Err(err);
            }
        }

        let published = self.publish(&tmp_path, &dest, &resource).await;
        discard(&claimed).await;
        published?;

        info!(
            "committed chunked transfer {} ({} chunks) to {}",
            chunk.transfer_id, total, resource
        );
        Ok(CommitOutcome::Committed(
            self.stat(identity, &resource, false).await?,
        ))
    }

    async fn get_object(
        &self,
        identity: &Identity,
        path: &ResourcePath,
    ) -> StorageResult<ObjectReader> {
        let full = self.resolve(identity, path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| StorageError::from_io(err, path))?;
        if meta.is_dir() {
            return Err(StorageError::InvalidPath(PathError {
                path: path.to_string(),
                reason: "cannot read a container",
            }));
        }
        let file = File::open(&full)
            .await
            .map_err(|err| StorageError::from_io(err, path))?;
        Ok(Box::new(file))
    }

    async fn stat(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        children: bool,
    ) -> StorageResult<MetaData> {
        let full = self.resolve(identity, path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| StorageError::from_io(err, path))?;
        let mut md = self.to_metadata(path, &meta);

        if meta.is_dir() && children {
            let mut entries = fs::read_dir(&full)
                .await
                .map_err(|err| StorageError::from_io(err, path))?;
            let mut kids = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    warn!("skipping non UTF-8 entry in {}", full.display());
                    continue;
                };
                let child_meta = match entry.metadata().await {
                    Ok(child_meta) => child_meta,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                kids.push(self.to_metadata(&path.child(&name), &child_meta));
            }
            kids.sort_by(|a, b| a.path.cmp(&b.path));
            md.children = Some(kids);
        }

        if !meta.is_dir() && self.config.send_checksum {
            let mut file = File::open(&full)
                .await
                .map_err(|err| StorageError::from_io(err, path))?;
            let mut digest = Context::new();
            let mut sink = tokio::io::sink();
            copy_exact(&mut file, &mut sink, meta.len(), Some(&mut digest)).await?;
            md.checksum = format!("{:x}", digest.compute());
            md.checksum_type = CHECKSUM_ALGORITHM.to_string();
        }

        Ok(md)
    }

    async fn remove(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        recursive: bool,
    ) -> StorageResult<()> {
        Self::reject_backend_root(path, "cannot remove a backend root")?;
        let full = self.resolve(identity, path)?;
        let meta = fs::symlink_metadata(&full)
            .await
            .map_err(|err| StorageError::from_io(err, path))?;

        let result = if !meta.is_dir() {
            fs::remove_file(&full).await
        } else if recursive {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_dir(&full).await
        };
        result.map_err(|err| StorageError::from_io(err, path))?;
        debug!("removed {}", full.display());
        Ok(())
    }

    async fn create_container(
        &self,
        identity: &Identity,
        path: &ResourcePath,
        recursive: bool,
    ) -> StorageResult<()> {
        let full = self.resolve(identity, path)?;
        let result = if recursive {
            fs::create_dir_all(&full).await
        } else {
            fs::create_dir(&full).await
        };
        result.map_err(|err| StorageError::from_io(err, path))
    }

    async fn copy(
        &self,
        identity: &Identity,
        from: &ResourcePath,
        to: &ResourcePath,
    ) -> StorageResult<()> {
        Self::reject_backend_root(from, "cannot copy a backend root")?;
        Self::reject_backend_root(to, "cannot copy over a backend root")?;
        if is_same_or_nested(from, to) {
            return Err(StorageError::InvalidPath(PathError {
                path: to.to_string(),
                reason: "destination is inside the source",
            }));
        }
        let src = self.resolve(identity, from)?;
        let dest = self.resolve(identity, to)?;
        let meta = fs::metadata(&src)
            .await
            .map_err(|err| StorageError::from_io(err, from))?;
        if !meta.is_dir() {
            Self::reject_container_target(to)?;
        }

        let staged = self.staging_path();
        let result = if meta.is_dir() {
            copy_tree(&src, &staged).await
        } else {
            fs::copy(&src, &staged).await.map(|_| ())
        };
        if let Err(err) = result {
            warn!("copy of {} to {} failed: {}", from, to, err);
            discard(&staged).await;
            return Err(StorageError::from_io(err, from));
        }
        self.publish(&staged, &dest, to).await
    }

    async fn rename(
        &self,
        identity: &Identity,
        from: &ResourcePath,
        to: &ResourcePath,
    ) -> StorageResult<()> {
        Self::reject_backend_root(from, "cannot rename a backend root")?;
        Self::reject_backend_root(to, "cannot rename over a backend root")?;
        if is_same_or_nested(from, to) {
            return Err(StorageError::InvalidPath(PathError {
                path: to.to_string(),
                reason: "destination is inside the source",
            }));
        }
        let src = self.resolve(identity, from)?;
        let dest = self.resolve(identity, to)?;
        let meta = fs::symlink_metadata(&src)
            .await
            .map_err(|err| StorageError::from_io(err, from))?;
        if !meta.is_dir() {
            Self::reject_container_target(to)?;
        }
        fs::rename(&src, &dest)
            .await
            .map_err(|err| StorageError::from_io(err, to))
    }
}

/// Copy exactly `size` bytes, feeding `digest` along the way.
async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    size: u64,
    mut digest: Option<&mut Context>,
) -> StorageResult<()>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut limited = reader.take(size);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = limited.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(digest) = digest.as_deref_mut() {
            digest.consume(&buf[..n]);
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    if copied != size {
        return Err(StorageError::SizeMismatch {
            expected: size,
            actual: copied,
        });
    }
    Ok(())
}

/// Replicate the tree at `src` into a new directory `dst`.
async fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir(dst).await?;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from_dir, to_dir)) = pending.pop() {
        let mut entries = fs::read_dir(&from_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to_dir.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                fs::create_dir(&target).await?;
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Number of chunk files named `0..total` present in `dir`.
async fn count_chunks(dir: &Path, total: u64) -> io::Result<u64> {
    let mut entries = fs::read_dir(dir).await?;
    let mut received = 0;
    while let Some(entry) = entries.next_entry().await? {
        let index = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok());
        if matches!(index, Some(i) if i < total) {
            received += 1;
        }
    }
    Ok(received)
}

fn is_same_or_nested(from: &ResourcePath, to: &ResourcePath) -> bool {
    let from = from.relative_trimmed();
    let to = to.relative_trimmed();
    to == from || to.starts_with(&format!("{}/", from))
}

/// Best-effort removal of a staging artifact, file or tree.
async fn discard(path: &Path) {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => debug!("discarded {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to discard {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Cursor, sync::Arc};
    use tempfile::TempDir;

    fn alice() -> Identity {
        Identity::new("alice")
    }

    fn path(raw: &str) -> ResourcePath {
        ResourcePath::parse(raw).unwrap()
    }

    fn reader(data: &[u8]) -> ObjectReader {
        Box::new(Cursor::new(data.to_vec()))
    }

    async fn setup_with(configure: impl FnOnce(&mut LocalConfig)) -> (LocalStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config =
            LocalConfig::new("local", dir.path().join("homes"), dir.path().join("tmp"));
        configure(&mut config);
        let storage = LocalStorage::open(config).await.unwrap();
        storage.create_user_home_directory(&alice()).await.unwrap();
        (storage, dir)
    }

    async fn setup() -> (LocalStorage, TempDir) {
        setup_with(|_| {}).await
    }

    async fn put(storage: &LocalStorage, raw: &str, data: &[u8]) {
        storage
            .put_object(&alice(), &path(raw), reader(data), data.len() as u64, &Checksum::none())
            .await
            .unwrap();
    }

    async fn read_all(storage: &LocalStorage, raw: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut r = storage.get_object(&alice(), &path(raw)).await.unwrap();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn staging_entries(storage: &LocalStorage) -> usize {
        let mut n = 0;
        let mut entries = fs::read_dir(storage.staging_dir()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn test_put_stat_remove() {
        let (storage, _dir) = setup().await;
        put(&storage, "local/a.txt", b"hello").await;

        let md = storage.stat(&alice(), &path("local/a.txt"), false).await.unwrap();
        assert_eq!(md.size, 5);
        assert!(!md.is_container);
        assert_eq!(md.path, "local/a.txt");
        assert_eq!(md.mime_type, "text/plain");
        assert_eq!(read_all(&storage, "local/a.txt").await, b"hello");

        storage.remove(&alice(), &path("local/a.txt"), false).await.unwrap();
        let err = storage.stat(&alice(), &path("local/a.txt"), false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotExist(_)));
    }

    #[tokio::test]
    async fn test_put_overwrites_and_changes_etag() {
        let (storage, _dir) = setup().await;
        put(&storage, "local/a.txt", b"one").await;
        let first = storage.stat(&alice(), &path("local/a.txt"), false).await.unwrap();
        put(&storage, "local/a.txt", b"second").await;
        let second = storage.stat(&alice(), &path("local/a.txt"), false).await.unwrap();
        assert_eq!(read_all(&storage, "local/a.txt").await, b"second");
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn test_put_with_matching_checksum() {
        let (storage, _dir) = setup().await;
        let checksum = Checksum::md5_of(b"hello");
        storage
            .put_object(&alice(), &path("local/a.txt"), reader(b"hello"), 5, &checksum)
            .await
            .unwrap();
        assert_eq!(read_all(&storage, "local/a.txt").await, b"hello");
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_bad_checksum_leaves_previous_object() {
        let (storage, _dir) = setup().await;
        put(&storage, "local/a.txt", b"original").await;

        let wrong = Checksum::md5_of(b"something else");
        let err = storage
            .put_object(&alice(), &path("local/a.txt"), reader(b"hello"), 5, &wrong)
            .await
            .unwrap_err();
        match err {
            StorageError::BadChecksum { expected, computed } => {
                assert_eq!(expected, wrong);
                assert_eq!(computed, Checksum::md5_of(b"hello"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(read_all(&storage, "local/a.txt").await, b"original");

        let err = storage
            .put_object(&alice(), &path("local/new.txt"), reader(b"hello"), 5, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BadChecksum { .. }));
        assert!(storage.stat(&alice(), &path("local/new.txt"), false).await.is_err());
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_checksum_ignored_when_verification_disabled() {
        let (storage, _dir) = setup_with(|c| c.verify_client_checksum = false).await;
        let wrong = Checksum::new("sha1", "nope");
        storage
            .put_object(&alice(), &path("local/a.txt"), reader(b"hello"), 5, &wrong)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_checksum_algorithm() {
        let (storage, _dir) = setup().await;
        let err = storage
            .put_object(
                &alice(),
                &path("local/a.txt"),
                reader(b"hello"),
                5,
                &Checksum::new("sha1", "aaaa"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedChecksum(alg) if alg == "sha1"));
    }

    #[tokio::test]
    async fn test_short_stream_is_discarded() {
        let (storage, _dir) = setup().await;
        let err = storage
            .put_object(&alice(), &path("local/a.txt"), reader(b"hel"), 5, &Checksum::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeMismatch {
                expected: 5,
                actual: 3
            }
        ));
        assert!(storage.stat(&alice(), &path("local/a.txt"), false).await.is_err());
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_put_into_missing_container() {
        let (storage, _dir) = setup().await;
        let err = storage
            .put_object(&alice(), &path("local/nope/a.txt"), reader(b"x"), 1, &Checksum::none())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotExist(_)));
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_object_writes_reject_container_paths() {
        let (storage, _dir) = setup().await;
        let err = storage
            .put_object(&alice(), &path("local/newdir/"), reader(b"x"), 1, &Checksum::none())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        assert!(storage.stat(&alice(), &path("local/newdir"), false).await.is_err());
        assert_eq!(staging_entries(&storage).await, 0);

        put(&storage, "local/a.txt", b"data").await;
        let err = storage
            .copy(&alice(), &path("local/a.txt"), &path("local/b/"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        let err = storage
            .rename(&alice(), &path("local/a.txt"), &path("local/b/"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        assert!(storage.stat(&alice(), &path("local/b"), false).await.is_err());
        assert_eq!(read_all(&storage, "local/a.txt").await, b"data");

        let err = storage
            .start_chunked_upload(&alice(), &path("local/big/"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));

        // Containers may still be copied to a container-style destination.
        storage
            .create_container(&alice(), &path("local/docs"), false)
            .await
            .unwrap();
        storage
            .copy(&alice(), &path("local/docs"), &path("local/docs2/"))
            .await
            .unwrap();
        assert!(storage.stat(&alice(), &path("local/docs2"), false).await.unwrap().is_container);
    }

    #[tokio::test]
    async fn test_stat_children() {
        let (storage, _dir) = setup().await;
        storage
            .create_container(&alice(), &path("local/docs"), false)
            .await
            .unwrap();
        put(&storage, "local/docs/b.pdf", b"pdf").await;
        put(&storage, "local/docs/a.txt", b"text").await;
        storage
            .create_container(&alice(), &path("local/docs/sub"), false)
            .await
            .unwrap();
        put(&storage, "local/docs/sub/deep.txt", b"deep").await;

        let md = storage.stat(&alice(), &path("local/docs"), true).await.unwrap();
        assert!(md.is_container);
        assert_eq!(md.path, "local/docs/");
        assert_eq!(md.mime_type, CONTAINER_MIME_TYPE);
        let children = md.children.unwrap();
        let paths: Vec<_> = children.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["local/docs/a.txt", "local/docs/b.pdf", "local/docs/sub/"]);
        assert_eq!(children[1].mime_type, "application/pdf");
        assert!(children[2].children.is_none());

        let md = storage.stat(&alice(), &path("local/docs"), false).await.unwrap();
        assert!(md.children.is_none());
    }

    #[tokio::test]
    async fn test_stat_sends_checksum() {
        let (storage, _dir) = setup_with(|c| c.send_checksum = true).await;
        put(&storage, "local/a.txt", b"hello").await;
        let md = storage.stat(&alice(), &path("local/a.txt"), false).await.unwrap();
        assert_eq!(md.checksum_type, "md5");
        assert_eq!(md.checksum, "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_remove_non_empty_container() {
        let (storage, _dir) = setup().await;
        storage
            .create_container(&alice(), &path("local/docs"), false)
            .await
            .unwrap();
        put(&storage, "local/docs/a.txt", b"a").await;

        let err = storage
            .remove(&alice(), &path("local/docs"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContainerNotEmpty(_)));

        storage.remove(&alice(), &path("local/docs"), true).await.unwrap();
        assert!(storage.stat(&alice(), &path("local/docs"), false).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_backend_root_rejected() {
        let (storage, _dir) = setup().await;
        let err = storage.remove(&alice(), &path("local"), true).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_create_container_recursive() {
        let (storage, _dir) = setup().await;
        let err = storage
            .create_container(&alice(), &path("local/a/b/c"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotExist(_)));

        storage
            .create_container(&alice(), &path("local/a/b/c"), true)
            .await
            .unwrap();
        let md = storage.stat(&alice(), &path("local/a/b/c"), false).await.unwrap();
        assert!(md.is_container);

        let err = storage
            .create_container(&alice(), &path("local/a/b"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExist(_)));
    }

    #[tokio::test]
    async fn test_home_directory_is_idempotent() {
        let (storage, dir) = setup().await;
        put(&storage, "local/keep.txt", b"keep").await;
        storage.create_user_home_directory(&alice()).await.unwrap();

        let home = dir.path().join("homes").join("alice");
        let mode = std::fs::metadata(&home).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, HOME_DIR_MODE);
        assert_eq!(read_all(&storage, "local/keep.txt").await, b"keep");
    }

    #[tokio::test]
    async fn test_invalid_namespace_rejected() {
        let (storage, _dir) = setup().await;
        let err = storage
            .create_user_home_directory(&Identity::new("../evil"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_copy_object() {
        let (storage, _dir) = setup().await;
        put(&storage, "local/a.txt", b"hello").await;
        storage
            .copy(&alice(), &path("local/a.txt"), &path("local/b.txt"))
            .await
            .unwrap();
        assert_eq!(read_all(&storage, "local/a.txt").await, b"hello");
        assert_eq!(read_all(&storage, "local/b.txt").await, b"hello");
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_copy_container() {
        let (storage, _dir) = setup().await;
        storage
            .create_container(&alice(), &path("local/src/nested"), true)
            .await
            .unwrap();
        put(&storage, "local/src/one.txt", b"1").await;
        put(&storage, "local/src/two.txt", b"22").await;
        put(&storage, "local/src/nested/three.txt", b"333").await;

        storage
            .copy(&alice(), &path("local/src"), &path("local/dst"))
            .await
            .unwrap();
        assert_eq!(read_all(&storage, "local/dst/one.txt").await, b"1");
        assert_eq!(read_all(&storage, "local/dst/two.txt").await, b"22");
        assert_eq!(read_all(&storage, "local/dst/nested/three.txt").await, b"333");

        let err = storage
            .copy(&alice(), &path("local/src"), &path("local/dst"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExist(_)));
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_failed_container_copy_leaves_nothing() {
        let (storage, dir) = setup().await;
        storage
            .create_container(&alice(), &path("local/src"), false)
            .await
            .unwrap();
        put(&storage, "local/src/a.txt", b"a").await;
        put(&storage, "local/src/b.txt", b"b").await;
        let home = dir.path().join("homes").join("alice");
        std::os::unix::fs::symlink(home.join("missing"), home.join("src").join("dangling"))
            .unwrap();

        let result = storage
            .copy(&alice(), &path("local/src"), &path("local/dst"))
            .await;
        assert!(result.is_err());
        assert!(!home.join("dst").exists());
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_copy_into_itself_rejected() {
        let (storage, _dir) = setup().await;
        storage
            .create_container(&alice(), &path("local/src"), false)
            .await
            .unwrap();
        let err = storage
            .copy(&alice(), &path("local/src"), &path("local/src/inner"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_rename() {
        let (storage, _dir) = setup().await;
        put(&storage, "local/a.txt", b"hello").await;
        storage
            .rename(&alice(), &path("local/a.txt"), &path("local/b.txt"))
            .await
            .unwrap();
        assert!(storage.stat(&alice(), &path("local/a.txt"), false).await.is_err());
        assert_eq!(read_all(&storage, "local/b.txt").await, b"hello");

        let err = storage
            .rename(&alice(), &path("local/missing"), &path("local/c.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotExist(_)));
    }

    #[tokio::test]
    async fn test_get_object_of_container_rejected() {
        let (storage, _dir) = setup().await;
        let result = storage.get_object(&alice(), &path("local")).await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
    }

    async fn put_chunk(storage: &LocalStorage, info: &ChunkPathInfo, data: &[u8]) {
        storage
            .put_chunked_object(&alice(), reader(data), data.len() as u64, 0, info)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chunked_upload_out_of_order() {
        let (storage, _dir) = setup().await;
        let tid = storage
            .start_chunked_upload(&alice(), &path("local/big.bin"))
            .await
            .unwrap();
        let chunk = |i| ChunkPathInfo::new("local/big.bin", tid.clone(), 3, i);

        put_chunk(&storage, &chunk(2), b"ccc").await;
        put_chunk(&storage, &chunk(0), b"aaa").await;
        let outcome = storage
            .commit_chunked_upload(&alice(), &chunk(0), &Checksum::none())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Pending {
                received: 2,
                total: 3
            }
        ));
        assert!(storage.stat(&alice(), &path("local/big.bin"), false).await.is_err());

        put_chunk(&storage, &chunk(1), b"bb").await;
        let checksum = Checksum::md5_of(b"aaabbccc");
        let outcome = storage
            .commit_chunked_upload(&alice(), &chunk(1), &checksum)
            .await
            .unwrap();
        match outcome {
            CommitOutcome::Committed(md) => assert_eq!(md.size, 8),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(read_all(&storage, "local/big.bin").await, b"aaabbccc");

        // A late duplicate commit finds nothing left to claim.
        let outcome = storage
            .commit_chunked_upload(&alice(), &chunk(2), &checksum)
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Busy));
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_claim_once() {
        for round in 0..10 {
            let (storage, _dir) = setup().await;
            let storage = Arc::new(storage);
            let tid = format!("race{}", round);
            let chunk = |i| ChunkPathInfo::new("local/raced.bin", tid.clone(), 2, i);
            put_chunk(&storage, &chunk(0), b"left").await;
            put_chunk(&storage, &chunk(1), b"right").await;

            let commits: Vec<_> = (0..4)
                .map(|_| {
                    let storage = storage.clone();
                    let chunk = chunk(1);
                    tokio::spawn(async move {
                        storage
                            .commit_chunked_upload(&alice(), &chunk, &Checksum::none())
                            .await
                    })
                })
                .collect();

            let mut committed = 0;
            for handle in commits {
                match handle.await.unwrap().unwrap() {
                    CommitOutcome::Committed(md) => {
                        assert_eq!(md.size, 9);
                        committed += 1;
                    }
                    CommitOutcome::Busy | CommitOutcome::Pending { .. } => {}
                }
            }
            assert_eq!(committed, 1, "round {}", round);
            assert_eq!(read_all(&storage, "local/raced.bin").await, b"leftright");
            assert_eq!(staging_entries(&storage).await, 0);
        }
    }

    #[tokio::test]
    async fn test_chunked_upload_bad_checksum_discards_chunks() {
        let (storage, _dir) = setup().await;
        let chunk = |i| ChunkPathInfo::new("local/big.bin", "tid", 2, i);
        put_chunk(&storage, &chunk(0), b"aa").await;
        put_chunk(&storage, &chunk(1), b"bb").await;

        let err = storage
            .commit_chunked_upload(&alice(), &chunk(1), &Checksum::md5_of(b"wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BadChecksum { .. }));
        assert!(storage.stat(&alice(), &path("local/big.bin"), false).await.is_err());

        let outcome = storage
            .commit_chunked_upload(&alice(), &chunk(1), &Checksum::none())
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Busy));
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_chunk_resume_from_offset() {
        let (storage, _dir) = setup().await;
        let chunk = ChunkPathInfo::new("local/r.bin", "tid", 1, 0);
        put_chunk(&storage, &chunk, b"hello wrong").await;
        storage
            .put_chunked_object(&alice(), reader(b" world"), 6, 5, &chunk)
            .await
            .unwrap();
        storage
            .commit_chunked_upload(&alice(), &chunk, &Checksum::none())
            .await
            .unwrap();
        assert_eq!(read_all(&storage, "local/r.bin").await, b"hello world");
    }

    #[tokio::test]
    async fn test_chunk_resume_without_staged_chunk() {
        let (storage, _dir) = setup().await;
        let chunk = ChunkPathInfo::new("local/r.bin", "tid", 1, 0);
        let err = storage
            .put_chunked_object(&alice(), reader(b"x"), 1, 4, &chunk)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotExist(_)));
        assert_eq!(staging_entries(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_chunk_sets_are_isolated_per_user() {
        let (storage, _dir) = setup().await;
        let bob = Identity::new("bob");
        storage.create_user_home_directory(&bob).await.unwrap();
        let chunk = |i| ChunkPathInfo::new("local/f.bin", "tid", 2, i);

        put_chunk(&storage, &chunk(0), b"a").await;
        storage
            .put_chunked_object(&bob, reader(b"b"), 1, 0, &chunk(1))
            .await
            .unwrap();
        let outcome = storage
            .commit_chunked_upload(&alice(), &chunk(0), &Checksum::none())
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Pending { received: 1, .. }));
    }

    #[tokio::test]
    async fn test_start_rejects_marker_in_path() {
        let (storage, _dir) = setup().await;
        let err = storage
            .start_chunked_upload(&alice(), &path("local/x-chunking-y"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));

        let a = storage
            .start_chunked_upload(&alice(), &path("local/ok.bin"))
            .await
            .unwrap();
        let b = storage
            .start_chunked_upload(&alice(), &path("local/ok.bin"))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
    }

    #[tokio::test]
    async fn test_sweep_abandoned_transfers() {
        let (storage, _dir) = setup().await;
        put_chunk(&storage, &ChunkPathInfo::new("local/f.bin", "tid", 2, 0), b"a").await;

        assert_eq!(
            storage.sweep_abandoned(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert_eq!(storage.sweep_abandoned(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(storage.sweep_abandoned(Duration::ZERO).await.unwrap(), 0);
    }
}
