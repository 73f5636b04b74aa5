//! Recursive replication of pipeline working directories.
//!
//! [`DirectoryReplicator::copy`] reproduces a subtree entry by entry:
//! directories are recreated, regular files are cloned copy-on-write when the
//! filesystem allows it and otherwise byte-copied with the source permission
//! bits, and symbolic links are recreated with their original target string.
//! Device nodes become regular files holding at most the size the filesystem
//! reports for them (zero for character devices). Sockets and FIFOs are
//! skipped. Files and links already present at the destination are replaced;
//! existing directories are merged into.
//!
//! Children of a directory are copied concurrently. The number of file
//! handles in flight across the whole copy is bounded by a semaphore, and
//! every failing child is reported rather than just the first.

use std::fs::FileType;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio::fs;
use tokio::sync::Semaphore;

/// Default bound on concurrently open file handles.
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;

/// Errors raised while replicating a tree. Never partially cleaned up.
#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    /// A filesystem operation failed on `path`.
    #[error("I/O failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Several entries failed; sorted by path.
    #[error("{} entries failed to replicate", .0.len())]
    Multiple(Vec<ReplicateError>),
}

impl ReplicateError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Every path that failed, in report order.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Io { path, .. } => vec![path.as_path()],
            Self::Multiple(errors) => errors.iter().flat_map(Self::paths).collect(),
        }
    }

    /// Collapse child failures into one result: `Ok` for none, the error
    /// itself for one, a flat sorted [`ReplicateError::Multiple`] otherwise.
    fn aggregate(errors: Vec<ReplicateError>) -> Result<(), Self> {
        let mut flat: Vec<ReplicateError> = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Multiple(inner) => flat.extend(inner),
                io_err => flat.push(io_err),
            }
        }

        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => {
                flat.sort_by(|a, b| a.paths().cmp(&b.paths()));
                Err(Self::Multiple(flat))
            }
        }
    }
}

/// Copies filesystem subtrees between pipeline workspaces.
#[derive(Debug, Clone)]
pub struct DirectoryReplicator {
    permits: Arc<Semaphore>,
}

impl Default for DirectoryReplicator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPEN_FILES)
    }
}

impl DirectoryReplicator {
    /// Create a replicator allowing at most `max_open_files` file operations
    /// in flight (minimum 1).
    pub fn new(max_open_files: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_open_files.max(1))),
        }
    }

    /// Replicate the subtree rooted at `src` into `dst`.
    pub async fn copy(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> Result<(), ReplicateError> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        tracing::debug!(src = %src.display(), dst = %dst.display(), "Replicating directory tree");
        self.copy_entry(src.to_path_buf(), dst.to_path_buf()).await
    }

    fn copy_entry(&self, src: PathBuf, dst: PathBuf) -> BoxFuture<'_, Result<(), ReplicateError>> {
        Box::pin(async move {
            let meta = fs::symlink_metadata(&src)
                .await
                .map_err(ReplicateError::io(&src))?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                self.copy_dir(&src, &dst).await
            } else if file_type.is_symlink() {
                self.copy_symlink(&src, &dst).await
            } else if file_type.is_file() {
                self.copy_file(&src, &dst, meta.permissions(), None).await
            } else if is_device(&file_type) {
                self.copy_file(&src, &dst, meta.permissions(), Some(meta.len()))
                    .await
            } else {
                tracing::debug!(path = %src.display(), "Skipping unsupported entry type");
                Ok(())
            }
        })
    }

    async fn copy_dir(&self, src: &Path, dst: &Path) -> Result<(), ReplicateError> {
        fs::create_dir_all(dst)
            .await
            .map_err(ReplicateError::io(dst))?;

        // The listing handle is released before recursing so nested
        // directories never wait on a permit held by their parent.
        let names = {
            let _permit = self.acquire(src).await?;
            let mut entries = fs::read_dir(src).await.map_err(ReplicateError::io(src))?;
            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(ReplicateError::io(src))?
            {
                names.push(entry.file_name());
            }
            names
        };

        let children = names
            .iter()
            .map(|name| self.copy_entry(src.join(name), dst.join(name)));
        let errors = join_all(children)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        ReplicateError::aggregate(errors)
    }

    async fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        permissions: std::fs::Permissions,
        limit: Option<u64>,
    ) -> Result<(), ReplicateError> {
        let _permit = self.acquire(src).await?;
        remove_stale_entry(dst)
            .await
            .map_err(ReplicateError::io(dst))?;

        let (from, to) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || clone_file(&from, &to, limit))
            .await
            .map_err(|e| ReplicateError::Io {
                path: src.to_path_buf(),
                source: io::Error::other(e),
            })??;

        fs::set_permissions(dst, permissions)
            .await
            .map_err(ReplicateError::io(dst))
    }

    async fn copy_symlink(&self, src: &Path, dst: &Path) -> Result<(), ReplicateError> {
        let _permit = self.acquire(src).await?;
        let target = fs::read_link(src).await.map_err(ReplicateError::io(src))?;
        remove_stale_entry(dst)
            .await
            .map_err(ReplicateError::io(dst))?;
        create_symlink(&target, dst)
            .await
            .map_err(ReplicateError::io(dst))
    }

    async fn acquire(
        &self,
        path: &Path,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, ReplicateError> {
        self.permits.acquire().await.map_err(|e| ReplicateError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })
    }
}

/// Unlink a file or link left at `path` by an earlier copy. Directories are
/// left alone so creating a file over one still fails.
async fn remove_stale_entry(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path).await,
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_device(file_type: &FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_char_device() || file_type.is_block_device()
}

#[cfg(not(unix))]
fn is_device(_file_type: &FileType) -> bool {
    false
}

#[cfg(unix)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are only replicated on unix",
    ))
}

/// Clone `src` onto `dst`, falling back to a byte copy.
///
/// With a `limit` (device nodes) no clone is attempted and at most `limit`
/// bytes are read, since a device stream may never end.
fn clone_file(src: &Path, dst: &Path, limit: Option<u64>) -> Result<(), ReplicateError> {
    let source = std::fs::File::open(src).map_err(ReplicateError::io(src))?;
    let mut dest = std::fs::File::create(dst).map_err(ReplicateError::io(dst))?;

    let copied = match limit {
        Some(len) => io::copy(&mut io::Read::take(source, len), &mut dest),
        None => {
            #[cfg(target_os = "linux")]
            if reflink(&source, &dest) {
                return Ok(());
            }
            io::copy(&mut &source, &mut dest)
        }
    };
    copied.map(|_| ()).map_err(ReplicateError::io(dst))
}

/// `FICLONE` from `linux/fs.h`: `_IOW(0x94, 9, int)`.
#[cfg(target_os = "linux")]
const FICLONE: u32 = 0x4004_9409;

/// Try a copy-on-write clone. `false` means the filesystem declined and the
/// caller should fall back to a plain copy.
#[cfg(target_os = "linux")]
fn reflink(source: &std::fs::File, dest: &std::fs::File) -> bool {
    use std::os::unix::io::AsRawFd;

    // SAFETY: both descriptors are owned by live `File`s for the duration of
    // the call and FICLONE only reads the source descriptor.
    let rc = unsafe { libc::ioctl(dest.as_raw_fd(), FICLONE as _, source.as_raw_fd()) };
    rc == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
