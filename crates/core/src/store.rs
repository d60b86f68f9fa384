//! On-disk content-addressed blob store
//!
//! Layout under the base directory (shared with other implementations, so
//! the scheme must not change):
//! ```text
//! <base>/
//!   sha256/
//!     <hex[0:2]>/
//!       <hex[2:]>      committed blob, mode 0600
//!   tmp/
//!     <random>         staging file for an in-progress put
//! ```

use std::fs::{self, DirBuilder, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::changes::{ChangeNotifier, StoreEvent, StoreOp};
use crate::error::{Result, StoreError};
use crate::hash::{Algorithm, BlobRef, RefHasher};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Write-once blob storage addressed by content hash
///
/// Safe to share between threads; every operation goes straight to the
/// filesystem and concurrent puts of identical content converge on one file.
#[derive(Debug)]
pub struct BlobStore {
    base: PathBuf,
    tmp: PathBuf,
    changes: ChangeNotifier<StoreEvent>,
}

impl BlobStore {
    /// Open (or create) a store rooted at `base`
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        for algo in Algorithm::ALL {
            create_private_dir(&base.join(algo.tag()))?;
        }
        let tmp = base.join("tmp");
        create_private_dir(&tmp)?;

        debug!(path = %base.display(), "opened blob store");
        Ok(Self {
            base,
            tmp,
            changes: ChangeNotifier::new(),
        })
    }

    /// Root directory of the store
    pub fn path(&self) -> &Path {
        &self.base
    }

    /// Feed of put/remove events
    pub fn changes(&self) -> &ChangeNotifier<StoreEvent> {
        &self.changes
    }

    /// Consume `reader` into the store and return the reference of its content
    ///
    /// Content is hashed while it is written to a staging file, then renamed
    /// into place. If identical content was committed first the staging file
    /// is discarded and the put still succeeds.
    pub fn put<R: Read>(&self, mut reader: R) -> Result<BlobRef> {
        let mut staged = NamedTempFile::new_in(&self.tmp)
            .map_err(|e| StoreError::io("create staging file", &self.tmp, e))?;

        let mut hasher = RefHasher::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StoreError::io("read blob content", staged.path(), e)),
            };
            hasher.update(&buf[..n]);
            staged
                .write_all(&buf[..n])
                .map_err(|e| StoreError::io("write staging file", staged.path(), e))?;
            written += n as u64;
        }
        staged
            .as_file()
            .sync_all()
            .map_err(|e| StoreError::io("sync staging file", staged.path(), e))?;

        let blob = hasher.finalize();
        create_private_dir(&self.shard_dir(&blob))?;

        let final_path = self.blob_path(&blob);
        let event = StoreEvent {
            op: StoreOp::Put,
            blob,
        };
        // rename and emit under the delivery lock: events follow disk order
        self.changes.emit_after(&event, || match staged.persist_noclobber(&final_path) {
            Ok(_) => {
                trace!(blob = %event.blob, size = written, "committed blob");
                Ok(())
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                trace!(blob = %event.blob, "blob already present, dropping staged copy");
                Ok(())
            }
            Err(e) => Err(StoreError::io("rename staged blob", &final_path, e.error)),
        })?;
        Ok(event.blob)
    }

    /// Open a blob for reading
    pub fn get(&self, blob: &BlobRef) -> Result<File> {
        let path = self.blob_path(blob);
        File::open(&path).map_err(|e| not_found_or(blob, "open blob", &path, e))
    }

    /// Remove a blob
    pub fn delete(&self, blob: &BlobRef) -> Result<()> {
        let path = self.blob_path(blob);
        let event = StoreEvent {
            op: StoreOp::Remove,
            blob: blob.clone(),
        };
        self.changes.emit_after(&event, || {
            fs::remove_file(&path).map_err(|e| not_found_or(blob, "remove blob", &path, e))
        })?;

        debug!(%blob, "removed blob");
        Ok(())
    }

    /// Size of a stored blob in bytes
    pub fn size(&self, blob: &BlobRef) -> Result<u64> {
        let path = self.blob_path(blob);
        let meta = fs::metadata(&path).map_err(|e| not_found_or(blob, "stat blob", &path, e))?;
        Ok(meta.len())
    }

    /// Whether a blob is currently stored
    pub fn has(&self, blob: &BlobRef) -> Result<bool> {
        match self.size(blob) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Enumerate stored blobs
    ///
    /// Unordered and lazy. Blobs added or removed while iterating may or may
    /// not show up; entries that vanish mid-walk are skipped.
    pub fn list(&self) -> impl Iterator<Item = Result<BlobRef>> + '_ {
        Algorithm::ALL.into_iter().flat_map(move |algo| {
            let root = self.base.join(algo.tag());
            WalkDir::new(root)
                .min_depth(2)
                .max_depth(2)
                .into_iter()
                .filter_map(move |entry| match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        parse_blob_path(algo, entry.path()).map(Ok)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                        let io = e.into_io_error()?;
                        if io.kind() == io::ErrorKind::NotFound {
                            None
                        } else {
                            Some(Err(StoreError::io("list blobs", path, io)))
                        }
                    }
                })
        })
    }

    fn shard_dir(&self, blob: &BlobRef) -> PathBuf {
        let hex = blob.to_hex();
        self.base.join(blob.algo().tag()).join(&hex[..2])
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let hex = blob.to_hex();
        self.base.join(blob.algo().tag()).join(&hex[..2]).join(&hex[2..])
    }
}

fn not_found_or(blob: &BlobRef, op: &'static str, path: &Path, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(blob.clone())
    } else {
        StoreError::io(op, path, e)
    }
}

/// Recover a reference from `<algo>/<hh>/<rest>`; stray files yield `None`
fn parse_blob_path(algo: Algorithm, path: &Path) -> Option<BlobRef> {
    let name = path.file_name()?.to_str()?;
    let shard = path.parent()?.file_name()?.to_str()?;
    let bytes = hex::decode(format!("{shard}{name}")).ok();
    match bytes.and_then(|b| BlobRef::new(algo, &b).ok()) {
        Some(blob) => Some(blob),
        None => {
            debug!(path = %path.display(), "skipping non-blob file in store");
            None
        }
    }
}

/// Create a directory (and parents) readable only by the owner.
/// An existing directory, including one created concurrently, is fine.
fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(StoreError::io("create directory", path, e)),
    }
}
