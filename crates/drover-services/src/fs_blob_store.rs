//! Blob store on the local filesystem.
//!
//! Layout: `{root}/{hex[0..2]}/{hex}`, fanned out by the first byte of the
//! blob id. A blob file never changes once its rename lands, so existence
//! implies complete content.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use drover_core::{BlobId, BlobStoreError};
use memmap2::Mmap;

use crate::blob_store::{verify_content, BlobStore};

/// Per-process sequence for temp file names; each write gets its own.
static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn has(&self, id: &BlobId) -> bool {
        self.blob_path(id).exists()
    }

    fn get(&self, id: &BlobId) -> Result<Option<Bytes>, BlobStoreError> {
        let path = self.blob_path(id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            // mmap of an empty file fails on some platforms.
            return Ok(Some(Bytes::new()));
        }

        // Safety: blob files are never modified after the rename that
        // publishes them, and the map is read-only.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn put(&self, id: &BlobId, data: &[u8]) -> Result<(), BlobStoreError> {
        let path = self.blob_path(id);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension(format!(
            "tmp{}-{}",
            std::process::id(),
            NEXT_TMP.fetch_add(1, Ordering::Relaxed)
        ));
        let written = fs::File::create(&tmp_path).and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        });
        let published = written.and_then(|()| fs::rename(&tmp_path, &path));
        if let Err(e) = published {
            let _ = fs::remove_file(&tmp_path);
            // Another writer published the same content first.
            if path.exists() {
                return Ok(());
            }
            return Err(e.into());
        }

        tracing::trace!(blob = %id.short(), bytes = data.len(), "blob written");
        Ok(())
    }

    /// Count stored blobs (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.flatten().filter(|b| is_blob_file(&b.path())).count();
                }
            }
        }
        total
    }

    /// Total stored bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for blob in subdir.flatten().filter(|b| is_blob_file(&b.path())) {
                        if let Ok(meta) = blob.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }
}

/// Published blobs are named by bare hex id; in-flight writes carry a
/// `.tmp…` extension.
fn is_blob_file(path: &Path) -> bool {
    path.extension().is_none()
}

impl BlobStore for FsBlobStore {
    fn write_blobs(&self, blobs: HashMap<BlobId, Bytes>) -> Result<(), BlobStoreError> {
        for (id, data) in &blobs {
            verify_content(id, data)?;
        }
        for (id, data) in &blobs {
            self.put(id, data)?;
        }
        Ok(())
    }

    fn read_blobs(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, Option<Bytes>>, BlobStoreError> {
        ids.iter().map(|id| Ok((*id, self.get(id)?))).collect()
    }

    fn check_blobs_exist(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, bool>, BlobStoreError> {
        Ok(ids.iter().map(|id| (*id, self.has(id))).collect())
    }
}
