//! Blob store contract and the in-memory implementation.
//!
//! All operations are batch-shaped; the single-item helpers are thin
//! wrappers over the batch form. Blobs are immutable: writing an id that
//! already exists is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use drover_core::{BlobId, BlobStoreError};

pub trait BlobStore: Send + Sync {
    /// Create blobs. Every id must be the hash of its data.
    fn write_blobs(&self, blobs: HashMap<BlobId, Bytes>) -> Result<(), BlobStoreError>;

    /// Read blobs; ids that don't exist map to `None`.
    fn read_blobs(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, Option<Bytes>>, BlobStoreError>;

    /// Existence check without reading content.
    fn check_blobs_exist(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, bool>, BlobStoreError>;

    /// Write blobs keyed by their content hash, returning the ids in input order.
    fn write_blobs_with_unknown_hashes(
        &self,
        blobs: Vec<Bytes>,
    ) -> Result<Vec<BlobId>, BlobStoreError> {
        let ids: Vec<BlobId> = blobs.iter().map(|b| BlobId::of(b)).collect();
        self.write_blobs(ids.iter().copied().zip(blobs).collect())?;
        Ok(ids)
    }

    fn write_blob_with_unknown_hash(&self, blob: Bytes) -> Result<BlobId, BlobStoreError> {
        let id = BlobId::of(&blob);
        self.write_blobs(HashMap::from([(id, blob)]))?;
        Ok(id)
    }

    fn read_blob(&self, id: BlobId) -> Result<Option<Bytes>, BlobStoreError> {
        Ok(self.read_blobs(&[id])?.remove(&id).flatten())
    }

    fn check_blob_exists(&self, id: BlobId) -> Result<bool, BlobStoreError> {
        Ok(self
            .check_blobs_exist(&[id])?
            .get(&id)
            .copied()
            .unwrap_or(false))
    }
}

/// Reject data whose hash doesn't match the id it's being written under.
pub(crate) fn verify_content(id: &BlobId, data: &[u8]) -> Result<(), BlobStoreError> {
    if BlobId::of(data) != *id {
        return Err(BlobStoreError::HashMismatch(*id));
    }
    Ok(())
}

/// Blob store held in memory. Cheap to clone; clones share storage.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<BlobId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.blobs.len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn write_blobs(&self, blobs: HashMap<BlobId, Bytes>) -> Result<(), BlobStoreError> {
        for (id, data) in &blobs {
            verify_content(id, data)?;
        }
        for (id, data) in blobs {
            self.blobs.entry(id).or_insert(data);
        }
        Ok(())
    }

    fn read_blobs(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, Option<Bytes>>, BlobStoreError> {
        Ok(ids
            .iter()
            .map(|id| (*id, self.blobs.get(id).map(|b| b.clone())))
            .collect())
    }

    fn check_blobs_exist(&self, ids: &[BlobId]) -> Result<HashMap<BlobId, bool>, BlobStoreError> {
        Ok(ids
            .iter()
            .map(|id| (*id, self.blobs.contains_key(id)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_check_exists_immediately() {
        let store = MemoryBlobStore::new();
        let id = store
            .write_blob_with_unknown_hash(Bytes::from_static(b"entries"))
            .unwrap();
        assert!(store.check_blob_exists(id).unwrap());
    }

    #[test]
    fn read_missing_blob_is_none_not_error() {
        let store = MemoryBlobStore::new();
        let present = store
            .write_blob_with_unknown_hash(Bytes::from_static(b"present"))
            .unwrap();
        let missing = BlobId::of(b"missing");

        let read = store.read_blobs(&[present, missing]).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[&present].as_deref(), Some(&b"present"[..]));
        assert_eq!(read[&missing], None);
        assert_eq!(store.read_blob(missing).unwrap(), None);
    }

    #[test]
    fn identical_content_is_stored_once() {
        let store = MemoryBlobStore::new();
        let ids = store
            .write_blobs_with_unknown_hashes(vec![
                Bytes::from_static(b"same"),
                Bytes::from_static(b"same"),
                Bytes::from_static(b"other"),
            ])
            .unwrap();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn rejects_mismatched_hash() {
        let store = MemoryBlobStore::new();
        let wrong = BlobId::of(b"expected");
        let err = store
            .write_blobs(HashMap::from([(wrong, Bytes::from_static(b"actual"))]))
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::HashMismatch(id) if id == wrong));
        assert_eq!(store.count(), 0);
    }
}
