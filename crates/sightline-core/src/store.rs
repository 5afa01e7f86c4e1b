//! Durable identity gallery.
//!
//! The in-memory [`Gallery`] is authoritative for the running process and
//! is mirrored to a single JSON file after every mutation. The file is
//! replaced atomically: the new document is written to a temporary file in
//! the same directory, fsynced, then renamed over the old one.

use crate::gallery::{Gallery, GalleryDocument, GALLERY_FORMAT_VERSION};
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::Embedding;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("embedding must not be empty")]
    EmptyEmbedding,
    #[error("embedding contains NaN or infinite values")]
    NonFiniteEmbedding,
    #[error("embedding dimension mismatch: gallery holds {expected}-dim embeddings, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("gallery I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the in-memory mutation succeeded but could not be made durable.
    pub fn is_persistence(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::Serialize(_))
    }
}

/// Thread-safe gallery with nearest-neighbor lookup and write-through persistence.
pub struct IdentityStore<M = EuclideanMatcher> {
    path: PathBuf,
    gallery: RwLock<Gallery>,
    matcher: M,
}

impl IdentityStore<EuclideanMatcher> {
    /// Open the gallery at `path` using exhaustive Euclidean matching.
    ///
    /// Never fails: a missing file yields an empty gallery, and an unreadable
    /// or corrupt file is logged and replaced by an empty gallery in memory.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_matcher(path, EuclideanMatcher)
    }
}

impl<M: Matcher> IdentityStore<M> {
    pub fn with_matcher(path: impl Into<PathBuf>, matcher: M) -> Self {
        let path = path.into();
        let gallery = load_gallery(&path);
        Self {
            path,
            gallery: RwLock::new(gallery),
            matcher,
        }
    }

    /// Path of the backing gallery file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `embedding` to `name` (creating the identity) and persist.
    ///
    /// On a persistence error the embedding stays enrolled in memory; check
    /// [`StoreError::is_persistence`] to tell this apart from a rejected input.
    pub fn add(&self, name: &str, embedding: Embedding) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if embedding.is_empty() {
            return Err(StoreError::EmptyEmbedding);
        }
        // JSON cannot represent NaN or infinity
        if !embedding.is_finite() {
            return Err(StoreError::NonFiniteEmbedding);
        }

        let mut gallery = self.write();
        if let Some(expected) = gallery.dim() {
            if expected != embedding.dim() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }

        // How close the new sample is to what this identity already has
        let closest = gallery.get(name).and_then(|existing| {
            existing
                .iter()
                .map(|e| e.similarity(&embedding))
                .max_by(f32::total_cmp)
        });
        if let Some(similarity) = closest {
            tracing::debug!(name, similarity, "new sample vs closest existing sample");
        }

        gallery.insert(name, embedding);
        tracing::info!(
            name,
            embeddings = gallery.get(name).map_or(0, <[Embedding]>::len),
            "identity enrolled"
        );
        self.persist(&gallery)
    }

    /// Remove `name` and all of its embeddings. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut gallery = self.write();
        if !gallery.remove(name) {
            return Ok(false);
        }
        tracing::info!(name, "identity deleted");
        self.persist(&gallery)?;
        Ok(true)
    }

    /// Find the nearest enrolled identity to `probe`.
    ///
    /// Returns the owner of the closest embedding when its distance is
    /// strictly below `threshold`, otherwise an unknown result carrying the
    /// best distance seen (+inf for an empty gallery).
    pub fn identify(&self, probe: &Embedding, threshold: f32) -> MatchResult {
        let gallery = self.read();
        self.matcher.compare(probe, &gallery, threshold)
    }

    /// Enrolled identity names in match order.
    pub fn names(&self) -> Vec<String> {
        self.read().names().map(str::to_string).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains(name)
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.read().embedding_count()
    }

    /// Consistent copy of the whole gallery.
    pub fn snapshot(&self) -> Gallery {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Gallery> {
        self.gallery.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Gallery> {
        self.gallery.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the full gallery. Called with the write lock held so persisted
    /// documents follow mutation order.
    fn persist(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let doc = GalleryDocument {
            version: GALLERY_FORMAT_VERSION,
            identities: gallery,
        };
        let bytes = serde_json::to_vec(&doc)?;

        write_atomic(&self.path, &bytes).map_err(|source| {
            tracing::warn!(path = %self.path.display(), error = %source, "failed to save gallery");
            StoreError::Io {
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::debug!(
            path = %self.path.display(),
            identities = gallery.len(),
            bytes = bytes.len(),
            "gallery saved"
        );
        Ok(())
    }
}

fn load_gallery(path: &Path) -> Gallery {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no existing gallery, starting empty");
        return Gallery::new();
    }

    match read_gallery(path) {
        Ok(gallery) => {
            tracing::info!(
                path = %path.display(),
                identities = gallery.len(),
                embeddings = gallery.embedding_count(),
                "loaded gallery"
            );
            gallery
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load gallery, starting empty");
            Gallery::new()
        }
    }
}

fn read_gallery(path: &Path) -> Result<Gallery, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let doc: GalleryDocument = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if doc.version != GALLERY_FORMAT_VERSION {
        return Err(format!(
            "unsupported gallery version {} (expected {GALLERY_FORMAT_VERSION})",
            doc.version
        ));
    }
    Ok(doc.identities)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn store_in(dir: &TempDir) -> IdentityStore {
        IdentityStore::open(dir.path().join("gallery.json"))
    }

    #[test]
    fn test_self_match_is_exact() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let e1 = emb(&[0.1, 0.7, -0.3]);

        store.add("Alice", e1.clone()).unwrap();
        let result = store.identify(&e1, 0.8);
        assert_eq!(result.identity.as_deref(), Some("Alice"));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_empty_store_returns_unknown() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let result = store.identify(&emb(&[1.0, 2.0]), 0.8);
        assert_eq!(result.name(), "Unknown");
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_deleted_identity_never_matches() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let e2 = emb(&[0.2, 0.2]);

        store.add("Bob", e2.clone()).unwrap();
        assert!(store.delete("Bob").unwrap());
        assert!(!store.identify(&e2, 1.0).is_match());
        assert!(!store.delete("Bob").unwrap());
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.json");
        let v1 = emb(&[0.1, 0.2, 0.3]);
        let v2 = emb(&[0.4, 0.5, 0.6]);
        let v3 = emb(&[-0.7, 0.8, -0.9]);

        {
            let store = IdentityStore::open(&path);
            store.add("A", v1.clone()).unwrap();
            store.add("B", v2.clone()).unwrap();
            store.add("B", v3.clone()).unwrap();
        }

        let reloaded = IdentityStore::open(&path).snapshot();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("A").unwrap(), &[v1]);
        let b = reloaded.get("B").unwrap();
        assert_eq!(b.len(), 2);
        for (got, want) in b.iter().zip([v2, v3].iter()) {
            assert!(got.euclidean_distance(want) < 1e-6);
        }
    }

    #[test]
    fn test_delete_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.json");
        {
            let store = IdentityStore::open(&path);
            store.add("keep", emb(&[1.0])).unwrap();
            store.add("drop", emb(&[2.0])).unwrap();
            store.delete("drop").unwrap();
        }
        assert_eq!(IdentityStore::open(&path).names(), vec!["keep".to_string()]);
    }

    #[test]
    fn test_missing_file_starts_empty_and_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/gallery.json");
        let store = IdentityStore::open(&path);
        assert!(store.is_empty());

        store.add("x", emb(&[1.0])).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = IdentityStore::open(&path);
        assert!(store.is_empty());

        // The store stays usable and overwrites the corrupt file
        store.add("fresh", emb(&[1.0, 1.0])).unwrap();
        assert_eq!(IdentityStore::open(&path).len(), 1);
    }

    #[test]
    fn test_unknown_version_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, br#"{"version":99,"identities":{"A":[[1.0]]}}"#).unwrap();
        assert!(IdentityStore::open(&path).is_empty());
    }

    #[test]
    fn test_rejects_invalid_input_without_mutation() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add("a", emb(&[1.0, 0.0])).unwrap();

        assert!(matches!(store.add("", emb(&[1.0, 0.0])), Err(StoreError::EmptyName)));
        assert!(matches!(store.add("b", emb(&[])), Err(StoreError::EmptyEmbedding)));
        let err = store.add("b", emb(&[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 2, actual: 3 }
        ));
        assert!(!err.is_persistence());
        assert_eq!(store.embedding_count(), 1);
        assert!(!store.contains("b"));
    }

    #[test]
    fn test_non_finite_embedding_rejected_and_gallery_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.json");
        {
            let store = IdentityStore::open(&path);
            store.add("Alice", emb(&[0.1, 0.2])).unwrap();

            let err = store.add("Bob", emb(&[f32::NAN, 0.2])).unwrap_err();
            assert!(matches!(err, StoreError::NonFiniteEmbedding));
            assert!(!err.is_persistence());
            assert!(matches!(
                store.add("Alice", emb(&[f32::INFINITY, 0.2])),
                Err(StoreError::NonFiniteEmbedding)
            ));
            assert!(!store.contains("Bob"));
            assert_eq!(store.embedding_count(), 1);
        }

        let reloaded = IdentityStore::open(&path);
        assert_eq!(reloaded.names(), vec!["Alice".to_string()]);
        assert_eq!(reloaded.embedding_count(), 1);
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        // A regular file where the parent directory should be makes every write fail
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let store = IdentityStore::open(blocker.join("gallery.json"));

        let err = store.add("Dana", emb(&[0.5, 0.5])).unwrap_err();
        assert!(err.is_persistence());
        assert!(store.contains("Dana"));
        assert!(store.identify(&emb(&[0.5, 0.5]), 0.1).is_match());

        let err = store.delete("Dana").unwrap_err();
        assert!(err.is_persistence());
        assert!(!store.contains("Dana"));
    }

    #[test]
    fn test_concurrent_identify_sees_whole_mutations() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        // Sample i sits at distance 20 - i from the probe, so the best
        // distance reveals exactly how many samples a lookup saw.
        let probe = emb(&[20.0, 0.0]);

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..20 {
                    store.add("w", emb(&[i as f32, 0.0])).unwrap();
                }
            })
        };

        let mut last_seen = 0;
        for _ in 0..50 {
            let count = store.embedding_count();
            let snapshot = store.snapshot();
            assert!(snapshot.embedding_count() >= count);

            let result = store.identify(&probe, 0.5);
            if result.distance.is_infinite() {
                assert_eq!(last_seen, 0);
                continue;
            }
            // Distance of the newest enrolled sample, never a partial state
            assert_eq!(result.distance.fract(), 0.0);
            let seen = 20 - result.distance as usize + 1;
            assert!((1..=20).contains(&seen));
            assert!(seen >= last_seen);
            assert!(seen >= count);
            last_seen = seen;
        }
        writer.join().unwrap();
        assert_eq!(store.embedding_count(), 20);
    }
}
