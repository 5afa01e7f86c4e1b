//! In-memory gallery of named identities and its on-disk document format.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk format version.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

/// Mapping of identity name → enrolled embeddings.
///
/// Names iterate in lexicographic order; embeddings under one name keep
/// their enrollment order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gallery {
    identities: BTreeMap<String, Vec<Embedding>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an embedding under `name`, creating the identity if absent.
    pub fn insert(&mut self, name: &str, embedding: Embedding) {
        self.identities
            .entry(name.to_string())
            .or_default()
            .push(embedding);
    }

    /// Remove an identity and all its embeddings. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.identities.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&[Embedding]> {
        self.identities.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total number of embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Dimension shared by the stored embeddings, if any are stored.
    pub fn dim(&self) -> Option<usize> {
        self.iter_embeddings().next().map(|(_, e)| e.dim())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    /// Identities with their embeddings, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.identities
            .iter()
            .map(|(name, embeddings)| (name.as_str(), embeddings.as_slice()))
    }

    /// Every stored embedding paired with its owner, in match order.
    pub fn iter_embeddings(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.identities
            .iter()
            .flat_map(|(name, embeddings)| embeddings.iter().map(move |e| (name.as_str(), e)))
    }
}

/// Versioned envelope of the gallery file. Written with a borrowed gallery,
/// read back into an owned one.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct GalleryDocument<G = Gallery> {
    pub version: u32,
    pub identities: G,
}
