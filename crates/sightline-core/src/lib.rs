//! sightline-core — Identity gallery and face-embedding matching.
//!
//! Holds the persisted name → embeddings gallery and the nearest-neighbor
//! matcher used to label faces in live frames.

pub mod gallery;
pub mod matcher;
pub mod store;
pub mod types;

pub use gallery::Gallery;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, UNKNOWN_LABEL};
pub use store::{IdentityStore, StoreError};
pub use types::{BoundingBox, Embedding};
