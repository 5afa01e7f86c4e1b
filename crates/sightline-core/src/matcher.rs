//! Nearest-neighbor matching of a probe embedding against the gallery.

use crate::gallery::Gallery;
use crate::types::Embedding;

/// Label reported for a probe that matched no identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity name, `None` when the best candidate was not close enough.
    pub identity: Option<String>,
    /// Euclidean distance to the nearest stored embedding (+inf for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Identity name, or [`UNKNOWN_LABEL`].
    pub fn name(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }

    /// Display label, e.g. `"Alice (0.42)"`.
    pub fn label(&self) -> String {
        format!("{} ({:.2})", self.name(), self.distance)
    }
}

/// Strategy for finding the nearest enrolled identity.
///
/// Implementations must be deterministic for a fixed gallery: the same
/// probe against the same gallery always yields the same result.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Exhaustive Euclidean-distance matcher.
///
/// Scans every embedding in gallery order. The first embedding at the
/// minimum distance wins, so ties go to the lexicographically smallest
/// name. A match requires `distance < threshold`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_name: Option<&str> = None;

        for (name, known) in gallery.iter_embeddings() {
            if known.dim() != probe.dim() {
                continue;
            }
            let dist = probe.euclidean_distance(known);
            if dist < best_dist {
                best_dist = dist;
                best_name = Some(name);
            }
        }

        match best_name {
            Some(name) if best_dist < threshold => MatchResult {
                identity: Some(name.to_string()),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}
