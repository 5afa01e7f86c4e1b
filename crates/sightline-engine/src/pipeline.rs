//! Per-frame recognition: detect → filter → crop → embed → match, plus the
//! one-shot enrollment gate.
//!
//! Capability failures never escape a tick: a detector error counts as zero
//! faces, and an embedder error leaves the faces unlabeled.

use crate::capability::{FaceDetector, FaceEmbedder};
use image::RgbImage;
use sightline_core::{BoundingBox, Embedding, EuclideanMatcher, IdentityStore, MatchResult, Matcher};
use sightline_hw::{clamp_region, Frame};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.9;
const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.8;

/// Thresholds applied on every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Minimum detector score for a box to count as a face (inclusive).
    pub confidence_threshold: f32,
    /// Maximum embedding distance for a match (exclusive).
    pub recognition_threshold: f32,
    pub detection_enabled: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            detection_enabled: true,
        }
    }
}

/// One face kept on a tick.
#[derive(Debug, Clone)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    /// Nearest identity; `None` when no embedding could be computed.
    pub identity: Option<MatchResult>,
}

impl FaceAnnotation {
    /// Display label such as `"Alice (0.42)"`.
    pub fn label(&self) -> Option<String> {
        self.identity.as_ref().map(MatchResult::label)
    }
}

/// Output of one pipeline pass.
#[derive(Debug, Clone, Default)]
pub struct TickResult {
    /// Sequence number of the processed frame.
    pub frame_sequence: u64,
    pub face_count: usize,
    pub faces: Vec<FaceAnnotation>,
    /// Set when a pending enrollment was resolved on this tick.
    pub enrollment: Option<EnrollmentOutcome>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentFailure {
    #[error("too many faces")]
    TooManyFaces,
    #[error("no face found")]
    NoFaceFound,
    #[error("superseded by a newer enrollment request")]
    Superseded,
    #[error("rejected by identity store: {0}")]
    Rejected(String),
    #[error("engine stopped")]
    EngineStopped,
}

/// Final answer to an enrollment request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentOutcome {
    /// The embedding was added. `durable` is false when saving the gallery
    /// failed; the identity is still active in memory.
    Enrolled { name: String, durable: bool },
    Failed { name: String, reason: EnrollmentFailure },
}

impl EnrollmentOutcome {
    pub fn name(&self) -> &str {
        match self {
            Self::Enrolled { name, .. } | Self::Failed { name, .. } => name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Enrolled { .. })
    }
}

/// Tick-driven face recognition over an injected detector, embedder and store.
pub struct DetectionPipeline<D, E, M: Matcher = EuclideanMatcher> {
    detector: D,
    embedder: E,
    store: Arc<IdentityStore<M>>,
    settings: PipelineSettings,
    pending: Option<String>,
}

impl<D, E, M> DetectionPipeline<D, E, M>
where
    D: FaceDetector,
    E: FaceEmbedder,
    M: Matcher,
{
    pub fn new(detector: D, embedder: E, store: Arc<IdentityStore<M>>, settings: PipelineSettings) -> Self {
        Self {
            detector,
            embedder,
            store,
            settings,
            pending: None,
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: PipelineSettings) {
        self.settings = settings;
    }

    pub fn store(&self) -> &Arc<IdentityStore<M>> {
        &self.store
    }

    /// Arm a one-shot enrollment for `name`, resolved on a later tick.
    ///
    /// Returns the name of a still-pending request that this one replaced.
    pub fn request_enrollment(&mut self, name: impl Into<String>) -> Option<String> {
        let name = name.into();
        tracing::info!(name = %name, "enrollment requested");
        self.pending.replace(name)
    }

    /// Drop the pending enrollment, returning its name.
    pub fn cancel_enrollment(&mut self) -> Option<String> {
        self.pending.take()
    }

    pub fn pending_enrollment(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Run one recognition pass over `frame`.
    pub fn process(&mut self, frame: &Frame) -> TickResult {
        let mut result = TickResult {
            frame_sequence: frame.sequence,
            ..TickResult::default()
        };
        if !self.settings.detection_enabled {
            return result;
        }

        let boxes = match self.detector.detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "face detection failed; treating frame as empty");
                Vec::new()
            }
        };
        let detected = boxes.len();

        let threshold = self.settings.confidence_threshold;
        let mut kept = Vec::new();
        let mut crops = Vec::new();
        for bbox in boxes.into_iter().filter(|b| b.confidence >= threshold) {
            match clamp_region(bbox.x1, bbox.y1, bbox.x2, bbox.y2, frame.width(), frame.height()) {
                Some(region) => {
                    crops.push(frame.crop(region));
                    kept.push(bbox);
                }
                None => tracing::debug!(?bbox, "face box empty after clamping; dropped"),
            }
        }

        result.face_count = kept.len();
        tracing::debug!(seq = frame.sequence, detected, kept = kept.len(), "faces filtered");

        // Nothing to embed: a pending enrollment waits for a later frame.
        if crops.is_empty() {
            return result;
        }

        match self.embed(&crops) {
            Some(embeddings) => {
                let r = self.settings.recognition_threshold;
                result.faces = kept
                    .into_iter()
                    .zip(&embeddings)
                    .map(|(bbox, embedding)| FaceAnnotation {
                        bbox,
                        identity: Some(self.store.identify(embedding, r)),
                    })
                    .collect();
                result.enrollment = self.try_enroll(&embeddings);
            }
            None => {
                result.faces = kept
                    .into_iter()
                    .map(|bbox| FaceAnnotation { bbox, identity: None })
                    .collect();
            }
        }

        result
    }

    fn embed(&mut self, crops: &[RgbImage]) -> Option<Vec<Embedding>> {
        match self.embedder.embed(crops) {
            Ok(embeddings) if embeddings.len() == crops.len() => Some(embeddings),
            Ok(embeddings) => {
                tracing::warn!(
                    expected = crops.len(),
                    got = embeddings.len(),
                    "embedder returned wrong number of embeddings; ignoring"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, faces = crops.len(), "face embedding failed");
                None
            }
        }
    }

    /// Resolve the pending enrollment against this tick's embeddings.
    fn try_enroll(&mut self, embeddings: &[Embedding]) -> Option<EnrollmentOutcome> {
        let name = self.pending.take()?;

        let outcome = match embeddings {
            [] => {
                self.pending = Some(name);
                return None;
            }
            [embedding] => match self.store.add(&name, embedding.clone()) {
                Ok(()) => EnrollmentOutcome::Enrolled { name, durable: true },
                Err(e) if e.is_persistence() => {
                    tracing::warn!(name = %name, error = %e, "enrolled in memory only; gallery not saved");
                    EnrollmentOutcome::Enrolled { name, durable: false }
                }
                Err(e) => EnrollmentOutcome::Failed {
                    name,
                    reason: EnrollmentFailure::Rejected(e.to_string()),
                },
            },
            _ => EnrollmentOutcome::Failed {
                name,
                reason: EnrollmentFailure::TooManyFaces,
            },
        };

        tracing::info!(
            name = outcome.name(),
            success = outcome.is_success(),
            faces = embeddings.len(),
            "enrollment resolved"
        );
        Some(outcome)
    }
}
