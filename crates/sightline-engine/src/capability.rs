//! Face localization and embedding capabilities consumed by the pipeline.
//!
//! Model internals live behind these traits; the pipeline only sees boxes
//! and vectors.

use image::RgbImage;
use sightline_core::{BoundingBox, Embedding};
use sightline_hw::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Locates faces in a frame.
pub trait FaceDetector: Send {
    /// Return every candidate face with its confidence, in any order.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CapabilityError>;
}

/// Computes identity embeddings for face crops.
pub trait FaceEmbedder: Send {
    /// Return exactly one embedding per crop, in input order.
    fn embed(&mut self, faces: &[RgbImage]) -> Result<Vec<Embedding>, CapabilityError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CapabilityError> {
        (**self).detect(frame)
    }
}

impl<T: FaceEmbedder + ?Sized> FaceEmbedder for Box<T> {
    fn embed(&mut self, faces: &[RgbImage]) -> Result<Vec<Embedding>, CapabilityError> {
        (**self).embed(faces)
    }
}
