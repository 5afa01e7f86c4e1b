//! sightline-engine — per-frame detection, recognition and enrollment.
//!
//! [`DetectionPipeline`] turns one frame into a [`TickResult`]; the engine
//! thread drives it on a fixed tick and serves enrollment requests.

pub mod capability;
pub mod config;
pub mod engine;
pub mod pipeline;

pub use capability::{CapabilityError, FaceDetector, FaceEmbedder};
pub use config::{ConfigError, EngineConfig};
pub use engine::{spawn_engine, EngineError, EngineHandle, EngineOptions, LatestResult};
pub use pipeline::{
    DetectionPipeline, EnrollmentFailure, EnrollmentOutcome, FaceAnnotation, PipelineSettings,
    TickResult,
};
