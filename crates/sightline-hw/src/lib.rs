//! sightline-hw — Hardware abstraction for live camera capture.
//!
//! Provides V4L2-based camera access and a reconnecting frame source that
//! always holds the newest decoded frame.

pub mod camera;
pub mod device;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Opener};
pub use device::{CaptureDevice, DeviceOpener};
pub use frame::{clamp_region, Frame, FrameError, PixelRect};
pub use source::{Backoff, FrameProvider, FrameSource, SourceError, SourceState, SourceStats};
