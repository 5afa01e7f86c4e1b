//! Capture device abstraction consumed by [`FrameSource`](crate::FrameSource).

use crate::camera::CameraError;
use image::RgbImage;

/// An open capture handle. Dropping it releases the device.
pub trait CaptureDevice {
    /// Block until the next frame is available and return it as RGB.
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;
}

/// Opens capture handles for one configured source.
///
/// The opener is shared with the acquisition thread, which calls
/// [`open`](Self::open) again after every read failure.
pub trait DeviceOpener: Send + Sync + 'static {
    type Device: CaptureDevice;

    /// Opaque identifier of the source (device path, index or URL).
    fn source_id(&self) -> &str;

    fn open(&self) -> Result<Self::Device, CameraError>;
}
