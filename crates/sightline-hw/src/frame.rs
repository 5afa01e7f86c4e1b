//! Frame type and pixel conversion (YUYV, GREY, RGB24, MJPEG) plus cropping.

use image::{ImageFormat, RgbImage};
use std::time::Instant;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Time the converted frame was published by its source.
    pub timestamp: Instant,
    /// Per-source capture counter, strictly increasing.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = (self.width() * self.height()) as usize;
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0)).sum::<f32>() / pixels as f32
    }

    /// Copy out a region that lies within the frame (see [`clamp_region`]).
    pub fn crop(&self, region: PixelRect) -> RgbImage {
        image::imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height)
            .to_image()
    }
}

/// Integer pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp corner coordinates `(x1, y1)–(x2, y2)` to a `width × height` image.
///
/// The start edge is floored and the end edge ceiled. Returns `None` when the
/// clamped region is empty (box entirely outside the image, inverted, or NaN).
pub fn clamp_region(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<PixelRect> {
    let clamp = |v: f32, max: u32| -> u32 {
        if v.is_nan() {
            0
        } else {
            v.clamp(0.0, max as f32) as u32
        }
    };

    let left = clamp(x1.floor(), width);
    let top = clamp(y1.floor(), height);
    let right = clamp(x2.ceil(), width);
    let bottom = clamp(y2.ceil(), height);

    if right <= left || bottom <= top {
        return None;
    }
    Some(PixelRect {
        x: left,
        y: top,
        width: right - left,
        height: bottom - top,
    })
}

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(to_u8(y + 1.402 * v));
            rgb.push(to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(to_u8(y + 1.772 * u));
        }
    }

    from_raw(rgb, width, height)
}

/// Replicate an 8-bit grayscale plane into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb = gray[..expected].iter().flat_map(|&p| [p, p, p]).collect();
    from_raw(rgb, width, height)
}

/// Wrap a packed RGB24 buffer.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    from_raw(buf[..expected].to_vec(), width, height)
}

/// Decode one Motion-JPEG buffer.
pub fn decode_mjpeg(buf: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

/// Check if a frame is dark: more than `threshold` (a fraction in [0, 1]) of
/// pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark_count = image.pixels().filter(|p| luma(p.0) < 32.0).count();
    (dark_count as f32 / total as f32) > threshold
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn from_raw(rgb: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: (width * height * 3) as usize,
        actual,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(String),
}
