//! Frame type, face crops, and the frame source contract.

use crate::types::BoundingBox;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    /// Capture order. Strictly increasing within one source.
    pub sequence: u64,
    pub is_dark: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// True when more than `ratio` of the pixels fall in the darkest eighth
/// of the range (0–31). Empty buffers are dark.
pub fn is_dark_frame(gray: &[u8], ratio: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > ratio
}

impl Frame {
    /// Stamp a frame with the current time and classify its brightness.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Cut a region out of the frame, clamped to the frame bounds.
    ///
    /// Landmarks are carried over relative to the crop origin. Returns `None`
    /// when the clamped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<FaceCrop> {
        let w = self.width as usize;
        let h = self.height as usize;
        if w == 0 || h == 0 || self.data.len() < w * h {
            return None;
        }

        let x0 = bbox.x.floor().clamp(0.0, w as f32) as usize;
        let y0 = bbox.y.floor().clamp(0.0, h as f32) as usize;
        let x1 = (bbox.x + bbox.width).ceil().clamp(0.0, w as f32) as usize;
        let y1 = (bbox.y + bbox.height).ceil().clamp(0.0, h as f32) as usize;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let crop_w = x1 - x0;
        let crop_h = y1 - y0;
        let mut data = Vec::with_capacity(crop_w * crop_h);
        for y in y0..y1 {
            data.extend_from_slice(&self.data[y * w + x0..y * w + x1]);
        }

        let landmarks = bbox
            .landmarks
            .map(|lms| lms.map(|(lx, ly)| (lx - x0 as f32, ly - y0 as f32)));

        Some(FaceCrop {
            data,
            width: crop_w as u32,
            height: crop_h as u32,
            origin: (x0 as u32, y0 as u32),
            landmarks,
        })
    }
}

/// Grayscale pixels of one detected region, cut from a frame.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Top-left corner in the source frame.
    pub origin: (u32, u32),
    /// Landmarks relative to the crop's top-left corner.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceCrop {
    /// Length of the shorter side in pixels.
    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("frame source closed: {0}")]
    Closed(String),
    #[error("failed to open frame source: {0}")]
    Open(String),
}

/// A live stream of frames in strict capture order.
///
/// Implementations may drop frames under load but never reorder or repeat
/// them. Dropping the source releases the underlying device.
pub trait FrameSource: Send {
    /// Wait at most `timeout` for the next frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError>;

    /// Frames discarded by the source's bounded-latency policy so far.
    fn dropped_frames(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let data = (0..w * h).map(|i| (i % 256) as u8).collect();
        Frame::new(data, w, h, 0)
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_crop_inside() {
        let frame = gradient_frame(10, 10);
        let crop = frame.crop(&bbox(2.0, 3.0, 4.0, 2.0)).unwrap();
        assert_eq!((crop.width, crop.height), (4, 2));
        assert_eq!(crop.data, vec![32, 33, 34, 35, 42, 43, 44, 45]);
    }

    #[test]
    fn test_crop_clamped_to_frame() {
        let frame = gradient_frame(10, 10);
        let crop = frame.crop(&bbox(-5.0, 8.0, 8.0, 10.0)).unwrap();
        assert_eq!((crop.width, crop.height), (3, 2));
        assert_eq!(crop.origin, (0, 8));
    }

    #[test]
    fn test_crop_outside_is_none() {
        let frame = gradient_frame(10, 10);
        assert!(frame.crop(&bbox(20.0, 20.0, 5.0, 5.0)).is_none());
    }

    #[test]
    fn test_crop_landmarks_relative() {
        let frame = gradient_frame(100, 100);
        let mut b = bbox(10.0, 20.0, 50.0, 50.0);
        b.landmarks = Some([(30.0, 40.0); 5]);
        let crop = frame.crop(&b).unwrap();
        assert_eq!(crop.landmarks.unwrap()[0], (20.0, 20.0));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![0, 100, 200], 3, 1, 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_dark_classification() {
        assert!(Frame::new(vec![0; 100], 10, 10, 0).is_dark);
        assert!(!Frame::new(vec![128; 100], 10, 10, 0).is_dark);
        // 94% black is still usable
        let mut data = vec![0u8; 100];
        data[..6].fill(200);
        assert!(!is_dark_frame(&data, DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));
    }
}
