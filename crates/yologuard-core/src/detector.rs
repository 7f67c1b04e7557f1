//! Detector contract and the pre/post-processing shared by the ONNX detectors.

use crate::frame::Frame;
use crate::types::{BoundingBox, Detection};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates candidate regions in a frame.
///
/// Returning an empty list is a normal outcome, not an error. Boxes are in
/// the coordinate space of the input frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(frame)
    }
}

/// A model that finds boxes in a raw grayscale buffer.
///
/// The person-gated cascade runs these on sub-images; each one also backs a
/// full-frame [`Detector`].
pub trait RegionDetector: Send {
    fn detect_regions(
        &mut self,
        data: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Drops detections below a minimum confidence, whatever model is behind it.
pub struct MinConfidence<D> {
    inner: D,
    min_confidence: f32,
}

impl<D: Detector> MinConfidence<D> {
    pub fn new(inner: D, min_confidence: f32) -> Self {
        Self {
            inner,
            min_confidence,
        }
    }

    pub fn set_min_confidence(&mut self, min_confidence: f32) {
        self.min_confidence = min_confidence;
    }
}

impl<D: Detector> Detector for MinConfidence<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let mut detections = self.inner.detect(frame)?;
        let before = detections.len();
        detections.retain(|d| d.bbox.confidence >= self.min_confidence);
        if detections.len() < before {
            tracing::trace!(
                discarded = before - detections.len(),
                min_confidence = self.min_confidence,
                "discarded low-confidence detections"
            );
        }
        Ok(detections)
    }
}

/// Wrap raw boxes from one frame into detections.
pub(crate) fn detections_for(frame: &Frame, boxes: Vec<BoundingBox>) -> Vec<Detection> {
    boxes
        .into_iter()
        .map(|bbox| Detection {
            bbox,
            frame_sequence: frame.sequence,
            captured_at: frame.timestamp,
        })
        .collect()
}

/// Aspect-preserving resize into a fixed model input, centered with padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub new_w: usize,
    pub new_h: usize,
    pub input_w: usize,
    pub input_h: usize,
}

impl Letterbox {
    pub fn fit(src_w: usize, src_h: usize, input_w: usize, input_h: usize) -> Self {
        let scale = (input_w as f32 / src_w as f32).min(input_h as f32 / src_h as f32);
        let new_w = ((src_w as f32 * scale).round() as usize).min(input_w);
        let new_h = ((src_h as f32 * scale).round() as usize).min(input_h);
        Self {
            scale,
            pad_x: (input_w - new_w) as f32 / 2.0,
            pad_y: (input_h - new_h) as f32 / 2.0,
            new_w,
            new_h,
            input_w,
            input_h,
        }
    }

    /// Map a point from model-input space back to the source frame.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Resize grayscale `src` and build a 1×3×H×W tensor, replicating the
    /// single channel. `normalize` maps a raw pixel to the model's range;
    /// padding uses `pad_value` before normalization.
    pub fn tensor(
        &self,
        src: &[u8],
        src_w: usize,
        src_h: usize,
        pad_value: f32,
        normalize: impl Fn(f32) -> f32,
    ) -> Array4<f32> {
        let resized = bilinear_resize(src, src_w, src_h, self.new_w, self.new_h, self.scale);
        let x_start = self.pad_x.floor() as usize;
        let y_start = self.pad_y.floor() as usize;
        let pad = normalize(pad_value);

        let mut tensor = Array4::<f32>::from_elem((1, 3, self.input_h, self.input_w), pad);
        for y in 0..self.new_h {
            for x in 0..self.new_w {
                let v = normalize(resized[y * self.new_w + x] as f32);
                for c in 0..3 {
                    tensor[[0, c, y + y_start, x + x_start]] = v;
                }
            }
        }
        tensor
    }
}

/// Bilinear resize of a grayscale image by `scale`.
pub(crate) fn bilinear_resize(
    src: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
    scale: f32,
) -> Vec<u8> {
    let inv_scale = 1.0 / scale;
    let mut resized = vec![0u8; new_w * new_h];
    if width == 0 || height == 0 {
        return resized;
    }
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    resized
}

/// Non-Maximum Suppression, highest confidence first.
pub(crate) fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
