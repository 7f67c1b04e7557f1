//! Person-gated face detection.
//!
//! A YOLOv8 person detector finds people in the full frame; the face detector
//! then runs only inside each person region large enough to hold a usable
//! face. Face boxes are mapped back to full-frame coordinates.

use crate::detector::{detections_for, nms, Detector, DetectorError, Letterbox, RegionDetector};
use crate::frame::Frame;
use crate::session::{build_session, ProcessingDevice};
use crate::types::{BoundingBox, Detection};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: f32 = 114.0;
const YOLO_PERSON_CLASS: usize = 0;
const YOLO_SCORE_FLOOR: f32 = 0.25;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
/// Person regions with a shorter side below this are skipped.
pub const DEFAULT_MIN_PERSON_SIZE: u32 = 60;

/// YOLOv8 detector restricted to the person class.
pub struct YoloPersonDetector {
    session: Session,
}

impl YoloPersonDetector {
    pub fn load(model_path: &Path, device: ProcessingDevice) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let session = build_session(model_path, device, 2)?;
        tracing::info!(path = %model_path.display(), "loaded YOLOv8 person model");
        Ok(Self { session })
    }
}

impl RegionDetector for YoloPersonDetector {
    fn detect_regions(
        &mut self,
        data: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(width, height, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE);
        let input = letterbox.tensor(data, width, height, YOLO_PAD_VALUE, |p| p / 255.0);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("YOLO output: {e}")))?;

        // [1, 4 + classes, anchors]
        if shape.len() != 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected YOLO output rank {}",
                shape.len()
            )));
        }
        let channels = shape[1] as usize;
        let anchors = shape[2] as usize;

        let boxes = decode_yolo(raw, channels, anchors, &letterbox, YOLO_SCORE_FLOOR);
        Ok(nms(boxes, YOLO_NMS_THRESHOLD))
    }
}

impl Detector for YoloPersonDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let boxes = self.detect_regions(&frame.data, frame.width as usize, frame.height as usize)?;
        Ok(detections_for(frame, boxes))
    }
}

/// Decode the channel-major YOLOv8 head: rows are cx, cy, w, h, then one
/// score per class.
fn decode_yolo(
    raw: &[f32],
    channels: usize,
    anchors: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    if channels <= 4 + YOLO_PERSON_CLASS || raw.len() < channels * anchors {
        return Vec::new();
    }
    let at = |c: usize, i: usize| raw[c * anchors + i];

    (0..anchors)
        .filter_map(|i| {
            let score = at(4 + YOLO_PERSON_CLASS, i);
            if score <= threshold {
                return None;
            }
            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks: None,
            })
        })
        .collect()
}

/// Two-stage cascade: persons first, then the best face inside each person.
///
/// The reported confidence is the face detector's.
pub struct PersonGatedDetector<P, F> {
    persons: P,
    faces: F,
    min_person_size: u32,
}

impl<P: RegionDetector, F: RegionDetector> PersonGatedDetector<P, F> {
    pub fn new(persons: P, faces: F, min_person_size: u32) -> Self {
        Self {
            persons,
            faces,
            min_person_size,
        }
    }
}

impl<P: RegionDetector, F: RegionDetector> Detector for PersonGatedDetector<P, F> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let people =
            self.persons
                .detect_regions(&frame.data, frame.width as usize, frame.height as usize)?;

        let mut faces = Vec::new();
        for person in &people {
            let Some(region) = frame.crop(person) else {
                continue;
            };
            if region.min_side() < self.min_person_size {
                tracing::trace!(
                    width = region.width,
                    height = region.height,
                    "person region too small, skipping face stage"
                );
                continue;
            }

            let found = self.faces.detect_regions(
                &region.data,
                region.width as usize,
                region.height as usize,
            )?;
            let best = found
                .into_iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
            if let Some(face) = best {
                faces.push(face.translated(region.origin.0 as f32, region.origin.1 as f32));
            }
        }

        // Overlapping person boxes can yield the same face twice.
        Ok(detections_for(frame, nms(faces, 0.5)))
    }
}
