//! Face embedding extraction.
//!
//! [`ArcFaceEmbedder`] runs the w600k_r50 ArcFace model on a normalized
//! 112×112 face and returns an L2-normalized 512-dimensional embedding.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::FaceCrop;
use crate::session::{build_session, ProcessingDevice};
use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Tag stored with every embedding this model produces.
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("face crop {width}x{height} is below the minimum size {min}")]
    InvalidInput { width: u32, height: u32, min: u32 },
    #[error("model file not found: {0}; place the ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts a face crop into a fixed-size embedding.
pub trait Embedder: Send {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError>;

    /// Length of every embedding this embedder returns.
    fn dimension(&self) -> usize;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError> {
        (**self).embed(crop)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// Reject crops whose shorter side is below `min_size` pixels.
pub fn check_crop_size(crop: &FaceCrop, min_size: u32) -> Result<(), EmbedError> {
    if crop.width == 0 || crop.height == 0 || crop.min_side() < min_size {
        return Err(EmbedError::InvalidInput {
            width: crop.width,
            height: crop.height,
            min: min_size,
        });
    }
    Ok(())
}

pub struct ArcFaceEmbedder {
    session: Session,
    min_face_size: u32,
}

impl ArcFaceEmbedder {
    pub fn load(
        model_path: &Path,
        device: ProcessingDevice,
        min_face_size: u32,
    ) -> Result<Self, EmbedError> {
        if !model_path.exists() {
            return Err(EmbedError::ModelNotFound(model_path.display().to_string()));
        }

        let session = build_session(model_path, device, 2)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            min_face_size,
        })
    }

    /// Build the NCHW tensor from a normalized 112×112 grayscale face.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                // Grayscale → 3-channel
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }

        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedError> {
        check_crop_size(crop, self.min_face_size)?;

        let aligned = alignment::normalize_face(crop);
        let input = Self::preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: Embedding::normalized(raw.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}
