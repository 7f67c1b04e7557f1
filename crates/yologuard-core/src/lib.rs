//! yologuard-core: access-control recognition pipeline.
//!
//! Person/face detection (YOLOv8 + SCRFD), ArcFace embeddings, gallery
//! matching, track-based deduplication and the orchestrator that turns a
//! camera stream into access events. Models run on ONNX Runtime.

pub mod access;
pub mod alignment;
pub mod config;
pub mod detector;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod person;
pub mod pipeline;
pub mod recognizer;
pub mod scrfd;
pub mod session;
pub mod tracker;
pub mod types;

pub use access::{AccessLogger, LogDeliveryError, MemoryLogger, RetryPolicy};
pub use config::{ConfigError, ConfigHandle, PipelineConfig};
pub use detector::{Detector, DetectorError, MinConfidence, RegionDetector};
pub use frame::{FaceCrop, Frame, FrameSource, SourceError};
pub use gallery::{GalleryError, GallerySnapshot, GalleryStore, IdentityGallery, StoreError};
pub use matcher::{GalleryMatcher, Matcher, SimilarityMetric};
pub use person::{PersonGatedDetector, YoloPersonDetector};
pub use pipeline::{FrameSnapshot, Pipeline, PipelineError, PipelineHandle, PipelineStats};
pub use recognizer::{ArcFaceEmbedder, EmbedError, Embedder, ARCFACE_MODEL_VERSION};
pub use scrfd::ScrfdDetector;
pub use session::ProcessingDevice;
pub use tracker::{TrackState, TrackTable};
pub use types::{
    AccessEvent, BoundingBox, Embedding, EnrolledPerson, MatchResult, Person, PersonId,
    PersonMetadata,
};

use std::path::PathBuf;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const YOLO_MODEL_FILE: &str = "yolov8n.onnx";

/// `$XDG_DATA_HOME/yologuard/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/yologuard`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("yologuard")
}
