//! yologuard-hw: camera capture for the access pipeline.
//!
//! V4L2 device access, pixel-format conversion to grayscale and a threaded
//! frame source that keeps latency bounded by dropping stale frames.

pub mod camera;
pub mod capture;
pub mod convert;

pub use camera::{Camera, CameraError, CameraSettings, CameraStream, DeviceInfo, PixelFormat};
pub use capture::{CameraSource, Grabber, ThreadedSource};
pub use convert::{ConvertError, RawGray};
