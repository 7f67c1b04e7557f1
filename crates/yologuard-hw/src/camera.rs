//! V4L2 camera capture via the `v4l` crate.

use crate::convert::{self, RawGray};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

/// How long one dequeue may block before the capture loop checks for stop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    /// One buffer could not be converted; the stream itself is still up.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported by {0}")]
    StreamingNotSupported(String),
}

impl CameraError {
    /// Worth retrying: the device may appear or be released shortly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CameraError::DeviceNotFound(_) | CameraError::DeviceBusy(_)
        )
    }

    /// Only the current frame is lost; capture can go on.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, CameraError::CorruptFrame(_))
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    /// Motion-JPEG, decoded per frame.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// Everything needed to open and drive one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// V4L2 device path, e.g. "/dev/video0".
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Total open attempts before giving up.
    pub open_attempts: u32,
    pub open_backoff_ms: u64,
    /// Frames discarded after streaming starts (exposure settling).
    pub warmup_frames: usize,
    /// Frames buffered between capture and the pipeline; older ones are
    /// dropped when full.
    pub queue_depth: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 15,
            open_attempts: 3,
            open_backoff_ms: 500,
            warmup_frames: 4,
            queue_depth: 2,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a camera and negotiate resolution and frame rate. One attempt.
    pub fn open(settings: &CameraSettings) -> Result<Self, CameraError> {
        let device_path = settings.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported(device_path.to_string()));
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, Y16 or MJPG)"
            ))
        })?;

        if settings.fps > 0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
                tracing::warn!(fps = settings.fps, error = %e, "driver rejected frame rate");
            }
        }

        if (negotiated.width, negotiated.height) != (settings.width, settings.height) {
            tracing::warn!(
                requested = format!("{}x{}", settings.width, settings.height),
                width = negotiated.width,
                height = negotiated.height,
                "driver adjusted resolution"
            );
        }
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Open with bounded retry. Only missing or busy devices are retried;
    /// the backoff doubles after each failure.
    pub fn open_with_retry(settings: &CameraSettings) -> Result<Self, CameraError> {
        let attempts = settings.open_attempts.max(1);
        let mut backoff = Duration::from_millis(settings.open_backoff_ms);

        for attempt in 1..=attempts {
            match Self::open(settings) {
                Ok(camera) => return Ok(camera),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        device = %settings.device,
                        attempt,
                        attempts,
                        error = %e,
                        "camera open failed, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CameraError::DeviceNotFound(settings.device.clone()))
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. The stream owns the device from here on.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        Ok(CameraStream {
            stream,
            _device: self.device,
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// A streaming camera, producing grayscale frames.
pub struct CameraStream {
    stream: MmapStream<'static>,
    // Keeps the device open for as long as buffers are mapped.
    _device: Device,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl CameraStream {
    /// Dequeue the next frame. `Ok(None)` when nothing arrived within the
    /// dequeue timeout.
    pub fn next_gray(&mut self) -> Result<Option<RawGray>, CameraError> {
        let (buf, _meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Ok(None)
            }
            Err(e) => {
                return Err(CameraError::CaptureFailed(format!(
                    "failed to dequeue buffer: {e}"
                )))
            }
        };

        let (w, h) = (self.width, self.height);
        let data = match self.pixel_format {
            PixelFormat::Grey => convert::grey_copy(buf, w, h),
            PixelFormat::Y16 => convert::y16_to_grayscale(buf, w, h),
            PixelFormat::Yuyv => convert::yuyv_to_grayscale(buf, w, h),
            PixelFormat::Mjpeg => convert::mjpeg_to_grayscale(buf, w, h),
        }
        .map_err(|e| CameraError::CorruptFrame(e.to_string()))?;

        Ok(Some(RawGray {
            data,
            width: w,
            height: h,
        }))
    }
}
