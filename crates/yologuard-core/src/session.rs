//! ONNX Runtime session construction with processing-device selection.

use ort::session::Session;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where model inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingDevice {
    Cpu,
    Cuda,
    /// Use an accelerator when one is available, else the CPU.
    #[default]
    Auto,
}

impl std::str::FromStr for ProcessingDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown processing device: {other}")),
        }
    }
}

/// Build a session for `model_path` on the requested device.
///
/// Accelerator registration failures fall back to the CPU provider with a
/// warning; only a missing or unreadable model is an error.
pub fn build_session(
    model_path: &Path,
    device: ProcessingDevice,
    intra_threads: usize,
) -> Result<Session, ort::Error> {
    let builder = Session::builder()?.with_intra_threads(intra_threads)?;

    #[cfg(feature = "cuda")]
    if device != ProcessingDevice::Cpu {
        use ort::execution_providers::CUDAExecutionProvider;
        match builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            Ok(cuda_builder) => match cuda_builder.commit_from_file(model_path) {
                Ok(session) => {
                    tracing::info!(path = %model_path.display(), "using CUDA execution provider");
                    return Ok(session);
                }
                Err(e) => tracing::warn!(error = %e, "CUDA session failed; falling back to CPU"),
            },
            Err(e) => tracing::warn!(error = %e, "CUDA provider unavailable; falling back to CPU"),
        }
    }

    #[cfg(not(feature = "cuda"))]
    if device == ProcessingDevice::Cuda {
        tracing::warn!("built without the `cuda` feature; running inference on CPU");
    }

    builder.commit_from_file(model_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!("CPU".parse::<ProcessingDevice>(), Ok(ProcessingDevice::Cpu));
        assert_eq!("gpu".parse::<ProcessingDevice>(), Ok(ProcessingDevice::Cuda));
        assert_eq!("auto".parse::<ProcessingDevice>(), Ok(ProcessingDevice::Auto));
        assert!("tpu".parse::<ProcessingDevice>().is_err());
    }
}
