//! Pipeline configuration and its hot-reload handle.

use crate::access::RetryPolicy;
use crate::matcher::SimilarityMetric;
use crate::tracker::TrackerSettings;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longest cooldown or silence window accepted, in seconds.
const MAX_WINDOW_SECS: f32 = 86_400.0;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid config value for {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        field,
        reason: reason.into(),
    }
}

/// Everything the orchestrator reads each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub target_fps: u32,
    /// Bounded wait for the next frame.
    pub frame_timeout_ms: u64,
    pub min_detection_confidence: f32,
    /// Similarity at or above this is a match.
    pub acceptance_threshold: f32,
    pub metric: SimilarityMetric,
    /// Consecutive frames of one identity before a track is confirmed.
    pub confirm_frames: u32,
    pub cooldown_secs: f32,
    pub silence_secs: f32,
    /// Shorter side of a face crop, in pixels, below which no embedding is made.
    pub min_face_size: u32,
    pub iou_threshold: f32,
    /// Write events for faces that match nobody.
    pub log_unknown: bool,
    /// Camera / site identifier stamped on every event.
    pub site: String,
    pub log_retry_attempts: u32,
    pub log_retry_backoff_ms: u64,
    /// Minimum interval between two backlog warnings.
    pub backlog_report_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: 15,
            frame_timeout_ms: 1000,
            min_detection_confidence: 0.5,
            acceptance_threshold: 0.45,
            metric: SimilarityMetric::Cosine,
            confirm_frames: 2,
            cooldown_secs: 3.0,
            silence_secs: 2.0,
            min_face_size: 40,
            iou_threshold: 0.3,
            log_unknown: false,
            site: "main".to_string(),
            log_retry_attempts: 3,
            log_retry_backoff_ms: 50,
            backlog_report_secs: 5,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=120).contains(&self.target_fps) {
            return Err(invalid("target_fps", "must be between 1 and 120"));
        }
        if self.frame_timeout_ms == 0 {
            return Err(invalid("frame_timeout_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_detection_confidence) {
            return Err(invalid("min_detection_confidence", "must lie in [0, 1]"));
        }
        let (lo, hi) = match self.metric {
            SimilarityMetric::Cosine => (-1.0, 1.0),
            SimilarityMetric::Euclidean => (0.0, 1.0),
        };
        if !(lo..=hi).contains(&self.acceptance_threshold) {
            return Err(invalid(
                "acceptance_threshold",
                format!("must lie in [{lo}, {hi}] for the {} metric", self.metric),
            ));
        }
        if self.confirm_frames == 0 {
            return Err(invalid("confirm_frames", "must be at least 1"));
        }
        if !(0.0..=MAX_WINDOW_SECS).contains(&self.cooldown_secs) {
            return Err(invalid(
                "cooldown_secs",
                format!("must lie in [0, {MAX_WINDOW_SECS}]"),
            ));
        }
        if !(self.silence_secs > 0.0 && self.silence_secs <= MAX_WINDOW_SECS) {
            return Err(invalid(
                "silence_secs",
                format!("must be positive and at most {MAX_WINDOW_SECS}"),
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(invalid("iou_threshold", "must lie in [0, 1]"));
        }
        if self.site.trim().is_empty() {
            return Err(invalid("site", "must not be empty"));
        }
        Ok(())
    }

    /// Time one cycle may take at the target rate.
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn backlog_report_interval(&self) -> Duration {
        Duration::from_secs(self.backlog_report_secs)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            confirm_frames: self.confirm_frames,
            cooldown: window(self.cooldown_secs),
            silence: window(self.silence_secs),
            iou_threshold: self.iou_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.log_retry_attempts,
            backoff: Duration::from_millis(self.log_retry_backoff_ms),
        }
    }
}

/// Seconds to a duration, clamped to `[0, MAX_WINDOW_SECS]`. NaN maps to zero.
fn window(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs.clamp(0.0, MAX_WINDOW_SECS)).unwrap_or_default()
}

/// Shared, atomically replaceable configuration.
///
/// The pipeline loads it once per cycle; `replace` swaps in a whole new
/// value, so a cycle never sees a mix of old and new fields.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<PipelineConfig>>,
}

impl ConfigHandle {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    pub fn load(&self) -> Arc<PipelineConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, config: PipelineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        tracing::info!("pipeline configuration replaced");
        Ok(())
    }
}
