use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use yologuard_core::{PipelineConfig, ProcessingDevice};
use yologuard_hw::CameraSettings;

/// Which message bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration: a TOML file, then `YOLOGUARD_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraSettings,
    pub pipeline: PipelineConfig,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub face_model: String,
    pub embedding_model: String,
    pub person_model: String,
    /// Run the YOLO person stage before face detection.
    pub person_gate: bool,
    pub min_person_size: u32,
    pub device: ProcessingDevice,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Encrypts stored embeddings when set.
    pub encryption_key: Option<String>,
    pub embedding_dimension: usize,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            pipeline: PipelineConfig::default(),
            model_dir: yologuard_core::default_model_dir(),
            face_model: yologuard_core::SCRFD_MODEL_FILE.to_string(),
            embedding_model: yologuard_core::ARCFACE_MODEL_FILE.to_string(),
            person_model: yologuard_core::YOLO_MODEL_FILE.to_string(),
            person_gate: false,
            min_person_size: yologuard_core::person::DEFAULT_MIN_PERSON_SIZE,
            device: ProcessingDevice::Auto,
            db_path: yologuard_core::data_dir().join("yologuard.db"),
            encryption_key: None,
            embedding_dimension: yologuard_core::recognizer::ARCFACE_EMBEDDING_DIM,
            log_level: "info".to_string(),
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// `YOLOGUARD_CONFIG`, else `$XDG_CONFIG_HOME/yologuard/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("YOLOGUARD_CONFIG") {
            return PathBuf::from(path);
        }
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("yologuard/config.toml")
    }

    /// Read the file (a missing file means defaults), apply env overrides
    /// and validate the pipeline section.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()))
            }
        };
        config.apply_env();
        config
            .pipeline
            .validate()
            .context("invalid pipeline configuration")?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override individual fields from `YOLOGUARD_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let v = &var;
        env_set(v, "YOLOGUARD_CAMERA_DEVICE", &mut self.camera.device);
        env_set(v, "YOLOGUARD_CAMERA_WIDTH", &mut self.camera.width);
        env_set(v, "YOLOGUARD_CAMERA_HEIGHT", &mut self.camera.height);
        env_set(v, "YOLOGUARD_CAMERA_FPS", &mut self.camera.fps);
        env_set(v, "YOLOGUARD_OPEN_ATTEMPTS", &mut self.camera.open_attempts);
        env_set(v, "YOLOGUARD_OPEN_BACKOFF_MS", &mut self.camera.open_backoff_ms);
        env_set(v, "YOLOGUARD_WARMUP_FRAMES", &mut self.camera.warmup_frames);
        env_set(v, "YOLOGUARD_MODEL_DIR", &mut self.model_dir);
        env_set(v, "YOLOGUARD_DB_PATH", &mut self.db_path);
        env_set(v, "YOLOGUARD_DEVICE", &mut self.device);
        env_set(v, "YOLOGUARD_EMBEDDING_DIMENSION", &mut self.embedding_dimension);
        env_set(v, "YOLOGUARD_LOG_LEVEL", &mut self.log_level);
        env_set(v, "YOLOGUARD_BUS", &mut self.bus);
        if let Some(flag) = var("YOLOGUARD_PERSON_GATE") {
            self.person_gate = flag != "0";
        }
        if let Some(key) = var("YOLOGUARD_ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            self.encryption_key = Some(key);
        }

        let p = &mut self.pipeline;
        env_set(v, "YOLOGUARD_TARGET_FPS", &mut p.target_fps);
        env_set(v, "YOLOGUARD_THRESHOLD", &mut p.acceptance_threshold);
        env_set(v, "YOLOGUARD_METRIC", &mut p.metric);
        env_set(v, "YOLOGUARD_MIN_CONFIDENCE", &mut p.min_detection_confidence);
        env_set(v, "YOLOGUARD_CONFIRM_FRAMES", &mut p.confirm_frames);
        env_set(v, "YOLOGUARD_COOLDOWN_SECS", &mut p.cooldown_secs);
        env_set(v, "YOLOGUARD_MIN_FACE_SIZE", &mut p.min_face_size);
        env_set(v, "YOLOGUARD_SITE", &mut p.site);
        if let Some(flag) = var("YOLOGUARD_LOG_UNKNOWN") {
            p.log_unknown = flag != "0";
        }
    }

    pub fn face_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.face_model)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }

    pub fn person_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.person_model)
    }
}

/// Replace `slot` when `key` is set and parses; keep the old value otherwise.
fn env_set<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use yologuard_core::SimilarityMetric;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            person_gate = true
            [camera]
            device = "/dev/video4"
            [pipeline]
            acceptance_threshold = 0.5
            site = "biblioteca"
            "#,
        )
        .unwrap();
        assert!(config.person_gate);
        assert_eq!(config.camera.device, "/dev/video4");
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.pipeline.site, "biblioteca");
        assert_eq!(config.pipeline.confirm_frames, 2);
        assert_eq!(config.embedding_dimension, 512);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_vars(vars(&[
            ("YOLOGUARD_CAMERA_DEVICE", "/dev/video1"),
            ("YOLOGUARD_THRESHOLD", "0.6"),
            ("YOLOGUARD_METRIC", "euclidean"),
            ("YOLOGUARD_DEVICE", "cpu"),
            ("YOLOGUARD_PERSON_GATE", "1"),
            ("YOLOGUARD_BUS", "session"),
            ("YOLOGUARD_DB_PATH", "/var/lib/yologuard/db.sqlite"),
        ]));
        assert_eq!(config.camera.device, "/dev/video1");
        assert!((config.pipeline.acceptance_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.pipeline.metric, SimilarityMetric::Euclidean);
        assert_eq!(config.device, ProcessingDevice::Cpu);
        assert!(config.person_gate);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/yologuard/db.sqlite"));
    }

    #[test]
    fn test_bad_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_vars(vars(&[("YOLOGUARD_CONFIRM_FRAMES", "lots")]));
        assert_eq!(config.pipeline.confirm_frames, 2);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\ntarget_fps = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/models"),
            ..Config::default()
        };
        assert_eq!(config.face_model_path(), PathBuf::from("/models/det_10g.onnx"));
        assert_eq!(
            config.embedding_model_path(),
            PathBuf::from("/models/w600k_r50.onnx")
        );
    }
}
