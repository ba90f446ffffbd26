use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
pub use error::{Error, Result};

pub mod executor;
pub use executor::{Executor, JobHandle};

pub mod loader;
pub use loader::{LazyModel, ModelLoader};

pub mod waveform;
pub use waveform::{AudioBuffer, DecodedAudio, Waveform, MIN_SAMPLES, SAMPLE_RATE};

pub mod decoder;
pub use decoder::{DecodeCascade, DecodeStrategy, SymphoniaDecoder, WavDecoder};

pub mod emotion;
pub use emotion::{color_for, emoji_for, Emotion, EmotionModel, EmotionResult};

pub mod face;
pub use face::{FaceBox, FaceDetector, FaceEmbedder, FaceEncoder, FaceEncoding};

pub mod matcher;
pub use matcher::{FaceMatcher, MatchPolicy};

pub mod store;
pub use store::{FaceCandidate, FaceFields, JsonUserStore, MemoryUserStore, UserRecord, UserRef, UserStore};

mod service;
pub use service::{Authentication, EmotionService, FaceService, Registration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    pub model_path: PathBuf,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/emotion.onnx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub detector_path: PathBuf,
    pub embedder_path: PathBuf,
    pub storage_dir: PathBuf,
    pub tolerance: f64,
    pub policy: MatchPolicy,
    /// Detector input as `[width, height]`.
    pub detection_input: [u32; 2],
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Side of the square crop fed to the embedder.
    pub embedding_input: u32,
}

impl Default for FaceConfig {
    fn default() -> Self {
        let detector = face::DetectorConfig::default();
        Self {
            detector_path: PathBuf::from("models/face_detector.onnx"),
            embedder_path: PathBuf::from("models/face_embedder.onnx"),
            storage_dir: PathBuf::from("faces"),
            tolerance: matcher::DEFAULT_TOLERANCE,
            policy: MatchPolicy::default(),
            detection_input: detector.input_size,
            confidence_threshold: detector.confidence_threshold,
            iou_threshold: detector.iou_threshold,
            embedding_input: 150,
        }
    }
}

impl FaceConfig {
    pub fn detector_config(&self) -> face::DetectorConfig {
        face::DetectorConfig {
            input_size: self.detection_input,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub emotion: EmotionConfig,
    pub face: FaceConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let f = std::fs::File::open(path)?;
        let cfg: Config =
            serde_yaml::from_reader(f).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.face.tolerance.is_finite() && self.face.tolerance >= 0.0) {
            return Err(Error::Config(format!("face.tolerance must be >= 0, got {}", self.face.tolerance)));
        }
        if self.face.detection_input.contains(&0) || self.face.embedding_input == 0 {
            return Err(Error::Config("face model input sizes must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.executor.workers, 2);
        assert_eq!(cfg.face.tolerance, 0.6);
        assert_eq!(cfg.face.policy, MatchPolicy::FirstMatch);
        assert_eq!(cfg.face.storage_dir, PathBuf::from("faces"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recog.yaml");
        std::fs::write(
            &path,
            "executor:\n  workers: 6\nface:\n  tolerance: 0.45\n  policy: best_match\n",
        )
        .unwrap();

        let cfg = Config::from_path(&path).unwrap();
        assert_eq!(cfg.executor.workers, 6);
        assert_eq!(cfg.executor.queue_depth, 32);
        assert_eq!(cfg.face.tolerance, 0.45);
        assert_eq!(cfg.face.policy, MatchPolicy::BestMatch);
        assert_eq!(cfg.face.detector_config().input_size, [320, 240]);
        assert_eq!(cfg.emotion, EmotionConfig::default());
    }

    #[test]
    fn bad_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recog.yaml");
        std::fs::write(&path, "face:\n  tolerance: -1.0\n").unwrap();
        assert!(matches!(Config::from_path(&path), Err(Error::Config(_))));

        std::fs::write(&path, "executor: [1, 2\n").unwrap();
        assert!(matches!(Config::from_path(&path), Err(Error::Config(_))));
        assert!(matches!(Config::from_path(dir.path().join("missing.yaml")), Err(Error::Io(_))));
    }
}
