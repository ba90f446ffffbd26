use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::decoder::DecodeCascade;
use crate::emotion::{classify, EmotionModel, EmotionResult, OnnxEmotionModel};
use crate::executor::Executor;
use crate::face::{FaceEmbedder, FaceEncoder, OnnxFaceDetector, OnnxFaceEmbedder};
use crate::loader::{LazyModel, ModelLoader};
use crate::matcher::FaceMatcher;
use crate::store::{UserRef, UserStore};
use crate::{EmotionConfig, Error, FaceConfig, Result};

/// Runs `job` on the pool and waits for it.
async fn offload<T, F>(executor: &Executor, job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    executor.submit(job)?.join().await?
}

/// Registration outcome for a write that did not make it to storage.
fn not_persisted(user_id: u64, e: &Error) -> Registration {
    error!(user = user_id, error = %e, "face registration not persisted");
    Registration::Rejected {
        reason: "face registration could not be saved".into(),
    }
}

fn log_failure(op: &str, e: &Error) {
    if e.is_client_error() {
        warn!(op, error = %e, "request rejected");
    } else {
        error!(op, error = %e, "request failed");
    }
}

/// Speech emotion classification over a lazily loaded model.
pub struct EmotionService {
    executor: Arc<Executor>,
    model: Arc<LazyModel<dyn EmotionModel>>,
    cascade: Arc<DecodeCascade>,
}

impl EmotionService {
    pub fn new<L>(executor: Arc<Executor>, loader: L) -> Self
    where
        L: ModelLoader<dyn EmotionModel> + 'static,
    {
        Self {
            executor,
            model: Arc::new(LazyModel::new("emotion", loader)),
            cascade: Arc::new(DecodeCascade::standard()),
        }
    }

    /// Service whose model is the ONNX file named in `cfg`, loaded on first use.
    pub fn from_config(executor: Arc<Executor>, cfg: &EmotionConfig) -> Self {
        let path = cfg.model_path.clone();
        Self::new(executor, move || -> Result<Arc<dyn EmotionModel>> {
            Ok(Arc::new(OnnxEmotionModel::load(&path)?))
        })
    }

    pub fn with_cascade(mut self, cascade: DecodeCascade) -> Self {
        self.cascade = Arc::new(cascade);
        self
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// Loads the model now instead of on the first request.
    pub async fn initialize_model(&self) -> Result<()> {
        let model = self.model.clone();
        offload(&self.executor, move || model.initialize())
            .await
            .inspect_err(|e| log_failure("initialize_model", e))
    }

    /// Classifies encoded audio. `rate_hint` is the sample rate the caller
    /// believes the audio has; decoders may ignore it.
    pub async fn classify_audio(&self, data: Vec<u8>, rate_hint: u32) -> Result<EmotionResult> {
        if data.is_empty() {
            let e = Error::Validation("empty audio".into());
            log_failure("classify_audio", &e);
            return Err(e);
        }

        let model = self.model.clone();
        let cascade = self.cascade.clone();
        let res = offload(&self.executor, move || {
            let waveform = cascade.decode_normalized(&data, rate_hint)?;
            let model = model.get()?;
            classify(model.as_ref(), &waveform)
        })
        .await;

        match &res {
            Ok(r) => info!(
                emotion = %r.dominant_emotion,
                confidence = r.confidence,
                duration = r.duration,
                "classified audio"
            ),
            Err(e) => log_failure("classify_audio", e),
        }
        res
    }
}

/// Result of a face registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Registration {
    Registered { image_path: PathBuf },
    NoFace,
    Rejected { reason: String },
}

impl Registration {
    pub fn is_registered(&self) -> bool {
        matches!(self, Registration::Registered { .. })
    }
}

/// Result of a face login attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Authentication {
    Matched { user: UserRef },
    NoMatch,
    NoFace,
    InvalidImage { reason: String },
}

impl Authentication {
    pub fn user(&self) -> Option<&UserRef> {
        match self {
            Authentication::Matched { user } => Some(user),
            _ => None,
        }
    }
}

/// Face registration and login against a [`UserStore`].
pub struct FaceService {
    executor: Arc<Executor>,
    encoder: Arc<FaceEncoder>,
    matcher: Arc<FaceMatcher>,
}

impl FaceService {
    pub fn new(executor: Arc<Executor>, encoder: FaceEncoder, matcher: FaceMatcher) -> Self {
        Self {
            executor,
            encoder: Arc::new(encoder),
            matcher: Arc::new(matcher),
        }
    }

    /// Loads both face models named in `cfg`.
    pub fn from_config(executor: Arc<Executor>, store: Arc<dyn UserStore>, cfg: &FaceConfig) -> Result<Self> {
        let detector = OnnxFaceDetector::load(&cfg.detector_path, cfg.detector_config())?;
        let embedder = OnnxFaceEmbedder::load(&cfg.embedder_path, cfg.embedding_input)?;
        info!(dimension = embedder.dimension(), "face models loaded");

        let encoder = FaceEncoder::new(Arc::new(detector), Arc::new(embedder), &cfg.storage_dir);
        let matcher = FaceMatcher::new(store, cfg.tolerance, cfg.policy);
        Ok(Self::new(executor, encoder, matcher))
    }

    pub async fn register_face(&self, user_id: u64, image: String, enable_login: bool) -> Result<Registration> {
        let encoder = self.encoder.clone();
        let matcher = self.matcher.clone();
        let res = offload(&self.executor, move || {
            if matcher.store().get_by_id(user_id)?.is_none() {
                return Ok(Registration::Rejected {
                    reason: format!("unknown user {}", user_id),
                });
            }

            let (encoding, staged) = match encoder.encode_and_stage(user_id, &image) {
                Ok(Some(staged)) => staged,
                Ok(None) => return Ok(Registration::NoFace),
                Err(Error::Decode(reason)) => return Ok(Registration::Rejected { reason }),
                Err(e @ Error::Io(_)) => return Ok(not_persisted(user_id, &e)),
                Err(e) => return Err(e),
            };

            // The staged image is dropped, and so removed, on every early return.
            match matcher.register(user_id, encoding, enable_login) {
                Ok(true) => {}
                Ok(false) => {
                    // User vanished between the lookup and the write.
                    return Ok(Registration::Rejected {
                        reason: format!("unknown user {}", user_id),
                    });
                }
                Err(e @ (Error::Io(_) | Error::Store(_))) => return Ok(not_persisted(user_id, &e)),
                Err(e) => return Err(e),
            }

            let image_path = match staged.commit() {
                Ok(path) => path,
                Err(e) => return Ok(not_persisted(user_id, &e)),
            };
            Ok(Registration::Registered { image_path })
        })
        .await;

        match &res {
            Ok(Registration::Rejected { reason }) => warn!(user = user_id, reason = %reason, "face registration rejected"),
            Ok(Registration::NoFace) => info!(user = user_id, "no face in registration image"),
            Ok(Registration::Registered { .. }) => {}
            Err(e) => log_failure("register_face", e),
        }
        res
    }

    pub async fn authenticate_by_face(&self, image: String) -> Result<Authentication> {
        let encoder = self.encoder.clone();
        let matcher = self.matcher.clone();
        let res = offload(&self.executor, move || {
            let query = match encoder.encode(&image) {
                Ok(Some(v)) => v,
                Ok(None) => return Ok(Authentication::NoFace),
                Err(Error::Decode(reason)) => return Ok(Authentication::InvalidImage { reason }),
                Err(e) => return Err(e),
            };
            Ok(match matcher.authenticate(&query)? {
                Some(user) => Authentication::Matched { user },
                None => Authentication::NoMatch,
            })
        })
        .await;

        match &res {
            Ok(Authentication::InvalidImage { reason }) => warn!(reason = %reason, "face login with undecodable image"),
            Ok(_) => {}
            Err(e) => log_failure("authenticate_by_face", e),
        }
        res
    }

    /// Clears the user's face login. False for an unknown user.
    pub async fn remove_face(&self, user_id: u64) -> Result<bool> {
        let matcher = self.matcher.clone();
        offload(&self.executor, move || matcher.remove(user_id))
            .await
            .inspect_err(|e| log_failure("remove_face", e))
    }
}
