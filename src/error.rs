use thiserror::Error;

/// Errors returned by recognition operations.
///
/// `Validation` and `Decode` are caller-correctable (4xx-equivalent);
/// everything else is an internal fault (5xx-equivalent).
/// A missing face is never an error, see [`crate::Authentication`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("could not decode input: {0}")]
    Decode(String),

    #[error("model failed to load: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("worker pool is full ({queued} jobs queued)")]
    Busy { queued: usize },

    #[error("worker pool unavailable: {0}")]
    Unavailable(String),

    #[error("timed out waiting for worker after {0:?}")]
    Timeout(std::time::Duration),

    #[error("user store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the caller sent something we could not use.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Decode(_))
    }

    /// Message safe to hand back to a remote caller.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(_) | Error::Decode(_) => self.to_string(),
            Error::Busy { .. } | Error::Timeout(_) => "service busy, retry later".to_string(),
            Error::Unavailable(_) => "service unavailable".to_string(),
            _ => "internal server error".to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
