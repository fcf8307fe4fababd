//! Error types returned across the session boundary.

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Failures reported by [`crate::SessionManager`].
///
/// Every variant is recoverable: the session stays usable and the caller
/// decides whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The identifier did not resolve to an artifact on disk.
    #[error("model not found: {0}")]
    ArtifactNotFound(String),

    /// The engine failed while constructing the model. The session is unloaded.
    #[error("error loading model: {0}")]
    LoadFailure(String),

    /// `generate` was called before any successful `load`.
    #[error("no model loaded, load a model first")]
    NoModelLoaded,

    /// The engine failed while generating. The loaded model stays usable.
    #[error("error generating image: {0}")]
    GenerationFailure(String),
}

impl SessionError {
    /// Wraps an engine error, keeping its whole context chain in the message.
    pub(crate) fn load(err: anyhow::Error) -> Self {
        Self::LoadFailure(format!("{err:#}"))
    }

    pub(crate) fn generation(err: anyhow::Error) -> Self {
        Self::GenerationFailure(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn engine_context_is_flattened_into_the_message() {
        let err = Err::<(), _>(anyhow::anyhow!("CUDA_ERROR_OUT_OF_MEMORY"))
            .context("failed to run unet")
            .unwrap_err();
        let err = SessionError::generation(err);
        assert_eq!(
            err.to_string(),
            "error generating image: failed to run unet: CUDA_ERROR_OUT_OF_MEMORY"
        );
    }
}
