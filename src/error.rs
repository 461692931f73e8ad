//! Renderer error types.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors returned by renderer operations.
///
/// Usage errors and logic defects are fatal: they indicate a caller bug and
/// must not be retried. Capability gaps are soft and the caller may try
/// again with different parameters. See [`RenderError::is_fatal`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// An object uses a texture that the bound render target is writing to.
    #[error("object uses texture {0} that is being rendered to")]
    FeedbackLoop(u64),
    /// Structurally invalid render target configuration.
    #[error("invalid render target configuration: {0}")]
    InvalidTargetConfig(String),
    /// The backend cannot provide the requested render target.
    #[error("render target not supported: {0}")]
    UnsupportedTarget(String),
    /// Framebuffer incomplete for a reason other than an unsupported combination.
    #[error("framebuffer incomplete (status 0x{0:04x})")]
    IncompleteFramebuffer(u32),
    /// The render thread is gone.
    #[error("render thread disconnected")]
    Disconnected,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RenderError {
    /// Whether the error signals a caller or engine defect rather than a
    /// recoverable capability gap.
    pub fn is_fatal(&self) -> bool {
        match self {
            RenderError::FeedbackLoop(_)
            | RenderError::InvalidTargetConfig(_)
            | RenderError::IncompleteFramebuffer(_) => true,
            RenderError::UnsupportedTarget(_) => false,
            RenderError::Disconnected => true,
            RenderError::Backend(err) => !matches!(err, BackendError::FeatureNotSupported(_)),
        }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::IncompleteFramebuffer(0x8cd6);
        assert_eq!(err.to_string(), "framebuffer incomplete (status 0x8cd6)");

        let err = RenderError::InvalidTargetConfig("no outputs requested".to_string());
        assert_eq!(
            err.to_string(),
            "invalid render target configuration: no outputs requested"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RenderError::FeedbackLoop(3).is_fatal());
        assert!(RenderError::InvalidTargetConfig(String::new()).is_fatal());
        assert!(!RenderError::UnsupportedTarget(String::new()).is_fatal());
        assert!(!RenderError::Backend(BackendError::FeatureNotSupported("fbo".into())).is_fatal());
        assert!(RenderError::Backend(BackendError::ContextLost).is_fatal());
    }
}
