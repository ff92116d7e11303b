use std::{io, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    error::DomainError,
    render::{RenderRequest, RenderResponse},
};

/// Failures a render call cannot turn into a structured `fail` response.
///
/// Timeouts and malformed worker output are *not* errors: they come back as a
/// [`RenderResponse`] whose status is `fail`.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer misconfigured: {message}")]
    Configuration { message: String },
    #[error("invalid render request: {0}")]
    Validation(#[from] DomainError),
    #[error("worker did not start within {timeout:?}")]
    StartupTimeout { timeout: Duration },
    #[error("worker transport failed during {stage}: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RenderError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn transport(stage: &'static str, source: io::Error) -> Self {
        Self::Transport { stage, source }
    }

    /// Whether the worker was torn down while producing this error.
    pub fn tore_down_worker(&self) -> bool {
        matches!(
            self,
            RenderError::StartupTimeout { .. } | RenderError::Transport { .. }
        )
    }
}

/// Anything that can turn a [`RenderRequest`] into a [`RenderResponse`].
///
/// Implementations own whatever external resources rendering needs and must
/// release them in [`Renderer::shutdown`]. `shutdown` is idempotent and leaves
/// the renderer usable: a later `render` acquires fresh resources.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderResponse, RenderError>;

    /// Release external resources, waiting at most `timeout` for an in-flight
    /// render before forcing the issue. `None` waits indefinitely.
    async fn shutdown(&self, timeout: Option<Duration>);
}
