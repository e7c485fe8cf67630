use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errores que la capa de resolución puede devolver a un cliente.
///
/// Every variant carries only owned, cloneable data: a single failed
/// resolution is fanned out to every waiter of the same key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The identifier does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient network or provider failure.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The resolver exceeded its allotted time.
    #[error("upstream timed out after {}", humantime::format_duration(.0.to_owned()))]
    Timeout(Duration),

    /// Malformed identifier, rejected before reaching the resolver.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ResolveError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Código HTTP que la capa de dispatch debe usar para este error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Invalid(_) => 400,
            Self::NotFound(_) => 404,
            Self::UpstreamUnavailable(_) => 502,
            Self::Timeout(_) => 504,
        }
    }

    /// Cuerpo JSON `{"error": "..."}` que consume el frontend.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
        }
    }

    /// Errors that are worth re-requesting later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type Result<T> = std::result::Result<T, ResolveError>;
