use thiserror::Error;

/// A rejected request: bad input that will fail again if resent unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("prompt is required")]
    EmptyPrompt,
    #[error("resolution must be one of 480p, 720p (got {0:?})")]
    UnsupportedResolution(String),
    #[error("dtype must be one of bf16, fp32 (got {0:?})")]
    UnsupportedPrecision(String),
    #[error("sparse_attn is only supported with 720p resolution")]
    SparseAttentionRequires720p,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("image_path not found: {0}")]
    ImageNotFound(String),
}

/// How the HTTP boundary reports a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 400, caller must change the request.
    Validation,
    /// 500 carrying a `retryable` flag.
    Service,
    /// 500, logged with full context server-side.
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    MalformedField {
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Missing required ckpts: {}", .0.join(", "))]
    MissingArtifacts(Vec<String>),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingField(_) | Self::MalformedField { .. } | Self::Validation(_) => {
                ErrorClass::Validation
            }
            Self::MissingArtifacts(_) | Self::ResourceExhausted(_) | Self::ExecutionFailed(_) => {
                ErrorClass::Service
            }
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Only resource exhaustion is worth resending as-is. Missing artifacts
    /// clear up once the environment is provisioned, which is not the caller's
    /// retry to make.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
