use thiserror::Error;

/// Unified error type for the whole Orca engine.
#[derive(Error, Debug)]
pub enum OrcaError {
    // ── Request errors ─────────────────────────────────────────
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Capability errors ──────────────────────────────────────
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("capability already registered: {0}")]
    AlreadyRegistered(String),

    #[error("capability execution failed: {capability}: {reason}")]
    Execution { capability: String, reason: String },

    // ── Backend errors ─────────────────────────────────────────
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend connection failed after {attempts} attempts: {reason}")]
    BackendUnreachable { attempts: u32, reason: String },

    #[error("backend timed out after {0}s")]
    BackendTimeout(u64),

    #[error("model still loading after {attempts} retries")]
    BackendLoading { attempts: u32 },

    #[error("backend returned an empty response")]
    EmptyResponse,

    #[error("request cancelled by the consumer")]
    Cancelled,

    // ── Persistence errors ─────────────────────────────────────
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    // ── Lifecycle / config errors ──────────────────────────────
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OrcaError {
    /// True for both kinds of "does not exist" failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrcaError::CapabilityNotFound(_) | OrcaError::ConversationNotFound(_)
        )
    }

    /// True for backend failures that describe the model, not the request.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            OrcaError::Backend(_)
                | OrcaError::BackendUnreachable { .. }
                | OrcaError::BackendTimeout(_)
                | OrcaError::BackendLoading { .. }
                | OrcaError::EmptyResponse
        )
    }
}

pub type Result<T> = std::result::Result<T, OrcaError>;
