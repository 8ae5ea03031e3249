use thiserror::Error;

/// Result type used throughout the calling core
pub type Result<T> = std::result::Result<T, CallError>;

/// Everything that can go wrong while setting up or running a call
#[derive(Debug, Error)]
pub enum CallError {
    #[error("permission denied for {device}")]
    PermissionDenied { device: String },

    #[error("no {device} available")]
    DeviceUnavailable { device: String },

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload does not match expected schema: {0}")]
    SchemaMismatch(String),

    #[error("remote descriptor cannot be applied: {0}")]
    InvalidRemoteDescriptor(String),

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("no active offer")]
    NoActiveOffer,

    #[error("no active answer")]
    NoActiveAnswer,

    #[error("answer already applied")]
    AlreadyAnswered,

    #[error("connectivity failed: {0}")]
    ConnectivityFailed(String),

    #[error("failed to encode payload: {0}")]
    Encoding(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("webrtc: {0}")]
    Webrtc(#[from] webrtc::Error),
}

impl CallError {
    /// Fatal errors end the call; everything else can be corrected inline
    /// (re-paste, re-scan, retry the step) without touching session state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::PermissionDenied { .. }
                | CallError::DeviceUnavailable { .. }
                | CallError::MediaUnavailable(_)
                | CallError::ConnectivityFailed(_)
                | CallError::Webrtc(_)
        )
    }

    /// Out-of-order step errors.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CallError::PreconditionNotMet(_)
                | CallError::NoActiveOffer
                | CallError::NoActiveAnswer
                | CallError::AlreadyAnswered
        )
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        CallError::PreconditionNotMet(msg.into())
    }
}
