use std::{fmt, sync::Arc};

/// Result alias that carries the custom [`AudioError`] type.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Shared, cloneable lower-level cause attached to an [`AudioError`].
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Category of failure reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioErrorKind {
    InitializationFailed,
    LoadFailed,
    DecodeFailed,
    PlaybackFailed,
    FormatUnsupported,
    PermissionDenied,
    NetworkError,
    InvalidData,
    InteractionRequired,
    /// Batch lip-sync analysis exceeded its deadline.
    Timeout,
}

impl AudioErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitializationFailed => "initialization-failed",
            Self::LoadFailed => "load-failed",
            Self::DecodeFailed => "decode-failed",
            Self::PlaybackFailed => "playback-failed",
            Self::FormatUnsupported => "format-unsupported",
            Self::PermissionDenied => "permission-denied",
            Self::NetworkError => "network-error",
            Self::InvalidData => "invalid-data",
            Self::InteractionRequired => "interaction-required",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AudioErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common error type for the core crate.
///
/// Errors are cloneable so they can be fanned out to several event
/// subscribers. Payload bytes are never embedded in the message; load and
/// decode failures only carry the byte length and a short hex prefix.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AudioError {
    pub kind: AudioErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<ErrorCause>,
    /// Set when the failure clears once the user has produced a gesture.
    pub requires_interaction: bool,
}

impl AudioError {
    pub fn new(kind: AudioErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            requires_interaction: kind == AudioErrorKind::InteractionRequired,
        }
    }

    /// Attaches the lower-level error that triggered this one.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn interaction_required(message: impl Into<String>) -> Self {
        Self::new(AudioErrorKind::InteractionRequired, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(AudioErrorKind::InvalidData, message)
    }

    pub fn decode_failed(message: impl Into<String>) -> Self {
        Self::new(AudioErrorKind::DecodeFailed, message)
    }

    pub fn playback_failed(message: impl Into<String>) -> Self {
        Self::new(AudioErrorKind::PlaybackFailed, message)
    }

    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::new(AudioErrorKind::InitializationFailed, message)
    }

    pub fn is_interaction_required(&self) -> bool {
        self.requires_interaction
    }
}

impl From<std::io::Error> for AudioError {
    fn from(value: std::io::Error) -> Self {
        let kind = match value.kind() {
            std::io::ErrorKind::PermissionDenied => AudioErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                AudioErrorKind::InvalidData
            }
            _ => AudioErrorKind::LoadFailed,
        };
        Self::new(kind, value.to_string()).with_cause(value)
    }
}
