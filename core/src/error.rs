use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bucket is already locked by {holder} ({mode}, since {since})")]
    AlreadyLocked {
        holder: String,
        mode: String,
        since: String,
    },

    #[error("Lock is not held by this process (found: {found})")]
    NotHolder { found: String },

    #[error("Transport exhausted after {attempts} attempts during {operation} of {key}: {reason}")]
    TransportExhausted {
        operation: String,
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("Integrity check failed for {subject}: {reason}")]
    Integrity { subject: String, reason: String },

    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Corrupt manifest {generation}: {reason}")]
    CorruptManifest { generation: String, reason: String },

    #[error("Bucket belongs to {found}, refusing to back up {expected} (use --force to override)")]
    IdentityMismatch { expected: String, found: String },

    #[error("Restore target is not empty: {path}")]
    TargetNotEmpty { path: PathBuf },

    #[error("File changed while it was read: {path}")]
    SourceChanged { path: PathBuf },

    #[error("Run interrupted after {completed} entries, no manifest was published")]
    Interrupted { completed: usize },

    #[error("Transient transport error: {0}")]
    Transport(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    pub fn integrity(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Short machine-friendly name of the error kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::InvalidInput(_) => "invalid-input",
            Self::AlreadyLocked { .. } => "already-locked",
            Self::NotHolder { .. } => "not-holder",
            Self::TransportExhausted { .. } => "transport-exhausted",
            Self::Integrity { .. } => "integrity",
            Self::NotFound { .. } => "not-found",
            Self::CorruptManifest { .. } => "corrupt-manifest",
            Self::IdentityMismatch { .. } => "identity-mismatch",
            Self::TargetNotEmpty { .. } => "target-not-empty",
            Self::SourceChanged { .. } => "source-changed",
            Self::Interrupted { .. } => "interrupted",
            Self::Transport(_) => "transport",
            Self::Backend(_) => "backend",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
