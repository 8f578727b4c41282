// Typed failures reported by the service ports

pub mod classifier;

use thiserror::Error;

/// A failed call to one of the setup services, in terms the classifier can discriminate without
/// looking at message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("name resolution failed: {0}")]
    Dns(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("credentials rejected: {0}")]
    InvalidCredentials(String),
    #[error("permission denied: {message}")]
    PermissionDenied { message: String, transient: bool },
    #[error("insufficient disk space: {0}")]
    DiskSpace(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// The service answered with a failure that carries no typed signal.
    #[error("{message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },
}

impl ServiceError {
    /// Maps a service-reported failure code onto a typed error.
    pub fn from_reported(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let normalized = code.map(|c| c.trim().to_ascii_uppercase());
        match normalized.as_deref() {
            Some("DISK_FULL" | "ENOSPC" | "INSUFFICIENT_DISK_SPACE") => {
                ServiceError::DiskSpace(message)
            }
            Some("PERMISSION_DENIED" | "EACCES" | "EPERM") => ServiceError::PermissionDenied {
                message,
                transient: false,
            },
            Some("RESOURCE_BUSY" | "EBUSY" | "LOCKED") => ServiceError::PermissionDenied {
                message,
                transient: true,
            },
            Some("INVALID_CREDENTIALS" | "UNAUTHORIZED") => {
                ServiceError::InvalidCredentials(message)
            }
            Some("ECONNREFUSED") => ServiceError::ConnectionRefused(message),
            Some("MALFORMED_RESPONSE") => ServiceError::MalformedResponse(message),
            _ => ServiceError::Rejected {
                code: code.map(str::to_string),
                message,
            },
        }
    }

    /// Failures of the transport or the service itself, as opposed to a verdict about the
    /// request. Validation falls back and replication retries only on these.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            ServiceError::Timeout { .. }
            | ServiceError::ConnectionRefused(_)
            | ServiceError::Dns(_)
            | ServiceError::Transport(_)
            | ServiceError::MalformedResponse(_) => true,
            ServiceError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The service looked at the credential and said no.
    pub fn is_credential_rejection(&self) -> bool {
        match self {
            ServiceError::InvalidCredentials(_) => true,
            ServiceError::Http { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}
