//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Backend failures (Docker,
//! provisioner HTTP, local IO) are translated into one of these variants
//! at the provider boundary, so agent-visible tool output never carries a
//! raw transport error.

use super::SandboxStatus;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SandboxError {
    /// The backend could not create or reach the execution environment.
    #[error("Sandbox provisioning failed ({status}): {message}")]
    Provisioning {
        message: String,
        status: SandboxStatus,
    },

    /// The requested file, directory or sandbox does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A file operation targeted a directory.
    #[error("Path is a directory, not a file: {path}")]
    IsADirectory { path: String },

    /// A command or file operation could not be dispatched to the backend.
    #[error("Sandbox execution failed: {message}")]
    Execution { message: String },

    /// `str_replace` found more than one occurrence without `all`.
    #[error("String to replace occurs {count} times in {path}; pass all=true or add more context")]
    AmbiguousMatch { path: String, count: usize },

    /// `str_replace` found no occurrence.
    #[error("String to replace not found in file: {path}")]
    NoMatch { path: String },

    /// A virtual path tried to climb out of its mapped root.
    #[error("Access denied: path traversal detected in {path}")]
    PathTraversal { path: String },

    /// The thread id contains characters that are unsafe in a path.
    #[error("Invalid thread_id '{thread_id}': only alphanumeric characters, hyphens, and underscores are allowed")]
    InvalidThreadId { thread_id: String },

    /// A write targeted a read-only root such as `/mnt/skills`.
    #[error("Permission denied: {path} is read-only")]
    ReadOnly { path: String },
}

impl SandboxError {
    /// Creates a `Provisioning` error with status `Unknown`.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            status: SandboxStatus::Unknown,
        }
    }

    /// Creates a `Provisioning` error carrying a backend-confirmed status.
    pub fn provisioning_with_status(message: impl Into<String>, status: SandboxStatus) -> Self {
        Self::Provisioning {
            message: message.into(),
            status,
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an `IsADirectory` error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory { path: path.into() }
    }

    /// Creates an `Execution` error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates an `AmbiguousMatch` error.
    pub fn ambiguous_match(path: impl Into<String>, count: usize) -> Self {
        Self::AmbiguousMatch {
            path: path.into(),
            count,
        }
    }

    /// Creates a `NoMatch` error.
    pub fn no_match(path: impl Into<String>) -> Self {
        Self::NoMatch { path: path.into() }
    }

    /// Creates a `PathTraversal` error.
    pub fn path_traversal(path: impl Into<String>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Creates an `InvalidThreadId` error.
    pub fn invalid_thread_id(thread_id: impl Into<String>) -> Self {
        Self::InvalidThreadId {
            thread_id: thread_id.into(),
        }
    }

    /// Creates a `ReadOnly` error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly { path: path.into() }
    }

    /// Maps an IO error for `path` onto the sandbox taxonomy.
    pub fn from_io(err: &std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(path),
            std::io::ErrorKind::IsADirectory => Self::is_a_directory(path),
            std::io::ErrorKind::PermissionDenied => Self::read_only(path),
            _ => Self::execution(format!("{path}: {err}")),
        }
    }

    /// Returns true if this is a provisioning error.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a dispatch failure.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }

    /// Returns the sandbox status carried by a provisioning error.
    pub fn status(&self) -> Option<SandboxStatus> {
        match self {
            Self::Provisioning { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the sandbox module.
pub(crate) type SandboxResult<T> = std::result::Result<T, SandboxError>;
