//! Error types surfaced to open callers.
//!
//! A failed open is always delivered to the caller that asked for it, with
//! the last error code the backend reported.

use thiserror::Error;

use crate::request::ResourceId;

/// Errors that can occur while opening a resource.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// Resource cannot be opened (permission denied, hardware missing or
    /// disabled). Retrying will not help.
    #[error("resource {resource} unavailable (error code {code})")]
    Unavailable {
        /// Resource that failed to open
        resource: ResourceId,
        /// Last error code reported by the backend
        code: i32,
    },

    /// Resource is held by a contending owner. May succeed on retry.
    #[error("resource {resource} busy (error code {code})")]
    Busy {
        /// Resource that failed to open
        resource: ResourceId,
        /// Last error code reported by the backend
        code: i32,
    },

    /// The request backlog was full when the open was submitted.
    #[error("request queue full, resource {resource} not opened")]
    QueueOverflow {
        /// Resource whose open was refused
        resource: ResourceId,
    },

    /// The worker has shut down.
    #[error("request queue closed")]
    QueueClosed,
}

impl ResourceError {
    /// Returns true if the open may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Backend error code, if the failure came from the backend.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Unavailable { code, .. } | Self::Busy { code, .. } => Some(*code),
            Self::QueueOverflow { .. } | Self::QueueClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_display() {
        let err = ResourceError::Unavailable { resource: ResourceId(2), code: 13 };
        assert_eq!(err.to_string(), "resource 2 unavailable (error code 13)");

        let err = ResourceError::QueueOverflow { resource: ResourceId(5) };
        assert_eq!(err.to_string(), "request queue full, resource 5 not opened");
    }

    #[test]
    fn only_busy_is_transient() {
        assert!(ResourceError::Busy { resource: ResourceId(0), code: 1 }.is_transient());
        assert!(!ResourceError::Unavailable { resource: ResourceId(0), code: 1 }.is_transient());
        assert!(!ResourceError::QueueClosed.is_transient());
    }

    #[test]
    fn code_only_for_backend_failures() {
        assert_eq!(ResourceError::Busy { resource: ResourceId(0), code: 4 }.code(), Some(4));
        assert_eq!(ResourceError::QueueClosed.code(), None);
    }
}
