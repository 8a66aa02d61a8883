//! Error taxonomy for backend operations.

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors a compute backend reports to the reconciliation loop.
///
/// Every failed API call is wrapped with the name of the operation that
/// issued it; the loop logs these and moves on to the next tick rather
/// than retrying within the same tick.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No golden image has been published yet, so a runner cannot launch.
    #[error("no runner image available")]
    NoImage,

    /// A backend API call failed.
    #[error("{op}: {message}")]
    Api { op: &'static str, message: String },

    /// An asynchronous backend operation reached its ERROR state.
    #[error("operation {name}: {message}")]
    Operation { name: String, message: String },

    /// Shutdown was requested while waiting on the backend.
    #[error("cancelled while waiting for {0}")]
    Cancelled(&'static str),

    /// Composing the bootstrap document failed before anything launched.
    #[error("bootstrap document: {0}")]
    Bootstrap(String),
}

impl BackendError {
    /// Wrap a failed API call with the operation name for context.
    pub fn api(op: &'static str, err: impl std::fmt::Display) -> Self {
        BackendError::Api {
            op,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_carry_the_operation_name() {
        let err = BackendError::api("list instances", "connection refused");
        assert_eq!(err.to_string(), "list instances: connection refused");
    }

    #[test]
    fn no_image_is_distinguishable() {
        assert!(matches!(BackendError::NoImage, BackendError::NoImage));
        assert_eq!(
            BackendError::NoImage.to_string(),
            "no runner image available"
        );
    }
}
