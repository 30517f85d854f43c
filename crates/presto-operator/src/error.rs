//! Error types for the Presto Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration in the Presto spec
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A resource quantity that could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    InvalidQuantity { value: String, reason: String },

    /// A required autoscaling field was left unset
    #[error("{0} cannot be null")]
    MissingAutoscalingField(&'static str),

    /// A convergence step failed
    #[error("Failed to create {resource}: {source}")]
    StepFailed {
        resource: &'static str,
        #[source]
        source: Box<OperatorError>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A write that was accepted did not stick, usually because another
    /// writer raced it
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Wrap an error with the name of the resource kind whose step failed
    pub fn in_step(self, resource: &'static str) -> Self {
        OperatorError::StepFailed {
            resource,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through step wrappers
    pub fn root(&self) -> &OperatorError {
        match self {
            OperatorError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            OperatorError::KubeError(_)
                | OperatorError::SerializationError(_)
                | OperatorError::Conflict(_)
        )
    }

    /// Errors caused by the user's spec. These are surfaced on the status
    /// and never retried until the spec changes or a resync happens.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.root(),
            OperatorError::InvalidConfig(_)
                | OperatorError::InvalidQuantity { .. }
                | OperatorError::MissingAutoscalingField(_)
                | OperatorError::ValidationError(_)
        )
    }

    /// Get a suggested requeue delay, overriding exponential backoff.
    ///
    /// A write that lost an optimistic-concurrency race is retried almost
    /// immediately against the fresh object.
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self.root() {
            OperatorError::KubeError(kube::Error::Api(resp)) if resp.code == 409 => {
                Some(std::time::Duration::from_secs(1))
            }
            OperatorError::Conflict(_) => Some(std::time::Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Whether a kube error is a 409 AlreadyExists from the API server
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}
