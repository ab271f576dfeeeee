//! Error taxonomy for the fleet agent
//!
//! Each subsystem owns one error type. Only `CycleResult` crosses the
//! reconciliation boundary; these types are converted into recorded
//! messages before they reach observers.

use thiserror::Error;

/// A malformed field in a declarative service description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("invalid memory limit '{value}' for service {service}")]
    InvalidMemory { service: String, value: String },

    #[error("invalid cpu limit '{value}' for service {service}")]
    InvalidCpus { service: String, value: String },

    #[error("invalid restart policy '{value}' for service {service}")]
    InvalidRestartPolicy { service: String, value: String },

    #[error("invalid port binding '{value}' for service {service}")]
    InvalidPort { service: String, value: String },

    #[error("invalid volume binding '{value}' for service {service}")]
    InvalidVolume { service: String, value: String },

    #[error("invalid device mapping '{value}' for service {service}")]
    InvalidDevice { service: String, value: String },

    #[error("invalid extra host '{value}' for service {service}")]
    InvalidExtraHost { service: String, value: String },

    #[error("service {service} has no image")]
    MissingImage { service: String },
}

/// Failure reported by the container runtime
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("runtime transport error: {0}")]
    Transport(String),

    #[error("failed to decode runtime response: {0}")]
    Decode(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Failure resolving the latest digest for an image reference
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no digest published for {0}")]
    NotFound(String),

    #[error("registry lookup for {image} failed: {message}")]
    Lookup { image: String, message: String },
}

/// Another reconciliation cycle holds the execution token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("another update cycle is already running")]
pub struct LockBusyError;

/// Failure of a manual start or stop
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error(transparent)]
    Busy(#[from] LockBusyError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("refusing to stop the agent's own container {0}")]
    SelfContainer(String),
}

/// The dependency graph of a batch could not be ordered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle between containers: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Failure of one streaming subscription
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("upstream error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("failed to write to client: {0}")]
    Send(String),

    #[error("failed to read from client: {0}")]
    Receive(String),

    #[error("broadcaster is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_cycle_message_lists_members() {
        let err = PlanError::DependencyCycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "dependency cycle between containers: a, b");
    }

    #[test]
    fn test_runtime_not_found_predicate() {
        assert!(RuntimeError::NotFound("web".into()).is_not_found());
        assert!(!RuntimeError::Transport("reset".into()).is_not_found());
    }
}
