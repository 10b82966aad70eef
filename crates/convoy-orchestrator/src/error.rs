//! Error types for the orchestrator crate.
//!
//! [`OrchestratorError`] is the single error type returned by the engine.
//! Failures coming from the container runtime are carried as a
//! [`RuntimeError`] so that retry decisions can be made on its kind rather
//! than on message text.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::topology::DependencyCondition;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur during orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The topology is malformed or missing required fields.
    #[error("invalid topology: {0}")]
    SpecValidation(String),

    /// The dependency graph contains a cycle.
    #[error("circular dependency involving service {service}: {}", .path.join(" -> "))]
    CircularDependency {
        /// The service that was revisited while still being resolved.
        service: String,
        /// The services forming the cycle, starting and ending with `service`.
        path: Vec<String>,
    },

    /// A dependency did not reach its required condition in time.
    #[error(
        "service {service} timed out after {timeout:?} waiting for {dependency} to be {condition}"
    )]
    DependencyTimeout {
        /// The service that was waiting.
        service: String,
        /// The service being waited on.
        dependency: String,
        /// The condition that was not satisfied.
        condition: DependencyCondition,
        /// How long the wait lasted.
        timeout: Duration,
    },

    /// A dependency can never satisfy its condition.
    #[error("service {service} cannot start: dependency {dependency} {reason}")]
    DependencyFailed {
        /// The dependent service.
        service: String,
        /// The dependency that failed.
        dependency: String,
        /// Why the dependency can no longer become ready.
        reason: String,
    },

    /// A call to the container runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A health probe failed. Only ever reported, never fatal to `up`.
    #[error("health check failed for {container}: {reason}")]
    HealthCheckFailure {
        /// The container name.
        container: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The operation was interrupted.
    #[error("operation cancelled")]
    Cancelled,

    /// One or more teardown steps failed.
    #[error("teardown failed with {} error(s): {}", .0.len(), join_errors(.0))]
    Teardown(Vec<OrchestratorError>),

    /// The named service is not part of the active topology.
    #[error("no such service: {0}")]
    ServiceNotFound(String),

    /// No container matches the request.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Engine configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Creates a spec validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::SpecValidation(reason.into())
    }

    /// Creates a circular dependency error.
    pub fn circular_dependency(service: impl Into<String>, path: Vec<String>) -> Self {
        Self::CircularDependency {
            service: service.into(),
            path,
        }
    }

    /// Creates a dependency timeout error.
    pub fn dependency_timeout(
        service: impl Into<String>,
        dependency: impl Into<String>,
        condition: DependencyCondition,
        timeout: Duration,
    ) -> Self {
        Self::DependencyTimeout {
            service: service.into(),
            dependency: dependency.into(),
            condition,
            timeout,
        }
    }

    /// Creates a dependency failed error.
    pub fn dependency_failed(
        service: impl Into<String>,
        dependency: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyFailed {
            service: service.into(),
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    /// Creates a health check failure.
    pub fn health_check_failed(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HealthCheckFailure {
            container: container.into(),
            reason: reason.into(),
        }
    }

    /// Creates a service not found error.
    pub fn service_not_found(name: impl Into<String>) -> Self {
        Self::ServiceNotFound(name.into())
    }

    /// Creates a container not found error.
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::ContainerNotFound(id.into())
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Returns true if retrying the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Runtime(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ServiceNotFound(_) | Self::ContainerNotFound(_) => true,
            Self::Runtime(err) => matches!(
                err.kind,
                RuntimeErrorKind::NotFound | RuntimeErrorKind::ImageNotFound
            ),
            _ => false,
        }
    }

    /// Returns true for errors detected before any runtime call is made.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::SpecValidation(_)
                | Self::CircularDependency { .. }
                | Self::Configuration(_)
                | Self::Serialization(_)
                | Self::ServiceNotFound(_)
        )
    }

    /// Returns the process exit code a CLI wrapper should use for this error.
    pub fn exit_code(&self) -> i32 {
        if self.is_configuration_error() {
            EXIT_CONFIG_ERROR
        } else if matches!(self, Self::Cancelled) {
            EXIT_INTERRUPTED
        } else {
            EXIT_SERVICE_FAILED
        }
    }
}

/// Exit code: every selected service converged.
pub const EXIT_CONVERGED: i32 = 0;

/// Exit code: one or more services failed.
pub const EXIT_SERVICE_FAILED: i32 = 1;

/// Exit code: the topology or configuration is invalid.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Exit code: interrupted by a signal.
pub const EXIT_INTERRUPTED: i32 = 3;

fn join_errors(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Classification of a container runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The referenced container, network or volume does not exist.
    NotFound,
    /// The resource being created already exists.
    AlreadyExists,
    /// The resource is busy (being created, removed or in use).
    Conflict,
    /// The requested image does not exist.
    ImageNotFound,
    /// A temporary failure such as a daemon timeout.
    Transient,
    /// Anything else.
    Other,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Conflict => "conflict",
            Self::ImageNotFound => "image not found",
            Self::Transient => "transient",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

/// An error reported by the container runtime.
#[derive(Debug, Clone, Error)]
#[error("runtime {operation} failed ({kind}): {message}")]
pub struct RuntimeError {
    /// What went wrong.
    pub kind: RuntimeErrorKind,
    /// The runtime call that failed, e.g. `create_container`.
    pub operation: String,
    /// The runtime's message.
    pub message: String,
}

impl RuntimeError {
    /// Creates a runtime error.
    pub fn new(
        kind: RuntimeErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::NotFound, operation, message)
    }

    /// Creates an already exists error.
    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::AlreadyExists, operation, message)
    }

    /// Creates a transient error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Transient, operation, message)
    }

    /// Creates an image not found error.
    pub fn image_not_found(operation: impl Into<String>, image: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::ImageNotFound, operation, image)
    }

    /// Creates an uncategorised error.
    pub fn other(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Other, operation, message)
    }

    /// Returns true for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RuntimeErrorKind::Transient | RuntimeErrorKind::Conflict
        )
    }

    /// Returns true if the target does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == RuntimeErrorKind::NotFound
    }

    /// Returns true if the resource already exists.
    pub fn is_already_exists(&self) -> bool {
        self.kind == RuntimeErrorKind::AlreadyExists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::container_not_found("abc123");
        assert_eq!(err.to_string(), "container not found: abc123");

        let err = OrchestratorError::circular_dependency(
            "a",
            vec!["a".to_string(), "b".to_string(), "a".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "circular dependency involving service a: a -> b -> a"
        );

        let err = OrchestratorError::dependency_timeout(
            "web",
            "db",
            DependencyCondition::Healthy,
            Duration::from_millis(100),
        );
        assert_eq!(
            err.to_string(),
            "service web timed out after 100ms waiting for db to be healthy"
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = RuntimeError::transient("create_container", "resource already creating");
        assert!(OrchestratorError::from(transient).is_retryable());

        let missing = RuntimeError::image_not_found("create_container", "nope:latest");
        assert!(!OrchestratorError::from(missing).is_retryable());

        assert!(!OrchestratorError::validation("test").is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_is_not_found() {
        assert!(OrchestratorError::container_not_found("test").is_not_found());
        assert!(OrchestratorError::service_not_found("test").is_not_found());
        assert!(OrchestratorError::from(RuntimeError::not_found("inspect", "x")).is_not_found());
        assert!(!OrchestratorError::Cancelled.is_not_found());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(OrchestratorError::validation("x").exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            OrchestratorError::circular_dependency("a", vec![]).exit_code(),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(OrchestratorError::Cancelled.exit_code(), EXIT_INTERRUPTED);
        assert_eq!(
            OrchestratorError::from(RuntimeError::other("pull", "boom")).exit_code(),
            EXIT_SERVICE_FAILED
        );
    }

    #[test]
    fn test_teardown_display_joins_errors() {
        let err = OrchestratorError::Teardown(vec![
            OrchestratorError::container_not_found("a"),
            OrchestratorError::container_not_found("b"),
        ]);
        assert_eq!(
            err.to_string(),
            "teardown failed with 2 error(s): container not found: a; container not found: b"
        );
    }
}
