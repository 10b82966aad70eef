//! Aggregate results of `up` and `down`.

use std::fmt;

use crate::container::ContainerInstance;
use crate::error::{
    OrchestratorError, Result, EXIT_CONVERGED, EXIT_INTERRUPTED, EXIT_SERVICE_FAILED,
};

/// Progress of an `up` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpState {
    /// Nothing has been done yet.
    Pending,
    /// Networks exist.
    NetworksReady,
    /// Volumes exist.
    VolumesReady,
    /// Starting the service at this position of the resolved order.
    Starting(usize),
    /// Every selected service started.
    Running,
    /// At least one service did not start; the others keep running.
    PartiallyFailed,
}

impl fmt::Display for UpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::NetworksReady => f.write_str("networks ready"),
            Self::VolumesReady => f.write_str("volumes ready"),
            Self::Starting(index) => write!(f, "starting service #{}", index + 1),
            Self::Running => f.write_str("running"),
            Self::PartiallyFailed => f.write_str("partially failed"),
        }
    }
}

/// How one service fared during `up`.
#[derive(Debug)]
pub enum ServiceStatus {
    /// Every replica was started.
    Started {
        /// Containers started for the service.
        containers: Vec<ContainerInstance>,
    },
    /// The service did not start.
    Failed(OrchestratorError),
    /// The service was never attempted.
    Skipped {
        /// Why it was skipped.
        reason: String,
    },
}

/// Outcome of one service.
#[derive(Debug)]
pub struct ServiceOutcome {
    /// Service name.
    pub service: String,
    /// What happened.
    pub status: ServiceStatus,
}

impl ServiceOutcome {
    /// Creates a started outcome.
    pub fn started(service: impl Into<String>, containers: Vec<ContainerInstance>) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Started { containers },
        }
    }

    /// Creates a failed outcome.
    pub fn failed(service: impl Into<String>, error: OrchestratorError) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Failed(error),
        }
    }

    /// Creates a skipped outcome.
    pub fn skipped(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Skipped {
                reason: reason.into(),
            },
        }
    }

    /// Returns true if the service started.
    pub fn is_started(&self) -> bool {
        matches!(self.status, ServiceStatus::Started { .. })
    }

    /// Returns the failure, if any.
    pub fn error(&self) -> Option<&OrchestratorError> {
        match &self.status {
            ServiceStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            ServiceStatus::Started { containers } => {
                write!(f, "{}: started ({} container(s))", self.service, containers.len())
            }
            ServiceStatus::Failed(err) => write!(f, "{}: failed: {}", self.service, err),
            ServiceStatus::Skipped { reason } => write!(f, "{}: skipped ({})", self.service, reason),
        }
    }
}

/// Result of `up`.
///
/// Outcomes follow the resolved start order, so the first failure in the
/// list is the first one that happened along that order.
#[derive(Debug)]
pub struct UpReport {
    /// Project name.
    pub project: String,
    /// Final state of the run.
    pub state: UpState,
    /// Per-service outcomes in start order.
    pub outcomes: Vec<ServiceOutcome>,
    /// True if the run was interrupted.
    pub cancelled: bool,
}

impl UpReport {
    /// Returns true if every service started.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(ServiceOutcome::is_started)
    }

    /// Returns the outcome of a service.
    pub fn outcome(&self, service: &str) -> Option<&ServiceOutcome> {
        self.outcomes.iter().find(|o| o.service == service)
    }

    /// Returns the services that did not start, failed or skipped.
    pub fn unstarted(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_started())
            .map(|o| o.service.as_str())
            .collect()
    }

    /// Returns the first error along the start order.
    pub fn first_error(&self) -> Option<&OrchestratorError> {
        self.outcomes.iter().find_map(ServiceOutcome::error)
    }

    /// Returns the services in the order they were processed.
    pub fn order(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.service.as_str()).collect()
    }

    /// Returns the exit code for a CLI wrapper.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_INTERRUPTED
        } else if self.is_success() {
            EXIT_CONVERGED
        } else {
            EXIT_SERVICE_FAILED
        }
    }
}

impl fmt::Display for UpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "project {}: {}", self.project, self.state)?;
        for outcome in &self.outcomes {
            writeln!(f, "  {}", outcome)?;
        }
        Ok(())
    }
}

/// Result of `down`.
#[derive(Debug, Default)]
pub struct DownReport {
    /// Names of removed containers, in removal order.
    pub removed_containers: Vec<String>,
    /// Names of removed networks.
    pub removed_networks: Vec<String>,
    /// Names of removed volumes.
    pub removed_volumes: Vec<String>,
    /// Removed images.
    pub removed_images: Vec<String>,
    /// Every failure met along the way.
    pub errors: Vec<OrchestratorError>,
}

impl DownReport {
    /// Returns true if teardown completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts the report into a result carrying all teardown errors.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Teardown(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_report_exit_codes() {
        let mut report = UpReport {
            project: "shop".to_string(),
            state: UpState::Running,
            outcomes: vec![
                ServiceOutcome::started("a", vec![]),
                ServiceOutcome::started("c", vec![]),
            ],
            cancelled: false,
        };
        assert!(report.is_success());
        assert_eq!(report.exit_code(), EXIT_CONVERGED);

        report.outcomes.insert(
            1,
            ServiceOutcome::failed("b", OrchestratorError::container_not_found("x")),
        );
        report.state = UpState::PartiallyFailed;
        assert_eq!(report.exit_code(), EXIT_SERVICE_FAILED);
        assert_eq!(report.unstarted(), vec!["b"]);
        assert_eq!(report.order(), vec!["a", "b", "c"]);
        assert!(report.first_error().is_some());

        report.cancelled = true;
        assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_down_report_into_result() {
        assert!(DownReport::default().into_result().is_ok());

        let report = DownReport {
            errors: vec![OrchestratorError::container_not_found("a")],
            ..Default::default()
        };
        assert!(matches!(
            report.into_result(),
            Err(OrchestratorError::Teardown(errors)) if errors.len() == 1
        ));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = ServiceOutcome::skipped("web", "abort after failure of db");
        assert_eq!(outcome.to_string(), "web: skipped (abort after failure of db)");
        assert_eq!(UpState::Starting(0).to_string(), "starting service #1");
    }
}
