//! Dependency readiness waits.
//!
//! A service only starts once each of its dependencies satisfies the
//! declared [`DependencyCondition`]. The [`ReadinessCoordinator`] polls the
//! container registry for that condition, bounded by a timeout and by the
//! engine's cancellation token.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::container::{ContainerInstance, ContainerRegistry, ContainerStatus};
use crate::error::{OrchestratorError, Result};
use crate::periodic::{poll_until, PollOutcome};
use crate::runtime::SharedRuntime;
use crate::topology::DependencyCondition;

/// What one registry check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Ready,
    Pending,
    /// The dependency can no longer satisfy the condition.
    Failed(String),
}

/// Waits for dependencies to reach their declared condition.
#[derive(Clone)]
pub struct ReadinessCoordinator {
    runtime: SharedRuntime,
    registry: ContainerRegistry,
    token: CancellationToken,
    poll_interval: Duration,
}

impl ReadinessCoordinator {
    /// Creates a coordinator.
    pub fn new(
        runtime: SharedRuntime,
        registry: ContainerRegistry,
        token: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            token,
            poll_interval,
        }
    }

    /// Blocks until `dependency` satisfies `condition`.
    ///
    /// Fails with [`OrchestratorError::DependencyTimeout`] once `timeout`
    /// elapses, with [`OrchestratorError::DependencyFailed`] as soon as the
    /// dependency can no longer get there, and with
    /// [`OrchestratorError::Cancelled`] if the engine is interrupted.
    pub async fn await_condition(
        &self,
        service: &str,
        dependency: &str,
        condition: DependencyCondition,
        timeout: Duration,
    ) -> Result<()> {
        debug!(
            service = %service,
            dependency = %dependency,
            condition = %condition,
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for dependency"
        );

        let outcome = poll_until(&self.token, self.poll_interval, timeout, || {
            self.check(dependency, condition)
        })
        .await
        .map_err(|err| match err {
            OrchestratorError::DependencyFailed { reason, .. } => {
                OrchestratorError::dependency_failed(service, dependency, reason)
            }
            other => other,
        })?;

        match outcome {
            PollOutcome::Ready(()) => {
                info!(service = %service, dependency = %dependency, condition = %condition, "Dependency ready");
                Ok(())
            }
            PollOutcome::TimedOut => Err(OrchestratorError::dependency_timeout(
                service, dependency, condition, timeout,
            )),
            PollOutcome::Cancelled => Err(OrchestratorError::Cancelled),
        }
    }

    async fn check(&self, dependency: &str, condition: DependencyCondition) -> Result<Option<()>> {
        let replicas = match condition {
            // Exit status is only visible to the runtime.
            DependencyCondition::Started | DependencyCondition::CompletedSuccessfully => {
                self.refresh(dependency).await?
            }
            DependencyCondition::Healthy => self.registry.for_service(dependency).await,
        };

        match evaluate(condition, &replicas) {
            Readiness::Ready => Ok(Some(())),
            Readiness::Pending => Ok(None),
            Readiness::Failed(reason) => Err(OrchestratorError::dependency_failed(
                String::new(),
                dependency,
                reason,
            )),
        }
    }

    /// Re-reads the state of every replica of `service` from the runtime.
    async fn refresh(&self, service: &str) -> Result<Vec<ContainerInstance>> {
        let mut replicas = self.registry.for_service(service).await;
        for replica in replicas.iter_mut().filter(|r| !r.status.is_terminal()) {
            let (status, exit_code) = match self.runtime.inspect_container(&replica.id).await {
                Ok(state) => (state.status, state.exit_code),
                Err(err) if err.is_not_found() => (ContainerStatus::Dead, None),
                Err(err) => return Err(err.into()),
            };
            if status != replica.status {
                let _ = self.registry.update_status(&replica.id, status, exit_code).await;
                replica.status = status;
                replica.exit_code = exit_code;
            }
        }
        Ok(replicas)
    }
}

/// Decides whether `replicas` satisfy `condition`.
fn evaluate(condition: DependencyCondition, replicas: &[ContainerInstance]) -> Readiness {
    let all_terminal = !replicas.is_empty() && replicas.iter().all(|r| r.status.is_terminal());

    match condition {
        DependencyCondition::Started => {
            if replicas.iter().any(ContainerInstance::is_running) {
                Readiness::Ready
            } else {
                Readiness::Pending
            }
        }
        DependencyCondition::Healthy => {
            if replicas.iter().any(|r| r.is_running() && r.is_healthy()) {
                Readiness::Ready
            } else if all_terminal {
                Readiness::Failed("exited before becoming healthy".to_string())
            } else {
                Readiness::Pending
            }
        }
        DependencyCondition::CompletedSuccessfully => {
            if replicas.iter().any(ContainerInstance::completed_successfully) {
                Readiness::Ready
            } else if all_terminal {
                let codes: Vec<String> = replicas
                    .iter()
                    .map(|r| r.exit_code.map_or_else(|| r.status.to_string(), |c| c.to_string()))
                    .collect();
                Readiness::Failed(format!("did not complete successfully (exit {})", codes.join(", ")))
            } else {
                Readiness::Pending
            }
        }
    }
}
