//! Container health monitoring.
//!
//! A [`HealthTracker`] is the per-container state machine; it knows nothing
//! about containers or time. A [`HealthMonitor`] drives one tracker by
//! running the service's probe inside the container on every interval and
//! publishing transitions to the registry.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{ContainerInstance, ContainerRegistry, ContainerStatus, HealthState};
use crate::error::OrchestratorError;
use crate::periodic::PeriodicTask;
use crate::runtime::{ExecOptions, SharedRuntime};
use crate::topology::HealthCheck;

/// A health state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the probe.
    pub from: HealthState,
    /// State after the probe.
    pub to: HealthState,
}

/// Health state machine for one container.
///
/// Starts in `starting`. A successful probe resets the failure counter and
/// moves straight to `healthy`. Failed probes count up; reaching the retry
/// threshold moves to `unhealthy`, which holds until the next success.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    retries: u32,
    failures: u32,
    state: HealthState,
}

impl HealthTracker {
    /// Creates a tracker. A threshold of zero behaves as one.
    pub fn new(retries: u32) -> Self {
        Self {
            retries: retries.max(1),
            failures: 0,
            state: HealthState::Starting,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Returns the number of consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a successful probe.
    pub fn record_success(&mut self) -> Option<Transition> {
        self.failures = 0;
        self.move_to(HealthState::Healthy)
    }

    /// Records a failed probe.
    pub fn record_failure(&mut self) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.retries {
            self.move_to(HealthState::Unhealthy)
        } else {
            None
        }
    }

    fn move_to(&mut self, to: HealthState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }
}

/// Result of one probe.
enum Probe {
    Passed,
    Failed(String),
    /// The container is stopped or gone; stop probing.
    Gone(ContainerStatus),
}

/// Spawns and owns the health monitors of one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    tasks: Arc<Mutex<HashMap<String, PeriodicTask>>>,
}

impl HealthMonitor {
    /// Creates an empty monitor set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts monitoring a container.
    ///
    /// Returns false without spawning anything if the check is disabled.
    /// The container's health is set to `starting` before the first probe.
    pub async fn watch(
        &self,
        runtime: SharedRuntime,
        registry: ContainerRegistry,
        instance: &ContainerInstance,
        check: &HealthCheck,
        parent: &CancellationToken,
    ) -> bool {
        let Some(command) = check.probe_command() else {
            return false;
        };

        if registry
            .set_health(&instance.id, HealthState::Starting)
            .await
            .is_err()
        {
            return false;
        }

        let id = instance.id.clone();
        let name = instance.name.clone();
        let timeout = check.timeout_duration();
        let tracker = Arc::new(Mutex::new(HealthTracker::new(check.retries)));

        let tick = move || {
            let runtime = runtime.clone();
            let registry = registry.clone();
            let tracker = tracker.clone();
            let command = command.clone();
            let id = id.clone();
            let name = name.clone();

            async move {
                let outcome = probe(&runtime, &registry, &id, &command, timeout).await;
                let transition = {
                    let mut tracker = tracker.lock().await;
                    match &outcome {
                        Probe::Passed => tracker.record_success(),
                        Probe::Failed(reason) => {
                            let failure = OrchestratorError::health_check_failed(&name, reason);
                            debug!(
                                container = %name,
                                failures = tracker.failures() + 1,
                                error = %failure,
                                "Health probe failed"
                            );
                            tracker.record_failure()
                        }
                        Probe::Gone(status) => {
                            debug!(container = %name, status = %status, "Container gone, stopping health checks");
                            let _ = registry.update_status(&id, *status, None).await;
                            return ControlFlow::Break(());
                        }
                    }
                };

                if let Some(Transition { from, to }) = transition {
                    if registry.set_health(&id, to).await.is_err() {
                        return ControlFlow::Break(());
                    }
                    match to {
                        HealthState::Unhealthy => {
                            warn!(container = %name, from = %from, "Container is unhealthy")
                        }
                        _ => info!(container = %name, from = %from, to = %to, "Health changed"),
                    }
                }

                ControlFlow::Continue(())
            }
        };

        let task = PeriodicTask::spawn(
            format!("health:{}", instance.name),
            parent,
            check.start_period_duration(),
            check.interval_duration(),
            tick,
        );

        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(instance.id.clone(), task) {
            previous.stop();
        }
        true
    }

    /// Returns true if a monitor for the container is still running.
    pub async fn is_watching(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops monitoring a container.
    pub async fn unwatch(&self, id: &str) {
        let task = self.tasks.lock().await.remove(id);
        if let Some(task) = task {
            task.join().await;
        }
    }

    /// Stops every monitor and waits for them to exit.
    pub async fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.join().await;
        }
    }

    /// Returns the number of monitors still running.
    pub async fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }
}

async fn probe(
    runtime: &SharedRuntime,
    registry: &ContainerRegistry,
    id: &str,
    command: &[String],
    timeout: std::time::Duration,
) -> Probe {
    match registry.get(id).await {
        None => return Probe::Gone(ContainerStatus::Dead),
        Some(instance) if instance.status.is_terminal() => return Probe::Gone(instance.status),
        Some(_) => {}
    }

    let options = ExecOptions::default();
    let exec = runtime.exec_in_container(id, command, &options);
    match tokio::time::timeout(timeout, exec).await {
        Ok(Ok(output)) if output.success() => Probe::Passed,
        Ok(Ok(output)) => Probe::Failed(format!(
            "probe exited with code {}: {}",
            output.exit_code,
            output.combined_output().trim()
        )),
        Err(_) => Probe::Failed(format!("probe timed out after {:?}", timeout)),
        Ok(Err(err)) => match runtime.inspect_container(id).await {
            Err(inspect) if inspect.is_not_found() => Probe::Gone(ContainerStatus::Dead),
            Ok(state) if state.status.is_terminal() => Probe::Gone(state.status),
            _ => Probe::Failed(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_starts_starting() {
        let tracker = HealthTracker::new(3);
        assert_eq!(tracker.state(), HealthState::Starting);
        assert_eq!(tracker.failures(), 0);
    }

    #[test]
    fn test_tracker_unhealthy_after_retries() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(
            tracker.record_failure(),
            Some(Transition {
                from: HealthState::Starting,
                to: HealthState::Unhealthy
            })
        );
        // Further failures keep it unhealthy without a new transition.
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_tracker_single_success_recovers() {
        let mut tracker = HealthTracker::new(2);
        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.state(), HealthState::Unhealthy);

        assert_eq!(
            tracker.record_success(),
            Some(Transition {
                from: HealthState::Unhealthy,
                to: HealthState::Healthy
            })
        );
        assert_eq!(tracker.failures(), 0);
    }

    #[test]
    fn test_tracker_success_resets_counter() {
        let mut tracker = HealthTracker::new(3);
        tracker.record_success();
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.state(), HealthState::Healthy);
    }

    #[test]
    fn test_tracker_zero_retries() {
        let mut tracker = HealthTracker::new(0);
        assert!(tracker.record_failure().is_some());
        assert_eq!(tracker.state(), HealthState::Unhealthy);
    }
}
