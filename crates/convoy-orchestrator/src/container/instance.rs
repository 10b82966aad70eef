//! Materialised replicas of a service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// One running or terminated replica of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    /// Container ID assigned by the runtime.
    pub id: String,

    /// Container name (`project_service_index`).
    pub name: String,

    /// Service this container belongs to.
    pub service: String,

    /// Replica index, starting at 1.
    pub replica: u32,

    /// Current status of the container.
    pub status: ContainerStatus,

    /// Health state, present only when a probe is configured.
    pub health: Option<HealthState>,

    /// Exit code once the container has terminated.
    pub exit_code: Option<i64>,

    /// Container creation timestamp (Unix milliseconds).
    pub created_at: u64,

    /// Container start timestamp (Unix milliseconds).
    pub started_at: Option<u64>,
}

impl ContainerInstance {
    /// Creates a new instance in the `created` status.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        service: impl Into<String>,
        replica: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service: service.into(),
            replica,
            status: ContainerStatus::Created,
            health: None,
            exit_code: None,
            created_at: now_millis(),
            started_at: None,
        }
    }

    /// Marks the instance as running.
    pub fn mark_running(mut self) -> Self {
        self.status = ContainerStatus::Running;
        self.started_at = Some(now_millis());
        self
    }

    /// Returns the short container ID (first 12 characters).
    pub fn short_id(&self) -> &str {
        if self.id.len() > 12 {
            &self.id[..12]
        } else {
            &self.id
        }
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Returns true if the container reports a healthy probe.
    pub fn is_healthy(&self) -> bool {
        self.health == Some(HealthState::Healthy)
    }

    /// Returns true if the container exited with code 0.
    pub fn completed_successfully(&self) -> bool {
        self.status == ContainerStatus::Exited && self.exit_code == Some(0)
    }

    /// Returns true if the container exited with a non-zero code or died.
    pub fn failed(&self) -> bool {
        match self.status {
            ContainerStatus::Dead => true,
            ContainerStatus::Exited => self.exit_code.is_some_and(|code| code != 0),
            _ => false,
        }
    }
}

/// Container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container was stopped by the engine.
    Stopped,
    /// Container process has exited.
    Exited,
    /// Container could not be stopped or is otherwise unusable.
    Dead,
}

impl ContainerStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Dead)
    }

    /// Maps a Docker state string to a status.
    pub fn from_runtime_state(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" | "restarting" | "paused" => Self::Running,
            "exited" => Self::Exited,
            "removing" | "dead" => Self::Dead,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Health state of a probed container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No probe result yet.
    #[default]
    Starting,
    /// The last probe succeeded.
    Healthy,
    /// The failure threshold was reached.
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Returns the current Unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
