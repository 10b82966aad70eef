//! Container runtime trait definition.
//!
//! The engine never creates containers itself. Every side effect goes
//! through a [`ContainerRuntime`], which may be a Docker daemon, an
//! in-process fake, or anything else that can run containers.

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ContainerInstance, ContainerStatus, ResourceLimits};
use crate::error::RuntimeError;
use crate::topology::{PortMapping, RestartPolicy};

/// Result type for runtime calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Core trait for container runtimes.
///
/// # Lifecycle
///
/// 1. `create_network()` / `create_volume()` for every declared resource
/// 2. `pull_image()` or `build_image()` for the images services run
/// 3. `create_and_start_container()` per replica
/// 4. `exec_in_container()` and `stream_logs()` while running
/// 5. `stop_container()`, `remove_container()`, then resource removal
///
/// # Errors
///
/// Every call reports a [`RuntimeError`] whose kind tells the engine whether
/// a retry can help. Creating something that already exists must fail with
/// `AlreadyExists`; acting on something missing must fail with `NotFound`.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine calls them from many
/// tasks at once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the name of this runtime.
    fn name(&self) -> &str;

    /// Checks if the runtime is reachable.
    async fn is_ready(&self) -> bool {
        true
    }

    /// Creates a network and returns its ID.
    async fn create_network(&self, request: &NetworkRequest) -> RuntimeResult<String>;

    /// Removes a network by name or ID.
    async fn remove_network(&self, id: &str) -> RuntimeResult<()>;

    /// Creates a volume and returns its name.
    async fn create_volume(&self, request: &VolumeRequest) -> RuntimeResult<String>;

    /// Removes a volume by name.
    async fn remove_volume(&self, id: &str) -> RuntimeResult<()>;

    /// Creates and starts a container.
    ///
    /// Returns the instance in the `running` status. If the container was
    /// created but could not be started, the runtime removes it again before
    /// reporting the error.
    async fn create_and_start_container(
        &self,
        request: &ContainerRequest,
    ) -> RuntimeResult<ContainerInstance>;

    /// Stops a container, killing it after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Removes a stopped container and, if asked, its anonymous volumes.
    async fn remove_container(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()>;

    /// Returns the current state of a container.
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// Lists the containers belonging to a project.
    ///
    /// With `all == false` only running containers are returned.
    async fn list_containers(&self, project: &str, all: bool)
        -> RuntimeResult<Vec<ContainerInstance>>;

    /// Executes a command in a running container and collects its output.
    async fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        options: &ExecOptions,
    ) -> RuntimeResult<ExecOutput>;

    /// Streams the logs of a container.
    async fn stream_logs(
        &self,
        id: &str,
        options: &LogOptions,
    ) -> RuntimeResult<BoxStream<'static, RuntimeResult<LogLine>>>;

    /// Returns true if the image is present locally.
    async fn image_exists(&self, reference: &str) -> RuntimeResult<bool>;

    /// Pulls an image.
    async fn pull_image(&self, reference: &str) -> RuntimeResult<()>;

    /// Builds an image and returns its reference.
    async fn build_image(&self, request: &BuildRequest) -> RuntimeResult<String>;

    /// Removes an image.
    async fn remove_image(&self, reference: &str) -> RuntimeResult<()>;
}

/// A shared container runtime for dynamic dispatch.
pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Service the container belongs to.
    pub service: String,

    /// Replica index, starting at 1.
    pub replica: u32,

    /// Command override.
    pub command: Option<Vec<String>>,

    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,

    /// Environment in `KEY=value` form.
    pub env: Vec<String>,

    /// Published ports.
    pub ports: Vec<PortMapping>,

    /// Mounts in `source:target[:ro]` form. Anonymous volumes have no source.
    pub binds: Vec<String>,

    /// Runtime names of the networks to attach to; the first is primary.
    pub networks: Vec<String>,

    /// Network aliases (the service name) used on every attached network.
    pub aliases: Vec<String>,

    /// Restart policy enforced by the runtime.
    pub restart: RestartPolicy,

    /// Resource limits.
    pub resources: ResourceLimits,

    /// Labels applied to the container.
    pub labels: IndexMap<String, String>,

    /// Working directory.
    pub working_dir: Option<String>,

    /// User.
    pub user: Option<String>,
}

/// Network creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Runtime name of the network.
    pub name: String,
    /// Network driver.
    pub driver: String,
    /// Driver options.
    pub driver_opts: IndexMap<String, String>,
    /// Whether the network is internal.
    pub internal: bool,
    /// Whether IPv6 is enabled.
    pub enable_ipv6: bool,
    /// Labels.
    pub labels: IndexMap<String, String>,
}

/// Volume creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Runtime name of the volume.
    pub name: String,
    /// Volume driver.
    pub driver: String,
    /// Driver options.
    pub driver_opts: IndexMap<String, String>,
    /// Labels.
    pub labels: IndexMap<String, String>,
}

/// Image build request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Absolute path of the build context.
    pub context: PathBuf,
    /// Dockerfile path inside the context.
    pub dockerfile: Option<String>,
    /// Tag to give the built image.
    pub tag: String,
    /// Build arguments.
    pub args: IndexMap<String, String>,
    /// Do not use the build cache.
    pub no_cache: bool,
    /// Always pull base images.
    pub pull: bool,
    /// Labels applied to the image.
    pub labels: IndexMap<String, String>,
}

/// State of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Current status.
    pub status: ContainerStatus,
    /// Exit code if the container has terminated.
    pub exit_code: Option<i64>,
}

impl ContainerState {
    /// A running container.
    pub fn running() -> Self {
        Self {
            status: ContainerStatus::Running,
            exit_code: None,
        }
    }

    /// A container that exited with the given code.
    pub fn exited(code: i64) -> Self {
        Self {
            status: ContainerStatus::Exited,
            exit_code: Some(code),
        }
    }
}

/// Options for exec sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// User to run as.
    pub user: Option<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Extra environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Run with elevated privileges.
    pub privileged: bool,
}

/// Options for log streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Keep the stream open for new output.
    pub follow: bool,
    /// Number of lines from the end to start with; `None` means all.
    pub tail: Option<usize>,
    /// Prefix lines with timestamps.
    pub timestamps: bool,
}

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Name of the container that produced the line.
    pub container: String,
    /// Stream the line came from.
    pub stream: LogStream,
    /// The line, without trailing newline.
    pub message: String,
}

/// Output from executing a command in a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,

    /// Standard error from the command.
    pub stderr: String,

    /// Exit code of the command.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Creates a new exec output.
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined stdout and stderr.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}
