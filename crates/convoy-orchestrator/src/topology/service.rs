//! Service definitions.
//!
//! A [`ServiceSpec`] describes everything needed to materialise the
//! containers of one service: the image or build context, runtime settings,
//! attachments, dependencies with their readiness conditions, the health
//! probe, and the replica count.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::{ContainerImage, ImagePullPolicy, ResourceLimits};
use crate::topology::resources::PortMapping;

/// Condition a dependency must satisfy before a dependent service starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyCondition {
    /// At least one replica is running.
    #[default]
    #[serde(rename = "service_started", alias = "started")]
    Started,

    /// At least one replica reports a healthy probe.
    #[serde(rename = "service_healthy", alias = "healthy")]
    Healthy,

    /// At least one replica has exited with code 0.
    #[serde(
        rename = "service_completed_successfully",
        alias = "completedSuccessfully",
        alias = "completed_successfully"
    )]
    CompletedSuccessfully,
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Healthy => "healthy",
            Self::CompletedSuccessfully => "completed successfully",
        };
        f.write_str(name)
    }
}

/// Specification for a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Name of the service.
    #[serde(skip)]
    pub name: String,

    /// The container image to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ContainerImage>,

    /// Build instructions, when the image is produced locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// When to pull the image.
    pub pull_policy: ImagePullPolicy,

    /// Command to run in the container (overrides image default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Entrypoint override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    /// Environment variables to set in the container.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,

    /// Port mappings for the container.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,

    /// Volume mounts for the container.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,

    /// Networks the container attaches to. Empty means the default network.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    /// Services that must satisfy a condition before this one starts.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub depends_on: IndexMap<String, DependencyCondition>,

    /// Health check configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,

    /// Restart policy for the container.
    pub restart: RestartPolicy,

    /// Number of containers to run.
    pub replicas: u32,

    /// Resource limits for the container.
    pub resources: ResourceLimits,

    /// Profiles this service belongs to. Empty means always active.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,

    /// Labels to apply to the container.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,

    /// Working directory inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// User the container process runs as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: None,
            build: None,
            pull_policy: ImagePullPolicy::default(),
            command: None,
            entrypoint: None,
            environment: IndexMap::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            depends_on: IndexMap::new(),
            healthcheck: None,
            restart: RestartPolicy::default(),
            replicas: 1,
            resources: ResourceLimits::default(),
            profiles: Vec::new(),
            labels: IndexMap::new(),
            working_dir: None,
            user: None,
        }
    }
}

impl ServiceSpec {
    /// Creates a new service specification builder.
    pub fn builder(name: impl Into<String>) -> ServiceSpecBuilder {
        ServiceSpecBuilder::new(name)
    }

    /// Returns the image reference containers of this service run.
    ///
    /// A service with only a build section runs the locally built
    /// `<project>-<service>` image.
    pub fn image_ref(&self, project: &str) -> Option<String> {
        match (&self.image, &self.build) {
            (Some(image), _) => Some(image.reference().to_string()),
            (None, Some(_)) => Some(format!("{}-{}", project, self.name)),
            (None, None) => None,
        }
    }

    /// Returns the container name for a replica (`project_service_index`).
    pub fn container_name(&self, project: &str, replica: u32) -> String {
        format!("{}_{}_{}", project, self.name, replica)
    }

    /// Returns the enabled health check, if any.
    pub fn active_healthcheck(&self) -> Option<&HealthCheck> {
        self.healthcheck.as_ref().filter(|hc| hc.is_enabled())
    }

    /// Returns true if the service is active under the given profiles.
    pub fn is_enabled_for(&self, active_profiles: &[String]) -> bool {
        self.profiles.is_empty() || self.profiles.iter().any(|p| active_profiles.contains(p))
    }

    /// Returns true if the image of this service is produced by the engine.
    pub fn has_local_image(&self) -> bool {
        self.image.is_none() && self.build.is_some()
    }
}

/// Builder for `ServiceSpec`.
#[derive(Debug)]
pub struct ServiceSpecBuilder {
    spec: ServiceSpec,
}

impl ServiceSpecBuilder {
    /// Creates a new builder with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: ServiceSpec {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Sets the container image.
    pub fn image(mut self, image: impl Into<ContainerImage>) -> Self {
        self.spec.image = Some(image.into());
        self
    }

    /// Sets the build section.
    pub fn build(mut self, build: BuildSpec) -> Self {
        self.spec.build = Some(build);
        self
    }

    /// Sets the pull policy.
    pub fn pull_policy(mut self, policy: ImagePullPolicy) -> Self {
        self.spec.pull_policy = policy;
        self
    }

    /// Sets the command to run.
    pub fn command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.command = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the entrypoint.
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    /// Adds a port mapping.
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.spec.ports.push(mapping);
        self
    }

    /// Adds a volume mount.
    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.spec.volumes.push(mount);
        self
    }

    /// Attaches the service to a network.
    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.spec.networks.push(name.into());
        self
    }

    /// Adds a dependency on another service.
    pub fn depends_on(mut self, service: impl Into<String>, condition: DependencyCondition) -> Self {
        self.spec.depends_on.insert(service.into(), condition);
        self
    }

    /// Sets the health check configuration.
    pub fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.spec.healthcheck = Some(check);
        self
    }

    /// Sets the restart policy.
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.spec.restart = policy;
        self
    }

    /// Sets the replica count.
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.spec.replicas = replicas;
        self
    }

    /// Sets the resource limits.
    pub fn resources(mut self, resources: ResourceLimits) -> Self {
        self.spec.resources = resources;
        self
    }

    /// Adds the service to a profile.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.spec.profiles.push(profile.into());
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.working_dir = Some(dir.into());
        self
    }

    /// Builds the service specification.
    ///
    /// Required fields are checked by [`Topology::validate`](crate::topology::Topology::validate),
    /// not here.
    pub fn build_spec(self) -> ServiceSpec {
        self.spec
    }
}

/// Local image build instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory, relative to the topology base directory.
    pub context: PathBuf,

    /// Dockerfile path inside the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Build arguments.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
}

impl BuildSpec {
    /// Creates a build section for a context directory.
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
            dockerfile: None,
            args: IndexMap::new(),
        }
    }

    /// Sets the Dockerfile path.
    pub fn dockerfile(mut self, path: impl Into<String>) -> Self {
        self.dockerfile = Some(path.into());
        self
    }

    /// Adds a build argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Returns the context directory resolved against `base_dir`.
    pub fn resolved_context(&self, base_dir: &Path) -> PathBuf {
        if self.context.is_absolute() {
            self.context.clone()
        } else {
            base_dir.join(&self.context)
        }
    }
}

/// Volume mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name or host path. None for an anonymous volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Target path in the container.
    pub target: String,

    /// Whether the mount is read-only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl VolumeMount {
    /// Creates a mount of a named volume.
    pub fn named(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: Some(name.into()),
            target: target.into(),
            read_only: false,
        }
    }

    /// Creates a bind mount of a host path.
    pub fn bind(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self::named(path, target)
    }

    /// Creates an anonymous volume mount.
    pub fn anonymous(target: impl Into<String>) -> Self {
        Self {
            source: None,
            target: target.into(),
            read_only: false,
        }
    }

    /// Sets the mount to read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Classifies the mount source.
    pub fn source_kind(&self) -> MountSource<'_> {
        match self.source.as_deref() {
            None | Some("") => MountSource::Anonymous,
            Some(src) if Path::new(src).is_absolute() => MountSource::AbsolutePath(src),
            Some(src) if src.starts_with('.') || src.starts_with('~') || src.contains('/') => {
                MountSource::RelativePath(src)
            }
            Some(src) => MountSource::Named(src),
        }
    }
}

/// What a volume mount's source refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource<'a> {
    /// A named volume declared by the topology.
    Named(&'a str),
    /// A host path relative to the topology base directory.
    RelativePath(&'a str),
    /// An absolute host path.
    AbsolutePath(&'a str),
    /// An anonymous volume.
    Anonymous,
}

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    /// Probe command in Docker form: `["CMD", ...]`, `["CMD-SHELL", "..."]`
    /// or `["NONE"]`.
    pub test: Vec<String>,

    /// Time to wait between checks.
    pub interval_ms: u64,

    /// Time to wait for a check to complete.
    pub timeout_ms: u64,

    /// Number of consecutive failures for unhealthy status.
    pub retries: u32,

    /// Time to wait before starting health checks.
    pub start_period_ms: u64,

    /// Disables the check entirely.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), "exit 0".to_string()],
            interval_ms: 30_000,
            timeout_ms: 30_000,
            retries: 3,
            start_period_ms: 0,
            disable: false,
        }
    }
}

impl HealthCheck {
    /// Creates a health check using curl.
    pub fn http(url: &str) -> Self {
        Self::shell(format!("curl -f {} || exit 1", url))
    }

    /// Creates a health check using a TCP connection.
    pub fn tcp(host: &str, port: u16) -> Self {
        Self::shell(format!("nc -z {} {} || exit 1", host, port))
    }

    /// Creates a health check run through the container shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), script.into()],
            ..Default::default()
        }
    }

    /// Creates a custom command health check.
    pub fn cmd<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut test = vec!["CMD".to_string()];
        test.extend(command.into_iter().map(Into::into));
        Self {
            test,
            ..Default::default()
        }
    }

    /// Sets the probe interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the probe timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the failure threshold.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the start period.
    pub fn start_period(mut self, period: Duration) -> Self {
        self.start_period_ms = period.as_millis() as u64;
        self
    }

    /// Returns the probe interval.
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Returns the probe timeout.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the start period.
    pub fn start_period_duration(&self) -> Duration {
        Duration::from_millis(self.start_period_ms)
    }

    /// Returns true unless the check is disabled.
    pub fn is_enabled(&self) -> bool {
        !self.disable && self.test.first().map(String::as_str) != Some("NONE")
    }

    /// Returns the command to execute inside the container.
    ///
    /// Returns `None` for a disabled or malformed check.
    pub fn probe_command(&self) -> Option<Vec<String>> {
        if !self.is_enabled() {
            return None;
        }

        match self.test.split_first() {
            Some((kind, rest)) if kind == "CMD" && !rest.is_empty() => Some(rest.to_vec()),
            Some((kind, rest)) if kind == "CMD-SHELL" && !rest.is_empty() => Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                rest.join(" "),
            ]),
            _ => None,
        }
    }
}

/// Container restart policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,

    /// Restart on failure.
    OnFailure {
        /// Maximum number of retries.
        #[serde(default)]
        max_retries: Option<u32>,
    },

    /// Always restart.
    Always,

    /// Restart unless explicitly stopped.
    UnlessStopped,
}

impl RestartPolicy {
    /// Returns the compose restart policy string.
    pub fn as_compose_str(&self) -> &str {
        match self {
            Self::No => "no",
            Self::OnFailure { .. } => "on-failure",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
        }
    }
}
