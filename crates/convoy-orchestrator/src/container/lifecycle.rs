//! Container lifecycle management.
//!
//! The [`ContainerLifecycleManager`] turns a service definition and a
//! replica index into a runtime call, and keeps the container registry in
//! step with what it starts, stops and removes. It never retries; that is
//! up to the caller.

use futures::stream::BoxStream;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::container::{ContainerInstance, ContainerRegistry, ContainerStatus};
use crate::error::{OrchestratorError, Result};
use crate::runtime::{
    ContainerRequest, ExecOptions, ExecOutput, LogLine, LogOptions, RuntimeResult, SharedRuntime,
    LABEL_PROJECT,
};
use crate::topology::{MountSource, ServiceSpec, Topology};

/// Starts, stops and removes the containers of one project.
#[derive(Clone)]
pub struct ContainerLifecycleManager {
    runtime: SharedRuntime,
    registry: ContainerRegistry,
    project: String,
    base_dir: PathBuf,
    labels: IndexMap<String, String>,
    /// Declared network name to runtime name.
    networks: IndexMap<String, String>,
    /// Declared volume name to runtime name.
    volumes: IndexMap<String, String>,
}

impl ContainerLifecycleManager {
    /// Creates a manager for `topology`.
    pub fn new(
        runtime: SharedRuntime,
        registry: ContainerRegistry,
        topology: &Topology,
        project: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        labels: IndexMap<String, String>,
    ) -> Self {
        let project = project.into();
        let networks = topology
            .effective_networks()
            .iter()
            .map(|(name, spec)| (name.clone(), spec.scoped_name(&project)))
            .collect();
        let volumes = topology
            .volumes
            .iter()
            .map(|(name, spec)| (name.clone(), spec.scoped_name(&project)))
            .collect();

        Self {
            runtime,
            registry,
            project,
            base_dir: base_dir.into(),
            labels,
            networks,
            volumes,
        }
    }

    /// Returns the project name.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Builds the runtime request for one replica of `service`.
    pub fn request_for(&self, service: &ServiceSpec, replica: u32) -> Result<ContainerRequest> {
        let image = service.image_ref(&self.project).ok_or_else(|| {
            OrchestratorError::validation(format!(
                "service {} has neither an image nor a build section",
                service.name
            ))
        })?;

        let env = service
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let binds = service
            .volumes
            .iter()
            .map(|mount| {
                let source = match mount.source_kind() {
                    MountSource::Anonymous => return mount.target.clone(),
                    MountSource::Named(name) => self.volume_name(name),
                    MountSource::RelativePath(path) => resolve_path(&self.base_dir, path),
                    MountSource::AbsolutePath(path) => path.to_string(),
                };
                if mount.read_only {
                    format!("{}:{}:ro", source, mount.target)
                } else {
                    format!("{}:{}", source, mount.target)
                }
            })
            .collect();

        let networks = if service.networks.is_empty() {
            vec![self.network_name(crate::topology::DEFAULT_NETWORK)]
        } else {
            service.networks.iter().map(|n| self.network_name(n)).collect()
        };

        let mut labels = IndexMap::new();
        labels.insert(LABEL_PROJECT.to_string(), self.project.clone());
        labels.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.extend(service.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(ContainerRequest {
            name: service.container_name(&self.project, replica),
            image,
            service: service.name.clone(),
            replica,
            command: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            env,
            ports: service.ports.clone(),
            binds,
            networks,
            aliases: vec![service.name.clone()],
            restart: service.restart.clone(),
            resources: service.resources.clone(),
            labels,
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
        })
    }

    /// Creates and starts one replica and records it in the registry.
    pub async fn start_replica(&self, service: &ServiceSpec, replica: u32) -> Result<ContainerInstance> {
        let request = self.request_for(service, replica)?;
        debug!(
            container = %request.name,
            image = %request.image,
            networks = ?request.networks,
            "Creating container"
        );

        let instance = self.runtime.create_and_start_container(&request).await?;
        self.registry.register(instance.clone()).await;

        info!(
            service = %service.name,
            replica,
            container = %instance.name,
            id = %instance.short_id(),
            "Started container"
        );
        Ok(instance)
    }

    /// Stops a container.
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.runtime.stop_container(id, timeout).await?;
        if self.registry.contains(id).await {
            self.registry
                .update_status(id, ContainerStatus::Stopped, None)
                .await?;
        }
        debug!(id = %id, "Stopped container");
        Ok(())
    }

    /// Removes a container and forgets it.
    ///
    /// The registry entry is dropped only once the runtime confirms the
    /// removal.
    pub async fn remove(&self, id: &str, remove_volumes: bool) -> Result<()> {
        self.runtime.remove_container(id, remove_volumes).await?;
        self.registry.unregister(id).await;
        debug!(id = %id, "Removed container");
        Ok(())
    }

    /// Streams the logs of a container.
    pub async fn logs(
        &self,
        id: &str,
        options: &LogOptions,
    ) -> Result<BoxStream<'static, RuntimeResult<LogLine>>> {
        Ok(self.runtime.stream_logs(id, options).await?)
    }

    /// Runs a command inside a container.
    pub async fn exec(&self, id: &str, command: &[String], options: &ExecOptions) -> Result<ExecOutput> {
        if command.is_empty() {
            return Err(OrchestratorError::configuration("exec requires a command"));
        }
        Ok(self.runtime.exec_in_container(id, command, options).await?)
    }

    fn volume_name(&self, name: &str) -> String {
        self.volumes
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("{}_{}", self.project, name))
    }

    fn network_name(&self, name: &str) -> String {
        self.networks
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("{}_{}", self.project, name))
    }
}

/// Resolves a relative host path against the base directory.
fn resolve_path(base_dir: &Path, path: &str) -> String {
    let resolved = match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.to_path_buf())
            .join(rest),
        None => base_dir.join(path.strip_prefix("./").unwrap_or(path)),
    };
    resolved.to_string_lossy().into_owned()
}
