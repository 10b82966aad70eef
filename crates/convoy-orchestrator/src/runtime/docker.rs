//! Docker runtime implementation.
//!
//! Talks to the Docker Engine API via bollard. Every resource the engine
//! creates is labelled with the project name so it can be found again by
//! [`ContainerRuntime::list_containers`] in a later invocation.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::service::{
    EndpointSettings, HostConfig, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::container::{ContainerInstance, ContainerStatus};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::r#trait::{
    BuildRequest, ContainerRequest, ContainerRuntime, ContainerState, ExecOptions, ExecOutput,
    LogLine, LogOptions, LogStream, NetworkRequest, RuntimeResult, VolumeRequest,
};
use crate::runtime::{LABEL_PROJECT, LABEL_REPLICA, LABEL_SERVICE};
use crate::topology::RestartPolicy;

/// Connection settings for the Docker daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Daemon socket, e.g. `unix:///var/run/docker.sock`. Local defaults
    /// (including `DOCKER_HOST`) are used when unset.
    pub host: Option<String>,

    /// Timeout for API requests in seconds.
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: 120,
        }
    }
}

/// Docker Engine runtime.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon with default settings.
    pub async fn new() -> RuntimeResult<Self> {
        Self::with_config(&DockerConfig::default()).await
    }

    /// Connects to the Docker daemon described by `config`.
    pub async fn with_config(config: &DockerConfig) -> RuntimeResult<Self> {
        let docker = match config.host.as_deref() {
            Some(host) => {
                let path = host.strip_prefix("unix://").unwrap_or(host);
                Docker::connect_with_socket(path, config.timeout_secs, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(map_err("connect"))?
        .with_timeout(Duration::from_secs(config.timeout_secs));

        docker.ping().await.map_err(map_err("ping"))?;

        info!(host = ?config.host, "Connected to Docker daemon");

        Ok(Self { docker })
    }

    /// Connects any networks beyond the primary one.
    async fn connect_extra_networks(&self, id: &str, request: &ContainerRequest) -> RuntimeResult<()> {
        for network in request.networks.iter().skip(1) {
            let options = ConnectNetworkOptions {
                container: id.to_string(),
                endpoint_config: EndpointSettings {
                    aliases: Some(request.aliases.clone()),
                    ..Default::default()
                },
            };
            self.docker
                .connect_network(network, options)
                .await
                .map_err(map_err("connect_network"))?;
        }
        Ok(())
    }

    async fn start_created(&self, id: &str, request: &ContainerRequest) -> RuntimeResult<()> {
        self.connect_extra_networks(id, request).await?;
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err("start_container"))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_ready(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn create_network(&self, request: &NetworkRequest) -> RuntimeResult<String> {
        let options = CreateNetworkOptions {
            name: request.name.clone(),
            check_duplicate: true,
            driver: request.driver.clone(),
            internal: request.internal,
            enable_ipv6: request.enable_ipv6,
            options: to_hash_map(&request.driver_opts),
            labels: to_hash_map(&request.labels),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(map_err("create_network"))?;

        let id = response.id.ok_or_else(|| {
            RuntimeError::other(
                "create_network",
                format!("daemon returned no id for network {}", request.name),
            )
        })?;

        info!(network = %request.name, id = %id, "Created network");
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_network(id)
            .await
            .map_err(map_err("remove_network"))?;
        info!(network = %id, "Removed network");
        Ok(())
    }

    async fn create_volume(&self, request: &VolumeRequest) -> RuntimeResult<String> {
        // Docker returns existing volumes from create; report them instead.
        if self.docker.inspect_volume(&request.name).await.is_ok() {
            return Err(RuntimeError::already_exists(
                "create_volume",
                format!("volume {} already exists", request.name),
            ));
        }

        let options = CreateVolumeOptions {
            name: request.name.clone(),
            driver: request.driver.clone(),
            driver_opts: to_hash_map(&request.driver_opts),
            labels: to_hash_map(&request.labels),
        };

        let volume = self
            .docker
            .create_volume(options)
            .await
            .map_err(map_err("create_volume"))?;

        info!(volume = %volume.name, "Created volume");
        Ok(volume.name)
    }

    async fn remove_volume(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_volume(id, Some(RemoveVolumeOptions { force: false }))
            .await
            .map_err(map_err("remove_volume"))?;
        info!(volume = %id, "Removed volume");
        Ok(())
    }

    async fn create_and_start_container(
        &self,
        request: &ContainerRequest,
    ) -> RuntimeResult<ContainerInstance> {
        let (binds, anonymous): (Vec<String>, Vec<String>) =
            request.binds.iter().cloned().partition(|b| b.contains(':'));

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .ports
            .iter()
            .map(|p| (p.container_key(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = request
            .ports
            .iter()
            .map(|p| {
                let binding = PortBinding {
                    host_ip: p.host_ip.map(|ip| ip.to_string()),
                    host_port: p.host_port.map(|port| port.to_string()),
                };
                (p.container_key(), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            port_bindings: Some(port_bindings),
            network_mode: request.networks.first().cloned(),
            restart_policy: Some(restart_policy(&request.restart)),
            memory: request.resources.memory_bytes.map(|b| b as i64),
            memory_reservation: request.resources.memory_reservation_bytes.map(|b| b as i64),
            nano_cpus: request.resources.nano_cpus(),
            pids_limit: request.resources.pids_limit,
            ..Default::default()
        };

        let networking_config = request.networks.first().map(|primary| NetworkingConfig {
            endpoints_config: HashMap::from([(
                primary.clone(),
                EndpointSettings {
                    aliases: Some(request.aliases.clone()),
                    ..Default::default()
                },
            )]),
        });

        let mut labels = to_hash_map(&request.labels);
        labels.insert(LABEL_SERVICE.to_string(), request.service.clone());
        labels.insert(LABEL_REPLICA.to_string(), request.replica.to_string());

        let config = Config {
            image: Some(request.image.clone()),
            hostname: Some(request.name.replace('_', "-")),
            env: Some(request.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            volumes: (!anonymous.is_empty())
                .then(|| anonymous.into_iter().map(|v| (v, HashMap::new())).collect()),
            host_config: Some(host_config),
            networking_config,
            cmd: request.command.clone(),
            entrypoint: request.entrypoint.clone(),
            working_dir: request.working_dir.clone(),
            user: request.user.clone(),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_create_err("create_container", &request.image))?;

        debug!(container = %request.name, id = %response.id, "Created container");

        if let Err(e) = self.start_created(&response.id, request).await {
            warn!(container = %request.name, error = %e, "Start failed, removing container");
            let remove = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(cleanup) = self.docker.remove_container(&response.id, Some(remove)).await {
                warn!(container = %request.name, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e);
        }

        info!(container = %request.name, "Started container");

        Ok(
            ContainerInstance::new(response.id, &request.name, &request.service, request.replica)
                .mark_running(),
        )
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(map_err("stop_container")),
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            v: remove_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_err("remove_container"))?;
        info!(container = %id, "Removed container");
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(map_err("inspect_container"))?;

        let state = inspect.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| ContainerStatus::from_runtime_state(&s.to_string()))
            .unwrap_or(ContainerStatus::Stopped);
        let exit_code = status.is_terminal().then_some(state.exit_code).flatten();

        Ok(ContainerState { status, exit_code })
    }

    async fn list_containers(
        &self,
        project: &str,
        all: bool,
    ) -> RuntimeResult<Vec<ContainerInstance>> {
        let filters: HashMap<String, Vec<String>> = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", LABEL_PROJECT, project)],
        )]);

        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err("list_containers"))?;

        let instances = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let labels = summary.labels.unwrap_or_default();
                let service = labels.get(LABEL_SERVICE)?.clone();
                let replica = labels
                    .get(LABEL_REPLICA)
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(1);
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());

                let mut instance = ContainerInstance::new(id, name, service, replica);
                instance.status = summary
                    .state
                    .as_deref()
                    .map(ContainerStatus::from_runtime_state)
                    .unwrap_or(ContainerStatus::Stopped);
                instance.exit_code = summary.status.as_deref().and_then(parse_exit_code);
                if let Some(created) = summary.created {
                    instance.created_at = (created as u64) * 1000;
                }
                Some(instance)
            })
            .collect();

        Ok(instances)
    }

    async fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        options: &ExecOptions,
    ) -> RuntimeResult<ExecOutput> {
        debug!(container = %id, cmd = ?command, "Executing command");

        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: options.user.clone(),
            working_dir: options.working_dir.clone(),
            env: (!options.env.is_empty()).then(|| options.env.clone()),
            privileged: Some(options.privileged),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(map_err("create_exec"))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_err("start_exec"))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(result) = output.next().await {
                match result.map_err(map_err("exec_output"))? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let exec_inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_err("inspect_exec"))?;
        let exit_code = exec_inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn stream_logs(
        &self,
        id: &str,
        options: &LogOptions,
    ) -> RuntimeResult<BoxStream<'static, RuntimeResult<LogLine>>> {
        let logs_options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let container = id.to_string();
        let stream = self
            .docker
            .logs(id, Some(logs_options))
            .flat_map(move |chunk| {
                let lines: Vec<RuntimeResult<LogLine>> = match chunk {
                    Ok(output) => split_log_output(&container, output),
                    Err(e) => vec![Err(map_err("logs")(e))],
                };
                stream::iter(lines)
            });

        Ok(stream.boxed())
    }

    async fn image_exists(&self, reference: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err("inspect_image")(e)),
        }
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        let image = crate::container::ContainerImage::new(reference);
        let (name, tag) = image.pull_parts();
        info!(image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(map_create_err("pull_image", reference))?;
            if let Some(status) = progress.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> RuntimeResult<String> {
        info!(image = %request.tag, context = %request.context.display(), "Building image");

        let context = request.context.clone();
        let archive = tokio::task::spawn_blocking(move || pack_context(&context))
            .await
            .map_err(|e| RuntimeError::other("build_image", e.to_string()))?
            .map_err(|e| RuntimeError::other("build_image", format!("packing context: {}", e)))?;

        let options = BuildImageOptions {
            dockerfile: request
                .dockerfile
                .clone()
                .unwrap_or_else(|| "Dockerfile".to_string()),
            t: request.tag.clone(),
            nocache: request.no_cache,
            pull: request.pull,
            rm: true,
            buildargs: to_hash_map(&request.args),
            labels: to_hash_map(&request.labels),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(archive)));
        while let Some(result) = stream.next().await {
            let info = result.map_err(map_err("build_image"))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::other("build_image", error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %request.tag, "{}", line);
                }
            }
        }

        info!(image = %request.tag, "Built image");
        Ok(request.tag.clone())
    }

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()> {
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map_err(map_err("remove_image"))?;
        info!(image = %reference, "Removed image");
        Ok(())
    }
}

/// Returns a mapper from Docker errors to runtime errors for `operation`.
fn map_err(operation: &'static str) -> impl Fn(DockerError) -> RuntimeError {
    move |err| classify(operation, err)
}

/// Like [`map_err`], but a 404 means the image is missing.
fn map_create_err<'a>(
    operation: &'static str,
    image: &'a str,
) -> impl Fn(DockerError) -> RuntimeError + 'a {
    move |err| match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::image_not_found(operation, format!("{}: {}", image, message)),
        other => classify(operation, other),
    }
}

fn classify(operation: &'static str, err: DockerError) -> RuntimeError {
    let kind = match &err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match *status_code {
            404 => RuntimeErrorKind::NotFound,
            409 if message.contains("already in use") || message.contains("already exists") => {
                RuntimeErrorKind::AlreadyExists
            }
            409 => RuntimeErrorKind::Conflict,
            502..=504 => RuntimeErrorKind::Transient,
            _ => RuntimeErrorKind::Other,
        },
        DockerError::RequestTimeoutError | DockerError::IOError { .. } => {
            RuntimeErrorKind::Transient
        }
        _ => RuntimeErrorKind::Other,
    };

    let message = match err {
        DockerError::DockerResponseServerError { message, .. } => message,
        other => other.to_string(),
    };

    RuntimeError::new(kind, operation, message)
}

fn restart_policy(policy: &RestartPolicy) -> DockerRestartPolicy {
    let (name, maximum_retry_count) = match policy {
        RestartPolicy::No => (RestartPolicyNameEnum::NO, None),
        RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
        RestartPolicy::UnlessStopped => (RestartPolicyNameEnum::UNLESS_STOPPED, None),
        RestartPolicy::OnFailure { max_retries } => (
            RestartPolicyNameEnum::ON_FAILURE,
            max_retries.map(i64::from),
        ),
    };

    DockerRestartPolicy {
        name: Some(name),
        maximum_retry_count,
    }
}

fn to_hash_map(map: &indexmap::IndexMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn split_log_output(container: &str, output: LogOutput) -> Vec<RuntimeResult<LogLine>> {
    let (stream, message) = match output {
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (LogStream::Stdout, message)
        }
        LogOutput::StdIn { .. } => return Vec::new(),
    };

    String::from_utf8_lossy(&message)
        .lines()
        .map(|line| {
            Ok(LogLine {
                container: container.to_string(),
                stream,
                message: line.to_string(),
            })
        })
        .collect()
}

/// Parses the exit code out of a status like `Exited (137) 2 minutes ago`.
fn parse_exit_code(status: &str) -> Option<i64> {
    let rest = status.strip_prefix("Exited (")?;
    let end = rest.find(')')?;
    rest[..end].parse().ok()
}

/// Packs a build context directory into an uncompressed tar archive.
fn pack_context(context: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", context)?;
    builder.into_inner()
}
