//! In-process container runtime.
//!
//! [`InMemoryRuntime`] keeps networks, volumes, images and containers in
//! memory and never touches a real daemon. Its behaviour can be scripted:
//! inject failures, decide what probes return, make containers exit, and
//! slow every call down. The test-suite and `convoy --dry-run` run on it.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::container::{ContainerInstance, ContainerStatus};
use crate::error::RuntimeError;
use crate::runtime::r#trait::{
    BuildRequest, ContainerRequest, ContainerRuntime, ContainerState, ExecOptions, ExecOutput,
    LogLine, LogOptions, LogStream, NetworkRequest, RuntimeResult, VolumeRequest,
};
use crate::runtime::LABEL_PROJECT;

/// Exit codes returned by exec calls for one service.
#[derive(Debug, Clone)]
pub enum ExecScript {
    /// Every call returns the same exit code.
    Always(i64),
    /// Calls return the queued codes in order, then `then` forever.
    Sequence {
        /// Codes still to be returned.
        codes: VecDeque<i64>,
        /// Code returned once the queue is empty.
        then: i64,
    },
}

impl ExecScript {
    fn next_code(&mut self) -> i64 {
        match self {
            Self::Always(code) => *code,
            Self::Sequence { codes, then } => codes.pop_front().unwrap_or(*then),
        }
    }
}

#[derive(Debug, Clone)]
struct MemContainer {
    instance: ContainerInstance,
    project: String,
    image: String,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    networks: HashMap<String, String>,
    volumes: HashSet<String>,
    images: HashSet<String>,
    missing_images: HashSet<String>,
    containers: HashMap<String, MemContainer>,
    calls: HashMap<&'static str, usize>,
    one_shot_failures: HashMap<&'static str, VecDeque<RuntimeError>>,
    service_failures: HashMap<String, RuntimeError>,
    service_exits: HashMap<String, i64>,
    exec_scripts: HashMap<String, ExecScript>,
    logs: HashMap<String, Vec<LogLine>>,
    started: Vec<String>,
    removed: Vec<String>,
}

impl State {
    fn record(&mut self, operation: &'static str) -> RuntimeResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;
        match self
            .one_shot_failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:012x}{:052x}", self.next_id, 0)
    }

    fn container_mut(&mut self, operation: &str, id: &str) -> RuntimeResult<&mut MemContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(operation, format!("no such container: {}", id)))
    }
}

/// A scriptable runtime that lives entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl InMemoryRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next call to `operation` fail with `error`.
    ///
    /// Failures queue up; each one is consumed by a single call.
    pub async fn fail_next(&self, operation: &'static str, error: RuntimeError) {
        let mut state = self.state.lock().await;
        state
            .one_shot_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Makes every container start of `service` fail with `error`.
    pub async fn fail_service(&self, service: &str, error: RuntimeError) {
        let mut state = self.state.lock().await;
        state.service_failures.insert(service.to_string(), error);
    }

    /// Makes containers of `service` exit with `code` right after starting.
    pub async fn exit_after_start(&self, service: &str, code: i64) {
        let mut state = self.state.lock().await;
        state.service_exits.insert(service.to_string(), code);
    }

    /// Sets the exit code every exec in `service` returns.
    pub async fn exec_always(&self, service: &str, code: i64) {
        let mut state = self.state.lock().await;
        state
            .exec_scripts
            .insert(service.to_string(), ExecScript::Always(code));
    }

    /// Queues exit codes for execs in `service`, then returns `then`.
    pub async fn exec_sequence(&self, service: &str, codes: impl IntoIterator<Item = i64>, then: i64) {
        let mut state = self.state.lock().await;
        state.exec_scripts.insert(
            service.to_string(),
            ExecScript::Sequence {
                codes: codes.into_iter().collect(),
                then,
            },
        );
    }

    /// Marks an image as unknown to every registry.
    pub async fn missing_image(&self, reference: &str) {
        let mut state = self.state.lock().await;
        state.missing_images.insert(reference.to_string());
    }

    /// Appends a log line for every container of `service`.
    pub async fn push_log(&self, service: &str, stream: LogStream, message: &str) {
        let mut state = self.state.lock().await;
        state.logs.entry(service.to_string()).or_default().push(LogLine {
            container: String::new(),
            stream,
            message: message.to_string(),
        });
    }

    /// Forces the state of a container, looked up by name.
    pub async fn set_container_state(&self, name: &str, status: ContainerStatus, exit_code: Option<i64>) {
        let mut state = self.state.lock().await;
        if let Some(container) = state.containers.values_mut().find(|c| c.instance.name == name) {
            container.instance.status = status;
            container.instance.exit_code = exit_code;
        }
    }

    /// Returns how many times `operation` was called.
    pub async fn calls(&self, operation: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.get(operation).copied().unwrap_or(0)
    }

    /// Returns the names of existing networks.
    pub async fn networks(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<_> = state.networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the names of existing volumes.
    pub async fn volumes(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<_> = state.volumes.iter().cloned().collect();
        names.sort();
        names
    }

    /// Returns the locally present images.
    pub async fn images(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut images: Vec<_> = state.images.iter().cloned().collect();
        images.sort();
        images
    }

    /// Returns all containers, including stopped ones.
    pub async fn containers(&self) -> Vec<ContainerInstance> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state
            .containers
            .values()
            .map(|c| c.instance.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Returns container names in the order they were started.
    pub async fn start_order(&self) -> Vec<String> {
        self.state.lock().await.started.clone()
    }

    /// Returns container names in the order they were removed.
    pub async fn removal_order(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_network(&self, request: &NetworkRequest) -> RuntimeResult<String> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("create_network")?;

        if state.networks.contains_key(&request.name) {
            return Err(RuntimeError::already_exists(
                "create_network",
                format!("network with name {} already exists", request.name),
            ));
        }

        let id = state.next_id();
        state.networks.insert(request.name.clone(), id.clone());
        debug!(network = %request.name, "Created network");
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> RuntimeResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("remove_network")?;

        let name = state
            .networks
            .iter()
            .find(|(name, net_id)| name.as_str() == id || net_id.as_str() == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| RuntimeError::not_found("remove_network", format!("network {} not found", id)))?;
        state.networks.remove(&name);
        Ok(())
    }

    async fn create_volume(&self, request: &VolumeRequest) -> RuntimeResult<String> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("create_volume")?;

        if !state.volumes.insert(request.name.clone()) {
            return Err(RuntimeError::already_exists(
                "create_volume",
                format!("volume {} already exists", request.name),
            ));
        }
        Ok(request.name.clone())
    }

    async fn remove_volume(&self, id: &str) -> RuntimeResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("remove_volume")?;

        if state.volumes.remove(id) {
            Ok(())
        } else {
            Err(RuntimeError::not_found("remove_volume", format!("no such volume: {}", id)))
        }
    }

    async fn create_and_start_container(
        &self,
        request: &ContainerRequest,
    ) -> RuntimeResult<ContainerInstance> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("create_and_start_container")?;

        if let Some(err) = state.service_failures.get(&request.service) {
            return Err(err.clone());
        }
        if state.missing_images.contains(&request.image) {
            return Err(RuntimeError::image_not_found(
                "create_container",
                format!("No such image: {}", request.image),
            ));
        }
        if state.containers.values().any(|c| c.instance.name == request.name) {
            return Err(RuntimeError::already_exists(
                "create_container",
                format!("container name {} is already in use", request.name),
            ));
        }

        let id = state.next_id();
        let instance = ContainerInstance::new(&id, &request.name, &request.service, request.replica)
            .mark_running();

        let mut stored = instance.clone();
        if let Some(code) = state.service_exits.get(&request.service) {
            stored.status = ContainerStatus::Exited;
            stored.exit_code = Some(*code);
        }

        let project = request
            .labels
            .get(LABEL_PROJECT)
            .cloned()
            .unwrap_or_default();
        state.containers.insert(
            id,
            MemContainer {
                instance: stored,
                project,
                image: request.image.clone(),
            },
        );
        state.started.push(request.name.clone());

        Ok(instance)
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("stop_container")?;

        let container = state.container_mut("stop_container", id)?;
        if container.instance.status == ContainerStatus::Running {
            container.instance.status = ContainerStatus::Exited;
            container.instance.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> RuntimeResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("remove_container")?;

        let container = state.container_mut("remove_container", id)?;
        if container.instance.status == ContainerStatus::Running {
            return Err(RuntimeError::new(
                crate::error::RuntimeErrorKind::Conflict,
                "remove_container",
                format!("container {} is running", id),
            ));
        }
        if let Some(removed) = state.containers.remove(id) {
            state.removed.push(removed.instance.name);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState> {
        let mut state = self.state.lock().await;
        state.record("inspect_container")?;

        let container = state.container_mut("inspect_container", id)?;
        Ok(ContainerState {
            status: container.instance.status,
            exit_code: container.instance.exit_code,
        })
    }

    async fn list_containers(
        &self,
        project: &str,
        all: bool,
    ) -> RuntimeResult<Vec<ContainerInstance>> {
        let mut state = self.state.lock().await;
        state.record("list_containers")?;

        let mut found: Vec<_> = state
            .containers
            .values()
            .filter(|c| c.project == project)
            .filter(|c| all || c.instance.is_running())
            .map(|c| c.instance.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn exec_in_container(
        &self,
        id: &str,
        command: &[String],
        _options: &ExecOptions,
    ) -> RuntimeResult<ExecOutput> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("exec_in_container")?;

        let container = state.container_mut("exec_in_container", id)?;
        if !container.instance.is_running() {
            return Err(RuntimeError::new(
                crate::error::RuntimeErrorKind::Conflict,
                "exec_in_container",
                format!("container {} is not running", id),
            ));
        }
        let service = container.instance.service.clone();

        let exit_code = state
            .exec_scripts
            .get_mut(&service)
            .map(ExecScript::next_code)
            .unwrap_or(0);

        Ok(ExecOutput::new(command.join(" "), "", exit_code))
    }

    async fn stream_logs(
        &self,
        id: &str,
        options: &LogOptions,
    ) -> RuntimeResult<BoxStream<'static, RuntimeResult<LogLine>>> {
        let mut state = self.state.lock().await;
        state.record("stream_logs")?;

        let container = state.container_mut("stream_logs", id)?;
        let service = container.instance.service.clone();
        let name = container.instance.name.clone();

        let mut lines: Vec<LogLine> = state
            .logs
            .get(&service)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|line| LogLine {
                container: name.clone(),
                ..line
            })
            .collect();
        if let Some(tail) = options.tail {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }

        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn image_exists(&self, reference: &str) -> RuntimeResult<bool> {
        let mut state = self.state.lock().await;
        state.record("image_exists")?;
        Ok(state.images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("pull_image")?;

        if state.missing_images.contains(reference) {
            return Err(RuntimeError::image_not_found("pull_image", reference));
        }
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> RuntimeResult<String> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record("build_image")?;

        state.missing_images.remove(&request.tag);
        state.images.insert(request.tag.clone());
        Ok(request.tag.clone())
    }

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        state.record("remove_image")?;

        if state.containers.values().any(|c| c.image == reference) {
            return Err(RuntimeError::new(
                crate::error::RuntimeErrorKind::Conflict,
                "remove_image",
                format!("image {} is in use", reference),
            ));
        }
        if state.images.remove(reference) {
            Ok(())
        } else {
            Err(RuntimeError::not_found("remove_image", format!("no such image: {}", reference)))
        }
    }
}
