//! The orchestration facade.
//!
//! [`Orchestrator`] composes the resolver, the resource and container
//! lifecycle managers, readiness waits and health monitors into the
//! operations a project exposes: `up`, `down`, `ps`, `logs`, `build`,
//! `exec` and `pull`.
//!
//! `up` is not atomic. Services that started stay up when a later one
//! fails, and the per-service outcomes are reported together.

use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, FailurePolicy};
use crate::container::{ContainerInstance, ContainerLifecycleManager, ContainerRegistry, ImagePullPolicy};
use crate::error::{OrchestratorError, Result};
use crate::health::HealthMonitor;
use crate::readiness::ReadinessCoordinator;
use crate::render;
use crate::report::{DownReport, ServiceOutcome, UpReport, UpState};
use crate::resolver::DependencyResolver;
use crate::resources::ResourceManager;
use crate::runtime::{
    BuildRequest, ExecOptions, ExecOutput, LogLine, LogOptions, RuntimeResult, SharedRuntime,
    LABEL_PROJECT,
};
use crate::topology::{ServiceSpec, Topology};

/// Options for [`Orchestrator::up`].
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Services to start. Empty means every active service.
    pub services: Vec<String>,
    /// Return once containers are started instead of handing control to a
    /// log follower. The engine itself never attaches; the flag is carried
    /// for callers that do.
    pub detach: bool,
    /// Build images of services with a build section first.
    pub build: bool,
    /// Pull images of image-only services first.
    pub pull: bool,
    /// Replica count overrides.
    pub scale: HashMap<String, u32>,
    /// Do not start the dependencies of the requested services.
    pub no_deps: bool,
}

/// Which images `down` removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoveImages {
    /// Keep all images.
    #[default]
    None,
    /// Remove images built by the engine.
    Local,
    /// Remove every image used by the project.
    All,
}

/// Options for [`Orchestrator::down`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
    /// Remove named and anonymous volumes.
    pub remove_volumes: bool,
    /// Images to remove.
    pub rmi: RemoveImages,
}

/// Options for [`Orchestrator::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Services to build. Empty means every service with a build section.
    pub services: Vec<String>,
    /// Do not use the build cache.
    pub no_cache: bool,
    /// Always pull newer base images.
    pub pull: bool,
    /// Build all images concurrently.
    pub parallel: bool,
}

/// Drives one project against a container runtime.
pub struct Orchestrator {
    topology: Topology,
    project: String,
    config: EngineConfig,
    runtime: SharedRuntime,
    registry: ContainerRegistry,
    lifecycle: ContainerLifecycleManager,
    resources: ResourceManager,
    readiness: ReadinessCoordinator,
    health: HealthMonitor,
    token: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator for a profile-filtered topology.
    ///
    /// The topology and configuration are validated here, before any
    /// runtime call is made.
    pub fn new(topology: Topology, runtime: SharedRuntime, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        topology.validate()?;

        let project = topology
            .name
            .clone()
            .unwrap_or_else(|| config.project_name.clone());
        let registry = ContainerRegistry::new();
        let token = CancellationToken::new();

        let lifecycle = ContainerLifecycleManager::new(
            runtime.clone(),
            registry.clone(),
            &topology,
            &project,
            config.base_dir.clone(),
            config.labels.clone(),
        );
        let resources = ResourceManager::new(runtime.clone(), &topology, &project, config.labels.clone());
        let readiness = ReadinessCoordinator::new(
            runtime.clone(),
            registry.clone(),
            token.clone(),
            config.poll_interval(),
        );

        Ok(Self {
            topology,
            project,
            config,
            runtime,
            registry,
            lifecycle,
            resources,
            readiness,
            health: HealthMonitor::new(),
            token,
        })
    }

    /// Returns the project name.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Returns the topology being orchestrated.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the container registry.
    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Returns the health monitors.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Returns the token that interrupts readiness waits and health checks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Interrupts in-flight work and stops every health monitor.
    ///
    /// Containers already started are left running.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.health.stop_all().await;
    }

    /// Renders the topology as a compose-style YAML document.
    pub fn render_config(&self) -> Result<String> {
        render::to_compose_yaml(&self.topology, &self.project)
    }

    /// Brings the selected services up.
    ///
    /// Returns `Err` only for problems found before any container is
    /// started: unknown services, resolution errors, and network or volume
    /// creation failures. Per-service failures are reported in the
    /// [`UpReport`].
    pub async fn up(&self, options: UpOptions) -> Result<UpReport> {
        let resolver = DependencyResolver::new(&self.topology);
        let selected = self.select(&options.services, options.no_deps)?;
        for name in options.scale.keys() {
            if self.topology.service(name).is_none() {
                return Err(OrchestratorError::service_not_found(name));
            }
        }

        let order = resolver.resolve(&selected)?;
        let waves = resolver.waves(&order);
        let selected: HashSet<String> = order.iter().cloned().collect();
        let replicas: HashMap<String, u32> = order
            .iter()
            .filter_map(|name| self.topology.service(name))
            .map(|svc| {
                let count = options.scale.get(&svc.name).copied().unwrap_or(svc.replicas);
                (svc.name.clone(), count)
            })
            .collect();

        info!(project = %self.project, services = ?order, waves = waves.len(), "Bringing project up");

        let mut state = UpState::Pending;
        self.retrying("create networks", || self.resources.ensure_networks())
            .await?;
        self.advance(&mut state, UpState::NetworksReady);
        self.retrying("create volumes", || self.resources.ensure_volumes())
            .await?;
        self.advance(&mut state, UpState::VolumesReady);

        let existing = self
            .retrying("list containers", || async {
                self.runtime
                    .list_containers(&self.project, true)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await?;
        self.registry.reconcile(existing, true).await;

        let mut outcomes: HashMap<String, ServiceOutcome> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut halted: Option<String> = None;
        let mut cancelled = false;

        if options.build || options.pull {
            for name in &order {
                let Some(service) = self.topology.service(name) else {
                    continue;
                };
                let prepared = if options.build && service.build.is_some() {
                    self.build_service(service, false, false).await.map(|_| ())
                } else if options.pull && !service.has_local_image() {
                    self.pull_service(service).await
                } else {
                    Ok(())
                };
                if let Err(err) = prepared {
                    error!(service = %name, error = %err, "Failed to prepare image");
                    failed.insert(name.clone());
                    outcomes.insert(name.clone(), ServiceOutcome::failed(name, err));
                }
            }
        }

        let mut position = 0;
        for wave in &waves {
            if self.token.is_cancelled() {
                cancelled = true;
            }

            let mut runnable: Vec<&str> = Vec::new();
            for name in wave {
                if outcomes.contains_key(name) {
                    continue;
                }
                if cancelled {
                    outcomes.insert(name.clone(), ServiceOutcome::skipped(name, "interrupted"));
                    continue;
                }
                if let Some(reason) = &halted {
                    outcomes.insert(name.clone(), ServiceOutcome::skipped(name, reason.clone()));
                    continue;
                }
                if let Some(dep) = self.failed_dependency(name, &failed) {
                    let err = OrchestratorError::dependency_failed(name, dep, "failed to start");
                    error!(service = %name, dependency = %dep, "Dependency failed, not starting");
                    failed.insert(name.clone());
                    outcomes.insert(name.clone(), ServiceOutcome::failed(name, err));
                    if self.config.failure_policy == FailurePolicy::Abort {
                        halted = Some(format!("aborted after {} failed", name));
                    }
                    continue;
                }
                runnable.push(name);
            }

            if !runnable.is_empty() {
                self.advance(&mut state, UpState::Starting(position));
                let results = join_all(
                    runnable
                        .iter()
                        .map(|name| self.start_service(name, &replicas, &selected)),
                )
                .await;

                for (name, result) in runnable.into_iter().zip(results) {
                    let outcome = match result {
                        Ok(containers) => ServiceOutcome::started(name, containers),
                        Err(OrchestratorError::Cancelled) => {
                            cancelled = true;
                            ServiceOutcome::skipped(name, "interrupted")
                        }
                        Err(err) => {
                            error!(service = %name, error = %err, "Service failed to start");
                            failed.insert(name.to_string());
                            if self.config.failure_policy == FailurePolicy::Abort && halted.is_none() {
                                halted = Some(format!("aborted after {} failed", name));
                            }
                            ServiceOutcome::failed(name, err)
                        }
                    };
                    outcomes.insert(name.to_string(), outcome);
                }
            }
            position += wave.len();
        }

        let outcomes: Vec<ServiceOutcome> = order.iter().filter_map(|name| outcomes.remove(name)).collect();
        let converged = !cancelled && outcomes.iter().all(ServiceOutcome::is_started);
        self.advance(
            &mut state,
            if converged {
                UpState::Running
            } else {
                UpState::PartiallyFailed
            },
        );

        let report = UpReport {
            project: self.project.clone(),
            state,
            outcomes,
            cancelled,
        };
        if converged {
            info!(project = %self.project, "Project is up");
        } else {
            warn!(
                project = %self.project,
                unstarted = ?report.unstarted(),
                cancelled,
                "Project is partially up"
            );
        }
        Ok(report)
    }

    /// Tears the project down.
    ///
    /// Containers are stopped and removed in reverse dependency order, then
    /// networks, then volumes and images when asked. Every step is
    /// attempted; failures are collected in the report.
    pub async fn down(&self, options: DownOptions) -> DownReport {
        info!(project = %self.project, "Tearing down project");
        self.health.stop_all().await;

        let mut report = DownReport::default();
        match self.runtime.list_containers(&self.project, true).await {
            Ok(found) => self.registry.reconcile(found, true).await,
            Err(err) => {
                warn!(project = %self.project, error = %err, "Could not list containers, using known ones");
                report.errors.push(err.into());
            }
        }

        let order = self.start_order();
        let rank = |service: &str| order.iter().position(|n| n == service);
        let mut containers = self.registry.all().await;
        // Unknown services sort first, then reverse start order.
        containers.sort_by_key(|c| (Reverse(rank(&c.service).unwrap_or(usize::MAX)), Reverse(c.replica)));

        for container in containers {
            if !container.status.is_terminal() {
                match self.lifecycle.stop(&container.id, self.config.stop_timeout()).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        self.registry.unregister(&container.id).await;
                        debug!(container = %container.name, "Container already gone");
                        continue;
                    }
                    Err(err) => {
                        warn!(container = %container.name, error = %err, "Failed to stop container");
                        report.errors.push(err);
                    }
                }
            }

            match self.lifecycle.remove(&container.id, options.remove_volumes).await {
                Ok(()) => report.removed_containers.push(container.name),
                Err(err) if err.is_not_found() => {
                    self.registry.unregister(&container.id).await;
                    debug!(container = %container.name, "Container already gone");
                }
                Err(err) => {
                    error!(container = %container.name, error = %err, "Failed to remove container");
                    report.errors.push(err);
                }
            }
        }

        let (removed, errors) = self.resources.remove_networks().await;
        report.removed_networks = removed;
        report.errors.extend(errors);

        if options.remove_volumes {
            let (removed, errors) = self.resources.remove_volumes().await;
            report.removed_volumes = removed;
            report.errors.extend(errors);
        }

        if options.rmi != RemoveImages::None {
            for image in self.images_to_remove(options.rmi) {
                match self.runtime.remove_image(&image).await {
                    Ok(()) => {
                        info!(image = %image, "Removed image");
                        report.removed_images.push(image);
                    }
                    Err(err) if err.is_not_found() => debug!(image = %image, "Image already gone"),
                    Err(err) => {
                        warn!(image = %image, error = %err, "Failed to remove image");
                        report.errors.push(err.into());
                    }
                }
            }
        }

        if report.is_success() {
            info!(project = %self.project, containers = report.removed_containers.len(), "Project is down");
        } else {
            error!(project = %self.project, errors = report.errors.len(), "Teardown finished with errors");
        }
        report
    }

    /// Lists the project's containers, running ones only unless `all`.
    pub async fn ps(&self, all: bool) -> Result<Vec<ContainerInstance>> {
        let found = self.runtime.list_containers(&self.project, all).await?;
        self.registry.reconcile(found.clone(), all).await;

        let mut containers = Vec::with_capacity(found.len());
        for container in found {
            let known = self.registry.get(&container.id).await;
            containers.push(known.unwrap_or(container));
        }

        let order = self.topology.service_names();
        containers.sort_by_key(|c| {
            (
                order.iter().position(|n| *n == c.service).unwrap_or(usize::MAX),
                c.replica,
            )
        });
        Ok(containers)
    }

    /// Merges the log streams of the selected services' containers.
    pub async fn logs(
        &self,
        services: &[String],
        options: LogOptions,
    ) -> Result<BoxStream<'static, RuntimeResult<LogLine>>> {
        self.check_services(services)?;
        let containers = self.ps(true).await?;

        let mut streams = Vec::new();
        for container in containers
            .iter()
            .filter(|c| services.is_empty() || services.contains(&c.service))
        {
            streams.push(self.lifecycle.logs(&container.id, &options).await?);
        }
        Ok(stream::select_all(streams).boxed())
    }

    /// Builds the images of the selected services. Returns the built tags.
    ///
    /// Sequential builds stop at the first failure. Parallel builds all run
    /// to completion, and the first failure in declaration order is
    /// returned.
    pub async fn build(&self, options: BuildOptions) -> Result<Vec<String>> {
        self.check_services(&options.services)?;
        let services: Vec<&ServiceSpec> = self
            .topology
            .services
            .values()
            .filter(|svc| options.services.is_empty() || options.services.contains(&svc.name))
            .filter(|svc| svc.build.is_some())
            .collect();

        if options.parallel {
            join_all(
                services
                    .iter()
                    .map(|svc| self.build_service(svc, options.no_cache, options.pull)),
            )
            .await
            .into_iter()
            .collect()
        } else {
            let mut tags = Vec::with_capacity(services.len());
            for service in services {
                tags.push(self.build_service(service, options.no_cache, options.pull).await?);
            }
            Ok(tags)
        }
    }

    /// Runs a command in replica `index` (starting at 1) of a service.
    pub async fn exec(
        &self,
        service: &str,
        command: &[String],
        options: ExecOptions,
        index: u32,
    ) -> Result<ExecOutput> {
        self.check_services(&[service.to_string()])?;
        let container = self
            .ps(false)
            .await?
            .into_iter()
            .find(|c| c.service == service && c.replica == index)
            .ok_or_else(|| {
                OrchestratorError::container_not_found(format!("{} replica {}", service, index))
            })?;

        debug!(container = %container.name, command = ?command, "Executing command");
        self.lifecycle.exec(&container.id, command, &options).await
    }

    /// Pulls the images of the selected services. Returns the pulled
    /// references.
    ///
    /// Services whose image is built locally are skipped. With
    /// `ignore_failures`, failed pulls are logged and skipped.
    pub async fn pull(&self, services: &[String], ignore_failures: bool) -> Result<Vec<String>> {
        self.check_services(services)?;

        let mut pulled = Vec::new();
        for service in self
            .topology
            .services
            .values()
            .filter(|svc| services.is_empty() || services.contains(&svc.name))
            .filter(|svc| !svc.has_local_image())
        {
            match self.pull_service(service).await {
                Ok(()) => {
                    if let Some(image) = service.image_ref(&self.project) {
                        pulled.push(image);
                    }
                }
                Err(err) if ignore_failures => {
                    warn!(service = %service.name, error = %err, "Pull failed, ignoring");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(pulled)
    }

    /// Waits on the dependencies of one service, then starts its replicas
    /// concurrently.
    async fn start_service(
        &self,
        name: &str,
        replicas: &HashMap<String, u32>,
        selected: &HashSet<String>,
    ) -> Result<Vec<ContainerInstance>> {
        let service = self
            .topology
            .service(name)
            .ok_or_else(|| OrchestratorError::service_not_found(name))?;

        for (dep, condition) in &service.depends_on {
            if !selected.contains(dep) {
                debug!(service = %name, dependency = %dep, "Dependency not selected, treating as satisfied");
                continue;
            }
            if replicas.get(dep) == Some(&0) {
                debug!(service = %name, dependency = %dep, "Dependency scaled to zero, treating as satisfied");
                continue;
            }
            self.readiness
                .await_condition(name, dep, *condition, self.config.readiness_timeout())
                .await?;
        }

        let count = replicas.get(name).copied().unwrap_or(service.replicas);
        self.remove_surplus(service, count).await?;
        if count == 0 {
            info!(service = %name, "Service scaled to zero");
            return Ok(Vec::new());
        }

        self.ensure_image(service).await?;

        let results = join_all((1..=count).map(|replica| self.start_replica(service, replica))).await;
        results.into_iter().collect()
    }

    async fn start_replica(&self, service: &ServiceSpec, replica: u32) -> Result<ContainerInstance> {
        let name = service.container_name(&self.project, replica);
        if let Some(existing) = self.registry.get_by_name(&name).await {
            if existing.is_running() {
                info!(container = %name, "Container already running");
                if !self.health.is_watching(&existing.id).await {
                    self.watch_health(service, &existing).await;
                }
                return Ok(existing);
            }
            debug!(container = %name, status = %existing.status, "Replacing stale container");
            self.health.unwatch(&existing.id).await;
            self.lifecycle.remove(&existing.id, false).await?;
        }

        let instance = self
            .retrying("start container", || self.lifecycle.start_replica(service, replica))
            .await?;
        self.watch_health(service, &instance).await;
        Ok(instance)
    }

    /// Stops and removes replicas above `count`.
    async fn remove_surplus(&self, service: &ServiceSpec, count: u32) -> Result<()> {
        for surplus in self
            .registry
            .for_service(&service.name)
            .await
            .into_iter()
            .filter(|c| c.replica > count)
        {
            info!(container = %surplus.name, "Scaling down");
            self.health.unwatch(&surplus.id).await;
            if !surplus.status.is_terminal() {
                self.lifecycle.stop(&surplus.id, self.config.stop_timeout()).await?;
            }
            self.lifecycle.remove(&surplus.id, false).await?;
        }
        Ok(())
    }

    async fn watch_health(&self, service: &ServiceSpec, instance: &ContainerInstance) {
        if let Some(check) = service.active_healthcheck() {
            let watching = self
                .health
                .watch(
                    self.runtime.clone(),
                    self.registry.clone(),
                    instance,
                    check,
                    &self.token,
                )
                .await;
            if watching {
                debug!(container = %instance.name, "Health monitor attached");
            }
        }
    }

    /// Makes the service image available according to its pull policy.
    async fn ensure_image(&self, service: &ServiceSpec) -> Result<()> {
        let reference = service.image_ref(&self.project).ok_or_else(|| {
            OrchestratorError::validation(format!("service {} has no image", service.name))
        })?;

        match service.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always if !service.has_local_image() => self.pull_service(service).await,
            _ => {
                if self.runtime.image_exists(&reference).await? {
                    return Ok(());
                }
                if service.build.is_some() {
                    self.build_service(service, false, false).await.map(|_| ())
                } else {
                    self.pull_service(service).await
                }
            }
        }
    }

    async fn pull_service(&self, service: &ServiceSpec) -> Result<()> {
        let Some(image) = service.image.as_ref() else {
            return Ok(());
        };
        info!(service = %service.name, image = %image, "Pulling image");
        self.retrying("pull image", || async {
            self.runtime
                .pull_image(image.reference())
                .await
                .map_err(OrchestratorError::from)
        })
        .await
    }

    async fn build_service(&self, service: &ServiceSpec, no_cache: bool, pull: bool) -> Result<String> {
        let build = service.build.as_ref().ok_or_else(|| {
            OrchestratorError::configuration(format!("service {} has no build section", service.name))
        })?;
        let tag = service.image_ref(&self.project).ok_or_else(|| {
            OrchestratorError::validation(format!("service {} has no image", service.name))
        })?;

        let mut labels = self.config.labels.clone();
        labels.insert(LABEL_PROJECT.to_string(), self.project.clone());
        let request = BuildRequest {
            context: build.resolved_context(&self.config.base_dir),
            dockerfile: build.dockerfile.clone(),
            tag,
            args: build.args.clone(),
            no_cache,
            pull,
            labels,
        };

        info!(service = %service.name, tag = %request.tag, context = %request.context.display(), "Building image");
        let built = self.runtime.build_image(&request).await?;
        info!(service = %service.name, image = %built, "Built image");
        Ok(built)
    }

    /// Runs `op`, retrying retryable failures according to the retry policy.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(err) if err.is_retryable() => match self.config.retry.delay_for(retry) {
                    Some(delay) => {
                        warn!(
                            operation = %what,
                            attempt = retry + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient runtime error, retrying"
                        );
                        tokio::select! {
                            _ = self.token.cancelled() => return Err(OrchestratorError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        retry += 1;
                    }
                    None => return Err(err),
                },
                result => return result,
            }
        }
    }

    fn advance(&self, state: &mut UpState, next: UpState) {
        debug!(project = %self.project, from = %state, to = %next, "Up state changed");
        *state = next;
    }

    fn select(&self, services: &[String], no_deps: bool) -> Result<Vec<String>> {
        self.check_services(services)?;
        if services.is_empty() {
            Ok(self.topology.service_names())
        } else if no_deps {
            Ok(services.to_vec())
        } else {
            DependencyResolver::new(&self.topology).with_dependencies(services)
        }
    }

    fn check_services(&self, services: &[String]) -> Result<()> {
        for name in services {
            if self.topology.service(name).is_none() {
                if self.topology.is_inactive(name) {
                    return Err(OrchestratorError::validation(format!(
                        "service {} is not enabled by the active profiles",
                        name
                    )));
                }
                return Err(OrchestratorError::service_not_found(name));
            }
        }
        Ok(())
    }

    fn failed_dependency<'a>(&'a self, name: &str, failed: &HashSet<String>) -> Option<&'a str> {
        self.topology
            .service(name)?
            .depends_on
            .keys()
            .find(|dep| failed.contains(*dep))
            .map(String::as_str)
    }

    fn start_order(&self) -> Vec<String> {
        DependencyResolver::new(&self.topology)
            .resolve(&self.topology.service_names())
            .unwrap_or_else(|_| self.topology.service_names())
    }

    fn images_to_remove(&self, rmi: RemoveImages) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        for service in self.topology.services.values() {
            let wanted = match rmi {
                RemoveImages::None => false,
                RemoveImages::Local => service.has_local_image(),
                RemoveImages::All => true,
            };
            if let Some(image) = service.image_ref(&self.project).filter(|_| wanted) {
                if !images.contains(&image) {
                    images.push(image);
                }
            }
        }
        images
    }
}
