//! Compose-style rendering of a topology.
//!
//! The output is what `convoy config` prints: the validated,
//! profile-filtered topology with project-scoped resource names, in a form
//! `docker compose` can read back for debugging.

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::topology::{DependencyCondition, HealthCheck, MountSource, ServiceSpec, Topology};

#[derive(Debug, Default, Serialize)]
struct ComposeFile {
    name: String,
    services: IndexMap<String, ComposeService>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    networks: IndexMap<String, ComposeNetwork>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    volumes: IndexMap<String, ComposeVolume>,
}

#[derive(Debug, Default, Serialize)]
struct ComposeService {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<ComposeBuild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    environment: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    depends_on: IndexMap<String, ComposeDependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck>,
    restart: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    labels: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy: Option<DeployConfig>,
}

#[derive(Debug, Serialize)]
struct ComposeBuild {
    context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dockerfile: Option<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    args: IndexMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ComposeDependency {
    condition: DependencyCondition,
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
    start_period: String,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    name: String,
    driver: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    driver_opts: IndexMap<String, String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    external: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    internal: bool,
}

#[derive(Debug, Serialize)]
struct ComposeVolume {
    name: String,
    driver: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    driver_opts: IndexMap<String, String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    external: bool,
}

#[derive(Debug, Serialize)]
struct DeployConfig {
    replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<ResourceConfig>,
}

#[derive(Debug, Serialize)]
struct ResourceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    limits: Option<Limits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reservations: Option<Limits>,
}

#[derive(Debug, Serialize)]
struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pids: Option<i64>,
}

/// Renders `topology` as a compose YAML document for `project`.
pub fn to_compose_yaml(topology: &Topology, project: &str) -> Result<String> {
    let compose = ComposeFile {
        name: project.to_string(),
        services: topology
            .services
            .values()
            .map(|svc| (svc.name.clone(), to_service(svc, topology)))
            .collect(),
        networks: topology
            .effective_networks()
            .into_iter()
            .map(|(name, net)| {
                let rendered = ComposeNetwork {
                    name: net.scoped_name(project),
                    driver: net.driver.clone(),
                    driver_opts: net.driver_opts.clone(),
                    external: net.external,
                    internal: net.internal,
                };
                (name, rendered)
            })
            .collect(),
        volumes: topology
            .volumes
            .iter()
            .map(|(name, vol)| {
                let rendered = ComposeVolume {
                    name: vol.scoped_name(project),
                    driver: vol.driver.clone(),
                    driver_opts: vol.driver_opts.clone(),
                    external: vol.external,
                };
                (name.clone(), rendered)
            })
            .collect(),
    };

    serde_yaml::to_string(&compose).map_err(|e| OrchestratorError::serialization(e.to_string()))
}

fn to_service(service: &ServiceSpec, topology: &Topology) -> ComposeService {
    let mut rendered = ComposeService {
        image: service.image.as_ref().map(|i| i.reference().to_string()),
        build: service.build.as_ref().map(|b| ComposeBuild {
            context: b.context.to_string_lossy().into_owned(),
            dockerfile: b.dockerfile.clone(),
            args: b.args.clone(),
        }),
        command: service.command.clone(),
        entrypoint: service.entrypoint.clone(),
        environment: service.environment.clone(),
        ports: service.ports.iter().map(|p| p.as_compose_port()).collect(),
        volumes: service.volumes.iter().map(mount_to_compose).collect(),
        networks: topology
            .service_networks(service)
            .into_iter()
            .map(str::to_string)
            .collect(),
        depends_on: service
            .depends_on
            .iter()
            .map(|(name, condition)| (name.clone(), ComposeDependency { condition: *condition }))
            .collect(),
        healthcheck: service.healthcheck.as_ref().map(healthcheck_to_compose),
        restart: service.restart.as_compose_str().to_string(),
        labels: service.labels.clone(),
        working_dir: service.working_dir.clone(),
        user: service.user.clone(),
        deploy: None,
    };

    let resources = &service.resources;
    if service.replicas != 1 || !resources.is_unlimited() {
        let limits = Limits {
            cpus: resources.cpu_limit().map(|c| format!("{:.2}", c)),
            memory: resources.memory_bytes.map(|m| format!("{}M", m / (1024 * 1024))),
            pids: resources.pids_limit,
        };
        let has_limits = limits.cpus.is_some() || limits.memory.is_some() || limits.pids.is_some();

        rendered.deploy = Some(DeployConfig {
            replicas: service.replicas,
            resources: (!resources.is_unlimited()).then(|| ResourceConfig {
                limits: has_limits.then_some(limits),
                reservations: resources.memory_reservation_bytes.map(|r| Limits {
                    cpus: None,
                    memory: Some(format!("{}M", r / (1024 * 1024))),
                    pids: None,
                }),
            }),
        });
    }

    rendered
}

fn mount_to_compose(mount: &crate::topology::VolumeMount) -> String {
    let source = match mount.source_kind() {
        MountSource::Anonymous => return mount.target.clone(),
        MountSource::Named(s) | MountSource::RelativePath(s) | MountSource::AbsolutePath(s) => s,
    };
    if mount.read_only {
        format!("{}:{}:ro", source, mount.target)
    } else {
        format!("{}:{}", source, mount.target)
    }
}

fn healthcheck_to_compose(check: &HealthCheck) -> ComposeHealthcheck {
    let test = if check.disable {
        vec!["NONE".to_string()]
    } else {
        check.test.clone()
    };
    ComposeHealthcheck {
        test,
        interval: format_millis(check.interval_ms),
        timeout: format_millis(check.timeout_ms),
        retries: check.retries,
        start_period: format_millis(check.start_period_ms),
    }
}

/// Formats milliseconds as a compose duration (`30s`, `1500ms`).
fn format_millis(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
