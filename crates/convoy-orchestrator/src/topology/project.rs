//! The topology: every service, network and volume of one project.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::resolver::DependencyResolver;
use crate::topology::resources::{NetworkSpec, PortProtocol, VolumeSpec};
use crate::topology::service::{DependencyCondition, MountSource, ServiceSpec};

/// Name of the network services join when they declare none.
pub const DEFAULT_NETWORK: &str = "default";

/// Complete declaration of a project.
///
/// Services, networks and volumes keep their declaration order; that order
/// breaks ties when the start order is computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Project name. Falls back to the engine's configured name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Service definitions.
    pub services: IndexMap<String, ServiceSpec>,

    /// Network definitions.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub networks: IndexMap<String, NetworkSpec>,

    /// Volume definitions.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, VolumeSpec>,

    /// Services removed by the profile filter.
    #[serde(skip)]
    inactive: Vec<String>,
}

impl Topology {
    /// Creates a new topology builder.
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Parses a topology from YAML whose variables are already substituted.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut topology: Self = serde_yaml::from_str(yaml)?;
        topology.assign_names();
        Ok(topology)
    }

    /// Reads and parses a topology file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Copies map keys into the `name` fields that are not serialized.
    fn assign_names(&mut self) {
        for (name, service) in &mut self.services {
            service.name = name.clone();
        }
        for (name, network) in &mut self.networks {
            network.name = name.clone();
        }
        for (name, volume) in &mut self.volumes {
            volume.name = name.clone();
        }
    }

    /// Gets a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Returns service names in declaration order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Returns true if the service was declared but filtered out by profile.
    pub fn is_inactive(&self, name: &str) -> bool {
        self.inactive.iter().any(|n| n == name)
    }

    /// Returns the topology restricted to the active profiles.
    ///
    /// Services with no profile are always kept. Dependencies on removed
    /// services are treated as already satisfied.
    pub fn with_profiles(&self, active: &[String]) -> Self {
        let (services, removed): (IndexMap<_, _>, IndexMap<_, _>) = self
            .services
            .clone()
            .into_iter()
            .partition(|(_, svc)| svc.is_enabled_for(active));

        let mut inactive = self.inactive.clone();
        inactive.extend(removed.into_keys());

        Self {
            name: self.name.clone(),
            services,
            networks: self.networks.clone(),
            volumes: self.volumes.clone(),
            inactive,
        }
    }

    /// Returns the networks a service attaches to.
    pub fn service_networks<'a>(&self, service: &'a ServiceSpec) -> Vec<&'a str> {
        if service.networks.is_empty() {
            vec![DEFAULT_NETWORK]
        } else {
            service.networks.iter().map(String::as_str).collect()
        }
    }

    /// Returns the networks in use, including the implicit default network.
    ///
    /// Declared networks no active service joins are still returned.
    pub fn effective_networks(&self) -> IndexMap<String, NetworkSpec> {
        let mut networks = self.networks.clone();
        let uses_default = self
            .services
            .values()
            .any(|svc| self.service_networks(svc).contains(&DEFAULT_NETWORK));

        if uses_default && !networks.contains_key(DEFAULT_NETWORK) {
            networks.insert(
                DEFAULT_NETWORK.to_string(),
                NetworkSpec::builder(DEFAULT_NETWORK).build(),
            );
        }
        networks
    }

    /// Validates the topology.
    ///
    /// All structural problems are reported together in one
    /// [`OrchestratorError::SpecValidation`]; a dependency cycle is reported
    /// as [`OrchestratorError::CircularDependency`] once the rest is sound.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if let Some(name) = &self.name {
            if !is_valid_project_name(name) {
                problems.push(format!(
                    "project name {:?} must be lowercase letters, digits, '-' or '_'",
                    name
                ));
            }
        }

        if self.services.is_empty() && self.inactive.is_empty() {
            problems.push("no services defined".to_string());
        }

        for (name, service) in &self.services {
            self.validate_service(name, service, &mut problems);
        }

        self.validate_host_ports(&mut problems);

        for (name, network) in &self.networks {
            if network.external && !network.driver_opts.is_empty() {
                problems.push(format!("external network {} cannot set driver_opts", name));
            }
        }
        for (name, volume) in &self.volumes {
            if volume.external && !volume.driver_opts.is_empty() {
                problems.push(format!("external volume {} cannot set driver_opts", name));
            }
        }

        if !problems.is_empty() {
            return Err(OrchestratorError::validation(problems.join("; ")));
        }

        DependencyResolver::new(self).resolve(&self.service_names())?;
        Ok(())
    }

    fn validate_service(&self, name: &str, service: &ServiceSpec, problems: &mut Vec<String>) {
        if service.image.is_none() && service.build.is_none() {
            problems.push(format!("service {} has neither image nor build", name));
        }

        for (dependency, condition) in &service.depends_on {
            match self.services.get(dependency) {
                Some(dep) => {
                    if *condition == DependencyCondition::Healthy
                        && dep.active_healthcheck().is_none()
                    {
                        problems.push(format!(
                            "service {} waits for {} to be healthy, but {} has no health check",
                            name, dependency, dependency
                        ));
                    }
                }
                None if self.is_inactive(dependency) => {}
                None => problems.push(format!(
                    "service {} depends on undefined service {}",
                    name, dependency
                )),
            }
        }

        for network in &service.networks {
            if network != DEFAULT_NETWORK && !self.networks.contains_key(network) {
                problems.push(format!(
                    "service {} refers to undefined network {}",
                    name, network
                ));
            }
        }

        for mount in &service.volumes {
            if let MountSource::Named(volume) = mount.source_kind() {
                if !self.volumes.contains_key(volume) {
                    problems.push(format!(
                        "service {} refers to undefined volume {}",
                        name, volume
                    ));
                }
            }
        }

        if let Some(hc) = &service.healthcheck {
            if hc.is_enabled() && hc.probe_command().is_none() {
                problems.push(format!(
                    "service {} has a malformed health check test {:?}",
                    name, hc.test
                ));
            }
        }
    }

    fn validate_host_ports(&self, problems: &mut Vec<String>) {
        let mut seen: HashSet<(Option<std::net::IpAddr>, u16, PortProtocol)> = HashSet::new();

        for (name, service) in &self.services {
            for port in &service.ports {
                let Some(host_port) = port.host_port else {
                    continue;
                };
                if service.replicas > 1 {
                    problems.push(format!(
                        "service {} publishes fixed host port {} but runs {} replicas",
                        name, host_port, service.replicas
                    ));
                }
                if !seen.insert((port.host_ip, host_port, port.protocol)) {
                    problems.push(format!(
                        "host port {}/{} is bound more than once (service {})",
                        host_port,
                        port.protocol.as_str(),
                        name
                    ));
                }
            }
        }
    }
}

fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Builder for `Topology`.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    /// Sets the project name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.topology.name = Some(name.into());
        self
    }

    /// Adds a service.
    pub fn service(mut self, service: ServiceSpec) -> Self {
        self.topology.services.insert(service.name.clone(), service);
        self
    }

    /// Adds a network.
    pub fn network(mut self, network: NetworkSpec) -> Self {
        self.topology.networks.insert(network.name.clone(), network);
        self
    }

    /// Adds a volume.
    pub fn volume(mut self, volume: VolumeSpec) -> Self {
        self.topology.volumes.insert(volume.name.clone(), volume);
        self
    }

    /// Builds the topology.
    pub fn build(self) -> Topology {
        self.topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::service::{HealthCheck, VolumeMount};
    use crate::topology::PortMapping;

    fn svc(name: &str) -> ServiceSpec {
        ServiceSpec::builder(name).image("alpine:3").build_spec()
    }

    #[test]
    fn test_from_yaml_assigns_names_and_keeps_order() {
        let yaml = r#"
name: shop
services:
  web:
    image: nginx:1.27
    depends_on:
      cache: service_started
  cache:
    image: redis:7
volumes:
  data: {}
"#;
        let topology = Topology::from_yaml_str(yaml).unwrap();
        assert_eq!(topology.service_names(), vec!["web", "cache"]);
        assert_eq!(topology.service("web").unwrap().name, "web");
        assert_eq!(topology.volumes["data"].name, "data");
        assert_eq!(topology.service("cache").unwrap().replicas, 1);
        topology.validate().unwrap();
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let topology = Topology::builder()
            .service(ServiceSpec::builder("web").depends_on("ghost", DependencyCondition::Started).build_spec())
            .service(
                ServiceSpec::builder("api")
                    .image("api:1")
                    .network("backend")
                    .volume(VolumeMount::named("data", "/data"))
                    .build_spec(),
            )
            .build();

        let err = topology.validate().unwrap_err().to_string();
        assert!(err.contains("neither image nor build"));
        assert!(err.contains("undefined service ghost"));
        assert!(err.contains("undefined network backend"));
        assert!(err.contains("undefined volume data"));
    }

    #[test]
    fn test_validate_healthy_requires_healthcheck() {
        let topology = Topology::builder()
            .service(svc("db"))
            .service(
                ServiceSpec::builder("web")
                    .image("nginx")
                    .depends_on("db", DependencyCondition::Healthy)
                    .build_spec(),
            )
            .build();

        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("has no health check"));

        let topology = Topology::builder()
            .service(
                ServiceSpec::builder("db")
                    .image("postgres:16")
                    .healthcheck(HealthCheck::cmd(["pg_isready"]))
                    .build_spec(),
            )
            .service(
                ServiceSpec::builder("web")
                    .image("nginx")
                    .depends_on("db", DependencyCondition::Healthy)
                    .build_spec(),
            )
            .build();
        topology.validate().unwrap();
    }

    #[test]
    fn test_validate_detects_cycle() {
        let topology = Topology::builder()
            .service(ServiceSpec::builder("a").image("x").depends_on("b", DependencyCondition::Started).build_spec())
            .service(ServiceSpec::builder("b").image("x").depends_on("a", DependencyCondition::Started).build_spec())
            .build();

        assert!(matches!(
            topology.validate(),
            Err(OrchestratorError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_validate_host_port_conflicts() {
        let topology = Topology::builder()
            .service(ServiceSpec::builder("a").image("x").port(PortMapping::tcp(80).host_port(8080)).build_spec())
            .service(ServiceSpec::builder("b").image("x").port(PortMapping::tcp(81).host_port(8080)).build_spec())
            .service(
                ServiceSpec::builder("c")
                    .image("x")
                    .replicas(2)
                    .port(PortMapping::tcp(80).host_port(9090))
                    .build_spec(),
            )
            .build();

        let err = topology.validate().unwrap_err().to_string();
        assert!(err.contains("host port 8080/tcp is bound more than once"));
        assert!(err.contains("runs 2 replicas"));
    }

    #[test]
    fn test_validate_external_driver_opts() {
        let topology = Topology::builder()
            .service(svc("web"))
            .network(
                NetworkSpec::builder("shared")
                    .external(true)
                    .driver_opt("mtu", "1400")
                    .build(),
            )
            .build();
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_profiles_filter_once() {
        let topology = Topology::builder()
            .service(svc("db"))
            .service(
                ServiceSpec::builder("adminer")
                    .image("adminer")
                    .profile("debug")
                    .depends_on("db", DependencyCondition::Started)
                    .build_spec(),
            )
            .service(
                ServiceSpec::builder("web")
                    .image("nginx")
                    .depends_on("adminer", DependencyCondition::Started)
                    .build_spec(),
            )
            .build();

        let filtered = topology.with_profiles(&[]);
        assert_eq!(filtered.service_names(), vec!["db", "web"]);
        assert!(filtered.is_inactive("adminer"));
        // The dependency on a filtered service is not an error.
        filtered.validate().unwrap();

        let debug = topology.with_profiles(&["debug".to_string()]);
        assert_eq!(debug.service_names(), vec!["db", "adminer", "web"]);
    }

    #[test]
    fn test_effective_networks_adds_default() {
        let topology = Topology::builder()
            .service(svc("web"))
            .service(ServiceSpec::builder("api").image("x").network("backend").build_spec())
            .network(NetworkSpec::builder("backend").build())
            .build();

        let networks = topology.effective_networks();
        assert_eq!(
            networks.keys().cloned().collect::<Vec<_>>(),
            vec!["backend", "default"]
        );
    }

    #[test]
    fn test_invalid_project_name() {
        let topology = Topology::builder().name("My Shop").service(svc("web")).build();
        assert!(topology.validate().unwrap_err().is_configuration_error());
    }
}
