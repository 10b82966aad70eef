//! Network, volume and port definitions.
//!
//! Networks and volumes are project-scoped resources that services attach
//! to. A resource marked `external` is managed outside the engine: it is
//! referenced by its declared name and is never created or removed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Container port.
    pub container_port: u16,

    /// Host port (if None, the runtime assigns one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    /// Protocol (tcp/udp).
    #[serde(default)]
    pub protocol: PortProtocol,

    /// Host IP to bind to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
}

impl PortMapping {
    /// Creates a new TCP port mapping.
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: PortProtocol::Tcp,
            host_ip: None,
        }
    }

    /// Creates a new UDP port mapping.
    pub fn udp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: PortProtocol::Udp,
            host_ip: None,
        }
    }

    /// Sets the host port.
    pub fn host_port(mut self, port: u16) -> Self {
        self.host_port = Some(port);
        self
    }

    /// Sets the host IP to bind to.
    pub fn host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }

    /// Returns the container side key, e.g. `8080/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol.as_str())
    }

    /// Returns the short compose form, e.g. `127.0.0.1:8080:80/tcp`.
    pub fn as_compose_port(&self) -> String {
        let proto = self.protocol.as_str();

        match (self.host_ip, self.host_port) {
            (Some(ip), Some(hp)) => format!("{}:{}:{}/{}", ip, hp, self.container_port, proto),
            (None, Some(hp)) => format!("{}:{}/{}", hp, self.container_port, proto),
            (Some(ip), None) => format!("{}::{}/{}", ip, self.container_port, proto),
            (None, None) => format!("{}/{}", self.container_port, proto),
        }
    }
}

/// Port protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
}

impl PortProtocol {
    /// Returns the protocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A network declared by the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Name of the network, as referenced by services.
    #[serde(skip)]
    pub name: String,

    /// Network driver (bridge, overlay, etc.).
    pub driver: String,

    /// Driver-specific options.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub driver_opts: IndexMap<String, String>,

    /// Whether the network is managed outside the engine.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,

    /// Name of the network in the runtime, overriding the project-scoped name.
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub runtime_name: Option<String>,

    /// Whether the network is internal (no external connectivity).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,

    /// Whether to enable IPv6.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_ipv6: bool,

    /// Network labels.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: "bridge".to_string(),
            driver_opts: IndexMap::new(),
            external: false,
            runtime_name: None,
            internal: false,
            enable_ipv6: false,
            labels: IndexMap::new(),
        }
    }
}

impl NetworkSpec {
    /// Creates a new network specification builder.
    pub fn builder(name: impl Into<String>) -> NetworkSpecBuilder {
        NetworkSpecBuilder::new(name)
    }

    /// Returns the name of the network in the runtime.
    ///
    /// External networks keep their declared name; all others are prefixed
    /// with the project name.
    pub fn scoped_name(&self, project: &str) -> String {
        match (&self.runtime_name, self.external) {
            (Some(name), _) => name.clone(),
            (None, true) => self.name.clone(),
            (None, false) => format!("{}_{}", project, self.name),
        }
    }
}

/// Builder for `NetworkSpec`.
#[derive(Debug)]
pub struct NetworkSpecBuilder {
    spec: NetworkSpec,
}

impl NetworkSpecBuilder {
    /// Creates a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: NetworkSpec {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Sets the network driver.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.spec.driver = driver.into();
        self
    }

    /// Marks the network as externally managed.
    pub fn external(mut self, external: bool) -> Self {
        self.spec.external = external;
        self
    }

    /// Overrides the runtime name of the network.
    pub fn runtime_name(mut self, name: impl Into<String>) -> Self {
        self.spec.runtime_name = Some(name.into());
        self
    }

    /// Sets whether the network is internal.
    pub fn internal(mut self, internal: bool) -> Self {
        self.spec.internal = internal;
        self
    }

    /// Sets whether IPv6 is enabled.
    pub fn enable_ipv6(mut self, enable: bool) -> Self {
        self.spec.enable_ipv6 = enable;
        self
    }

    /// Adds a driver option.
    pub fn driver_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.driver_opts.insert(key.into(), value.into());
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Builds the network specification.
    pub fn build(self) -> NetworkSpec {
        self.spec
    }
}

/// A named volume declared by the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    /// Name of the volume, as referenced by service mounts.
    #[serde(skip)]
    pub name: String,

    /// Volume driver.
    pub driver: String,

    /// Driver-specific options.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub driver_opts: IndexMap<String, String>,

    /// Whether the volume is managed outside the engine.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,

    /// Name of the volume in the runtime, overriding the project-scoped name.
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub runtime_name: Option<String>,

    /// Volume labels.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: "local".to_string(),
            driver_opts: IndexMap::new(),
            external: false,
            runtime_name: None,
            labels: IndexMap::new(),
        }
    }
}

impl VolumeSpec {
    /// Creates a volume with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates an externally managed volume.
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            external: true,
            ..Self::new(name)
        }
    }

    /// Sets the volume driver.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Adds a driver option.
    pub fn with_driver_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_opts.insert(key.into(), value.into());
        self
    }

    /// Returns the name of the volume in the runtime.
    pub fn scoped_name(&self, project: &str) -> String {
        match (&self.runtime_name, self.external) {
            (Some(name), _) => name.clone(),
            (None, true) => self.name.clone(),
            (None, false) => format!("{}_{}", project, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_forms() {
        let port = PortMapping::tcp(80).host_port(8080);
        assert_eq!(port.as_compose_port(), "8080:80/tcp");
        assert_eq!(port.container_key(), "80/tcp");

        let port = PortMapping::udp(53).host_ip("127.0.0.1".parse().unwrap());
        assert_eq!(port.as_compose_port(), "127.0.0.1::53/udp");

        assert_eq!(PortMapping::tcp(6379).as_compose_port(), "6379/tcp");
    }

    #[test]
    fn test_network_scoped_name() {
        let net = NetworkSpec::builder("backend").build();
        assert_eq!(net.scoped_name("shop"), "shop_backend");

        let net = NetworkSpec::builder("shared").external(true).build();
        assert_eq!(net.scoped_name("shop"), "shared");

        let net = NetworkSpec::builder("edge").runtime_name("edge-net").build();
        assert_eq!(net.scoped_name("shop"), "edge-net");
    }

    #[test]
    fn test_volume_scoped_name() {
        assert_eq!(VolumeSpec::new("data").scoped_name("shop"), "shop_data");
        assert_eq!(VolumeSpec::external("certs").scoped_name("shop"), "certs");
    }

    #[test]
    fn test_network_deserialize_defaults() {
        let net: NetworkSpec = serde_yaml::from_str("external: true").unwrap();
        assert!(net.external);
        assert_eq!(net.driver, "bridge");
    }
}
