//! Declarative project model.
//!
//! This module provides the types describing what should run: services and
//! their dependencies, networks, volumes, and the [`Topology`] that ties
//! them together.

mod project;
mod resources;
mod service;

pub use project::{Topology, TopologyBuilder, DEFAULT_NETWORK};
pub use resources::{NetworkSpec, NetworkSpecBuilder, PortMapping, PortProtocol, VolumeSpec};
pub use service::{
    BuildSpec, DependencyCondition, HealthCheck, MountSource, RestartPolicy, ServiceSpec,
    ServiceSpecBuilder, VolumeMount,
};
