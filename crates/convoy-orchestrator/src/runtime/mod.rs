//! Container runtime implementations.
//!
//! This module provides the trait the engine drives and two concrete
//! runtimes: Docker via bollard, and an in-memory fake.

mod docker;
mod memory;
mod r#trait;

pub use docker::{DockerConfig, DockerRuntime};
pub use memory::{ExecScript, InMemoryRuntime};
pub use r#trait::{
    BuildRequest, ContainerRequest, ContainerRuntime, ContainerState, ExecOptions, ExecOutput,
    LogLine, LogOptions, LogStream, NetworkRequest, RuntimeResult, SharedRuntime, VolumeRequest,
};

/// Label carrying the project name on every created resource.
pub const LABEL_PROJECT: &str = "convoy.project";

/// Label carrying the service name on containers.
pub const LABEL_SERVICE: &str = "convoy.service";

/// Label carrying the replica index on containers.
pub const LABEL_REPLICA: &str = "convoy.replica";
