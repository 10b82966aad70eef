//! Declarative multi-service orchestration.
//!
//! This crate brings a project of interdependent services up and down on a
//! container runtime. A project is described by a [`Topology`]: services
//! with their images, dependencies and health probes, plus the networks and
//! volumes they share.
//!
//! # Overview
//!
//! The engine handles:
//! - **Dependency ordering**: services start in waves computed from the
//!   dependency graph, and cycles are rejected before anything runs
//! - **Readiness**: a dependent waits until each dependency is started,
//!   healthy or completed successfully, as declared
//! - **Health monitoring**: probes run periodically inside each container
//!   and drive a starting/healthy/unhealthy state machine
//! - **Resources**: project-scoped networks and volumes are created
//!   idempotently and removed on teardown
//! - **Partial failure**: a failing service does not roll back the others;
//!   every outcome is reported
//!
//! # Architecture
//!
//! - [`topology`]: the declarative project model
//! - [`resolver`]: dependency graph, cycle detection and start waves
//! - [`runtime`]: the [`ContainerRuntime`] trait, a Docker implementation
//!   and an in-memory runtime
//! - [`container`]: replicas, the shared registry and the lifecycle manager
//! - [`health`] and [`readiness`]: probes and dependency conditions
//! - [`resources`]: networks and volumes
//! - [`orchestrator`]: the `up`/`down`/`ps`/`logs`/`build`/`exec`/`pull`
//!   facade
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use convoy_orchestrator::{
//!     DependencyCondition, DockerRuntime, EngineConfig, HealthCheck, Orchestrator, ServiceSpec,
//!     Topology, UpOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topology = Topology::builder()
//!         .name("shop")
//!         .service(
//!             ServiceSpec::builder("cache")
//!                 .image("redis:7-alpine")
//!                 .healthcheck(HealthCheck::cmd(["redis-cli", "ping"]))
//!                 .build_spec(),
//!         )
//!         .service(
//!             ServiceSpec::builder("web")
//!                 .image("nginx:1.25")
//!                 .depends_on("cache", DependencyCondition::Healthy)
//!                 .build_spec(),
//!         )
//!         .build();
//!
//!     let runtime = Arc::new(DockerRuntime::new().await?);
//!     let orchestrator = Orchestrator::new(topology, runtime, EngineConfig::default())?;
//!
//!     let report = orchestrator.up(UpOptions::default()).await?;
//!     println!("{}", report);
//!
//!     orchestrator.down(Default::default()).await.into_result()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod container;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod periodic;
pub mod readiness;
pub mod render;
pub mod report;
pub mod resolver;
pub mod resources;
pub mod runtime;
pub mod topology;

pub use config::{Backoff, EngineConfig, EngineConfigBuilder, FailurePolicy, RetryPolicy};
pub use container::{
    ContainerImage, ContainerInstance, ContainerRegistry, ContainerStatus, HealthState,
    ImagePullPolicy, ResourceLimits,
};
pub use error::{
    OrchestratorError, Result, RuntimeError, RuntimeErrorKind, EXIT_CONFIG_ERROR, EXIT_CONVERGED,
    EXIT_INTERRUPTED, EXIT_SERVICE_FAILED,
};
pub use health::{HealthMonitor, HealthTracker};
pub use orchestrator::{BuildOptions, DownOptions, Orchestrator, RemoveImages, UpOptions};
pub use readiness::ReadinessCoordinator;
pub use report::{DownReport, ServiceOutcome, ServiceStatus, UpReport, UpState};
pub use resolver::DependencyResolver;
pub use resources::ResourceManager;
pub use runtime::{
    ContainerRuntime, DockerConfig, DockerRuntime, ExecOptions, ExecOutput, InMemoryRuntime,
    LogOptions, SharedRuntime,
};
pub use topology::{
    BuildSpec, DependencyCondition, HealthCheck, NetworkSpec, PortMapping, RestartPolicy,
    ServiceSpec, Topology, VolumeMount, VolumeSpec,
};
