//! Container management types and lifecycle.
//!
//! This module provides image and resource types, the replica model, the
//! shared registry, and the manager that turns a service plus a replica
//! index into runtime calls.

mod instance;
mod lifecycle;
mod registry;
mod spec;

pub(crate) use instance::now_millis;
pub use instance::{ContainerInstance, ContainerStatus, HealthState};
pub use lifecycle::ContainerLifecycleManager;
pub use registry::ContainerRegistry;
pub use spec::{ContainerImage, ImagePullPolicy, ResourceLimits, ResourceLimitsBuilder};
