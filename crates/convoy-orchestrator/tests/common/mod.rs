//! Shared fixtures for the orchestration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use convoy_orchestrator::{
    DependencyCondition, EngineConfig, HealthCheck, InMemoryRuntime, Orchestrator, RetryPolicy,
    ServiceSpec, Topology,
};

/// Engine settings with short waits so scenarios finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig::builder()
        .project_name("shop")
        .readiness_timeout(Duration::from_secs(2))
        .poll_interval(Duration::from_millis(5))
        .retry(RetryPolicy::fixed(3, Duration::from_millis(5)))
        .build()
}

/// A health check that probes every 10ms and flips after one result.
pub fn quick_check() -> HealthCheck {
    HealthCheck::cmd(["check"])
        .interval(Duration::from_millis(10))
        .timeout(Duration::from_millis(50))
        .retries(1)
}

pub fn service(name: &str) -> ServiceSpec {
    ServiceSpec::builder(name).image(format!("{}:1", name)).build_spec()
}

/// `web` depends on a healthy `cache`.
pub fn cache_web() -> Topology {
    Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("cache")
                .image("redis:7")
                .healthcheck(quick_check())
                .build_spec(),
        )
        .service(
            ServiceSpec::builder("web")
                .image("nginx:1.25")
                .depends_on("cache", DependencyCondition::Healthy)
                .build_spec(),
        )
        .build()
}

pub fn orchestrator(topology: Topology, runtime: &InMemoryRuntime, config: EngineConfig) -> Orchestrator {
    Orchestrator::new(topology, Arc::new(runtime.clone()), config).unwrap()
}
