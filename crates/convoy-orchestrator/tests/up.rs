//! `up` scenarios driven against the in-memory runtime.

mod common;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use common::{cache_web, fast_config, orchestrator, quick_check, service};
use convoy_orchestrator::{
    ContainerStatus, DependencyCondition, EngineConfig, FailurePolicy, HealthState, InMemoryRuntime,
    OrchestratorError, RuntimeError, ServiceSpec, ServiceStatus, Topology, UpOptions, UpState,
    EXIT_CONFIG_ERROR, EXIT_CONVERGED, EXIT_INTERRUPTED, EXIT_SERVICE_FAILED,
};

#[tokio::test]
async fn test_dependency_starts_first() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.state, UpState::Running);
    assert_eq!(report.exit_code(), EXIT_CONVERGED);
    assert_eq!(report.order(), vec!["cache", "web"]);
    assert_eq!(runtime.start_order().await, vec!["shop_cache_1", "shop_web_1"]);
    assert_eq!(runtime.networks().await, vec!["shop_default".to_string()]);

    let cache = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert_eq!(cache.health, Some(HealthState::Healthy));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_healthy_timeout_fails_dependent_only() {
    let runtime = InMemoryRuntime::new();
    runtime.exec_always("cache", 1).await;
    let config = EngineConfig {
        readiness_timeout_ms: 100,
        ..fast_config()
    };
    let engine = orchestrator(cache_web(), &runtime, config);

    let started = Instant::now();
    let report = engine.up(UpOptions::default()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);

    assert!(report.outcome("cache").unwrap().is_started());
    assert!(matches!(
        report.outcome("web").unwrap().error(),
        Some(OrchestratorError::DependencyTimeout { dependency, condition: DependencyCondition::Healthy, .. })
            if dependency == "cache"
    ));
    assert_eq!(report.state, UpState::PartiallyFailed);
    assert_eq!(report.exit_code(), EXIT_SERVICE_FAILED);

    // The dependency is left running.
    let cache = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert!(cache.is_running());
    assert_eq!(cache.health, Some(HealthState::Unhealthy));
    assert!(engine.registry().get_by_name("shop_web_1").await.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unhealthy_dependency_recovers() {
    let runtime = InMemoryRuntime::new();
    runtime.exec_sequence("cache", [1, 1, 1], 0).await;
    let engine = orchestrator(cache_web(), &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert!(runtime.calls("exec_in_container").await >= 4);
    let cache = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert_eq!(cache.health, Some(HealthState::Healthy));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_started_dependency_order_and_exit_code() {
    let topology = Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("web")
                .image("nginx:1.25")
                .depends_on("cache", DependencyCondition::Started)
                .build_spec(),
        )
        .service(service("cache"))
        .build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.order(), vec!["cache", "web"]);
    assert_eq!(report.exit_code(), EXIT_CONVERGED);
    assert_eq!(runtime.start_order().await, vec!["shop_cache_1", "shop_web_1"]);
    for name in ["shop_cache_1", "shop_web_1"] {
        assert!(engine.registry().get_by_name(name).await.unwrap().is_running());
    }
}

#[tokio::test]
async fn test_independent_services_survive_sibling_failure() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("a"))
        .service(service("b"))
        .service(service("c"))
        .build();
    let runtime = InMemoryRuntime::new();
    runtime
        .fail_service("b", RuntimeError::other("create_container", "bad entrypoint"))
        .await;
    let engine = orchestrator(topology, &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.outcome("a").unwrap().is_started());
    assert!(report.outcome("b").unwrap().error().is_some());
    assert!(report.outcome("c").unwrap().is_started());
    assert_eq!(report.unstarted(), vec!["b"]);
    assert_eq!(report.state, UpState::PartiallyFailed);
    assert_eq!(report.exit_code(), EXIT_SERVICE_FAILED);
    assert!(engine.registry().get_by_name("shop_a_1").await.unwrap().is_running());
    assert!(engine.registry().get_by_name("shop_c_1").await.unwrap().is_running());
}

#[tokio::test]
async fn test_partial_failure_keeps_independent_services() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("a"))
        .service(
            ServiceSpec::builder("b")
                .image("b:1")
                .depends_on("a", DependencyCondition::Started)
                .build_spec(),
        )
        .service(service("c"))
        .service(
            ServiceSpec::builder("d")
                .image("d:1")
                .depends_on("b", DependencyCondition::Started)
                .build_spec(),
        )
        .build();
    let runtime = InMemoryRuntime::new();
    runtime
        .fail_service("b", RuntimeError::other("create_container", "bad entrypoint"))
        .await;
    let engine = orchestrator(topology, &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.outcome("a").unwrap().is_started());
    assert!(report.outcome("c").unwrap().is_started());
    assert!(matches!(
        report.outcome("b").unwrap().error(),
        Some(OrchestratorError::Runtime(_))
    ));
    assert!(matches!(
        report.outcome("d").unwrap().error(),
        Some(OrchestratorError::DependencyFailed { dependency, .. }) if dependency == "b"
    ));
    assert_eq!(report.unstarted(), vec!["b", "d"]);
    assert_eq!(report.exit_code(), EXIT_SERVICE_FAILED);

    // Non-transient errors are not retried.
    assert_eq!(runtime.calls("create_and_start_container").await, 3);
    assert!(engine.registry().get_by_name("shop_a_1").await.unwrap().is_running());
}

#[tokio::test]
async fn test_abort_policy_skips_later_services() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("a"))
        .service(service("b"))
        .service(
            ServiceSpec::builder("c")
                .image("c:1")
                .depends_on("a", DependencyCondition::Started)
                .build_spec(),
        )
        .build();
    let runtime = InMemoryRuntime::new();
    runtime
        .fail_service("b", RuntimeError::other("create_container", "boom"))
        .await;
    let config = EngineConfig {
        failure_policy: FailurePolicy::Abort,
        ..fast_config()
    };
    let engine = orchestrator(topology, &runtime, config);

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.outcome("a").unwrap().is_started());
    assert!(report.outcome("b").unwrap().error().is_some());
    assert!(matches!(
        &report.outcome("c").unwrap().status,
        ServiceStatus::Skipped { reason } if reason.contains("b")
    ));
    assert!(engine.registry().get_by_name("shop_c_1").await.is_none());
}

#[tokio::test]
async fn test_replicas_start_concurrently_with_distinct_entries() {
    let runtime = InMemoryRuntime::new().with_latency(Duration::from_millis(20));
    let topology = Topology::builder()
        .name("shop")
        .service(ServiceSpec::builder("web").image("nginx").replicas(2).build_spec())
        .build();
    let engine = orchestrator(topology, &runtime, fast_config());

    let mut scale = HashMap::new();
    scale.insert("web".to_string(), 6);
    let report = engine
        .up(UpOptions {
            scale,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    let replicas = engine.registry().for_service("web").await;
    assert_eq!(replicas.len(), 6);

    let ids: HashSet<_> = replicas.iter().map(|c| c.id.clone()).collect();
    let indices: HashSet<_> = replicas.iter().map(|c| c.replica).collect();
    assert_eq!(ids.len(), 6);
    assert_eq!(indices, (1..=6).collect());
}

#[tokio::test]
async fn test_scale_down_removes_surplus() {
    let runtime = InMemoryRuntime::new();
    let topology = Topology::builder()
        .name("shop")
        .service(ServiceSpec::builder("web").image("nginx").replicas(3).build_spec())
        .build();
    let engine = orchestrator(topology, &runtime, fast_config());

    engine.up(UpOptions::default()).await.unwrap();
    let mut scale = HashMap::new();
    scale.insert("web".to_string(), 1);
    engine
        .up(UpOptions {
            scale,
            ..Default::default()
        })
        .await
        .unwrap();

    let names: Vec<_> = runtime.containers().await.into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["shop_web_1".to_string()]);
}

#[tokio::test]
async fn test_second_up_reuses_resources_and_containers() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());

    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    assert_eq!(runtime.calls("create_network").await, 1);
    assert_eq!(runtime.calls("create_and_start_container").await, 2);
    assert_eq!(runtime.networks().await.len(), 1);
    engine.shutdown().await;
}

/// Probes once right away, then not again for the rest of the test.
fn slow_check_topology() -> Topology {
    Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("cache")
                .image("redis:7")
                .healthcheck(quick_check().interval(Duration::from_secs(3600)))
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

#[tokio::test]
async fn test_second_up_keeps_health_of_running_container() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(slow_check_topology(), &runtime, fast_config());

    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());
    let probes = runtime.calls("exec_in_container").await;
    assert_eq!(probes, 1);

    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let cache = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert_eq!(cache.health, Some(HealthState::Healthy));
    assert_eq!(runtime.calls("exec_in_container").await, probes);
    assert_eq!(engine.health().active().await, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_replacing_stale_container_drops_its_monitor() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(slow_check_topology(), &runtime, fast_config());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let old = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert!(engine.health().is_watching(&old.id).await);
    runtime
        .set_container_state("shop_cache_1", ContainerStatus::Exited, Some(1))
        .await;

    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let new = engine.registry().get_by_name("shop_cache_1").await.unwrap();
    assert_ne!(new.id, old.id);
    assert!(!engine.health().is_watching(&old.id).await);
    assert!(engine.health().is_watching(&new.id).await);
    assert_eq!(engine.health().active().await, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let runtime = InMemoryRuntime::new();
    runtime
        .fail_next("create_network", RuntimeError::transient("create_network", "daemon busy"))
        .await;
    runtime
        .fail_next(
            "create_and_start_container",
            RuntimeError::transient("create_container", "daemon busy"),
        )
        .await;
    let topology = Topology::builder().name("shop").service(service("api")).build();
    let engine = orchestrator(topology, &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(runtime.calls("create_network").await, 2);
    assert_eq!(runtime.calls("create_and_start_container").await, 2);
}

#[tokio::test]
async fn test_missing_image_is_not_retried() {
    let runtime = InMemoryRuntime::new();
    runtime.missing_image("ghost:1").await;
    let topology = Topology::builder()
        .name("shop")
        .service(service("ghost"))
        .service(service("api"))
        .build();
    let engine = orchestrator(topology, &runtime, fast_config());

    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(report.outcome("ghost").unwrap().error().unwrap().is_not_found());
    assert!(report.outcome("api").unwrap().is_started());
    assert_eq!(runtime.calls("pull_image").await, 2);
}

#[tokio::test]
async fn test_completed_successfully_dependency() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("migrate"))
        .service(
            ServiceSpec::builder("app")
                .image("app:1")
                .depends_on("migrate", DependencyCondition::CompletedSuccessfully)
                .build_spec(),
        )
        .build();

    let runtime = InMemoryRuntime::new();
    runtime.exit_after_start("migrate", 0).await;
    let engine = orchestrator(topology.clone(), &runtime, fast_config());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let runtime = InMemoryRuntime::new();
    runtime.exit_after_start("migrate", 2).await;
    let engine = orchestrator(topology, &runtime, fast_config());
    let started = Instant::now();
    let report = engine.up(UpOptions::default()).await.unwrap();

    // Fails as soon as the exit is seen, not after the readiness timeout.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        report.outcome("app").unwrap().error(),
        Some(OrchestratorError::DependencyFailed { service, .. }) if service == "app"
    ));
}

#[tokio::test]
async fn test_cancellation_interrupts_readiness_wait() {
    let runtime = InMemoryRuntime::new();
    runtime.exec_always("cache", 1).await;
    let config = EngineConfig {
        readiness_timeout_ms: 30_000,
        ..fast_config()
    };
    let engine = orchestrator(cache_web(), &runtime, config);

    let token = engine.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let started = Instant::now();
    let report = engine.up(UpOptions::default()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.cancelled);
    assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    assert!(matches!(
        &report.outcome("web").unwrap().status,
        ServiceStatus::Skipped { reason } if reason == "interrupted"
    ));
    assert!(engine.down(Default::default()).await.is_success());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_runtime_call() {
    let topology = Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("a")
                .image("a:1")
                .depends_on("b", DependencyCondition::Started)
                .build_spec(),
        )
        .service(
            ServiceSpec::builder("b")
                .image("b:1")
                .depends_on("a", DependencyCondition::Started)
                .build_spec(),
        )
        .build();
    let runtime = InMemoryRuntime::new();
    let result = convoy_orchestrator::Orchestrator::new(
        topology,
        std::sync::Arc::new(runtime.clone()),
        fast_config(),
    );

    let err = result.err().unwrap();
    assert!(matches!(err, OrchestratorError::CircularDependency { .. }));
    assert_eq!(err.exit_code(), EXIT_CONFIG_ERROR);
    assert_eq!(runtime.calls("create_network").await, 0);
}

#[tokio::test]
async fn test_profiles_select_services() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("api"))
        .service(ServiceSpec::builder("debugger").image("debug:1").profile("debug").build_spec())
        .build();

    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology.with_profiles(&[]), &runtime, fast_config());
    let report = engine.up(UpOptions::default()).await.unwrap();
    assert_eq!(report.order(), vec!["api"]);

    let err = engine
        .up(UpOptions {
            services: vec!["debugger".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), EXIT_CONFIG_ERROR);

    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology.with_profiles(&["debug".to_string()]), &runtime, fast_config());
    let report = engine.up(UpOptions::default()).await.unwrap();
    assert_eq!(report.order(), vec!["api", "debugger"]);
}

#[tokio::test]
async fn test_subset_pulls_in_dependencies_unless_no_deps() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());

    let report = engine
        .up(UpOptions {
            services: vec!["web".to_string()],
            no_deps: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.order(), vec!["web"]);
    assert!(engine.registry().get_by_name("shop_cache_1").await.is_none());

    let report = engine
        .up(UpOptions {
            services: vec!["web".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.order(), vec!["cache", "web"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unknown_service_is_rejected() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());

    let err = engine
        .up(UpOptions {
            services: vec!["nope".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ServiceNotFound(name) if name == "nope"));
    assert_eq!(runtime.calls("create_network").await, 0);
}

#[tokio::test]
async fn test_health_probe_runs_until_shutdown() {
    let runtime = InMemoryRuntime::new();
    let topology = Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("api")
                .image("api:1")
                .healthcheck(quick_check())
                .build_spec(),
        )
        .build();
    let engine = orchestrator(topology, &runtime, fast_config());

    engine.up(UpOptions::default()).await.unwrap();
    assert_eq!(engine.health().active().await, 1);

    engine.shutdown().await;
    assert_eq!(engine.health().active().await, 0);
}
