//! Teardown scenarios.

mod common;

use std::time::Duration;

use common::{cache_web, fast_config, orchestrator, service};
use convoy_orchestrator::{
    BuildSpec, ContainerRuntime, DownOptions, InMemoryRuntime, OrchestratorError, RemoveImages,
    RuntimeError, ServiceSpec, Topology, UpOptions, VolumeMount, VolumeSpec,
};

#[tokio::test]
async fn test_down_removes_in_reverse_dependency_order() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let report = engine.down(DownOptions::default()).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.removed_containers, vec!["shop_web_1", "shop_cache_1"]);
    assert_eq!(runtime.removal_order().await, vec!["shop_web_1", "shop_cache_1"]);
    assert_eq!(report.removed_networks, vec!["shop_default"]);
    assert!(runtime.containers().await.is_empty());
    assert!(runtime.networks().await.is_empty());
    assert!(engine.registry().is_empty().await);
    assert_eq!(engine.health().active().await, 0);
}

#[tokio::test]
async fn test_down_is_best_effort() {
    let topology = Topology::builder()
        .name("shop")
        .service(service("a"))
        .service(service("b"))
        .service(service("c"))
        .build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());
    engine.up(UpOptions::default()).await.unwrap();

    runtime
        .fail_next("remove_container", RuntimeError::other("remove_container", "device busy"))
        .await;
    let report = engine.down(DownOptions::default()).await;

    assert!(!report.is_success());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.removed_containers.len(), 2);
    assert_eq!(report.removed_networks, vec!["shop_default"]);
    assert_eq!(runtime.calls("remove_container").await, 3);

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, OrchestratorError::Teardown(errors) if errors.len() == 1));
}

#[tokio::test]
async fn test_down_finds_containers_from_earlier_runs() {
    let runtime = InMemoryRuntime::new();
    let first = orchestrator(cache_web(), &runtime, fast_config());
    first.up(UpOptions::default()).await.unwrap();
    first.shutdown().await;

    // A fresh engine knows nothing until it asks the runtime.
    let second = orchestrator(cache_web(), &runtime, fast_config());
    assert!(second.registry().is_empty().await);

    let report = second.down(DownOptions::default()).await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.removed_containers.len(), 2);
    assert!(runtime.containers().await.is_empty());
}

#[tokio::test]
async fn test_down_twice_is_harmless() {
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(cache_web(), &runtime, fast_config());
    engine.up(UpOptions::default()).await.unwrap();

    assert!(engine.down(DownOptions::default()).await.is_success());
    let again = engine.down(DownOptions::default()).await;
    assert!(again.is_success());
    assert!(again.removed_containers.is_empty());
    assert!(again.removed_networks.is_empty());
}

#[tokio::test]
async fn test_down_volumes_and_images() {
    let topology = Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("db")
                .image("postgres:16")
                .volume(VolumeMount::named("pgdata", "/var/lib/postgresql/data"))
                .build_spec(),
        )
        .service(ServiceSpec::builder("app").build(BuildSpec::new("./app")).build_spec())
        .volume(VolumeSpec::new("pgdata"))
        .volume(VolumeSpec::external("backups"))
        .build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());
    assert_eq!(runtime.volumes().await, vec!["shop_pgdata".to_string()]);
    assert_eq!(runtime.calls("build_image").await, 1);

    let report = engine
        .down(DownOptions {
            remove_volumes: true,
            rmi: RemoveImages::Local,
        })
        .await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.removed_volumes, vec!["shop_pgdata"]);
    assert_eq!(report.removed_images, vec!["shop-app"]);
    assert!(runtime.volumes().await.is_empty());
    assert_eq!(runtime.images().await, vec!["postgres:16".to_string()]);
}

#[tokio::test]
async fn test_down_keeps_volumes_by_default() {
    let topology = Topology::builder()
        .name("shop")
        .service(
            ServiceSpec::builder("db")
                .image("postgres:16")
                .volume(VolumeMount::named("pgdata", "/data"))
                .build_spec(),
        )
        .volume(VolumeSpec::new("pgdata"))
        .build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());
    engine.up(UpOptions::default()).await.unwrap();

    let report = engine.down(DownOptions::default()).await;
    assert!(report.is_success());
    assert!(report.removed_volumes.is_empty());
    assert_eq!(runtime.volumes().await, vec!["shop_pgdata".to_string()]);
}

#[tokio::test]
async fn test_down_after_container_removed_externally() {
    let topology = Topology::builder().name("shop").service(service("api")).build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());
    assert!(engine.up(UpOptions::default()).await.unwrap().is_success());

    let api = engine.registry().get_by_name("shop_api_1").await.unwrap();
    runtime.stop_container(&api.id, Duration::ZERO).await.unwrap();
    runtime.remove_container(&api.id, false).await.unwrap();

    let report = engine.down(DownOptions::default()).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert!(report.removed_containers.is_empty());
    assert_eq!(report.removed_networks, vec!["shop_default"]);
    assert!(engine.registry().is_empty().await);
    assert_eq!(runtime.calls("stop_container").await, 1);
}

#[tokio::test]
async fn test_down_tolerates_vanished_container_without_listing() {
    let topology = Topology::builder().name("shop").service(service("api")).build();
    let runtime = InMemoryRuntime::new();
    let engine = orchestrator(topology, &runtime, fast_config());
    engine.up(UpOptions::default()).await.unwrap();

    let api = engine.registry().get_by_name("shop_api_1").await.unwrap();
    runtime.stop_container(&api.id, Duration::ZERO).await.unwrap();
    runtime.remove_container(&api.id, false).await.unwrap();
    runtime
        .fail_next("list_containers", RuntimeError::transient("list_containers", "daemon busy"))
        .await;

    let report = engine.down(DownOptions::default()).await;

    // Only the listing failure is reported; the missing container is not.
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].to_string().contains("daemon busy"));
    assert!(engine.registry().is_empty().await);
    assert_eq!(runtime.calls("remove_container").await, 1);
}
