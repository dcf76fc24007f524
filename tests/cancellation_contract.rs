//! The same contract, run against every cancellation backend.

use std::sync::Arc;
use std::time::Duration;

use surrealdb::engine::any::connect;
use uar_orchestrator::error::RunFault;
use uar_orchestrator::uar::runtime::cancellation::{
    CancellationRegistry, InMemoryCancellation, SurrealCancellation,
};

const TTL: Duration = Duration::from_secs(3600);

async fn surreal() -> CancellationRegistry {
    let backend = SurrealCancellation::connect("mem://", TTL)
        .await
        .expect("embedded store");
    CancellationRegistry::new(Arc::new(backend))
}

fn memory() -> CancellationRegistry {
    CancellationRegistry::new(Arc::new(InMemoryCancellation::with_ttl(TTL)))
}

async fn register_then_cancel(registry: CancellationRegistry) {
    registry.register_run("run-b").await.unwrap();
    assert!(!registry.is_cancelled("run-b").await.unwrap());

    assert!(registry.cancel_run("run-b").await.unwrap());
    assert!(registry.is_cancelled("run-b").await.unwrap());
    assert!(matches!(
        registry.raise_if_cancelled("run-b").await,
        Err(RunFault::Cancelled { run_id }) if run_id == "run-b"
    ));
}

async fn cancel_before_register(registry: CancellationRegistry) {
    assert!(!registry.cancel_run("run-c").await.unwrap());
    registry.register_run("run-c").await.unwrap();
    assert!(registry.is_cancelled("run-c").await.unwrap());
}

async fn cleanup_is_idempotent(registry: CancellationRegistry) {
    registry.register_run("run-x").await.unwrap();
    registry.register_run("run-y").await.unwrap();
    registry.cancel_run("run-y").await.unwrap();

    let active = registry.get_active_runs().await.unwrap();
    assert_eq!(active.get("run-x"), Some(&false));
    assert_eq!(active.get("run-y"), Some(&true));

    registry.cleanup_run("run-x").await.unwrap();
    registry.cleanup_run("run-x").await.unwrap();
    let active = registry.get_active_runs().await.unwrap();
    assert!(!active.contains_key("run-x"));
    assert!(!registry.is_cancelled("run-x").await.unwrap());
}

async fn concurrent_register_and_cancel(registry: CancellationRegistry) {
    for i in 0..20 {
        let run_id = format!("race-{i}");
        let (a, b) = (registry.clone(), registry.clone());
        let (id_a, id_b) = (run_id.clone(), run_id.clone());
        let register = tokio::spawn(async move { a.register_run(&id_a).await });
        let cancel = tokio::spawn(async move { b.cancel_run(&id_b).await });
        register.await.unwrap().unwrap();
        cancel.await.unwrap().unwrap();
        // Whichever landed first, the cancel is never lost.
        assert!(registry.is_cancelled(&run_id).await.unwrap(), "{run_id}");
    }
}

#[tokio::test]
async fn test_memory_register_then_cancel() {
    register_then_cancel(memory()).await;
}

#[tokio::test]
async fn test_memory_cancel_before_register() {
    cancel_before_register(memory()).await;
}

#[tokio::test]
async fn test_memory_cleanup_is_idempotent() {
    cleanup_is_idempotent(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_register_and_cancel() {
    concurrent_register_and_cancel(memory()).await;
}

#[tokio::test]
async fn test_surreal_register_then_cancel() {
    register_then_cancel(surreal().await).await;
}

#[tokio::test]
async fn test_surreal_cancel_before_register() {
    cancel_before_register(surreal().await).await;
}

#[tokio::test]
async fn test_surreal_cleanup_is_idempotent() {
    cleanup_is_idempotent(surreal().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_surreal_concurrent_register_and_cancel() {
    concurrent_register_and_cancel(surreal().await).await;
}

#[tokio::test]
async fn test_surreal_cancel_is_visible_to_other_nodes() {
    let db = connect("mem://").await.unwrap();
    db.use_ns("uar").use_db("uar").await.unwrap();
    let node_a = CancellationRegistry::new(Arc::new(
        SurrealCancellation::from_client(db.clone(), TTL).await.unwrap(),
    ));
    let node_b = CancellationRegistry::new(Arc::new(
        SurrealCancellation::from_client(db, TTL).await.unwrap(),
    ));

    node_a.register_run("shared").await.unwrap();
    assert!(node_b.cancel_run("shared").await.unwrap());
    assert!(node_a.is_cancelled("shared").await.unwrap());
}
