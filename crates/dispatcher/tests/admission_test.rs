use chrono::Utc;
use dispatch_core::models::{InstanceState, ReleaseEntity};
use dispatch_core::{DispatchError, FeatureFlag};
use futures::future::join_all;

mod common;
use common::{Harness, TENANT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ensure_is_idempotent_under_races() {
    let harness = Harness::new();
    let attempts = (0..6).map(|_| {
        let admission = harness.engine.admission.clone();
        tokio::spawn(async move { admission.ensure(TENANT, "deploy-slots").await })
    });
    let ids: Vec<String> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().id)
        .collect();
    assert!(ids.iter().all(|id| id == &ids[0]));
}

#[tokio::test]
async fn test_fifo_promotion_on_release() {
    let harness = Harness::new();
    let admission = &harness.engine.admission;
    let constraint = admission.ensure(TENANT, "infra-lock").await.unwrap();
    let constraint = admission.update_capacity(&constraint.id, 2).await.unwrap();

    let a = ReleaseEntity::new("exec-a", "WORKFLOW");
    let b = ReleaseEntity::new("exec-b", "WORKFLOW");
    let c = ReleaseEntity::new("exec-c", "PIPELINE");

    let first = admission.acquire(&constraint.id, "infra-1", &a, 2).await.unwrap();
    let second = admission.acquire(&constraint.id, "infra-1", &b, 1).await.unwrap();
    let third = admission.acquire(&constraint.id, "infra-1", &c, 1).await.unwrap();
    assert_eq!(first.state, InstanceState::Active);
    assert_eq!(second.state, InstanceState::Blocked);
    assert_eq!(third.state, InstanceState::Blocked);

    let promoted = admission.release(&constraint.id, "infra-1", "exec-a").await.unwrap();
    let promoted: Vec<&str> = promoted.iter().map(|i| i.release_entity.id.as_str()).collect();
    assert_eq!(promoted, vec!["exec-b", "exec-c"]);

    // 其他资源单元互不影响
    let other = admission.acquire(&constraint.id, "infra-2", &a, 2).await.unwrap();
    assert_eq!(other.state, InstanceState::Active);
}

#[tokio::test]
async fn test_capacity_cannot_drop_below_active_permits() {
    let harness = Harness::new();
    let admission = &harness.engine.admission;
    let constraint = admission.ensure(TENANT, "slots").await.unwrap();
    admission.update_capacity(&constraint.id, 3).await.unwrap();
    admission
        .acquire(&constraint.id, "infra-1", &ReleaseEntity::new("e1", "WORKFLOW"), 3)
        .await
        .unwrap();

    let err = admission.update_capacity(&constraint.id, 2).await.unwrap_err();
    assert!(matches!(err, DispatchError::ValidationError(_)));
    assert_eq!(admission.get(&constraint.id).await.unwrap().capacity, 3);
}

#[tokio::test]
async fn test_capacity_increase_promotes_waiters() {
    let harness = Harness::new();
    let admission = &harness.engine.admission;
    let constraint = admission.ensure(TENANT, "slots").await.unwrap();
    assert_eq!(constraint.capacity, 1);

    admission
        .acquire(&constraint.id, "u", &ReleaseEntity::new("e1", "WORKFLOW"), 1)
        .await
        .unwrap();
    let waiting = admission
        .acquire(&constraint.id, "u", &ReleaseEntity::new("e2", "WORKFLOW"), 1)
        .await
        .unwrap();
    assert_eq!(waiting.state, InstanceState::Blocked);

    admission.update_capacity(&constraint.id, 2).await.unwrap();
    let instances = admission.instances(&constraint.id, "u").await.unwrap();
    assert!(instances.iter().all(|i| i.is_active()));
}

#[tokio::test]
async fn test_gc_sweep_is_flag_gated() {
    let harness = Harness::new();
    let admission = &harness.engine.admission;
    let constraint = admission.ensure(TENANT, "slots").await.unwrap();
    let finished = ReleaseEntity::new("exec-done", "WORKFLOW");
    let waiting = ReleaseEntity::new("exec-next", "WORKFLOW");
    admission.acquire(&constraint.id, "u", &finished, 1).await.unwrap();
    admission.acquire(&constraint.id, "u", &waiting, 1).await.unwrap();

    harness.registry.mark_terminal(&finished).await;
    assert_eq!(admission.gc_sweep(Utc::now()).await.unwrap(), 0);

    harness
        .flags
        .enable_for(FeatureFlag::ConstraintGarbageCollection, TENANT);
    assert_eq!(admission.gc_sweep(Utc::now()).await.unwrap(), 1);

    let instances = admission.instances(&constraint.id, "u").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].release_entity.id, "exec-next");
    assert!(instances[0].is_active());
}
